use std::sync::Arc;
use std::time::Duration;

use agentchat_engine::prelude::*;
use agentchat_engine::vendors::data_stream::DataStreamTransport;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SessionError> {
    agentchat_engine::init_observability();

    let agent_id = std::env::var("AGENTCHAT_AGENT_ID")
        .map_err(|_| SessionError::Config("set AGENTCHAT_AGENT_ID to run this example".into()))?;
    let controller = SessionController::new(
        Arc::new(DataStreamTransport::from_env()?),
        EngineConfig::from_env(),
    )?;
    controller.start(&agent_id)?;

    let mut view = controller.subscribe();
    let exchange = controller.send_message("Say hello in one sentence.").await?;

    let mut printed = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let done = exchange.is_finished();
        if let Some(snapshot) = view.poll()
            && let Some(reply) = snapshot
                .messages
                .iter()
                .rev()
                .find(|m| !m.is_user && m.kind == DisplayMessageType::Text)
            && let Some(suffix) = reply.content.get(printed..)
        {
            print!("{suffix}");
            printed = reply.content.len();
        }
        if done {
            break;
        }
    }
    println!();

    let outcome = exchange.wait().await?;
    println!("{outcome:?}, tools: {:?}", controller.stats());
    Ok(())
}
