use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::SessionError;
use crate::event::{DisplayMessage, DisplayMessageType, StreamEvent, StreamEventKind};
use crate::session::{SessionState, SharedSession};
use crate::tracker::{ToolStatus, ToolTransition};
use crate::transport::EventStream;

/// How an exchange ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The agent finished every message it started.
    Completed,
    /// The stream stopped early; buffered content was finalized as-is.
    Partial,
    /// The exchange was cancelled; the transcript was left untouched.
    Cancelled,
}

pub(crate) struct Exchange {
    pub id: uuid::Uuid,
    pub session: Arc<SharedSession>,
    pub stream: EventStream,
    pub cancel: CancellationToken,
    pub call_timeout: Duration,
    pub agent_name: String,
}

/// Ids this exchange touched, used for close-out.
#[derive(Default)]
struct ExchangeLedger {
    text_ids: Vec<String>,
    tool_ids: Vec<String>,
    received: bool,
}

impl ExchangeLedger {
    fn note_text(&mut self, id: &str) {
        if !self.text_ids.iter().any(|known| known == id) {
            self.text_ids.push(id.to_string());
        }
    }

    fn note_tool(&mut self, id: &str) {
        if !self.tool_ids.iter().any(|known| known == id) {
            self.tool_ids.push(id.to_string());
        }
    }
}

enum Step {
    Continue,
    Done(Result<ExchangeOutcome, SessionError>),
}

/// Reads one exchange's events into the session until the stream closes.
///
/// Only a final agent error ends the exchange early. Observes cancellation
/// and the per-call deadline at every wait. After cancellation nothing
/// further is written to the session.
pub(crate) async fn consume(exchange: Exchange) -> Result<ExchangeOutcome, SessionError> {
    let Exchange {
        id,
        session,
        mut stream,
        cancel,
        call_timeout,
        agent_name,
    } = exchange;
    let mut ledger = ExchangeLedger::default();
    let deadline = tokio::time::sleep(call_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(exchange_id = %id, "exchange cancelled");
                return Ok(ExchangeOutcome::Cancelled);
            }
            _ = &mut deadline => {
                warn!(exchange_id = %id, timeout_secs = call_timeout.as_secs(), "exchange timed out");
                return close_out(&session, &cancel, &ledger, CloseReason::Timeout(call_timeout));
            }
            next = stream.next() => {
                let Some(event) = next else {
                    debug!(exchange_id = %id, "event stream closed");
                    return close_out(&session, &cancel, &ledger, CloseReason::Closed);
                };
                let step = {
                    let mut state = session.lock();
                    if cancel.is_cancelled() {
                        return Ok(ExchangeOutcome::Cancelled);
                    }
                    apply_event(&mut state, event, &mut ledger, &agent_name)
                };
                session.notify();
                if let Step::Done(result) = step {
                    return result;
                }
            }
        }
    }
}

fn apply_event(
    state: &mut SessionState,
    event: StreamEvent,
    ledger: &mut ExchangeLedger,
    agent_name: &str,
) -> Step {
    if let Some(session_id) = event.session_id.as_deref()
        && state.adopt_session_id(session_id)
    {
        info!(session_id, "adopted remote session id");
    }
    state.touch();

    let sender = if event.sender_name.trim().is_empty() {
        agent_name.to_string()
    } else {
        event.sender_name.clone()
    };

    match event.kind {
        StreamEventKind::ContentDelta | StreamEventKind::Completion
            if state.tracker.is_known(&event.message_id) =>
        {
            let transition = state.tracker.on_output(
                &event.message_id,
                &event.content,
                None,
                event.is_final,
            );
            write_tool_entry(state, &event.message_id, &sender, transition);
            Step::Continue
        }
        StreamEventKind::ContentDelta | StreamEventKind::Completion => {
            apply_text(state, &event, ledger, &sender);
            Step::Continue
        }
        StreamEventKind::ToolCall => {
            let invocation = event.invocation();
            let transition =
                state
                    .tracker
                    .on_call(&event.message_id, &invocation.name, &invocation.args);
            if transition == ToolTransition::Started {
                ledger.note_tool(&event.message_id);
                ledger.received = true;
                let content = if event.content.trim().is_empty() {
                    format!("Tool: {}\nArguments: {}", invocation.name, invocation.args)
                } else {
                    event.content.clone()
                };
                state.transcript.upsert(DisplayMessage::agent(
                    event.message_id.clone(),
                    sender,
                    content,
                    DisplayMessageType::ToolInit,
                    false,
                ));
            }
            Step::Continue
        }
        StreamEventKind::ToolOutput => {
            ledger.note_tool(&event.message_id);
            ledger.received = true;
            let transition = state.tracker.on_output(
                &event.message_id,
                &event.content,
                event.error_text.as_deref(),
                event.is_final,
            );
            write_tool_entry(state, &event.message_id, &sender, transition);
            Step::Continue
        }
        StreamEventKind::Error => apply_error(state, &event, ledger, &sender),
    }
}

fn apply_text(
    state: &mut SessionState,
    event: &StreamEvent,
    ledger: &mut ExchangeLedger,
    sender: &str,
) {
    let id = event.message_id.as_str();
    ledger.note_text(id);
    if let Some(delta) = state.assembler.apply(id, &event.content) {
        ledger.received = true;
        debug!(message_id = id, delta_len = delta.len(), "text delta");
        if !event.is_final {
            state.transcript.upsert(DisplayMessage::agent(
                id,
                sender,
                event.content.clone(),
                DisplayMessageType::Text,
                false,
            ));
        }
    }
    if event.is_final && !state.assembler.is_finalized(id) {
        let content = state.assembler.finalize(id);
        if content.is_empty() && state.transcript.get(id).is_none() {
            return;
        }
        state.transcript.upsert(DisplayMessage::agent(
            id,
            sender,
            content,
            DisplayMessageType::Text,
            true,
        ));
        debug!(message_id = id, "message finalized");
    }
}

fn apply_error(
    state: &mut SessionState,
    event: &StreamEvent,
    ledger: &mut ExchangeLedger,
    sender: &str,
) -> Step {
    let id = event.message_id.as_str();
    let message = event.error_message().to_string();
    warn!(message_id = id, is_final = event.is_final, error = %message, "agent reported error");

    if state.tracker.is_known(id) {
        state.tracker.flag_failure(id, &message);
        if event.is_final {
            let transition = state.tracker.finish(id);
            write_tool_entry(state, id, sender, transition);
        }
    }
    // Entries under the same id (text or tool) keep their own row.
    let entry_id = match state.transcript.get(id) {
        Some(_) => format!("{id}-error"),
        None => id.to_string(),
    };
    state.transcript.upsert(DisplayMessage::agent(
        entry_id,
        sender,
        message.clone(),
        DisplayMessageType::Error,
        true,
    ));

    if !event.is_final {
        return Step::Continue;
    }
    finalize_pending(state, ledger, "agent reported an error");
    Step::Done(Err(SessionError::Agent(message)))
}

fn write_tool_entry(state: &mut SessionState, id: &str, sender: &str, transition: ToolTransition) {
    let kind = match transition {
        ToolTransition::Ignored | ToolTransition::Started => return,
        ToolTransition::Running => DisplayMessageType::ToolOutput,
        ToolTransition::Finished(ToolStatus::Failed) => DisplayMessageType::Error,
        ToolTransition::Finished(_) => DisplayMessageType::ToolComplete,
    };
    let Some(record) = state.tracker.get(id) else {
        return;
    };
    let content = match (&record.error_text, record.output.is_empty()) {
        (Some(err), true) => err.clone(),
        _ => record.output.clone(),
    };
    let is_final = record.status.is_terminal();
    state.transcript.upsert(DisplayMessage::agent(
        id, sender, content, kind, is_final,
    ));
}

/// Finalizes open text and fails open tools of this exchange.
///
/// Returns whether anything had to be closed out.
fn finalize_pending(state: &mut SessionState, ledger: &ExchangeLedger, reason: &str) -> bool {
    let mut synthesized = false;
    for id in &ledger.text_ids {
        if state.assembler.is_finalized(id) {
            continue;
        }
        let content = state.assembler.finalize(id);
        if content.is_empty() {
            continue;
        }
        synthesized = true;
        let sender = state
            .transcript
            .get(id)
            .map(|m| m.sender_name.clone())
            .unwrap_or_default();
        state.transcript.upsert(DisplayMessage::agent(
            id.clone(),
            sender,
            content,
            DisplayMessageType::Text,
            true,
        ));
        debug!(message_id = %id, reason, "finalized buffered text");
    }
    for id in &ledger.tool_ids {
        if let ToolTransition::Finished(status) = state.tracker.abandon(id, reason) {
            synthesized = true;
            let sender = state
                .transcript
                .get(id)
                .map(|m| m.sender_name.clone())
                .unwrap_or_default();
            write_tool_entry(state, id, &sender, ToolTransition::Finished(status));
        }
    }
    synthesized
}

enum CloseReason {
    Closed,
    Timeout(Duration),
}

fn close_out(
    session: &SharedSession,
    cancel: &CancellationToken,
    ledger: &ExchangeLedger,
    reason: CloseReason,
) -> Result<ExchangeOutcome, SessionError> {
    let result = {
        let mut state = session.lock();
        if cancel.is_cancelled() {
            return Ok(ExchangeOutcome::Cancelled);
        }
        match reason {
            CloseReason::Timeout(after) if !ledger.received => {
                finalize_pending(&mut state, ledger, "timed out");
                Err(SessionError::Timeout { after })
            }
            CloseReason::Timeout(_) => {
                finalize_pending(&mut state, ledger, "timed out before the agent finished");
                Ok(ExchangeOutcome::Partial)
            }
            CloseReason::Closed => {
                if !ledger.received {
                    warn!("event stream closed without any content");
                }
                if finalize_pending(&mut state, ledger, "stream ended before the tool finished") {
                    Ok(ExchangeOutcome::Partial)
                } else {
                    Ok(ExchangeOutcome::Completed)
                }
            }
        }
    };
    session.notify();
    result
}
