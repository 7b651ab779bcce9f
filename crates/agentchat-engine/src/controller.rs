use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::consumer::{Exchange, consume};
pub use crate::consumer::ExchangeOutcome;
use crate::errors::SessionError;
use crate::event::DisplayMessage;
use crate::history::SessionRecord;
use crate::retry::open_with_retry;
use crate::session::{SessionSnapshot, SharedSession};
use crate::tracker::{ErrorClassifier, ToolCallStats};
use crate::transport::{AgentTransport, OpenStreamRequest};

/// Orchestrates one logical conversation with a remote agent.
///
/// Every `send_message` opens a fresh transport stream and hands it to a
/// background consumer. The session id reported by the agent is reused for
/// later messages. Dropping the controller cancels everything it started.
pub struct SessionController {
    transport: Arc<dyn AgentTransport>,
    config: EngineConfig,
    session: Arc<SharedSession>,
    root: Mutex<CancellationToken>,
    lifetime: CancellationToken,
    sweeper_started: std::sync::atomic::AtomicBool,
}

impl SessionController {
    /// Creates a controller for `transport`. Call `start` before sending.
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
    ) -> Result<Self, SessionError> {
        Self::build(transport, config, None)
    }

    /// Creates a controller whose tool tracker uses `classifier`.
    pub fn with_classifier(
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
        classifier: ErrorClassifier,
    ) -> Result<Self, SessionError> {
        Self::build(transport, config, Some(classifier))
    }

    fn build(
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
        classifier: Option<ErrorClassifier>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            session: Arc::new(SharedSession::new(classifier)),
            root: Mutex::new(CancellationToken::new()),
            lifetime: CancellationToken::new(),
            sweeper_started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Binds the session to `agent_id`.
    ///
    /// Repeated calls with the same agent are no-ops. Must run inside a
    /// tokio runtime, which hosts the tool eviction sweep.
    pub fn start(&self, agent_id: &str) -> Result<(), SessionError> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(SessionError::Validation("agent id must not be empty".into()));
        }
        {
            let mut state = self.session.lock();
            match state.agent_id.as_deref() {
                Some(current) if current == agent_id => return Ok(()),
                Some(current) => {
                    return Err(SessionError::Validation(format!(
                        "session already started for agent {current}"
                    )));
                }
                None => {
                    state.agent_id = Some(agent_id.to_string());
                    state.touch();
                }
            }
        }
        self.spawn_sweeper()?;
        self.session.notify();
        info!(agent_id, "session started");
        Ok(())
    }

    /// Submits `text` to the agent.
    ///
    /// Resolves once the stream is established (after any retries) and
    /// returns a handle to the background exchange. Streaming results land
    /// in the session transcript.
    pub async fn send_message(&self, text: &str) -> Result<ExchangeHandle, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::Validation("message must not be empty".into()));
        }
        let request = {
            let mut state = self.session.lock();
            let Some(agent_id) = state.agent_id.clone() else {
                return Err(SessionError::NotStarted);
            };
            state.transcript.upsert(DisplayMessage::user(
                self.config.user_name.clone(),
                text.to_string(),
            ));
            state.touch();
            OpenStreamRequest {
                agent_id,
                text: text.to_string(),
                session_id: state.session_id.clone(),
            }
        };
        self.session.notify();

        let cancel = self.root_token().child_token();
        let stream =
            open_with_retry(self.transport.as_ref(), &request, &self.config.retry, &cancel)
                .await?;

        let exchange_id = uuid::Uuid::new_v4();
        debug!(
            exchange_id = %exchange_id,
            agent_id = %request.agent_id,
            session_id = request.session_id.as_deref().unwrap_or("<new>"),
            "exchange started"
        );
        let join = tokio::spawn(consume(Exchange {
            id: exchange_id,
            session: Arc::clone(&self.session),
            stream,
            cancel: cancel.clone(),
            call_timeout: self.config.call_timeout,
            agent_name: self.config.agent_name.clone(),
        }));
        Ok(ExchangeHandle {
            id: exchange_id,
            cancel,
            join,
        })
    }

    /// Cancels every in-flight exchange.
    ///
    /// Safe to call any number of times; the controller stays usable.
    pub fn cancel(&self) {
        let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        if !root.is_cancelled() {
            debug!("cancelling in-flight exchanges");
        }
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Cancels in-flight work and forgets the conversation.
    pub fn reset(&self) {
        self.cancel();
        self.session.lock().reset();
        self.session.notify();
    }

    /// The sticky session id, once the agent has reported one.
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().session_id.clone()
    }

    pub fn agent_id(&self) -> Option<String> {
        self.session.lock().agent_id.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> ToolCallStats {
        self.session.lock().tracker.stats()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Returns a read view for a presentation loop.
    pub fn subscribe(&self) -> SessionView {
        SessionView {
            session: Arc::clone(&self.session),
            rx: self.session.subscribe(),
            seen: None,
        }
    }

    /// Builds a history record for this conversation.
    pub fn record(&self, agent_name: &str) -> SessionRecord {
        let state = self.session.lock();
        let messages = state.transcript.snapshot();
        SessionRecord {
            id: state
                .session_id
                .clone()
                .unwrap_or_else(|| state.local_id.to_string()),
            agent_id: state.agent_id.clone().unwrap_or_default(),
            agent_name: agent_name.to_string(),
            total_messages: messages.len(),
            total_tools_used: state.tracker.stats().total,
            messages,
            created_at: state.created_at,
            last_active: state.last_active,
        }
    }

    fn root_token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn_sweeper(&self) -> Result<(), SessionError> {
        use std::sync::atomic::Ordering;

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            SessionError::Config("session must be started inside a tokio runtime".into())
        })?;
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        handle.spawn(sweep_finished_tools(
            Arc::clone(&self.session),
            self.lifetime.clone(),
            self.config.sweep_interval,
            self.config.tool_grace,
        ));
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.lifetime.cancel();
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

async fn sweep_finished_tools(
    session: Arc<SharedSession>,
    lifetime: CancellationToken,
    interval: std::time::Duration,
    grace: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = session
                    .lock()
                    .tracker
                    .evict_expired(tokio::time::Instant::now(), grace);
                if evicted > 0 {
                    session.notify();
                }
            }
        }
    }
    debug!("tool sweeper stopped");
}

/// Handle to one background exchange.
pub struct ExchangeHandle {
    id: uuid::Uuid,
    cancel: CancellationToken,
    join: JoinHandle<Result<ExchangeOutcome, SessionError>>,
}

impl ExchangeHandle {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Cancels only this exchange.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the exchange to end.
    ///
    /// Agent errors and no-content timeouts come back as errors; partial
    /// content and cancellation are successful outcomes.
    pub async fn wait(self) -> Result<ExchangeOutcome, SessionError> {
        match self.join.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(ExchangeOutcome::Cancelled),
            Err(err) => Err(SessionError::Internal(format!(
                "exchange task failed: {err}"
            ))),
        }
    }
}

/// Read side of a session for a presentation loop.
///
/// `poll` is cheap and never waits, so it can run on every tick.
pub struct SessionView {
    session: Arc<SharedSession>,
    rx: watch::Receiver<u64>,
    seen: Option<u64>,
}

impl SessionView {
    /// Returns a fresh snapshot if the session changed since the last poll.
    pub fn poll(&mut self) -> Option<SessionSnapshot> {
        let current = *self.rx.borrow_and_update();
        if self.seen == Some(current) {
            return None;
        }
        self.seen = Some(current);
        Some(self.session.snapshot())
    }

    /// Returns a snapshot regardless of changes.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Waits until the session changes.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::errors::TransportError;
    use crate::event::{DisplayMessageType, StreamEvent};
    use crate::retry::RetryPolicy;
    use crate::test_support::ScriptedTransport;
    use crate::tracker::ToolStatus;

    fn controller(transport: &Arc<ScriptedTransport>) -> SessionController {
        controller_with(transport, EngineConfig::default())
    }

    fn controller_with(
        transport: &Arc<ScriptedTransport>,
        config: EngineConfig,
    ) -> SessionController {
        let transport: Arc<dyn AgentTransport> = transport.clone();
        let controller = SessionController::new(transport, config).expect("controller");
        controller.start("agent-1").expect("start");
        controller
    }

    fn agent_messages(snapshot: &SessionSnapshot) -> Vec<&DisplayMessage> {
        snapshot.messages.iter().filter(|m| !m.is_user).collect()
    }

    #[tokio::test]
    async fn streams_cumulative_text_into_one_final_entry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::delta("m1", "Hel"),
            StreamEvent::delta("m1", "Hello"),
            StreamEvent::delta("m1", "Hello world").finished(),
        ]);
        let controller = controller(&transport);

        let outcome = controller
            .send_message("hi")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        assert_eq!(outcome, ExchangeOutcome::Completed);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert!(snapshot.messages[0].is_user);
        let reply = snapshot.message("m1").expect("reply");
        assert_eq!(reply.content, "Hello world");
        assert!(reply.is_final);
        assert_eq!(reply.kind, DisplayMessageType::Text);
    }

    #[tokio::test]
    async fn tool_call_then_output_completes_tool() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "kubectl_get", "pods"),
            StreamEvent::tool_output("t1", "pods: 3").finished(),
        ]);
        let controller = controller(&transport);
        controller
            .send_message("list pods")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");

        let snapshot = controller.snapshot();
        let tool = snapshot.tool("t1").expect("tool record");
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.output, "pods: 3");
        assert_eq!(tool.name, "kubectl_get");
        assert_eq!(
            snapshot.stats,
            ToolCallStats {
                total: 1,
                active: 0,
                completed: 1,
                failed: 0
            }
        );
        let entry = snapshot.message("t1").expect("tool entry");
        assert_eq!(entry.kind, DisplayMessageType::ToolComplete);
        assert!(entry.is_final);
    }

    #[tokio::test]
    async fn error_output_without_prior_call_fails_tool() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_output("t2", "Error: connection refused").finished(),
        ]);
        let controller = controller(&transport);
        controller
            .send_message("curl it")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.tool("t2").map(|t| t.status), Some(ToolStatus::Failed));
        assert_eq!(snapshot.stats.failed, 1);
        assert!(snapshot.stats.is_consistent());
        assert_eq!(
            snapshot.message("t2").map(|m| m.kind),
            Some(DisplayMessageType::Error)
        );
    }

    #[tokio::test]
    async fn closed_stream_finalizes_buffered_text() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![StreamEvent::delta("m3", "Thinking")]);
        let controller = controller(&transport);

        let outcome = controller
            .send_message("think")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        assert_eq!(outcome, ExchangeOutcome::Partial);

        let snapshot = controller.snapshot();
        let entry = snapshot.message("m3").expect("entry");
        assert_eq!(entry.content, "Thinking");
        assert!(entry.is_final);
    }

    #[tokio::test]
    async fn closed_stream_fails_dangling_tools() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "helm_upgrade", "app"),
            StreamEvent::tool_output("t1", "upgrading"),
        ]);
        let controller = controller(&transport);
        controller
            .send_message("upgrade")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.tool("t1").map(|t| t.status), Some(ToolStatus::Failed));
        assert_eq!(snapshot.stats.active, 0);
        assert!(snapshot.stats.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_surface_transport_error_after_retries() {
        let transport = Arc::new(ScriptedTransport::failing(
            std::iter::repeat_n(TransportError::connect("connection refused"), 3).collect(),
        ));
        let controller = controller_with(
            &transport,
            EngineConfig::default().retry(RetryPolicy::fixed(3, 250)),
        );
        let started = tokio::time::Instant::now();
        let err = controller
            .send_message("hello")
            .await
            .err()
            .expect("transport error");

        assert!(matches!(err, SessionError::Transport { attempts: 3, .. }));
        assert_eq!(transport.attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_partial_text_finalizes_without_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events_then_hang(vec![StreamEvent::delta("m1", "Partial answ")]);
        let controller = controller_with(
            &transport,
            EngineConfig::default().call_timeout(Duration::from_secs(120)),
        );

        let outcome = controller
            .send_message("long question")
            .await
            .expect("send")
            .wait()
            .await
            .expect("partial completion");
        assert_eq!(outcome, ExchangeOutcome::Partial);

        let snapshot = controller.snapshot();
        let entry = snapshot.message("m1").expect("entry");
        assert_eq!(entry.content, "Partial answ");
        assert!(entry.is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_content_is_an_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events_then_hang(Vec::new());
        let controller = controller_with(
            &transport,
            EngineConfig::default().call_timeout(Duration::from_secs(5)),
        );
        let result = controller
            .send_message("anyone there?")
            .await
            .expect("send")
            .wait()
            .await;
        assert_eq!(
            result,
            Err(SessionError::Timeout {
                after: Duration::from_secs(5)
            })
        );
        assert!(agent_messages(&controller.snapshot()).is_empty());
    }

    #[tokio::test]
    async fn final_agent_error_stops_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        let tx = transport.push_manual();
        tx.send(StreamEvent::delta("m1", "Working"))
            .await
            .expect("send");
        tx.send(StreamEvent::error("e1", "agent crashed").finished())
            .await
            .expect("send");
        let controller = controller(&transport);

        let result = controller
            .send_message("go")
            .await
            .expect("send")
            .wait()
            .await;
        assert_eq!(result, Err(SessionError::Agent("agent crashed".into())));

        let snapshot = controller.snapshot();
        let error = snapshot.message("e1").expect("error entry");
        assert_eq!(error.kind, DisplayMessageType::Error);
        assert!(snapshot.message("m1").is_some_and(|m| m.is_final));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn session_id_is_sticky_across_messages() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::delta("m1", "hi").with_session("sess-42").finished(),
        ]);
        transport.push_events(vec![StreamEvent::delta("m2", "again").finished()]);
        let controller = controller(&transport);

        controller
            .send_message("first")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        assert_eq!(controller.session_id().as_deref(), Some("sess-42"));

        controller
            .send_message("second")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].session_id, None);
        assert_eq!(requests[1].session_id.as_deref(), Some("sess-42"));
        assert_eq!(controller.session_id().as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn cancel_twice_stops_consumer_and_freezes_transcript() {
        let transport = Arc::new(ScriptedTransport::new());
        let tx = transport.push_manual();
        let controller = controller(&transport);
        let mut view = controller.subscribe();

        let handle = controller.send_message("stream forever").await.expect("send");
        tx.send(StreamEvent::delta("m1", "first")).await.expect("send");
        while view
            .poll()
            .and_then(|snap| snap.message("m1").map(|m| m.content.clone()))
            .is_none()
        {
            view.changed().await;
        }

        controller.cancel();
        controller.cancel();
        assert_eq!(handle.wait().await, Ok(ExchangeOutcome::Cancelled));

        // the consumer dropped its receiver; later events go nowhere
        assert!(tx.send(StreamEvent::delta("m1", "first second")).await.is_err());
        let entry = controller.snapshot().message("m1").cloned().expect("entry");
        assert_eq!(entry.content, "first");
        assert!(!entry.is_final);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_harmless_and_controller_stays_usable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![StreamEvent::completion("m1", "done")]);
        transport.push_events(vec![StreamEvent::completion("m2", "again")]);
        let controller = controller(&transport);

        let handle = controller.send_message("one").await.expect("send");
        assert_eq!(handle.wait().await, Ok(ExchangeOutcome::Completed));
        controller.cancel();
        controller.cancel();

        let handle = controller.send_message("two").await.expect("send");
        assert_eq!(handle.wait().await, Ok(ExchangeOutcome::Completed));
        assert!(controller.snapshot().message("m2").is_some_and(|m| m.is_final));
    }

    #[tokio::test]
    async fn send_requires_start_and_text() {
        let transport: Arc<dyn AgentTransport> = Arc::new(ScriptedTransport::new());
        let controller =
            SessionController::new(transport, EngineConfig::default()).expect("controller");
        assert_eq!(
            controller.send_message("hi").await.err(),
            Some(SessionError::NotStarted)
        );
        controller.start("agent-1").expect("start");
        controller.start("agent-1").expect("idempotent start");
        assert!(matches!(
            controller.start("agent-2"),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            controller.send_message("   ").await,
            Err(SessionError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tools_are_evicted_after_grace_window() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "ls", ""),
            StreamEvent::tool_output("t1", "a b").finished(),
        ]);
        let controller = controller_with(
            &transport,
            EngineConfig::default()
                .tool_grace(Duration::from_secs(30))
                .sweep_interval(Duration::from_secs(1)),
        );
        controller
            .send_message("ls")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        assert!(controller.snapshot().tool("t1").is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(controller.snapshot().tool("t1").is_some());

        tokio::time::sleep(Duration::from_secs(25)).await;
        let snapshot = controller.snapshot();
        assert!(snapshot.tool("t1").is_none());
        assert_eq!(snapshot.stats.completed, 1);
        assert!(snapshot.message("t1").is_some());
    }

    #[tokio::test]
    async fn view_poll_reports_only_changes() {
        let transport = Arc::new(ScriptedTransport::new());
        let controller = controller(&transport);
        let mut view = controller.subscribe();
        assert!(view.poll().is_some());
        assert!(view.poll().is_none());

        transport.push_events(vec![StreamEvent::completion("m1", "ok")]);
        controller
            .send_message("hi")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        let snapshot = view.poll().expect("changed");
        assert!(snapshot.message("m1").is_some());
        assert!(view.poll().is_none());
    }

    #[tokio::test]
    async fn record_uses_session_id_and_counts_tools() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "ls", "").with_session("s-9"),
            StreamEvent::tool_output("t1", "ok").finished(),
            StreamEvent::completion("m1", "listed"),
        ]);
        let controller = controller(&transport);
        controller
            .send_message("ls")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");

        let record = controller.record("Ops Bot");
        assert_eq!(record.id, "s-9");
        assert_eq!(record.agent_id, "agent-1");
        assert_eq!(record.total_tools_used, 1);
        assert_eq!(record.total_messages, 3);
    }

    async fn run_exchange(
        transport: &Arc<ScriptedTransport>,
        events: Vec<StreamEvent>,
    ) -> (SessionController, Result<ExchangeOutcome, SessionError>) {
        transport.push_events(events);
        let controller = controller(transport);
        let outcome = controller.send_message("go").await.expect("send").wait().await;
        (controller, outcome)
    }

    #[tokio::test]
    async fn completion_for_one_message_keeps_others_open_until_close() {
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, outcome) = run_exchange(
            &transport,
            vec![
                StreamEvent::delta("m_a", "Thinking"),
                StreamEvent::completion("m_b", "Answer"),
            ],
        )
        .await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Partial));

        let snapshot = controller.snapshot();
        let first = snapshot.message("m_a").expect("m_a");
        assert_eq!((first.content.as_str(), first.is_final), ("Thinking", true));
        let second = snapshot.message("m_b").expect("m_b");
        assert_eq!((second.content.as_str(), second.is_final), ("Answer", true));
    }

    #[tokio::test]
    async fn tool_events_after_completion_are_applied() {
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, outcome) = run_exchange(
            &transport,
            vec![
                StreamEvent::completion("m1", "Checking"),
                StreamEvent::tool_call("t1", "kubectl", "get pods"),
                StreamEvent::tool_output("t1", "pods: 3").finished(),
            ],
        )
        .await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Completed));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.tool("t1").map(|t| t.status), Some(ToolStatus::Completed));
        assert_eq!(
            snapshot.stats,
            ToolCallStats {
                total: 1,
                active: 0,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn non_final_error_is_recorded_and_reading_continues() {
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, outcome) = run_exchange(
            &transport,
            vec![
                StreamEvent::delta("m1", "Working"),
                StreamEvent::error("e1", "rate limited, retrying"),
                StreamEvent::delta("m1", "Working done").finished(),
            ],
        )
        .await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Completed));

        let snapshot = controller.snapshot();
        let error = snapshot.message("e1").expect("error entry");
        assert_eq!(error.kind, DisplayMessageType::Error);
        assert_eq!(error.content, "rate limited, retrying");
        let reply = snapshot.message("m1").expect("reply");
        assert_eq!((reply.content.as_str(), reply.is_final), ("Working done", true));
    }

    #[tokio::test]
    async fn error_for_tracked_tool_flags_failure_without_finishing_it() {
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, outcome) = run_exchange(
            &transport,
            vec![
                StreamEvent::tool_call("t1", "deploy", "app"),
                StreamEvent::error("t1", "permission denied"),
                StreamEvent::tool_output("t1", "rolled back").finished(),
            ],
        )
        .await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Completed));

        let snapshot = controller.snapshot();
        let tool = snapshot.tool("t1").expect("tool");
        assert_eq!(tool.status, ToolStatus::Failed);
        assert_eq!(tool.error_text.as_deref(), Some("permission denied"));
        assert_eq!(snapshot.stats.failed, 1);
        assert_eq!(
            snapshot.message("t1").map(|m| m.kind),
            Some(DisplayMessageType::Error)
        );
        let error = snapshot.message("t1-error").expect("separate error entry");
        assert_eq!(error.content, "permission denied");
    }

    #[tokio::test]
    async fn error_reusing_a_text_id_gets_its_own_entry() {
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, outcome) = run_exchange(
            &transport,
            vec![
                StreamEvent::delta("m1", "Partial"),
                StreamEvent::error("m1", "stream hiccup"),
            ],
        )
        .await;
        assert_eq!(outcome, Ok(ExchangeOutcome::Partial));

        let snapshot = controller.snapshot();
        let text = snapshot.message("m1").expect("text");
        assert_eq!(text.kind, DisplayMessageType::Text);
        assert_eq!((text.content.as_str(), text.is_final), ("Partial", true));
        let error = snapshot.message("m1-error").expect("error entry");
        assert_eq!(error.kind, DisplayMessageType::Error);
        assert_eq!(error.content, "stream hiccup");
    }

    #[tokio::test(start_paused = true)]
    async fn tool_redelivered_after_eviction_is_not_recounted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "ls", ""),
            StreamEvent::tool_output("t1", "a b").finished(),
        ]);
        transport.push_events(vec![
            StreamEvent::tool_call("t1", "ls", ""),
            StreamEvent::tool_output("t1", "a b").finished(),
        ]);
        let controller = controller_with(
            &transport,
            EngineConfig::default()
                .tool_grace(Duration::from_secs(30))
                .sweep_interval(Duration::from_secs(1)),
        );
        controller
            .send_message("ls")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(controller.snapshot().tool("t1").is_none());

        controller
            .send_message("ls again")
            .await
            .expect("send")
            .wait()
            .await
            .expect("exchange");
        let stats = controller.stats();
        assert_eq!((stats.total, stats.completed, stats.active), (1, 1, 0));
    }
}
