//! A consumer attached to one review session at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use prlens_core::retry::BackoffPolicy;
use prlens_core::{ControlError, Event};
use prlens_settings::ClientSettings;
use prlens_tokens::StreamingParse;
use prlens_upstream::{AgentControl, PromptRequest, SendOutcome};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::StreamBuffer;
use crate::feed::EventFeed;
use crate::state::{ConnectionSignal, ConnectionState};

const UPDATES_CAPACITY: usize = 256;

/// Tunables for [`SessionClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// How long `send_message` waits for the stream before sending anyway.
    pub send_wait_timeout: Duration,
    /// Reconnect policy for the drain loop.
    pub reconnect: BackoffPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            send_wait_timeout: Duration::from_secs(5),
            reconnect: BackoffPolicy {
                max_attempts: Some(10),
                ..BackoffPolicy::default()
            },
        }
    }
}

impl ClientOptions {
    /// Options from the `client` settings section.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            send_wait_timeout: settings.send_wait_timeout(),
            reconnect: settings.reconnect.policy(),
        }
    }
}

/// Session client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No session attached.
    #[error("no session attached")]
    NotConnected,
    /// `connect` while attached to another session; use `switch_session`.
    #[error("already attached to session {0}")]
    AlreadyAttached(String),
    /// Empty session id.
    #[error("session id is empty")]
    EmptySession,
    /// The control surface failed.
    #[error(transparent)]
    Control(#[from] ControlError),
}

struct Attachment {
    session_id: String,
    cancel: CancellationToken,
    buffer: StreamBuffer,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    /// Bumped on every attach and teardown; a drain task whose generation
    /// is stale can no longer touch state, buffer or updates.
    generation: u64,
    attachment: Option<Attachment>,
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    updates: broadcast::Sender<Event>,
    shared: Mutex<Shared>,
}

impl Inner {
    fn transition(&self, signal: ConnectionSignal) {
        let _ = self.state.send_if_modified(|state| match state.next(signal) {
            Ok(next) => {
                let changed = *state != next;
                *state = next;
                changed
            }
            Err(e) => {
                warn!(error = %e, "ignoring connection signal");
                false
            }
        });
    }

    /// Apply `signal` on behalf of drain task `generation`. `false` once
    /// that task has been superseded.
    fn signal(&self, generation: u64, signal: ConnectionSignal) -> bool {
        let shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }
        self.transition(signal);
        true
    }

    fn deliver(&self, generation: u64, event: Event) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }
        if let Some(attachment) = shared.attachment.as_mut() {
            attachment.buffer.apply(&event);
        }
        let _ = self.updates.send(event);
        true
    }
}

/// Attaches to a session's event stream, keeps it alive across
/// interruptions and folds its events into a [`StreamBuffer`].
///
/// At most one session is attached. Switching tears down the old stream and
/// buffer before the new attach starts, and a superseded drain task can no
/// longer deliver anything.
pub struct SessionClient {
    feed: Arc<dyn EventFeed>,
    control: Arc<dyn AgentControl>,
    options: ClientOptions,
    inner: Arc<Inner>,
}

impl SessionClient {
    /// Client over `feed` (events) and `control` (send / abort).
    pub fn new(
        feed: Arc<dyn EventFeed>,
        control: Arc<dyn AgentControl>,
        options: ClientOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            feed,
            control,
            options,
            inner: Arc::new(Inner {
                state,
                updates,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every event applied from now on, for live rendering.
    pub fn updates(&self) -> broadcast::Receiver<Event> {
        self.inner.updates.subscribe()
    }

    /// Attached session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .shared
            .lock()
            .attachment
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Read the active session's buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&StreamBuffer) -> R) -> Option<R> {
        self.inner
            .shared
            .lock()
            .attachment
            .as_ref()
            .map(|a| f(&a.buffer))
    }

    /// Parsed view of the latest message of the active session.
    pub fn parsed(&self) -> Option<StreamingParse> {
        self.with_buffer(StreamBuffer::parsed).flatten()
    }

    /// Attach to `session_id`. A no-op when already attached to it.
    pub fn connect(&self, session_id: &str) -> Result<(), ClientError> {
        if session_id.is_empty() {
            return Err(ClientError::EmptySession);
        }
        let mut shared = self.inner.shared.lock();
        if let Some(current) = &shared.attachment {
            if current.session_id == session_id {
                return Ok(());
            }
            return Err(ClientError::AlreadyAttached(current.session_id.clone()));
        }
        self.attach(&mut shared, session_id);
        Ok(())
    }

    /// Detach from the current session (stream and buffer), then attach to
    /// `session_id`.
    pub async fn switch_session(&self, session_id: &str) -> Result<(), ClientError> {
        if session_id.is_empty() {
            return Err(ClientError::EmptySession);
        }
        if let Some(previous) = self.teardown().await {
            info!(from = %previous, to = session_id, "switching session");
        }
        let mut shared = self.inner.shared.lock();
        // A concurrent connect may have won the race.
        if let Some(current) = &shared.attachment {
            return Err(ClientError::AlreadyAttached(current.session_id.clone()));
        }
        self.attach(&mut shared, session_id);
        Ok(())
    }

    /// Detach. The session's stream is released before this returns.
    pub async fn disconnect(&self) {
        if let Some(previous) = self.teardown().await {
            info!(session_id = %previous, "disconnected");
        }
        self.inner.transition(ConnectionSignal::Close);
    }

    /// Wait up to `timeout` for the stream to be connected.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut states = self.inner.state.subscribe();
        matches!(
            tokio::time::timeout(
                timeout,
                states.wait_for(|s| *s == ConnectionState::Connected)
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Send a user message to the attached session.
    ///
    /// Waits up to the configured send timeout for the stream so the reply
    /// is not missed, then sends regardless.
    pub async fn send_message(
        &self,
        text: &str,
        agent_mode: Option<&str>,
    ) -> Result<SendOutcome, ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NotConnected)?;
        if !self.wait_connected(self.options.send_wait_timeout).await {
            warn!(
                session_id,
                state = %self.state(),
                "stream not connected, sending anyway"
            );
        }
        let mut request = PromptRequest::new(text);
        if let Some(mode) = agent_mode {
            request = request.with_agent_mode(mode);
        }
        Ok(self.control.send_message(&session_id, &request).await?)
    }

    /// Abort whatever the attached session is doing.
    pub async fn abort(&self) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::NotConnected)?;
        Ok(self.control.abort(&session_id).await?)
    }

    fn attach(&self, shared: &mut Shared, session_id: &str) {
        shared.generation += 1;
        let generation = shared.generation;
        let cancel = CancellationToken::new();
        self.inner.transition(ConnectionSignal::Subscribe);

        let task = tokio::spawn(drive(
            Arc::clone(&self.inner),
            Arc::clone(&self.feed),
            session_id.to_string(),
            generation,
            cancel.clone(),
            self.options.reconnect.clone(),
        ));
        shared.attachment = Some(Attachment {
            session_id: session_id.to_string(),
            cancel,
            buffer: StreamBuffer::new(),
            task: Some(task),
        });
        debug!(session_id, generation, "attaching");
    }

    async fn teardown(&self) -> Option<String> {
        let mut attachment = {
            let mut shared = self.inner.shared.lock();
            shared.generation += 1;
            shared.attachment.take()?
        };
        attachment.cancel.cancel();
        if let Some(task) = attachment.task.take() {
            let _ = task.await;
        }
        Some(attachment.session_id)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock();
        shared.generation += 1;
        if let Some(attachment) = shared.attachment.take() {
            attachment.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Drain loop for one attachment: attach, forward events, reconnect with
/// backoff, give up when the policy is exhausted.
async fn drive(
    inner: Arc<Inner>,
    feed: Arc<dyn EventFeed>,
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
    policy: BackoffPolicy,
) {
    let mut failures: u32 = 0;
    loop {
        let attached = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            attached = feed.attach(&session_id) => attached,
        };

        match attached {
            Ok(mut stream) => {
                failures = 0;
                if !inner.signal(generation, ConnectionSignal::Established) {
                    return;
                }
                info!(session_id, "session stream attached");
                loop {
                    let item = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(event)) => {
                            if !inner.deliver(generation, event) {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(session_id, error = %e, kind = e.kind(), "session stream failed");
                            break;
                        }
                        None => {
                            debug!(session_id, "session stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    session_id,
                    error = %e,
                    kind = e.kind(),
                    attempt = failures + 1,
                    "attach failed"
                );
            }
        }

        failures += 1;
        if !inner.signal(generation, ConnectionSignal::Interrupted) {
            return;
        }
        if policy.exhausted(failures) {
            warn!(session_id, attempts = failures, "giving up on session stream");
            let _ = inner.signal(generation, ConnectionSignal::GaveUp);
            return;
        }
        let delay = policy.delay_for(failures - 1);
        debug!(session_id, attempt = failures, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use prlens_core::ConnectionError;
    use prlens_router::SessionRouter;
    use tokio::time::timeout;

    use super::*;
    use crate::feed::{EventStream, RouterFeed};

    mockall::mock! {
        Control {}

        #[async_trait]
        impl AgentControl for Control {
            async fn send_message(
                &self,
                session_id: &str,
                request: &PromptRequest,
            ) -> Result<SendOutcome, ControlError>;
            async fn abort(&self, session_id: &str) -> Result<(), ControlError>;
        }
    }

    /// Never finishes attaching.
    struct StalledFeed;

    #[async_trait]
    impl EventFeed for StalledFeed {
        async fn attach(&self, _session_id: &str) -> Result<EventStream, ConnectionError> {
            futures::future::pending().await
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_options(max_attempts: Option<u32>) -> ClientOptions {
        ClientOptions {
            send_wait_timeout: Duration::from_secs(5),
            reconnect: BackoffPolicy::fixed(
                Duration::from_millis(10),
                Duration::from_millis(10),
                max_attempts,
            ),
        }
    }

    fn client(router: &SessionRouter, control: MockControl, options: ClientOptions) -> SessionClient {
        SessionClient::new(
            Arc::new(RouterFeed::new(router.clone())),
            Arc::new(control),
            options,
        )
    }

    fn delta(session: &str, text: &str) -> Event {
        Event::TextDelta {
            session_id: session.into(),
            message_id: format!("msg_{session}"),
            part_id: "prt_1".into(),
            delta: text.into(),
        }
    }

    async fn next_update(updates: &mut broadcast::Receiver<Event>) -> Event {
        timeout(WAIT, updates.recv()).await.unwrap().unwrap()
    }

    async fn wait_for_state(client: &SessionClient, want: ConnectionState) {
        let mut states = client.watch_state();
        let _ = timeout(WAIT, states.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    // ── Attach and switch ──

    #[tokio::test]
    async fn streams_session_events_into_buffer() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        client.connect("ses_a").unwrap();
        assert!(client.wait_connected(WAIT).await);
        assert!(router.is_subscribed("ses_a"));

        let mut updates = client.updates();
        let _ = router.publish(&delta("ses_b", "not mine"));
        let _ = router.publish(&delta("ses_a", "Hello"));
        let _ = router.publish(&delta("ses_a", " there"));
        assert_eq!(next_update(&mut updates).await, delta("ses_a", "Hello"));
        assert_eq!(next_update(&mut updates).await, delta("ses_a", " there"));

        let text = client.with_buffer(|b| b.message_text("msg_ses_a")).flatten();
        assert_eq!(text.as_deref(), Some("Hello there"));
        assert!(client.with_buffer(|b| b.message_text("msg_ses_b")).flatten().is_none());
    }

    #[tokio::test]
    async fn connect_rules() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        assert_matches!(client.connect(""), Err(ClientError::EmptySession));
        client.connect("ses_a").unwrap();
        client.connect("ses_a").unwrap();
        assert_matches!(
            client.connect("ses_b"),
            Err(ClientError::AlreadyAttached(current)) if current == "ses_a"
        );
    }

    #[tokio::test]
    async fn switch_session_drops_old_stream_and_buffer() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        client.connect("ses_a").unwrap();
        assert!(client.wait_connected(WAIT).await);
        let mut updates = client.updates();
        let _ = router.publish(&delta("ses_a", "old"));
        let _ = next_update(&mut updates).await;

        client.switch_session("ses_b").await.unwrap();
        assert!(!router.is_subscribed("ses_a"));
        assert_eq!(client.session_id().as_deref(), Some("ses_b"));
        assert!(client.with_buffer(|b| b.latest().is_none()).unwrap());

        assert!(client.wait_connected(WAIT).await);
        let mut updates = client.updates();
        let _ = router.publish(&delta("ses_a", "stale"));
        let _ = router.publish(&delta("ses_b", "fresh"));
        assert_eq!(next_update(&mut updates).await, delta("ses_b", "fresh"));
        assert!(client.with_buffer(|b| b.message_text("msg_ses_a")).flatten().is_none());
    }

    // ── Reconnection ──

    #[tokio::test]
    async fn reconnects_after_interruption() {
        let router = SessionRouter::new(16);
        // Long enough to observe the reconnecting state before it clears.
        let options = ClientOptions {
            reconnect: BackoffPolicy::fixed(
                Duration::from_millis(200),
                Duration::from_millis(200),
                Some(3),
            ),
            ..ClientOptions::default()
        };
        let client = client(&router, MockControl::new(), options);
        client.connect("ses_a").unwrap();
        assert!(client.wait_connected(WAIT).await);

        let mut states = client.watch_state();
        assert!(router.unsubscribe("ses_a"));
        let _ = timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Reconnecting))
            .await
            .unwrap()
            .unwrap();
        assert!(client.wait_connected(WAIT).await);
        assert!(router.is_subscribed("ses_a"));
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let router = SessionRouter::new(16);
        router.shutdown();
        let client = client(&router, MockControl::new(), fast_options(Some(2)));
        client.connect("ses_a").unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        wait_for_state(&client, ConnectionState::Disconnected).await;
        // Still attached: a retry is a fresh switch.
        assert_eq!(client.session_id().as_deref(), Some("ses_a"));
    }

    #[tokio::test]
    async fn disconnect_releases_subscription() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        client.connect("ses_a").unwrap();
        assert!(client.wait_connected(WAIT).await);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.session_id().is_none());
        assert!(!router.is_subscribed("ses_a"));
        assert!(client.parsed().is_none());
    }

    #[tokio::test]
    async fn dropping_client_releases_subscription() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        client.connect("ses_a").unwrap();
        assert!(client.wait_connected(WAIT).await);
        drop(client);

        timeout(WAIT, async {
            while router.is_subscribed("ses_a") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    // ── Control ──

    #[tokio::test]
    async fn send_message_when_connected() {
        let router = SessionRouter::new(16);
        let mut control = MockControl::new();
        control
            .expect_send_message()
            .withf(|session_id, request| {
                session_id.to_string() == "ses_a"
                    && request.text == "review please"
                    && request.agent_mode.as_deref() == Some("plan")
            })
            .times(1)
            .returning(|_, _| Ok(SendOutcome::Accepted));
        let client = client(&router, control, fast_options(None));
        client.connect("ses_a").unwrap();

        let outcome = client.send_message("review please", Some("plan")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_proceeds_after_wait_timeout() {
        let mut control = MockControl::new();
        control
            .expect_send_message()
            .times(1)
            .returning(|_, _| {
                Ok(SendOutcome::Rejected {
                    reason: "busy".into(),
                })
            });
        let client = SessionClient::new(Arc::new(StalledFeed), Arc::new(control), ClientOptions::default());
        client.connect("ses_a").unwrap();

        let started = tokio::time::Instant::now();
        let outcome = client.send_message("hi", None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_matches!(outcome, SendOutcome::Rejected { reason } if reason == "busy");
    }

    #[tokio::test]
    async fn send_without_session() {
        let router = SessionRouter::new(16);
        let client = client(&router, MockControl::new(), fast_options(None));
        assert_matches!(
            client.send_message("hi", None).await,
            Err(ClientError::NotConnected)
        );
        assert_matches!(client.abort().await, Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn abort_and_control_errors() {
        let router = SessionRouter::new(16);
        let mut control = MockControl::new();
        control
            .expect_abort()
            .withf(|session_id| session_id.to_string() == "ses_a")
            .times(1)
            .returning(|_| Err(ControlError::Unreachable("connection refused".into())));
        let client = client(&router, control, fast_options(None));
        client.connect("ses_a").unwrap();

        assert_matches!(
            client.abort().await,
            Err(ClientError::Control(ControlError::Unreachable(_)))
        );
    }

    #[test]
    fn options_from_settings() {
        let settings = ClientSettings::default();
        let options = ClientOptions::from_settings(&settings);
        assert_eq!(options.send_wait_timeout, Duration::from_secs(5));
        assert_eq!(options.reconnect.max_attempts, Some(10));
    }
}
