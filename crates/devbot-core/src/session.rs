//! Session Client Adapter: owns login/teardown bounds and health probing for
//! one backend session at a time.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout, Duration};

use crate::{
    config::Config,
    errors::Error,
    transport::{
        port::{SessionClient, SessionConnector},
        types::EventReceiver,
    },
    Result,
};

/// One live session. Owned by the supervisor and replaced on every reconnect.
pub struct SessionHandle {
    client: Arc<dyn SessionClient>,
    generation: u64,
    connected_at: DateTime<Utc>,
    subscribed: bool,
}

impl SessionHandle {
    pub fn new(client: Arc<dyn SessionClient>, generation: u64) -> Self {
        Self {
            client,
            generation,
            connected_at: Utc::now(),
            subscribed: false,
        }
    }

    pub fn client(&self) -> Arc<dyn SessionClient> {
        self.client.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Subscribe to transport events at most once for this handle's lifetime.
    ///
    /// Returns `Ok(None)` when handlers are already attached.
    pub fn subscribe_once(&mut self) -> Result<Option<EventReceiver>> {
        if self.subscribed {
            return Ok(None);
        }
        let rx = self.client.subscribe()?;
        self.subscribed = true;
        Ok(Some(rx))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .field("connected_at", &self.connected_at)
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

/// Connection facts for the status surface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub has_session: bool,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub workspace_count: usize,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectionInfo {
    pub fn of(handle: &SessionHandle) -> Self {
        let identity = handle.client.identity();
        Self {
            has_session: true,
            generation: handle.generation,
            user_id: identity.as_ref().map(|i| i.user_id.0),
            username: identity.and_then(|i| i.username),
            workspace_count: handle.client.workspace_count(),
            ready: handle.client.is_ready(),
            connected_at: Some(handle.connected_at),
        }
    }
}

/// Healthy only with an identity plus either a joined workspace or the ready flag.
pub fn probe_health(handle: &SessionHandle) -> bool {
    let client = &handle.client;
    let has_identity = client.identity().is_some();
    let workspaces = client.workspace_count();
    let ready = client.is_ready();
    let healthy = has_identity && (workspaces > 0 || ready);
    tracing::debug!(
        generation = handle.generation,
        has_identity,
        workspaces,
        ready,
        "health probe: {}",
        if healthy { "connected" } else { "disconnected" }
    );
    healthy
}

pub struct SessionAdapter {
    connector: Arc<dyn SessionConnector>,
    token: String,
    login_timeout: Duration,
    teardown_timeout: Duration,
    settle_delay: Duration,
    generations: AtomicU64,
}

impl SessionAdapter {
    pub fn new(cfg: &Config, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            token: cfg.bot_token.clone(),
            login_timeout: cfg.login_timeout,
            teardown_timeout: cfg.teardown_timeout,
            settle_delay: cfg.settle_delay,
            generations: AtomicU64::new(0),
        }
    }

    /// Log in with the configured token.
    pub async fn connect(&self) -> Result<SessionHandle> {
        self.connect_with(&self.token).await
    }

    /// Log in, racing the backend against `login_timeout`.
    pub async fn connect_with(&self, token: &str) -> Result<SessionHandle> {
        tracing::info!("attempting to login");
        let client = match timeout(self.login_timeout, self.connector.login(token)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                tracing::error!("authentication error: {e}");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    "login timed out after {}s",
                    self.login_timeout.as_secs_f64()
                );
                return Err(Error::Timeout {
                    op: "login",
                    after: self.login_timeout,
                });
            }
        };

        // Give the backend a moment to finish wiring its own connections.
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SessionHandle::new(client, generation);
        let info = ConnectionInfo::of(&handle);
        tracing::info!(
            generation,
            user_id = ?info.user_id,
            workspaces = info.workspace_count,
            ready = info.ready,
            "authentication successful"
        );
        Ok(handle)
    }

    /// Best-effort close. A hung close is abandoned after `teardown_timeout`;
    /// the backend is left to collect the session.
    pub async fn teardown(&self, handle: SessionHandle) {
        let generation = handle.generation;
        tracing::info!(generation, "closing session");
        match timeout(self.teardown_timeout, handle.client.close()).await {
            Ok(Ok(())) => tracing::debug!(generation, "session closed"),
            Ok(Err(e)) => tracing::warn!(generation, "error during disconnect: {e}"),
            Err(_) => tracing::warn!(
                generation,
                "disconnect timed out after {}s, abandoning session",
                self.teardown_timeout.as_secs_f64()
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn connect_hands_out_increasing_generations() {
        let connector = FakeConnector::scripted(vec![]);
        let adapter = SessionAdapter::new(&test_config(), connector.clone());

        let a = adapter.connect().await.unwrap();
        let b = adapter.connect().await.unwrap();
        assert_eq!(a.generation(), 1);
        assert_eq!(b.generation(), 2);
        assert_eq!(connector.login_count(), 2);
    }

    #[tokio::test]
    async fn invalid_token_is_an_auth_error() {
        let adapter = SessionAdapter::new(&test_config(), FakeConnector::scripted(vec![]));
        let err = adapter.connect_with("invalid").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_login_times_out() {
        let adapter = SessionAdapter::new(
            &test_config(),
            FakeConnector::scripted(vec![Script::Hang]),
        );
        let err = adapter.connect().await.unwrap_err();
        match err {
            Error::Timeout { op, after } => {
                assert_eq!(op, "login");
                assert_eq!(after, Duration::from_secs(15));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_teardown_is_abandoned() {
        let mut session = FakeSession::new();
        session.hang_on_close = true;
        let session = Arc::new(session);
        let adapter = SessionAdapter::new(
            &test_config(),
            FakeConnector::scripted(vec![Script::Succeed(session.clone())]),
        );
        let handle = adapter.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        adapter.teardown(handle).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_once_is_idempotent() {
        let session = Arc::new(FakeSession::new());
        let mut handle = SessionHandle::new(session.clone(), 1);

        assert!(handle.subscribe_once().unwrap().is_some());
        assert!(handle.subscribe_once().unwrap().is_none());
        assert!(handle.is_subscribed());
        assert_eq!(session.subscribes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn health_requires_identity_and_workspace_or_ready() {
        let session = Arc::new(FakeSession::new());
        let handle = SessionHandle::new(session.clone(), 1);
        assert!(probe_health(&handle));

        session.workspaces.store(0, Ordering::SeqCst);
        assert!(probe_health(&handle), "ready flag alone is enough");

        session.ready.store(false, Ordering::SeqCst);
        assert!(!probe_health(&handle));

        session.workspaces.store(3, Ordering::SeqCst);
        *session.identity.lock().unwrap() = None;
        assert!(!probe_health(&handle), "identity is mandatory");
    }

    #[test]
    fn connection_info_reflects_the_handle() {
        let session = Arc::new(FakeSession::new());
        let handle = SessionHandle::new(session, 7);
        let info = ConnectionInfo::of(&handle);
        assert!(info.has_session);
        assert_eq!(info.generation, 7);
        assert_eq!(info.user_id, Some(BOT_ID.0));
        assert_eq!(info.workspace_count, 1);
        assert!(info.ready);
    }
}
