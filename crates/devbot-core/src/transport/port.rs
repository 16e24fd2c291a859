use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::ChannelId,
    transport::types::{EventReceiver, Identity},
    Result,
};

/// One authenticated session to the messaging backend.
///
/// Every backend adapter implements the full set; the supervisor never probes
/// for optional methods.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Logged-in identity, `None` once the backend no longer reports one.
    fn identity(&self) -> Option<Identity>;

    /// Number of workspaces (clans/servers/groups) the session has joined.
    fn workspace_count(&self) -> usize;

    /// Backend-reported readiness flag.
    fn is_ready(&self) -> bool;

    /// Attach to the session's event stream.
    ///
    /// Backends cannot detach handlers, so this hands out the single receiver
    /// and fails on any later call.
    fn subscribe(&self) -> Result<EventReceiver>;

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<()>;

    /// Graceful close. May hang; callers bound it with a timeout.
    async fn close(&self) -> Result<()>;
}

/// Creates sessions. Implementations map invalid credentials to `Error::Auth`.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn login(&self, token: &str) -> Result<Arc<dyn SessionClient>>;
}
