//! Telegram adapter (teloxide).
//!
//! This crate implements the `devbot-core` session ports over the Telegram
//! Bot API. One `TelegramSession` is one long-polling dispatcher; closing it
//! stops polling and drops the event stream.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;

use teloxide::{dispatching::ShutdownToken, prelude::*, ApiError, RequestError};

use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

pub mod router;

use devbot_core::{
    domain::{ChannelId, UserId},
    errors::Error,
    transport::{
        port::{SessionClient, SessionConnector},
        types::{EventReceiver, Identity, TransportEvent},
    },
    Result,
};

/// Logs in with `getMe` and starts long polling.
#[derive(Clone, Default)]
pub struct TelegramConnector;

impl TelegramConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionConnector for TelegramConnector {
    async fn login(&self, token: &str) -> Result<Arc<dyn SessionClient>> {
        let bot = Bot::new(token);
        let me = bot.get_me().await.map_err(map_login_err)?;
        let identity = Identity {
            user_id: UserId(me.user.id.0 as i64),
            username: me.user.username.clone(),
        };
        tracing::info!(
            user_id = identity.user_id.0,
            username = identity.username.as_deref().unwrap_or("-"),
            "logged in to telegram"
        );
        Ok(TelegramSession::start(bot, identity))
    }
}

// Telegram answers a bad token with 404 "Not Found", which teloxide parses
// as `ApiError::NotFound`.
fn map_login_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => Error::Auth("invalid bot token".to_string()),
        other => map_err(other),
    }
}

fn map_err(e: RequestError) -> Error {
    Error::Transport(format!("telegram error: {e}"))
}

pub struct TelegramSession {
    bot: Bot,
    me: Identity,
    events: Mutex<Option<EventReceiver>>,
    shutdown: ShutdownToken,
    ready: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramSession {
    fn start(bot: Bot, me: Identity) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let mut dispatcher = router::build_dispatcher(bot.clone(), tx.clone());
        let shutdown = dispatcher.shutdown_token();

        let task = {
            let bot = bot.clone();
            let ready = ready.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                let _ = tx.send(TransportEvent::Connected);
                router::poll(&mut dispatcher, bot, tx.clone()).await;
                ready.store(false, Ordering::SeqCst);
                if !closing.load(Ordering::SeqCst) {
                    tracing::warn!("telegram polling stopped unexpectedly");
                    let _ = tx.send(TransportEvent::Disconnected);
                }
            })
        };

        Arc::new(Self {
            bot,
            me,
            events: Mutex::new(Some(rx)),
            shutdown,
            ready,
            closing,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(channel: ChannelId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(channel.0)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(map_err(other)),
            }
        }
    }
}

#[async_trait]
impl SessionClient for TelegramSession {
    fn identity(&self) -> Option<Identity> {
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.me.clone())
    }

    // Telegram bots have no server/clan membership list to count.
    fn workspace_count(&self) -> usize {
        0
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Result<EventReceiver> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Internal("telegram event stream already taken".to_string()))
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.with_retry(|| self.bot.send_message(Self::tg_chat(channel), text.to_string()))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        match self.shutdown.shutdown() {
            Ok(done) => done.await,
            Err(_) => tracing::debug!("telegram dispatcher was not running"),
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}
