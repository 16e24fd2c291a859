//! Bot-management commands.
//!
//! Consumes what the command gate forwards and answers the lifecycle
//! commands. Everything else gets a short "unknown command" reply.

use devbot_core::{
    control::StatusPayload,
    dispatch::Dispatch,
    gate::COMMAND_PREFIXES,
    state::LifecycleState,
    supervisor::{ResetOutcome, Supervisor},
    transport::types::InboundMessage,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const HELP_TEXT: &str = "DevHelper bot commands:\n\
*ping - check the connection\n\
*help - show this help\n\
*botstatus - show the bot status\n\
*activate - enable command handling\n\
*deactivate [reason] - pause command handling\n\
*resetbot - reconnect the bot\n\
*bot status|on|off [reason]|reset - same, grouped";

const BOT_HELP_TEXT: &str = "Bot control:\n\
*bot status - show the current state\n\
*bot deactivate (or *bot off) [reason] - pause the bot, e.g. *bot off \"maintenance\"\n\
*bot activate (or *bot on) - resume after a pause\n\
*bot reset - reconnect the bot";

/// Split `*cmd arg1 "quoted arg"` into the lower-cased name and its args.
///
/// Telegram may append `@botname` to the command; it is dropped.
pub fn parse_command(text: &str) -> (String, Vec<String>) {
    let text = text.trim();
    let (first, rest) = match text.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest),
        None => (text, ""),
    };

    let name = first
        .trim_start_matches(COMMAND_PREFIXES)
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (name, split_args(rest))
}

/// Whitespace split that keeps double-quoted groups together.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

fn state_emoji(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Active => "🟢",
        LifecycleState::Inactive => "🔴",
        LifecycleState::Reconnecting => "🟡",
        LifecycleState::Error => "🟠",
    }
}

pub fn format_status(payload: &StatusPayload) -> String {
    let report = match payload {
        StatusPayload::Report(report) => report,
        StatusPayload::Degraded { error, .. } => {
            return format!("❌ Status unavailable: {error}");
        }
    };

    let mut lines = vec![
        format!("{} DevHelper bot status", state_emoji(report.state)),
        format!("State: {}", report.state.as_str()),
        format!("Since: {}", report.since.format("%Y-%m-%d %H:%M:%S UTC")),
        format!("Chats: {}", report.connection_info.workspace_count),
    ];
    if report.state != LifecycleState::Active {
        let reason = report
            .inactive_reason
            .as_deref()
            .or(report.last_error.as_deref())
            .unwrap_or("unknown");
        lines.push(format!("Reason: {reason}"));
    }
    lines.push(format!(
        "Reconnect attempts: {}/{}",
        report.reconnect_attempts, report.max_reconnect_attempts
    ));
    lines.push("Command prefix: *".to_string());
    lines.join("\n")
}

pub struct CommandHandler {
    sup: Supervisor,
}

impl CommandHandler {
    pub fn new(sup: Supervisor) -> Self {
        Self { sup }
    }

    pub async fn run(self, mut rx: UnboundedReceiver<Dispatch>) {
        while let Some(item) = rx.recv().await {
            self.handle(item).await;
        }
        tracing::debug!("command queue closed");
    }

    async fn handle(&self, item: Dispatch) {
        let (channel, reply) = match item {
            Dispatch::Message(msg) => (msg.channel_id, self.respond(&msg).await),
            Dispatch::Button(click) => {
                let reply = match click.custom_id.as_str() {
                    "help:bot" => Some(BOT_HELP_TEXT.to_string()),
                    other => {
                        tracing::debug!("unhandled button: {other}");
                        None
                    }
                };
                (click.channel_id, reply)
            }
        };

        let Some(reply) = reply else {
            return;
        };
        if let Err(e) = self.sup.send_text(channel, &reply).await {
            tracing::error!(channel = %channel, "failed to send command reply: {e}");
        }
    }

    /// Reply text for one forwarded message, `None` when nothing is sent.
    pub async fn respond(&self, msg: &InboundMessage) -> Option<String> {
        let (name, args) = parse_command(&msg.text);
        tracing::info!(user = %msg.author_id, "command: {name}");

        match name.as_str() {
            "ping" => Some(self.ping().await),
            "help" => Some(HELP_TEXT.to_string()),
            // The gate already switched the bot on and acknowledged it.
            "activate" => None,
            "deactivate" => Some(self.deactivate(&args)),
            "botstatus" => Some(format_status(&self.sup.status().await)),
            "bot" => Some(self.bot(&args).await),
            "" => None,
            other => Some(format!(
                "Unknown command: {other}. Type *help for the list of commands."
            )),
        }
    }

    async fn bot(&self, args: &[String]) -> String {
        let Some(sub) = args.first() else {
            return BOT_HELP_TEXT.to_string();
        };
        match sub.to_lowercase().as_str() {
            "status" => format_status(&self.sup.status().await),
            "deactivate" | "off" => self.deactivate(&args[1..]),
            "activate" | "on" => self.activate(),
            "reset" => self.reset().await,
            _ => BOT_HELP_TEXT.to_string(),
        }
    }

    async fn ping(&self) -> String {
        let chats = match self.sup.status().await {
            StatusPayload::Report(report) => report.connection_info.workspace_count,
            StatusPayload::Degraded { .. } => 0,
        };
        format!("🏓 Pong! Bot is running.\nConnected to {chats} chats.")
    }

    fn activate(&self) -> String {
        if self.sup.store().is_active() {
            return "✅ Bot is already active.".to_string();
        }
        self.sup.activate();
        "✅ Bot activated and ready for commands!".to_string()
    }

    fn deactivate(&self, args: &[String]) -> String {
        if !self.sup.store().is_active() {
            return "❌ Bot is already inactive.".to_string();
        }
        let reason = args.join(" ");
        self.sup.deactivate(&reason);
        let reason = self
            .sup
            .store()
            .state()
            .inactive_reason()
            .unwrap_or("Deactivated manually")
            .to_string();
        format!(
            "🛑 Bot paused.\nReason: {reason}\n\nType *activate or *bot on to enable it again."
        )
    }

    async fn reset(&self) -> String {
        match self.sup.reset().await {
            ResetOutcome::Reconnected => "🔄 Bot connection was reset successfully.".to_string(),
            ResetOutcome::Retrying => {
                "⚠️ Reset failed; retrying automatically in the background.".to_string()
            }
            ResetOutcome::Rejected => {
                "⏳ A reconnect is already in progress, try again shortly.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;
    use devbot_core::{
        config::Config,
        dispatch::QueuedDispatcher,
        domain::{ChannelId, UserId},
        transport::{
            port::{SessionClient, SessionConnector},
            types::{EventReceiver, EventSender, Identity, TransportEvent},
        },
        Error, Result,
    };
    use tokio::sync::mpsc;

    use super::*;

    struct StubSession {
        events: Mutex<Option<EventReceiver>>,
        _tx: EventSender,
    }

    #[async_trait]
    impl SessionClient for StubSession {
        fn identity(&self) -> Option<Identity> {
            Some(Identity {
                user_id: UserId(1),
                username: Some("devbot".to_string()),
            })
        }
        fn workspace_count(&self) -> usize {
            3
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn subscribe(&self) -> Result<EventReceiver> {
            self.events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Internal("already subscribed".to_string()))
        }
        async fn send_text(&self, _channel: ChannelId, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubConnector {
        logins: AtomicUsize,
    }

    #[async_trait]
    impl SessionConnector for StubConnector {
        async fn login(&self, _token: &str) -> Result<Arc<dyn SessionClient>> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel::<TransportEvent>();
            Ok(Arc::new(StubSession {
                events: Mutex::new(Some(rx)),
                _tx: tx,
            }))
        }
    }

    async fn handler() -> (CommandHandler, Supervisor, Arc<StubConnector>) {
        let mut cfg = Config::with_token("token".to_string());
        cfg.settle_delay = std::time::Duration::ZERO;
        let connector = Arc::new(StubConnector::default());
        let (dispatcher, _rx) = QueuedDispatcher::channel();
        let sup = Supervisor::new(Arc::new(cfg), connector.clone(), Arc::new(dispatcher));
        sup.start().await;
        (CommandHandler::new(sup.clone()), sup, connector)
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage::text(ChannelId(10), UserId(20), text)
    }

    #[test]
    fn parses_prefix_botname_and_case() {
        let (name, args) = parse_command("/BotStatus@devhelper_bot");
        assert_eq!(name, "botstatus");
        assert!(args.is_empty());

        let (name, args) = parse_command("*bot off \"planned maintenance\" now");
        assert_eq!(name, "bot");
        assert_eq!(args, vec!["off", "planned maintenance", "now"]);
    }

    #[test]
    fn split_args_handles_empty_quotes_and_spacing() {
        assert_eq!(split_args("  a   b "), vec!["a", "b"]);
        assert_eq!(split_args("\"\" x"), vec!["", "x"]);
        assert!(split_args("").is_empty());
    }

    #[test]
    fn degraded_status_is_reported() {
        let payload = StatusPayload::Degraded {
            status: "error",
            error: "lock poisoned".to_string(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(format_status(&payload), "❌ Status unavailable: lock poisoned");
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reports_chat_count() {
        let (handler, sup, _) = handler().await;
        let reply = handler.respond(&msg("*ping")).await.unwrap();
        assert!(reply.contains("Connected to 3 chats"), "{reply}");
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_then_status_then_bot_on() {
        let (handler, sup, _) = handler().await;

        let reply = handler
            .respond(&msg("*deactivate \"db migration\""))
            .await
            .unwrap();
        assert!(reply.contains("Reason: db migration"), "{reply}");
        assert!(!sup.store().is_active());

        let again = handler.respond(&msg("*bot off")).await.unwrap();
        assert_eq!(again, "❌ Bot is already inactive.");

        let status = handler.respond(&msg("*botstatus")).await.unwrap();
        assert!(status.contains("State: inactive"), "{status}");
        assert!(status.contains("Reason: db migration"), "{status}");
        assert!(status.contains("Reconnect attempts: 0/No limit"), "{status}");

        let on = handler.respond(&msg("*bot on")).await.unwrap();
        assert_eq!(on, "✅ Bot activated and ready for commands!");
        assert!(sup.store().is_active());
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bot_reset_reconnects() {
        let (handler, sup, connector) = handler().await;
        let reply = handler.respond(&msg("*bot reset")).await.unwrap();
        assert_eq!(reply, "🔄 Bot connection was reset successfully.");
        assert_eq!(connector.logins.load(Ordering::SeqCst), 2);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn activate_is_left_to_the_gate_and_unknown_gets_hint() {
        let (handler, sup, _) = handler().await;
        assert!(handler.respond(&msg("*activate")).await.is_none());

        let reply = handler.respond(&msg("*bug list")).await.unwrap();
        assert!(reply.starts_with("Unknown command: bug"), "{reply}");
        assert_eq!(handler.respond(&msg("*bot")).await.unwrap(), BOT_HELP_TEXT);
        sup.shutdown().await;
    }
}
