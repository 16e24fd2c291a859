//! Command gate: decides per inbound message whether it is a control command,
//! not a command at all, or a normal command that only passes while active.

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::{
    dispatch::{CommandDispatcher, Dispatch},
    domain::UserId,
    state::StateStore,
    transport::types::{ButtonClick, InboundMessage},
};

/// Characters that mark a message as a command.
pub const COMMAND_PREFIXES: [char; 3] = ['*', '/', '\\'];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Force the bot active, acknowledge, then dispatch.
    Activate,
    /// Reconnect the session; not dispatched.
    Reset,
    /// Lifecycle command that is dispatched in every state.
    Control,
    /// Normal command; dispatched only while active.
    Gated,
    /// No command prefix.
    NotACommand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    OwnMessage,
    Empty,
    NotACommand,
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Forwarded,
    Activated,
    ResetRequested,
    Dropped(DropReason),
}

struct ControlPatterns {
    activate: Regex,
    reset: Regex,
    deactivate: Regex,
    botstatus: Regex,
    bot_subcommand: Regex,
}

fn patterns() -> &'static ControlPatterns {
    static PATTERNS: OnceLock<ControlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ControlPatterns {
        activate: Regex::new(r"^(?:[*/\\]activate|activate(?: |$))").expect("valid regex"),
        reset: Regex::new(r"^(?:[*/\\]resetbot|resetbot$)").expect("valid regex"),
        deactivate: Regex::new(r"^[*/\\]deactivate").expect("valid regex"),
        botstatus: Regex::new(r"^[*/\\]botstatus").expect("valid regex"),
        bot_subcommand: Regex::new(r"^[*/\\]bot ").expect("valid regex"),
    })
}

/// Pure classification of the message text.
///
/// Control patterns are plain prefix matches on the raw text. Activation and
/// reset are recognised before the prefix check, so their bare forms
/// (`activate`, `resetbot`) work without a prefix. Only the prefix check
/// skips leading whitespace.
pub fn classify(text: &str) -> Verdict {
    let p = patterns();

    if p.activate.is_match(text) {
        return Verdict::Activate;
    }
    if p.reset.is_match(text) {
        return Verdict::Reset;
    }
    if !text.trim_start().starts_with(COMMAND_PREFIXES) {
        return Verdict::NotACommand;
    }
    if p.deactivate.is_match(text) || p.botstatus.is_match(text) || p.bot_subcommand.is_match(text)
    {
        return Verdict::Control;
    }
    Verdict::Gated
}

pub struct CommandGate {
    store: Arc<StateStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl CommandGate {
    pub fn new(store: Arc<StateStore>, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Apply the gate to one channel message.
    ///
    /// Activation is applied here; acknowledging it and running a reset need
    /// the live session, so those are left to the caller.
    pub fn on_message(&self, msg: InboundMessage, self_id: Option<UserId>) -> GateOutcome {
        if self_id == Some(msg.author_id) {
            return GateOutcome::Dropped(DropReason::OwnMessage);
        }
        if msg.text.trim().is_empty() {
            tracing::debug!(channel = %msg.channel_id, "received empty message");
            return GateOutcome::Dropped(DropReason::Empty);
        }

        tracing::debug!(
            channel = %msg.channel_id,
            "received message: {}...",
            msg.preview()
        );

        match classify(&msg.text) {
            Verdict::Activate => {
                tracing::info!("activation command received, activating bot");
                self.store.set_active();
                self.dispatcher.dispatch(Dispatch::Message(msg));
                GateOutcome::Activated
            }
            Verdict::Reset => {
                tracing::info!("reset command received, resetting bot connection");
                GateOutcome::ResetRequested
            }
            Verdict::NotACommand => {
                tracing::debug!("skipping message without valid prefix: {}", msg.preview());
                GateOutcome::Dropped(DropReason::NotACommand)
            }
            Verdict::Control => {
                self.dispatcher.dispatch(Dispatch::Message(msg));
                GateOutcome::Forwarded
            }
            Verdict::Gated => {
                if self.store.is_active() {
                    self.dispatcher.dispatch(Dispatch::Message(msg));
                    GateOutcome::Forwarded
                } else {
                    tracing::debug!("bot inactive, dropping: {}", msg.preview());
                    GateOutcome::Dropped(DropReason::Inactive)
                }
            }
        }
    }

    /// Button clicks only pass the active-state check; there are no control buttons.
    pub fn on_button(&self, click: ButtonClick, self_id: Option<UserId>) -> GateOutcome {
        if self_id == Some(click.user_id) {
            return GateOutcome::Dropped(DropReason::OwnMessage);
        }
        if click.custom_id.is_empty() {
            tracing::debug!("received invalid button click");
            return GateOutcome::Dropped(DropReason::Empty);
        }
        tracing::debug!(channel = %click.channel_id, "button click: {}", click.custom_id);

        if !self.store.is_active() {
            return GateOutcome::Dropped(DropReason::Inactive);
        }
        self.dispatcher.dispatch(Dispatch::Button(click));
        GateOutcome::Forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelId;
    use crate::state::LifecycleState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        items: Mutex<Vec<Dispatch>>,
    }

    impl RecordingDispatcher {
        fn texts(&self) -> Vec<String> {
            self.items
                .lock()
                .unwrap()
                .iter()
                .map(|d| match d {
                    Dispatch::Message(m) => m.text.clone(),
                    Dispatch::Button(b) => format!("button:{}", b.custom_id),
                })
                .collect()
        }
    }

    impl CommandDispatcher for RecordingDispatcher {
        fn dispatch(&self, item: Dispatch) {
            self.items.lock().unwrap().push(item);
        }
    }

    fn gate() -> (CommandGate, Arc<StateStore>, Arc<RecordingDispatcher>) {
        let store = Arc::new(StateStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        (
            CommandGate::new(store.clone(), dispatcher.clone()),
            store,
            dispatcher,
        )
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage::text(ChannelId(10), UserId(7), text)
    }

    #[test]
    fn classifies_control_patterns() {
        for text in [
            "*activate",
            "/activate",
            "\\activate",
            "activate",
            "activate now",
            "*activated",
        ] {
            assert_eq!(classify(text), Verdict::Activate, "{text}");
        }
        for text in ["*resetbot", "/resetbot", "\\resetbot", "resetbot"] {
            assert_eq!(classify(text), Verdict::Reset, "{text}");
        }
        for text in [
            "*deactivate",
            "/deactivate maintenance",
            "*deactivated",
            "*botstatus",
            "*botstatusx",
            "/bot off reason",
            "*bot ",
        ] {
            assert_eq!(classify(text), Verdict::Control, "{text}");
        }
        for text in ["hello", "deactivate", "botstatus", "activated", "resetbot please"] {
            assert_eq!(classify(text), Verdict::NotACommand, "{text}");
        }
        for text in ["*ping", "/help", "\\bug list", "*bot", "*botanist"] {
            assert_eq!(classify(text), Verdict::Gated, "{text}");
        }
    }

    #[test]
    fn only_the_prefix_check_skips_leading_whitespace() {
        assert_eq!(classify("   *ping"), Verdict::Gated);
        assert_eq!(classify("  *activate"), Verdict::Gated);
        assert_eq!(classify("  *deactivate"), Verdict::Gated);
        assert_eq!(classify("  activate"), Verdict::NotACommand);
    }

    #[test]
    fn activate_opens_an_inactive_gate_and_is_dispatched() {
        let (gate, store, dispatcher) = gate();
        store.set_inactive("maintenance");

        assert_eq!(gate.on_message(msg("*activate"), None), GateOutcome::Activated);
        assert_eq!(store.state().state.tag(), LifecycleState::Active);
        assert_eq!(dispatcher.texts(), vec!["*activate"]);
    }

    #[test]
    fn unprefixed_text_is_dropped_and_state_kept() {
        let (gate, store, dispatcher) = gate();
        store.set_inactive("maintenance");

        assert_eq!(
            gate.on_message(msg("hello"), None),
            GateOutcome::Dropped(DropReason::NotACommand)
        );
        assert_eq!(store.state().state.tag(), LifecycleState::Inactive);
        assert!(dispatcher.texts().is_empty());
    }

    #[test]
    fn bot_subcommand_passes_while_active_without_side_effects() {
        let (gate, store, dispatcher) = gate();
        store.set_active();

        assert_eq!(gate.on_message(msg("*bot off reason"), None), GateOutcome::Forwarded);
        assert!(store.is_active(), "deactivation is the dispatcher's job");
        assert_eq!(dispatcher.texts(), vec!["*bot off reason"]);
    }

    #[test]
    fn botstatus_passes_in_every_state() {
        let (gate, store, dispatcher) = gate();
        store.set_active();
        assert_eq!(gate.on_message(msg("*botstatus"), None), GateOutcome::Forwarded);
        store.set_inactive("off");
        assert_eq!(gate.on_message(msg("*botstatus"), None), GateOutcome::Forwarded);
        store.set_error("boom");
        assert_eq!(gate.on_message(msg("/botstatus"), None), GateOutcome::Forwarded);
        assert_eq!(dispatcher.texts().len(), 3);
    }

    #[test]
    fn normal_commands_need_active_state() {
        let (gate, store, dispatcher) = gate();
        store.set_reconnecting();
        assert_eq!(
            gate.on_message(msg("*ping"), None),
            GateOutcome::Dropped(DropReason::Inactive)
        );
        store.set_active();
        assert_eq!(gate.on_message(msg("*ping"), None), GateOutcome::Forwarded);
        assert_eq!(dispatcher.texts(), vec!["*ping"]);
    }

    #[test]
    fn reset_is_not_dispatched() {
        let (gate, _store, dispatcher) = gate();
        assert_eq!(gate.on_message(msg("*resetbot"), None), GateOutcome::ResetRequested);
        assert!(dispatcher.texts().is_empty());
    }

    #[test]
    fn own_messages_are_dropped_before_classification() {
        let (gate, store, dispatcher) = gate();
        store.set_inactive("off");
        assert_eq!(
            gate.on_message(msg("*activate"), Some(UserId(7))),
            GateOutcome::Dropped(DropReason::OwnMessage)
        );
        assert!(!store.is_active());
        assert!(dispatcher.texts().is_empty());
    }

    #[test]
    fn buttons_follow_the_active_gate_only() {
        let (gate, store, dispatcher) = gate();
        let click = ButtonClick {
            channel_id: ChannelId(10),
            user_id: UserId(7),
            message_id: None,
            custom_id: "solution:approve".to_string(),
        };

        store.set_inactive("off");
        assert_eq!(
            gate.on_button(click.clone(), None),
            GateOutcome::Dropped(DropReason::Inactive)
        );
        store.set_active();
        assert_eq!(gate.on_button(click, None), GateOutcome::Forwarded);
        assert_eq!(dispatcher.texts(), vec!["button:solution:approve"]);
    }
}
