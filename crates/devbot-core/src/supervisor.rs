//! Connection supervisor.
//!
//! Owns the single live session, wires its events into the command gate,
//! and runs recovery when the session drops, errors or fails a health probe.
//!
//! - at most one recovery (automatic or manual) is in flight at any time
//! - event handlers are attached at most once per session handle
//! - retries are unbounded; the backoff cap bounds the gap between attempts

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatch::CommandDispatcher,
    domain::{ChannelId, UserId},
    errors::Error,
    gate::{CommandGate, GateOutcome},
    scheduler::Scheduler,
    session::{probe_health, ConnectionInfo, SessionAdapter, SessionHandle},
    state::{LifecycleState, StateStore},
    transport::{
        port::SessionConnector,
        types::{EventReceiver, TransportEvent},
    },
    Result,
};

pub const ACTIVATED_TEXT: &str = "Bot activated and ready for commands.";
pub const RESET_OK_TEXT: &str = "Bot connection was reset successfully.";
pub const RESET_FAILED_TEXT: &str = "Could not reset the bot connection. Retrying automatically...";

/// Supervisor-level view of the connection, layered over the store state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Disconnected,
    Connecting,
    Active,
    Recovering,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Startup,
    Disconnected,
    TransportError,
    HealthCheck,
    Watchdog,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetOutcome {
    /// A fresh session is up.
    Reconnected,
    /// The first attempt failed; retries continue in the background.
    Retrying,
    /// Another recovery was already in flight.
    Rejected,
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct LiveSession {
    handle: SessionHandle,
    pump: Option<JoinHandle<()>>,
}

struct SupervisorInner {
    cfg: Arc<Config>,
    adapter: SessionAdapter,
    store: Arc<StateStore>,
    gate: CommandGate,
    session: tokio::sync::Mutex<Option<LiveSession>>,
    phase: Mutex<Phase>,
    recovering: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

/// Single-flight recovery slot; released on drop.
struct InFlight {
    sup: Supervisor,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.sup.inner.recovering.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(
        cfg: Arc<Config>,
        connector: Arc<dyn SessionConnector>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        let store = Arc::new(StateStore::new());
        Self {
            inner: Arc::new(SupervisorInner {
                adapter: SessionAdapter::new(&cfg, connector),
                gate: CommandGate::new(store.clone(), dispatcher),
                cfg,
                store,
                session: tokio::sync::Mutex::new(None),
                phase: Mutex::new(Phase::Disconnected),
                recovering: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                scheduler: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.inner.store.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, next: Phase) {
        let mut phase = self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != next {
            tracing::debug!(from = ?*phase, to = ?next, "supervisor phase");
            *phase = next;
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovering.load(Ordering::SeqCst)
    }

    fn try_begin_flight(&self) -> Option<InFlight> {
        self.inner
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight { sup: self.clone() })
    }

    /// First connect plus background maintenance. A failed first connect is
    /// not fatal: it hands over to the recovery loop.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("supervisor already started");
            return;
        }

        self.start_maintenance().await;

        self.set_phase(Phase::Connecting);
        match self.inner.adapter.connect().await {
            Ok(handle) => {
                self.install(handle).await;
                tracing::info!("bot events initialized successfully");
            }
            Err(e) => {
                tracing::error!("initial connect failed, will retry: {e}");
                self.inner.store.bump_attempts();
                self.inner
                    .store
                    .set_error(format!("Connection failed: {e}"));
                self.begin_recovery(RecoveryTrigger::Startup);
            }
        }
    }

    async fn start_maintenance(&self) {
        let cfg = &self.inner.cfg;
        let mut scheduler = Scheduler::new(&self.inner.cancel);

        let sup = self.clone();
        scheduler.every("health_check", cfg.health_check_interval, move || {
            let sup = sup.clone();
            async move { sup.health_check().await }
        });

        let sup = self.clone();
        scheduler.every("attempts_cooldown", cfg.attempts_cooldown, move || {
            let sup = sup.clone();
            async move { sup.cooldown_attempts() }
        });

        if let Some(period) = cfg.error_watchdog_interval {
            let sup = self.clone();
            scheduler.every("error_watchdog", period, move || {
                let sup = sup.clone();
                async move { sup.check_stale_error() }
            });
        }

        *self.inner.scheduler.lock().await = Some(scheduler);
    }

    /// Stop timers and recovery loops, then close the session.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.inner.cancel.cancel();
        if let Some(scheduler) = self.inner.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        if let Some(live) = self.take_session().await {
            self.inner.adapter.teardown(live.handle).await;
        }
        self.set_phase(Phase::Disconnected);
    }

    /// Put a fresh handle in the slot, attach its events and open the gate.
    async fn install(&self, handle: SessionHandle) {
        if self.inner.cancel.is_cancelled() {
            self.inner.adapter.teardown(handle).await;
            return;
        }
        let generation = handle.generation();
        {
            let mut slot = self.inner.session.lock().await;
            *slot = Some(LiveSession { handle, pump: None });
        }
        self.init_events().await;

        let store = &self.inner.store;
        store.set_active();
        let previous = store.reset_attempts();
        if previous > 0 {
            tracing::info!(generation, "connected after {previous} failed attempts");
        }
        self.set_phase(Phase::Active);
    }

    /// Attach transport event handlers to the current session.
    ///
    /// Returns `false` without subscribing again if handlers are already
    /// attached to this handle, or if there is no session.
    pub async fn init_events(&self) -> bool {
        let mut slot = self.inner.session.lock().await;
        let Some(live) = slot.as_mut() else {
            tracing::warn!("init_events called without a live session");
            return false;
        };

        let generation = live.handle.generation();
        let rx = match live.handle.subscribe_once() {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                tracing::info!(generation, "event handlers already attached, skipping");
                return false;
            }
            Err(e) => {
                tracing::error!(generation, "failed to attach event handlers: {e}");
                return false;
            }
        };

        let self_id = live.handle.client().identity().map(|i| i.user_id);
        live.pump = Some(tokio::spawn(self.clone().pump(generation, self_id, rx)));
        tracing::info!(generation, "event handlers attached");
        true
    }

    // Boxed with an explicit `Send` bound: the pump reaches `reset`, which
    // reinstalls sessions and spawns a new pump, so the future type is recursive.
    fn pump(self, generation: u64, self_id: Option<UserId>, mut rx: EventReceiver) -> BoxedTask {
        Box::pin(async move {
            loop {
                let ev = tokio::select! {
                    _ = self.inner.cancel.cancelled() => break,
                    ev = rx.recv() => ev,
                };
                let Some(ev) = ev else {
                    break;
                };
                self.on_event(generation, self_id, ev).await;
            }
            tracing::debug!(generation, "event pump finished");
        })
    }

    async fn current_generation(&self) -> Option<u64> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|live| live.handle.generation())
    }

    async fn on_event(&self, generation: u64, self_id: Option<UserId>, ev: TransportEvent) {
        if self.current_generation().await != Some(generation) {
            tracing::debug!(generation, kind = ev.kind(), "ignoring event from stale session");
            return;
        }

        let store = &self.inner.store;
        match ev {
            TransportEvent::Connected => {
                tracing::info!(generation, "bot connected");
                store.set_active();
                store.reset_attempts();
            }
            // A recovery already in flight owns the state; repeated triggers
            // leave it alone.
            TransportEvent::Disconnected => {
                tracing::warn!(generation, "bot disconnected");
                if self.begin_recovery(RecoveryTrigger::Disconnected) {
                    store.set_reconnecting();
                }
            }
            TransportEvent::Error(message) => {
                tracing::error!(generation, "transport error: {message}");
                if self.begin_recovery(RecoveryTrigger::TransportError) {
                    store.set_error(format!("Connection error: {message}"));
                }
            }
            TransportEvent::Message(msg) => {
                let channel = msg.channel_id;
                match self.inner.gate.on_message(msg, self_id) {
                    GateOutcome::Activated => self.spawn_reply(channel, ACTIVATED_TEXT),
                    GateOutcome::ResetRequested => {
                        let sup = self.clone();
                        tokio::spawn(async move {
                            let text = match sup.reset().await {
                                ResetOutcome::Reconnected => RESET_OK_TEXT,
                                ResetOutcome::Retrying | ResetOutcome::Rejected => {
                                    RESET_FAILED_TEXT
                                }
                            };
                            sup.reply(channel, text).await;
                        });
                    }
                    GateOutcome::Forwarded | GateOutcome::Dropped(_) => {}
                }
            }
            TransportEvent::ButtonClicked(click) => {
                self.inner.gate.on_button(click, self_id);
            }
        }
    }

    fn spawn_reply(&self, channel: ChannelId, text: &'static str) {
        let sup = self.clone();
        tokio::spawn(async move { sup.reply(channel, text).await });
    }

    async fn reply(&self, channel: ChannelId, text: &str) {
        if let Err(e) = self.send_text(channel, text).await {
            tracing::error!(channel = %channel, "failed to send reply: {e}");
        }
    }

    /// Send through whichever session is live right now.
    pub async fn send_text(&self, channel: ChannelId, text: &str) -> Result<()> {
        let client = {
            let slot = self.inner.session.lock().await;
            slot.as_ref().map(|live| live.handle.client())
        };
        let Some(client) = client else {
            return Err(Error::Transport("no live session".to_string()));
        };
        client.send_text(channel, text).await
    }

    /// Start an automatic recovery unless one is already in flight.
    pub fn begin_recovery(&self, trigger: RecoveryTrigger) -> bool {
        let Some(flight) = self.try_begin_flight() else {
            tracing::debug!(?trigger, "recovery already in flight, ignoring trigger");
            return false;
        };
        tracing::warn!(?trigger, "starting recovery");
        self.set_phase(Phase::Recovering);

        let first_wait = self
            .inner
            .cfg
            .reconnect
            .delay(self.inner.store.reconnect_attempts());
        let sup = self.clone();
        tokio::spawn(async move { sup.retry_loop(flight, first_wait).await });
        true
    }

    /// Manual reset: reconnect now, bypassing the initial backoff wait.
    ///
    /// Rejected, not queued, while another recovery is in flight.
    pub async fn reset(&self) -> ResetOutcome {
        let Some(flight) = self.try_begin_flight() else {
            tracing::warn!("manual reset rejected: recovery already in flight");
            return ResetOutcome::Rejected;
        };
        tracing::info!("manual bot reset initiated");
        self.set_phase(Phase::Recovering);
        self.inner.store.reset_attempts();

        match self.reconnect_once().await {
            Ok(()) => {
                drop(flight);
                tracing::info!("manual bot reset succeeded");
                ResetOutcome::Reconnected
            }
            Err(e) => {
                tracing::error!("manual bot reset failed: {e}");
                let wait = self.record_failure(format!("Manual reset failed: {e}"));
                let sup = self.clone();
                tokio::spawn(async move { sup.retry_loop(flight, wait).await });
                ResetOutcome::Retrying
            }
        }
    }

    /// `true` only when the reset produced a live session.
    pub async fn manual_reset(&self) -> bool {
        self.reset().await == ResetOutcome::Reconnected
    }

    async fn retry_loop(self, flight: InFlight, first_wait: Duration) {
        let mut wait = first_wait;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    tracing::debug!("recovery cancelled");
                    break;
                }
                _ = sleep(wait) => {}
            }

            let attempt = self.inner.store.reconnect_attempts() + 1;
            tracing::info!(attempt, "reconnect attempt");
            match self.reconnect_once().await {
                Ok(()) => {
                    tracing::info!(attempt, "reconnection successful");
                    break;
                }
                Err(e) => {
                    tracing::error!(attempt, "reconnection failed: {e}");
                    wait = self.record_failure(format!("Reconnection failed: {e}"));
                    tracing::info!("will retry in {:.1}s", wait.as_secs_f64());
                }
            }
        }
        drop(flight);
    }

    /// Returns the delay before the next attempt and bumps the counter.
    fn record_failure(&self, reason: String) -> Duration {
        let store = &self.inner.store;
        let delay = self.inner.cfg.reconnect.delay(store.reconnect_attempts());
        store.bump_attempts();
        store.set_error(reason);
        delay
    }

    /// Tear down the current handle (if any) and install a fresh one.
    async fn reconnect_once(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Internal("supervisor is shutting down".to_string()));
        }
        self.inner.store.set_reconnecting();

        if let Some(old) = self.take_session().await {
            self.inner.adapter.teardown(old.handle).await;
        }

        let handle = self.inner.adapter.connect().await?;
        self.install(handle).await;
        Ok(())
    }

    async fn take_session(&self) -> Option<LiveSession> {
        let mut live = self.inner.session.lock().await.take()?;
        if let Some(pump) = live.pump.take() {
            pump.abort();
        }
        Some(live)
    }

    /// Periodic probe; an unhealthy session starts a recovery.
    pub async fn health_check(&self) {
        if self.is_recovering() {
            return;
        }
        let healthy = {
            let slot = self.inner.session.lock().await;
            slot.as_ref().map(|live| probe_health(&live.handle)).unwrap_or(false)
        };
        if healthy {
            return;
        }
        tracing::warn!("connection check failed, attempting to reconnect");
        self.inner.store.set_reconnecting();
        self.begin_recovery(RecoveryTrigger::HealthCheck);
    }

    /// Forget old failures once things are quiet.
    pub fn cooldown_attempts(&self) {
        if self.is_recovering() {
            return;
        }
        let previous = self.inner.store.reset_attempts();
        if previous > 0 {
            tracing::info!("reset reconnect counter from {previous} to 0");
        }
    }

    /// Recover from an `Error` state nobody is working on.
    pub fn check_stale_error(&self) {
        if self.is_recovering() {
            return;
        }
        if self.inner.store.state().state.tag() == LifecycleState::Error {
            tracing::warn!("bot stuck in error state, starting recovery");
            self.begin_recovery(RecoveryTrigger::Watchdog);
        }
    }

    pub(crate) async fn connection_info(&self) -> ConnectionInfo {
        let slot = self.inner.session.lock().await;
        slot.as_ref()
            .map(|live| ConnectionInfo::of(&live.handle))
            .unwrap_or_default()
    }

    pub(crate) async fn probe(&self) -> bool {
        let slot = self.inner.session.lock().await;
        slot.as_ref().map(|live| probe_health(&live.handle)).unwrap_or(false)
    }

    /// Always succeeds; activating an active bot is a no-op.
    pub fn activate(&self) -> bool {
        self.inner.store.set_active();
        tracing::info!("bot activated by command");
        true
    }

    pub fn deactivate(&self, reason: &str) {
        let reason = if reason.trim().is_empty() {
            "Deactivated manually"
        } else {
            reason.trim()
        };
        self.inner.store.set_inactive(reason);
        tracing::info!("bot deactivated: {reason}");
    }
}
