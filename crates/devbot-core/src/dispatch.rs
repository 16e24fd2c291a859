use tokio::sync::mpsc;

use crate::transport::types::{ButtonClick, InboundMessage};

/// Work item handed to the command layer.
#[derive(Clone, Debug)]
pub enum Dispatch {
    Message(InboundMessage),
    Button(ButtonClick),
}

/// Downstream command executor.
///
/// Called from the event pump, so implementations must not block: queue the
/// work or spawn it.
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, item: Dispatch);
}

/// Dispatcher that queues work for a separate consumer task.
#[derive(Clone)]
pub struct QueuedDispatcher {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl QueuedDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandDispatcher for QueuedDispatcher {
    fn dispatch(&self, item: Dispatch) {
        if self.tx.send(item).is_err() {
            tracing::warn!("command queue closed, dropping dispatch");
        }
    }
}
