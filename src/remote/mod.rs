//! The upstream-facing half of a Session: owns the connection to the
//! resolved destination, re-encrypts bytes flowing back to the client, and
//! shares an idempotent close signal with the Session that spawned it.

pub mod tcp;
pub mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Non-owning link between a Session's task and its Remote's task (§9:
/// "Remote holds a non-owning back-reference to Session used only to invoke
/// close"). Either side calls [`CloseLatch::begin_close`] when it observes a
/// terminal condition; the other side is woken out of its `select!` loop via
/// the underlying `watch` channel, which (unlike `Notify`) is race-free
/// against a receiver that subscribes or polls after the value already
/// changed.
#[derive(Clone)]
pub struct CloseLatch {
    closing: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl CloseLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            closing: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Marks the session as closing. Returns `true` the first time this is
    /// called for a given latch, `false` on every call after (the idempotent
    /// half of invariant 1).
    pub fn begin_close(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
        first
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Default for CloseLatch {
    fn default() -> Self {
        Self::new()
    }
}
