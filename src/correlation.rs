use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Matches asynchronous replies to outstanding requests by token. Each
/// token resolves at most once; anything arriving for an unknown or
/// already-resolved token is discarded.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Delivered,
    Discarded,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh correlation token and hands back the receiver the
    /// submitting task waits on.
    pub fn register(&self) -> (String, oneshot::Receiver<String>) {
        let token = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), reply_tx);
        (token, reply_rx)
    }

    /// Delivers a reply to whoever registered `token`. First resolution
    /// wins; duplicates and late replies after a timeout are no-ops.
    pub fn resolve(&self, token: &str, payload: String) -> ResolveOutcome {
        let sender = self.pending.lock().remove(token);
        match sender {
            Some(reply_tx) => {
                if reply_tx.send(payload).is_err() {
                    log::warn!("reply for token {token} arrived after the waiter gave up");
                    return ResolveOutcome::Discarded;
                }
                ResolveOutcome::Delivered
            }
            None => {
                log::warn!("discarding reply for unknown token {token}");
                ResolveOutcome::Discarded
            }
        }
    }

    /// Drops the registration after a timeout so a late reply is treated
    /// as stale instead of resolving a request nobody is waiting on.
    pub fn abandon(&self, token: &str) {
        self.pending.lock().remove(token);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Waits for the reply registered under `token`, up to `deadline`.
    pub async fn await_reply(
        &self,
        token: &str,
        reply_rx: oneshot::Receiver<String>,
        deadline: Duration,
    ) -> Option<String> {
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(_)) => {
                // Sender dropped without resolving; tracker side is gone.
                self.abandon(token);
                None
            }
            Err(_) => {
                self.abandon(token);
                None
            }
        }
    }
}
