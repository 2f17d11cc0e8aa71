//! The live subscriber dispatcher.
//!
//! One background task drains the mutation queue. Each mutation fans out
//! to the hooks registered for its key (events go to the hooks' delivery
//! endpoints) and to every live fence connection watching the key
//! (events go down the connection's own bounded queue; a subscriber that
//! cannot keep up is dropped).
//!
//! Followers do not re-run hooks: their leaders already did. Live fence
//! connections on a follower are still served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::{CommandDetails, Db};
use crate::fence::{fence_match, FenceSpec};
use crate::server::ServerInner;

/// Queue depth per live fence connection.
const SUBSCRIBER_QUEUE: usize = 256;

pub struct LiveSub {
    pub key: String,
    pub spec: FenceSpec,
    groups: HashMap<(String, String), u64>,
    tx: mpsc::Sender<String>,
}

/// Registry of live fence connections.
#[derive(Default)]
pub struct LiveRegistry {
    next: AtomicU64,
    subs: parking_lot::Mutex<HashMap<u64, LiveSub>>,
}

impl LiveRegistry {
    /// Register a fence connection; the receiver side is drained by the
    /// connection's write loop.
    pub fn register(&self, spec: FenceSpec) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let sub = LiveSub {
            key: spec.key.clone(),
            spec,
            groups: HashMap::new(),
            tx,
        };
        self.subs.lock().insert(id, sub);
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        self.subs.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one mutation to every interested subscriber. Per-subscriber
    /// ordering is preserved by the per-connection queue; subscribers
    /// whose queue overflows are dropped.
    pub fn deliver(&self, db: &Db, details: &CommandDetails) {
        let mut dead: Vec<u64> = Vec::new();
        let mut subs = self.subs.lock();
        for (&id, sub) in subs.iter_mut() {
            if sub.key != details.key {
                continue;
            }
            let msgs = fence_match(db, None, &sub.spec, &mut sub.groups, details);
            for m in msgs {
                match sub.tx.try_send(m) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(sub = id, "live subscriber overflow, dropping");
                        dead.push(id);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(id);
                        break;
                    }
                }
            }
        }
        for id in dead {
            subs.remove(&id);
        }
    }
}

/// The background dispatcher: pops the mutation queue and fans out.
pub async fn run_dispatcher(
    inner: Arc<ServerInner>,
    mut rx: mpsc::UnboundedReceiver<CommandDetails>,
) {
    while let Some(details) = rx.recv().await {
        let db = inner.db.read().await;
        if !db.config.following() {
            for hook in db.hooks_for_key(&details.key) {
                let msgs = {
                    let mut groups = hook.groups.lock();
                    fence_match(&db, Some(&hook.name), &hook.spec, &mut groups, &details)
                };
                for m in msgs {
                    for ep in hook.endpoints.clone() {
                        let manager = inner.endpoints.clone();
                        let hook_name = hook.name.clone();
                        let m = m.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.send(&ep, &m).await {
                                tracing::warn!(
                                    hook = %hook_name,
                                    endpoint = %ep.original,
                                    error = %e,
                                    "hook delivery failed"
                                );
                            }
                        });
                    }
                }
            }
        }
        inner.lives.deliver(&db, &details);
    }
}
