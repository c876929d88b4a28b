//! Writer registry and event fanout
//!
//! Tracks connected writers, their subscription filters, and the bounded
//! outbound queue feeding each connection's writer task. A slow client never
//! stalls the daemon: when a writer's queue is full it is disconnected with
//! a `QueueOverflow` log instead of blocking anyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use nab_common::{encode_frame, matches_subscription, Frame};

pub type WriterId = u64;

/// Outbound queue capacity per writer.
pub const OUTBOUND_QUEUE: usize = 1000;

struct Writer {
    tx: mpsc::Sender<String>,
    subscriptions: Vec<String>,
}

/// Registry of connected writers.
pub struct WriterRegistry {
    writers: RwLock<HashMap<WriterId, Writer>>,
    next_id: AtomicU64,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self {
            writers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection; returns its id and the outbound line
    /// stream for the connection's writer task.
    pub async fn register(&self) -> (WriterId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.writers.write().await.insert(id, Writer { tx, subscriptions: Vec::new() });
        debug!("writer {} registered", id);
        (id, rx)
    }

    pub async fn unregister(&self, id: WriterId) {
        if self.writers.write().await.remove(&id).is_some() {
            debug!("writer {} unregistered", id);
        }
    }

    /// Replace a writer's subscription patterns.
    pub async fn set_subscriptions(&self, id: WriterId, patterns: Vec<String>) {
        if let Some(writer) = self.writers.write().await.get_mut(&id) {
            debug!("writer {} subscribes to {:?}", id, patterns);
            writer.subscriptions = patterns;
        }
    }

    pub async fn writer_ids(&self) -> Vec<WriterId> {
        let mut ids: Vec<WriterId> = self.writers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn count(&self) -> usize {
        self.writers.read().await.len()
    }

    /// Send a frame to one writer regardless of subscriptions (responses,
    /// handshake state). Returns false if the writer is gone or overflowed.
    pub async fn send(&self, id: WriterId, frame: &Frame) -> bool {
        let line = encode_frame(frame);
        let overflow = {
            let writers = self.writers.read().await;
            let Some(writer) = writers.get(&id) else {
                return false;
            };
            match writer.tx.try_send(line) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        };
        if overflow {
            self.disconnect_overflowed(id).await;
        } else {
            self.unregister(id).await;
        }
        false
    }

    /// Broadcast a frame to subscribed writers. `state` frames are
    /// universal; everything else is filtered through each writer's
    /// subscription patterns.
    pub async fn broadcast(&self, frame: &Frame) {
        let line = encode_frame(frame);
        let event_name = frame.event_name();
        let universal = matches!(frame, Frame::State { .. });

        let mut overflowed = Vec::new();
        {
            let writers = self.writers.read().await;
            for (id, writer) in writers.iter() {
                let wanted = universal
                    || event_name.as_deref().is_some_and(|name| {
                        writer.subscriptions.iter().any(|p| matches_subscription(p, name))
                    });
                if !wanted {
                    continue;
                }
                match writer.tx.try_send(line.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*id),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        for id in overflowed {
            self.disconnect_overflowed(id).await;
        }
    }

    async fn disconnect_overflowed(&self, id: WriterId) {
        if self.writers.write().await.remove(&id).is_some() {
            warn!("QueueOverflow: writer {} outbound queue full, disconnecting", id);
        }
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Dropping the sender side closes the outbound channel, which the
// connection's writer task treats as an order to hang up.
pub async fn shutdown_notice(registry: &WriterRegistry) {
    let count = registry.count().await;
    if count > 0 {
        info!("closing {} writer connections", count);
    }
    registry.writers.write().await.clear();
}
