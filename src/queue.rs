//! Outbound queue multiplexer.
//!
//! Merges two logically distinct streams — directly queued messages and
//! trickled inventory advertisements — into the output pump's single-slot
//! send queue, without ever blocking external callers. Direct messages are
//! strictly FIFO; inventory is batched on the trickle interval and deduped
//! against the known-inventory cache as it is packed.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::message::{InvItem, NetworkMessage};
use crate::peer::Peer;

/// A message travelling through the send path, with an optional completion
/// signal. The signal fires exactly once: after the transport write, or
/// during shutdown drain without transmission.
pub struct OutboundMessage {
    pub message: NetworkMessage,
    pub done: Option<oneshot::Sender<()>>,
}

impl OutboundMessage {
    pub fn new(message: NetworkMessage, done: Option<oneshot::Sender<()>>) -> Self {
        Self { message, done }
    }

    /// Satisfy the completion signal, if any. A dropped receiver is fine.
    pub(crate) fn finish(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Hand a message to the output pump if its slot is free, otherwise park it
/// in the FIFO backlog. Returns false when the pump is gone.
async fn dispatch(
    out: OutboundMessage,
    slot_free: &mut bool,
    backlog: &mut VecDeque<OutboundMessage>,
    send_tx: &mpsc::Sender<OutboundMessage>,
) -> bool {
    if *slot_free {
        *slot_free = false;
        if let Err(mpsc::error::SendError(out)) = send_tx.send(out).await {
            out.finish();
            return false;
        }
    } else {
        backlog.push_back(out);
    }
    true
}

/// Queue multiplexer task: one of the four background tasks per connected
/// peer.
pub(crate) async fn run(
    peer: Arc<Peer>,
    mut direct_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut inv_rx: mpsc::UnboundedReceiver<InvItem>,
    send_tx: mpsc::Sender<OutboundMessage>,
    mut send_done_rx: mpsc::Receiver<()>,
) {
    let mut backlog: VecDeque<OutboundMessage> = VecDeque::new();
    let mut inv_backlog: VecDeque<InvItem> = VecDeque::new();
    let mut slot_free = true;

    let mut trickle = interval(peer.config().trickle_interval);
    trickle.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let quit = peer.quit_token();

    'run: loop {
        tokio::select! {
            _ = quit.cancelled() => break,

            out = direct_rx.recv() => {
                let Some(out) = out else { break };
                if !dispatch(out, &mut slot_free, &mut backlog, &send_tx).await {
                    break;
                }
            }

            item = inv_rx.recv() => {
                let Some(item) = item else { break };
                // Already-known items are dropped here; the authoritative
                // recheck happens again at pack time so a duplicate queued
                // in the same tick is not double-sent.
                if peer.knows_inventory(&item) {
                    trace!("⏭️ Dropping known inv {} for {}", item.short_hash(), peer.addr());
                } else {
                    inv_backlog.push_back(item);
                }
            }

            freed = send_done_rx.recv() => {
                if freed.is_none() {
                    break;
                }
                match backlog.pop_front() {
                    Some(next) => {
                        if let Err(mpsc::error::SendError(next)) = send_tx.send(next).await {
                            next.finish();
                            break;
                        }
                    }
                    None => slot_free = true,
                }
            }

            _ = trickle.tick() => {
                if inv_backlog.is_empty() {
                    continue;
                }

                let max = peer.config().max_inv_per_batch.max(1);
                let mut batches: Vec<Vec<InvItem>> = Vec::new();
                let mut batch: Vec<InvItem> = Vec::new();

                while let Some(item) = inv_backlog.pop_front() {
                    // Mark known as it is packed so the same identifier
                    // later in this tick is skipped.
                    if peer.mark_inventory_known(item) {
                        continue;
                    }
                    batch.push(item);
                    if batch.len() == max {
                        batches.push(std::mem::take(&mut batch));
                    }
                }
                if !batch.is_empty() {
                    batches.push(batch);
                }

                // Arrival order is preserved across batch boundaries.
                for items in batches {
                    debug!(
                        "📤 Trickling {} inventory item(s) to {}",
                        items.len(),
                        peer.addr()
                    );
                    let out = OutboundMessage::new(NetworkMessage::Inv(items), None);
                    if !dispatch(out, &mut slot_free, &mut backlog, &send_tx).await {
                        break 'run;
                    }
                }
            }
        }
    }

    // Drain both internal queues; completion signals fire without
    // transmission.
    for out in backlog.drain(..) {
        out.finish();
    }
    while let Ok(out) = direct_rx.try_recv() {
        out.finish();
    }
    while inv_rx.try_recv().is_ok() {}
    inv_backlog.clear();

    debug!("🔌 Queue multiplexer for {} done", peer.addr());
}
