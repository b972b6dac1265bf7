use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use quickdist_transport::Dealer;

/// One remote process slot: a node, and which of its advertised process
/// slots this handle is pinned to. Identical slots on the same node share
/// a node address but are otherwise independent dealers, matching one
/// remote process each.
#[derive(Clone)]
pub struct Slot {
    pub node_addr: String,
    pub slot_index: usize,
    pub dealer: Arc<Dealer>,
}

/// The orchestrator's local worker pool. Pins each local worker 1:1 to one
/// of the flat list of remote slots (a node's advertised process count
/// worth of repeats of its address), the same way a node pins each of its
/// own worker processes to a fixed slot index.
#[derive(Clone)]
pub struct ClientPool {
    idle_tx: Sender<Slot>,
    idle_rx: Receiver<Slot>,
    size: usize,
}

impl ClientPool {
    pub fn new(slots: Vec<Slot>) -> ClientPool {
        let size = slots.len();
        let (idle_tx, idle_rx) = bounded(size.max(1));
        for slot in slots {
            idle_tx.send(slot).expect("channel sized to slot count");
        }
        ClientPool {
            idle_tx,
            idle_rx,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` against whichever slot is next free, returning the slot to
    /// the pool once `f` completes (even if it errors).
    pub fn with_slot<T>(&self, f: impl FnOnce(&Slot) -> T) -> T {
        let slot = self
            .idle_rx
            .recv()
            .expect("pool channel never disconnects while self is alive");
        let result = f(&slot);
        self.idle_tx.send(slot).expect("channel sized to slot count");
        result
    }
}
