/*!
Statistics of frames passing through a node.
Shared by every frame codec of a relay node or a client.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to the frame counters, cheap to clone.
#[derive(Clone, Default)]
pub struct Stats {
    /// incoming/outgoing counters
    pub counters: Arc<Counters>
}

impl Stats {
    /// New Stats object
    pub fn new() -> Self {
        Default::default()
    }
}

/// Number of frames and bytes received and sent.
#[derive(Default)]
pub struct Counters {
    incoming_frames: AtomicU64,
    incoming_bytes: AtomicU64,
    outgoing_frames: AtomicU64,
    outgoing_bytes: AtomicU64,
}

impl Counters {
    /// Count a received frame of `len` bytes.
    pub fn record_incoming(&self, len: usize) {
        self.incoming_frames.fetch_add(1, Ordering::Relaxed);
        self.incoming_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count a sent frame of `len` bytes.
    pub fn record_outgoing(&self, len: usize) {
        self.outgoing_frames.fetch_add(1, Ordering::Relaxed);
        self.outgoing_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Number of received frames.
    pub fn incoming(&self) -> u64 {
        self.incoming_frames.load(Ordering::Relaxed)
    }

    /// Number of sent frames.
    pub fn outgoing(&self) -> u64 {
        self.outgoing_frames.load(Ordering::Relaxed)
    }

    /// Number of received bytes, length prefixes excluded.
    pub fn incoming_bytes(&self) -> u64 {
        self.incoming_bytes.load(Ordering::Relaxed)
    }

    /// Number of sent bytes, length prefixes excluded.
    pub fn outgoing_bytes(&self) -> u64 {
        self.outgoing_bytes.load(Ordering::Relaxed)
    }
}
