// RX/TX Queue API

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;

use super::eth::{PortId, QueueId};
use super::mbuf::Mbuf;
use crate::api::RteBackend;

/// Maximum burst size for RX/TX operations
pub const MAX_BURST_SIZE: usize = 64;

/// Burst buffer exchanged with the framework
pub type Burst = ArrayVec<Mbuf, MAX_BURST_SIZE>;

/// RX Queue handle for receiving packets
#[derive(Clone)]
pub struct RxQueue {
    rte: Arc<dyn RteBackend>,
    port_id: PortId,
    queue_id: QueueId,
}

impl RxQueue {
    /// Create a new RX queue handle.
    ///
    /// Note: The queue must already be set up via `RteBackend::eth_rx_queue_setup()`.
    #[inline]
    pub fn new(rte: Arc<dyn RteBackend>, port_id: PortId, queue_id: QueueId) -> Self {
        Self {
            rte,
            port_id,
            queue_id,
        }
    }

    /// Get the port ID
    #[inline]
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    /// Get the queue ID
    #[inline]
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Receive a burst of packets into the provided buffer.
    ///
    /// Returns the number of packets received.
    /// Packets are appended to the `mbufs` vector (up to its remaining capacity).
    #[inline]
    pub fn rx<const N: usize>(&self, mbufs: &mut ArrayVec<Mbuf, N>) -> usize {
        let capacity = mbufs.remaining_capacity().min(MAX_BURST_SIZE);
        if capacity == 0 {
            return 0;
        }

        let mut burst = Burst::new();
        self.rte
            .eth_rx_burst(self.port_id, self.queue_id, &mut burst, capacity);

        let received = burst.len();
        for mbuf in burst {
            // capacity checked above
            let _ = mbufs.try_push(mbuf);
        }
        received
    }

    /// Receive a burst of packets, returning them as a new ArrayVec.
    #[inline]
    pub fn rx_burst<const N: usize>(&self) -> ArrayVec<Mbuf, N> {
        let mut mbufs = ArrayVec::new();
        self.rx(&mut mbufs);
        mbufs
    }
}

impl fmt::Debug for RxQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxQueue")
            .field("port_id", &self.port_id)
            .field("queue_id", &self.queue_id)
            .finish()
    }
}

/// TX Queue handle for transmitting packets
#[derive(Clone)]
pub struct TxQueue {
    rte: Arc<dyn RteBackend>,
    port_id: PortId,
    queue_id: QueueId,
}

impl TxQueue {
    /// Create a new TX queue handle.
    ///
    /// Note: The queue must already be set up via `RteBackend::eth_tx_queue_setup()`.
    #[inline]
    pub fn new(rte: Arc<dyn RteBackend>, port_id: PortId, queue_id: QueueId) -> Self {
        Self {
            rte,
            port_id,
            queue_id,
        }
    }

    /// Get the port ID
    #[inline]
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    /// Get the queue ID
    #[inline]
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Transmit a burst of packets from the provided buffer.
    ///
    /// Successfully transmitted packets are removed from the front of `mbufs`.
    /// Returns the number of packets transmitted.
    /// Packets that fail to transmit remain in the buffer (caller must handle).
    #[inline]
    pub fn tx(&self, mbufs: &mut Burst) -> usize {
        if mbufs.is_empty() {
            return 0;
        }
        self.rte.eth_tx_burst(self.port_id, self.queue_id, mbufs)
    }

    /// Transmit a single packet.
    ///
    /// On success the mbuf is consumed and `None` is returned.
    /// On failure, the mbuf is returned via the Option.
    #[inline]
    pub fn tx_one(&self, mbuf: Mbuf) -> Option<Mbuf> {
        let mut burst = Burst::new();
        burst.push(mbuf);
        if self.tx(&mut burst) == 1 {
            None
        } else {
            burst.pop()
        }
    }
}

impl fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxQueue")
            .field("port_id", &self.port_id)
            .field("queue_id", &self.queue_id)
            .finish()
    }
}
