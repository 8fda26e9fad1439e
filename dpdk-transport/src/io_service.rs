use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::api::rte::eth::{PortId, QueueId};
use crate::api::rte::mbuf::Mbuf;
use crate::api::rte::queue::MAX_BURST_SIZE;
use crate::port::Port;

/// A frame received by an [`IoService`] poll.
#[derive(Debug)]
pub struct RxPacket {
    pub port_id: PortId,
    pub queue_id: QueueId,
    pub mbuf: Mbuf,
}

/// Polling engine for the ports bound to one logical core.
///
/// Bindings are fixed at construction. Ports are lent out by reference
/// only.
pub struct IoService {
    lcore_id: u32,
    ports: Vec<Arc<Port>>,
    servq_depth: usize,
}

impl IoService {
    pub(crate) fn new(lcore_id: u32, ports: Vec<Arc<Port>>, servq_depth: usize) -> Self {
        tracing::debug!(
            lcore_id,
            ports = ports.len(),
            servq_depth,
            "Creating I/O service"
        );
        Self {
            lcore_id,
            ports,
            servq_depth,
        }
    }

    pub fn lcore_id(&self) -> u32 {
        self.lcore_id
    }

    pub fn servq_depth(&self) -> usize {
        self.servq_depth
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().map(Arc::as_ref)
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        self.ports.iter().map(|p| p.port_id()).collect()
    }

    pub fn serves(&self, port_id: PortId) -> bool {
        self.ports.iter().any(|p| p.port_id() == port_id)
    }

    /// Poll every CPU RX queue of every bound port once.
    ///
    /// ARP frames are handled by the owning port; everything else is
    /// appended to `out`. Returns the number of frames appended.
    pub fn poll(&self, out: &mut Vec<RxPacket>) -> usize {
        let before = out.len();
        for port in &self.ports {
            for queue_id in 0..port.rx_plan().cpu_queues() {
                let Some(rxq) = port.rx_queue(queue_id) else {
                    continue;
                };
                let burst: ArrayVec<Mbuf, MAX_BURST_SIZE> = rxq.rx_burst();
                for mbuf in burst {
                    if port.handle_arp(queue_id, mbuf.data()) {
                        continue;
                    }
                    out.push(RxPacket {
                        port_id: port.port_id(),
                        queue_id,
                        mbuf,
                    });
                }
            }
        }
        let received = out.len() - before;
        if received > 0 {
            tracing::trace!(lcore_id = self.lcore_id, received, "Polled frames");
        }
        received
    }
}

impl std::fmt::Debug for IoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoService")
            .field("lcore_id", &self.lcore_id)
            .field("ports", &self.port_ids())
            .field("servq_depth", &self.servq_depth)
            .finish()
    }
}
