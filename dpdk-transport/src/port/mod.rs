//! One managed NIC: queue bring-up, addressing, address resolution,
//! ephemeral transport ports and ingress steering.

pub mod addr;
pub mod arp;
pub mod flow;
pub mod udp;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::ArpOperation;

use crate::api::RteBackend;
use crate::api::rte::eth::{
    DevInfo, EthConf, LinkStatus, MacAddress, PortId, QueueId, RxQueueConf, RxSeg, TxQueueConf,
    format_mac_addr, offload_names, rx_offload, tx_offload,
};
use crate::api::rte::pktmbuf::MemPool;
use crate::api::rte::queue::{RxQueue, TxQueue};
use crate::error::{Result, TransportError};

pub use addr::Ipv4Net;
pub use arp::{AddressResolver, Resolution};
pub use flow::{FlowSteering, FlowTarget};
pub use udp::EphemeralPorts;

/// Bytes of each packet kept in host memory on the GPU queue: Ethernet,
/// IPv4 and UDP headers plus the 16-byte stream header and timestamp.
pub const HEADER_SPLIT_LEN: u16 = 14 + 20 + 8 + 16;

/// Inputs for bringing up one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub port_id: PortId,
    pub mtu: u16,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    pub num_desc: u16,
    /// `a.b.c.d/n`
    pub ipv4: String,
}

/// Buffer pools a port receives into and transmits from.
///
/// The pools are owned by the context's registry; the port only borrows
/// them.
#[derive(Debug, Clone)]
pub struct PortPools {
    pub cpu_rx: MemPool,
    pub cpu_tx: MemPool,
    pub gpu_rx: Option<MemPool>,
    pub gpu_tx: Option<MemPool>,
}

/// RX queue layout, resolved once from the device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPlan {
    CpuOnly { cpu_queues: u16 },
    /// CPU queues `0..cpu_queues`, followed by the header-split GPU queue.
    GpuSplit { cpu_queues: u16, gpu_queue: QueueId },
}

impl RxPlan {
    /// Decide the RX layout for `requested` CPU queues, clamping to what the
    /// device reports.
    fn resolve(port_id: PortId, info: &DevInfo, requested: u16, gpu: bool) -> Result<Self> {
        if !gpu {
            return Ok(RxPlan::CpuOnly {
                cpu_queues: clamp_queues(port_id, "RX", requested, info.max_rx_queues),
            });
        }
        if info.max_rx_queues < 2 {
            tracing::error!(port_id, max_rx_queues = info.max_rx_queues, "NIC has only one RX queue");
            return Err(TransportError::capability(
                port_id,
                format!(
                    "GPU split needs at least 2 RX queues, device reports {}",
                    info.max_rx_queues
                ),
            ));
        }
        let cpu_queues = clamp_queues(port_id, "RX", requested, info.max_rx_queues - 1);
        Ok(RxPlan::GpuSplit {
            cpu_queues,
            gpu_queue: cpu_queues,
        })
    }

    pub fn cpu_queues(&self) -> u16 {
        match *self {
            RxPlan::CpuOnly { cpu_queues } | RxPlan::GpuSplit { cpu_queues, .. } => cpu_queues,
        }
    }

    pub fn gpu_queue(&self) -> Option<QueueId> {
        match *self {
            RxPlan::CpuOnly { .. } => None,
            RxPlan::GpuSplit { gpu_queue, .. } => Some(gpu_queue),
        }
    }

    /// Total RX queues configured on the device
    pub fn rx_queue_count(&self) -> u16 {
        self.cpu_queues() + u16::from(self.gpu_queue().is_some())
    }
}

fn clamp_queues(port_id: PortId, dir: &str, requested: u16, max: u16) -> u16 {
    if requested > max {
        tracing::warn!(port_id, requested, max, "Maximum {dir} queues supported is {max}");
        max
    } else {
        requested
    }
}

/// A started NIC port.
///
/// Dropping the port stops the device and releases every address
/// resolution waiter.
pub struct Port {
    rte: Arc<dyn RteBackend>,
    port_id: PortId,
    mac: MacAddress,
    net: Ipv4Net,
    mtu: u16,
    socket_id: i32,
    rx_plan: RxPlan,
    num_tx_queues: u16,
    nb_rx_desc: u16,
    nb_tx_desc: u16,
    pools: PortPools,
    resolver: AddressResolver,
    udp_ports: EphemeralPorts,
    steering: FlowSteering,
}

impl Port {
    /// Configure, start and seed the ingress flow of a port.
    ///
    /// Any failure aborts the bring-up; no partially configured port is
    /// returned.
    pub fn new(rte: Arc<dyn RteBackend>, cfg: &PortConfig, pools: PortPools) -> Result<Self> {
        let port_id = cfg.port_id;
        let net = Ipv4Net::parse(&cfg.ipv4)?;

        let info = rte
            .eth_dev_info(port_id)
            .map_err(TransportError::device(port_id, "rte_eth_dev_info_get"))?;

        let rx_plan = RxPlan::resolve(port_id, &info, cfg.num_rx_queues, pools.gpu_rx.is_some())?;
        let num_tx_queues = clamp_queues(port_id, "TX", cfg.num_tx_queues, info.max_tx_queues);
        tracing::info!(
            port_id,
            rx_queues = rx_plan.rx_queue_count(),
            tx_queues = num_tx_queues,
            gpu_queue = ?rx_plan.gpu_queue(),
            "NIC queue layout"
        );

        let mut rx_offloads = rx_offload::IPV4_CKSUM;
        if rx_plan.gpu_queue().is_some() {
            rx_offloads |= rx_offload::SCATTER | rx_offload::BUFFER_SPLIT;
        }
        let mut tx_offloads = tx_offload::IPV4_CKSUM;
        if pools.gpu_tx.is_some() {
            tx_offloads |= tx_offload::MULTI_SEGS;
        }
        tracing::info!(
            port_id,
            rx = ?offload_names(rx_offloads, rx_offload::NAMES),
            tx = ?offload_names(tx_offloads, tx_offload::NAMES),
            "NIC offloads"
        );

        if info.rx_offload_capa & rx_offloads != rx_offloads {
            tracing::error!(
                port_id,
                capa = format_args!("{:#x}", info.rx_offload_capa),
                "Missing required RX offloads"
            );
            return Err(TransportError::capability(
                port_id,
                format!(
                    "missing RX offloads {:?}",
                    offload_names(rx_offloads & !info.rx_offload_capa, rx_offload::NAMES)
                ),
            ));
        }
        if info.tx_offload_capa & tx_offloads != tx_offloads {
            tracing::error!(
                port_id,
                capa = format_args!("{:#x}", info.tx_offload_capa),
                "Missing required TX offloads"
            );
            return Err(TransportError::capability(
                port_id,
                format!(
                    "missing TX offloads {:?}",
                    offload_names(tx_offloads & !info.tx_offload_capa, tx_offload::NAMES)
                ),
            ));
        }

        let eth_conf = EthConf::new()
            .mtu(u32::from(cfg.mtu))
            .rx_offloads(rx_offloads)
            .tx_offloads(tx_offloads)
            .lsc();
        rte.eth_dev_configure(port_id, rx_plan.rx_queue_count(), num_tx_queues, &eth_conf)
            .map_err(|e| {
                tracing::error!(port_id, error = %e, "Failed to configure the device");
                TransportError::device(port_id, "rte_eth_dev_configure")(e)
            })?;

        let mtu = match rte.eth_dev_set_mtu(port_id, cfg.mtu) {
            Ok(()) => cfg.mtu,
            Err(e) => {
                let actual = rte
                    .eth_dev_get_mtu(port_id)
                    .map_err(TransportError::device(port_id, "rte_eth_dev_get_mtu"))?;
                tracing::warn!(port_id, requested = cfg.mtu, actual, error = %e, "Could not set MTU");
                actual
            }
        };

        for (dir, lim) in [("RX", &info.rx_desc_lim), ("TX", &info.tx_desc_lim)] {
            if !lim.accepts(cfg.num_desc) {
                tracing::error!(
                    port_id,
                    requested = cfg.num_desc,
                    nb_min = lim.nb_min,
                    nb_max = lim.nb_max,
                    nb_align = lim.nb_align,
                    "{dir} descriptor count out of range"
                );
                return Err(TransportError::capability(
                    port_id,
                    format!(
                        "{} {dir} descriptors requested, must be in [{}, {}] aligned to {:#x}",
                        cfg.num_desc, lim.nb_min, lim.nb_max, lim.nb_align
                    ),
                ));
            }
        }
        let (mut nb_rx_desc, mut nb_tx_desc) = (cfg.num_desc, cfg.num_desc);
        rte.eth_dev_adjust_nb_rx_tx_desc(port_id, &mut nb_rx_desc, &mut nb_tx_desc)
            .map_err(|e| {
                tracing::error!(port_id, error = %e, "Failed to configure the DMA queues");
                TransportError::device(port_id, "rte_eth_dev_adjust_nb_rx_tx_desc")(e)
            })?;
        if (nb_rx_desc, nb_tx_desc) != (cfg.num_desc, cfg.num_desc) {
            tracing::warn!(
                port_id,
                requested = cfg.num_desc,
                nb_rx_desc,
                nb_tx_desc,
                "Descriptor ring sizes adjusted by device"
            );
        }

        let socket_id = rte.eth_dev_socket_id(port_id);

        if let (Some(gpu_queue), Some(gpu_rx)) = (rx_plan.gpu_queue(), &pools.gpu_rx) {
            let conf = RxQueueConf::split(vec![
                RxSeg {
                    pool: pools.cpu_rx.clone(),
                    length: HEADER_SPLIT_LEN,
                    offset: 0,
                },
                RxSeg {
                    pool: gpu_rx.clone(),
                    length: 0,
                    offset: 0,
                },
            ])
            .nb_desc(nb_rx_desc)
            .socket_id(socket_id);
            rte.eth_rx_queue_setup(port_id, gpu_queue, &conf).map_err(|e| {
                tracing::error!(port_id, queue_id = gpu_queue, error = %e, "Could not init GPU RX queue");
                TransportError::device(port_id, "GPU RX queue setup")(e)
            })?;
        }

        for queue_id in 0..rx_plan.cpu_queues() {
            let conf = RxQueueConf::new(pools.cpu_rx.clone())
                .nb_desc(nb_rx_desc)
                .socket_id(socket_id);
            rte.eth_rx_queue_setup(port_id, queue_id, &conf).map_err(|e| {
                tracing::error!(port_id, queue_id, error = %e, "Could not init RX queue");
                TransportError::device(port_id, "RX queue setup")(e)
            })?;
        }

        for queue_id in 0..num_tx_queues {
            let conf = TxQueueConf::new()
                .nb_desc(nb_tx_desc)
                .socket_id(socket_id)
                .offloads(tx_offload::IPV4_CKSUM);
            rte.eth_tx_queue_setup(port_id, queue_id, &conf).map_err(|e| {
                tracing::error!(port_id, queue_id, error = %e, "Could not init TX queue");
                TransportError::device(port_id, "TX queue setup")(e)
            })?;
        }

        rte.eth_dev_start(port_id).map_err(|e| {
            tracing::error!(port_id, error = %e, "Could not start device");
            TransportError::device(port_id, "rte_eth_dev_start")(e)
        })?;

        let steering = FlowSteering::new(rte.clone(), port_id, rx_plan.gpu_queue());
        let seeded = steering.route_to_host().and_then(|()| {
            rte.eth_macaddr_get(port_id)
                .map_err(TransportError::device(port_id, "rte_eth_macaddr_get"))
        });
        let mac = match seeded {
            Ok(mac) => mac,
            Err(e) => {
                if let Err(stop_err) = rte.eth_dev_stop(port_id) {
                    tracing::warn!(port_id, error = %stop_err, "Failed to stop device");
                }
                return Err(e);
            }
        };

        tracing::info!(
            port_id,
            mac = %format_mac_addr(&mac),
            ipv4 = %net,
            mtu,
            driver = %info.driver_name,
            "Port started"
        );

        Ok(Self {
            rte,
            port_id,
            mac,
            net,
            mtu,
            socket_id,
            rx_plan,
            num_tx_queues,
            nb_rx_desc,
            nb_tx_desc,
            pools,
            resolver: AddressResolver::new(),
            udp_ports: EphemeralPorts::new(),
            steering,
        })
    }

    #[inline]
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    #[inline]
    pub fn mac_addr(&self) -> MacAddress {
        self.mac
    }

    #[inline]
    pub fn ipv4(&self) -> Ipv4Addr {
        self.net.addr()
    }

    #[inline]
    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    pub fn net(&self) -> Ipv4Net {
        self.net
    }

    /// MTU in effect (may differ from the configured one)
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    pub fn rx_plan(&self) -> RxPlan {
        self.rx_plan
    }

    pub fn rx_queue_count(&self) -> u16 {
        self.rx_plan.rx_queue_count()
    }

    pub fn tx_queue_count(&self) -> u16 {
        self.num_tx_queues
    }

    /// Descriptor ring sizes in effect, `(rx, tx)`
    pub fn desc_counts(&self) -> (u16, u16) {
        (self.nb_rx_desc, self.nb_tx_desc)
    }

    pub fn pools(&self) -> &PortPools {
        &self.pools
    }

    pub fn rx_queue(&self, queue_id: QueueId) -> Option<RxQueue> {
        (queue_id < self.rx_queue_count())
            .then(|| RxQueue::new(self.rte.clone(), self.port_id, queue_id))
    }

    pub fn tx_queue(&self, queue_id: QueueId) -> Option<TxQueue> {
        (queue_id < self.num_tx_queues)
            .then(|| TxQueue::new(self.rte.clone(), self.port_id, queue_id))
    }

    /// Whether `ip` is on this port's subnet.
    pub fn dst_is_local(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(ip)
    }

    /// Current link state, without waiting.
    pub fn link_status(&self) -> Result<LinkStatus> {
        self.rte
            .eth_link_get_nowait(self.port_id)
            .map_err(TransportError::device(self.port_id, "rte_eth_link_get_nowait"))
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    /// Resolved link address of `ip`, without blocking.
    #[inline]
    pub fn arp_lookup(&self, ip: &Ipv4Addr) -> Option<MacAddress> {
        self.resolver.lookup(ip)
    }

    /// Resolve the link address of a same-subnet destination.
    ///
    /// The first waiter for a destination broadcasts one request; callers
    /// own any retransmission.
    pub fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Resolution {
        if !self.dst_is_local(ip) {
            tracing::debug!(port_id = self.port_id, %ip, "Destination is not on the local subnet");
            return Resolution::unresolved();
        }
        match self.resolver.register(ip) {
            arp::Registration::Done(res) => res,
            arp::Registration::Waiting { id, new_entry } => {
                if new_entry {
                    self.send_arp(0, ArpOperation::Request, ([0xff; 6], ip));
                }
                self.resolver.wait(ip, id, timeout)
            }
        }
    }

    /// Process an ARP frame received on `queue_id`.
    ///
    /// Requests for this port's address are answered on the same queue,
    /// replies complete pending resolutions. Returns `false` for frames
    /// that are not ARP.
    pub fn handle_arp(&self, queue_id: QueueId, frame: &[u8]) -> bool {
        match arp::ArpMessage::parse(frame) {
            Some(arp::ArpMessage::Request {
                sender_mac,
                sender_ip,
                target_ip,
            }) => {
                if target_ip == self.ipv4() {
                    self.send_arp(queue_id, ArpOperation::Reply, (sender_mac, sender_ip));
                }
                true
            }
            Some(arp::ArpMessage::Reply {
                sender_mac,
                sender_ip,
            }) => {
                self.resolver.on_reply(sender_ip, sender_mac);
                true
            }
            None => false,
        }
    }

    fn send_arp(&self, queue_id: QueueId, op: ArpOperation, dst: (MacAddress, Ipv4Addr)) -> bool {
        let Some(mut mbuf) = self.pools.cpu_tx.try_alloc() else {
            tracing::warn!(port_id = self.port_id, "Could not allocate packet buffer for ARP");
            return false;
        };
        let Some(buf) = mbuf.append(arp::ARP_FRAME_LEN) else {
            tracing::warn!(port_id = self.port_id, "Packet buffer too small for ARP");
            return false;
        };
        arp::emit_arp_frame(buf, op, (self.mac, self.ipv4()), dst);

        let Some(txq) = self.arp_tx_queue(queue_id) else {
            tracing::warn!(port_id = self.port_id, "No TX queue for ARP");
            return false;
        };
        if txq.tx_one(mbuf).is_some() {
            tracing::warn!(
                port_id = self.port_id,
                queue_id = txq.queue_id(),
                "TX descriptor ring is full"
            );
            return false;
        }
        true
    }

    /// TX queue paired with RX queue `queue_id`, folded onto the configured
    /// TX queues when the device has fewer of them.
    fn arp_tx_queue(&self, queue_id: QueueId) -> Option<TxQueue> {
        if let Some(txq) = self.tx_queue(queue_id) {
            return Some(txq);
        }
        let folded = queue_id.checked_rem(self.num_tx_queues)?;
        tracing::debug!(
            port_id = self.port_id,
            rx_queue = queue_id,
            tx_queue = folded,
            "Folding ARP onto TX queue"
        );
        self.tx_queue(folded)
    }

    /// Allocate a transport port, network byte order in and out.
    ///
    /// A non-zero `requested` port is granted only if free; zero picks the
    /// next free port. Returns 0 on failure.
    pub fn alloc_transport_port(&self, requested_be: u16) -> u16 {
        self.udp_ports
            .allocate(u16::from_be(requested_be))
            .map_or(0, u16::to_be)
    }

    /// Release a port returned by [`Self::alloc_transport_port`].
    pub fn free_transport_port(&self, port_be: u16) -> bool {
        self.udp_ports.free(u16::from_be(port_be))
    }

    pub fn transport_ports(&self) -> &EphemeralPorts {
        &self.udp_ports
    }

    /// Steer all ingress to the first CPU queue. No-op without a GPU pool.
    pub fn route_to_host(&self) -> Result<()> {
        self.steering.route_to_host()
    }

    /// Steer sample-stream ingress to the GPU queue. No-op without a GPU pool.
    pub fn route_to_device(&self) -> Result<()> {
        self.steering.route_to_device()
    }

    pub fn steering(&self) -> &FlowSteering {
        &self.steering
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if let Err(e) = self.rte.eth_dev_stop(self.port_id) {
            tracing::warn!(port_id = self.port_id, error = %e, "Failed to stop device");
        }
        self.resolver.teardown();
        tracing::debug!(port_id = self.port_id, "Port stopped");
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("port_id", &self.port_id)
            .field("mac", &format_mac_addr(&self.mac))
            .field("net", &self.net)
            .field("mtu", &self.mtu)
            .field("rx_plan", &self.rx_plan)
            .field("num_tx_queues", &self.num_tx_queues)
            .finish()
    }
}
