// Ethernet device types
// Mirrors the subset of rte_ethdev.h the transport configures.

use std::fmt;

use super::pktmbuf::MemPool;

/// Ethernet device port ID
pub type PortId = u16;

/// Queue ID for RX/TX queues
pub type QueueId = u16;

/// A MAC address (6 bytes).
pub type MacAddress = [u8; 6];

/// NUMA socket id meaning "any socket"
pub const SOCKET_ID_ANY: i32 = -1;

/// RX offload flags (RTE_ETH_RX_OFFLOAD_*)
pub mod rx_offload {
    pub const VLAN_STRIP: u64 = 1 << 0;
    pub const IPV4_CKSUM: u64 = 1 << 1;
    pub const UDP_CKSUM: u64 = 1 << 2;
    pub const TCP_CKSUM: u64 = 1 << 3;
    pub const TCP_LRO: u64 = 1 << 4;
    pub const SCATTER: u64 = 1 << 13;
    pub const TIMESTAMP: u64 = 1 << 14;
    pub const RSS_HASH: u64 = 1 << 19;
    pub const BUFFER_SPLIT: u64 = 1 << 20;

    pub(crate) const NAMES: &[(u64, &str)] = &[
        (VLAN_STRIP, "VLAN_STRIP"),
        (IPV4_CKSUM, "IPV4_CKSUM"),
        (UDP_CKSUM, "UDP_CKSUM"),
        (TCP_CKSUM, "TCP_CKSUM"),
        (TCP_LRO, "TCP_LRO"),
        (SCATTER, "SCATTER"),
        (TIMESTAMP, "TIMESTAMP"),
        (RSS_HASH, "RSS_HASH"),
        (BUFFER_SPLIT, "BUFFER_SPLIT"),
    ];
}

/// TX offload flags (RTE_ETH_TX_OFFLOAD_*)
pub mod tx_offload {
    pub const VLAN_INSERT: u64 = 1 << 0;
    pub const IPV4_CKSUM: u64 = 1 << 1;
    pub const UDP_CKSUM: u64 = 1 << 2;
    pub const TCP_CKSUM: u64 = 1 << 3;
    pub const TCP_TSO: u64 = 1 << 5;
    pub const MULTI_SEGS: u64 = 1 << 15;

    pub(crate) const NAMES: &[(u64, &str)] = &[
        (VLAN_INSERT, "VLAN_INSERT"),
        (IPV4_CKSUM, "IPV4_CKSUM"),
        (UDP_CKSUM, "UDP_CKSUM"),
        (TCP_CKSUM, "TCP_CKSUM"),
        (TCP_TSO, "TCP_TSO"),
        (MULTI_SEGS, "MULTI_SEGS"),
    ];
}

/// Render an offload bitmap as a list of flag names.
///
/// Bits without a known name are rendered as hex.
pub fn offload_names(offloads: u64, names: &[(u64, &str)]) -> Vec<String> {
    (0..u64::BITS)
        .map(|bit| 1u64 << bit)
        .filter(|flag| offloads & flag != 0)
        .map(|flag| {
            names
                .iter()
                .find(|(f, _)| *f == flag)
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| format!("{flag:#x}"))
        })
        .collect()
}

/// Descriptor ring limits reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescLimits {
    pub nb_min: u16,
    pub nb_max: u16,
    /// Required alignment (power of two, 1 for none)
    pub nb_align: u16,
}

impl Default for DescLimits {
    fn default() -> Self {
        Self {
            nb_min: 0,
            nb_max: u16::MAX,
            nb_align: 1,
        }
    }
}

impl DescLimits {
    /// Check that `nb_desc` is inside the limits and aligned.
    pub fn accepts(&self, nb_desc: u16) -> bool {
        let align = self.nb_align.max(1);
        nb_desc >= self.nb_min && nb_desc <= self.nb_max && (align - 1) & nb_desc == 0
    }
}

/// Device capabilities (subset of rte_eth_dev_info)
#[derive(Debug, Clone)]
pub struct DevInfo {
    pub driver_name: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_offload_capa: u64,
    pub tx_offload_capa: u64,
    pub rx_desc_lim: DescLimits,
    pub tx_desc_lim: DescLimits,
    pub min_mtu: u16,
    pub max_mtu: u16,
}

/// Link state as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    /// Link speed in Mbps (0 when unknown)
    pub speed_mbps: u32,
}

/// RX mode configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMode {
    /// Maximum Transfer Unit
    pub mtu: u32,
    /// RX offload flags (rx_offload::*)
    pub offloads: u64,
}

impl Default for RxMode {
    fn default() -> Self {
        Self {
            mtu: 1500,
            offloads: 0,
        }
    }
}

/// TX mode configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMode {
    /// TX offload flags (tx_offload::*)
    pub offloads: u64,
}

/// Ethernet device configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthConf {
    /// RX mode configuration
    pub rx_mode: RxMode,
    /// TX mode configuration
    pub tx_mode: TxMode,
    /// Link state change interrupt
    pub lsc_intr: bool,
}

impl EthConf {
    /// Create a simple configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set MTU
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.rx_mode.mtu = mtu;
        self
    }

    /// Set RX offloads
    pub fn rx_offloads(mut self, offloads: u64) -> Self {
        self.rx_mode.offloads = offloads;
        self
    }

    /// Set TX offloads
    pub fn tx_offloads(mut self, offloads: u64) -> Self {
        self.tx_mode.offloads = offloads;
        self
    }

    /// Enable link state change interrupts
    pub fn lsc(mut self) -> Self {
        self.lsc_intr = true;
        self
    }
}

/// One segment of a buffer-split receive (rte_eth_rxseg_split)
#[derive(Clone)]
pub struct RxSeg {
    /// Pool the segment is delivered into
    pub pool: MemPool,
    /// Segment length in bytes (0 = the rest of the packet)
    pub length: u16,
    /// Offset into the segment buffer
    pub offset: u16,
}

impl fmt::Debug for RxSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxSeg")
            .field("pool", &self.pool.name())
            .field("length", &self.length)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Where an RX queue places received bytes
#[derive(Clone, Debug)]
pub enum RxBuffers {
    /// Whole packets into a single pool
    Pool(MemPool),
    /// Each packet split across the given segments, in order
    Split(Vec<RxSeg>),
}

/// RX queue configuration
#[derive(Debug, Clone)]
pub struct RxQueueConf {
    /// Number of descriptors
    pub nb_desc: u16,
    /// NUMA socket ID (-1 for any)
    pub socket_id: i32,
    /// Per-queue RX offloads
    pub offloads: u64,
    /// Buffer placement
    pub buffers: RxBuffers,
}

impl RxQueueConf {
    /// Receive whole packets into `pool`.
    pub fn new(pool: MemPool) -> Self {
        Self {
            nb_desc: 1024,
            socket_id: SOCKET_ID_ANY,
            offloads: 0,
            buffers: RxBuffers::Pool(pool),
        }
    }

    /// Receive packets split across `segments`.
    ///
    /// Enables the scatter and buffer-split offloads on the queue.
    pub fn split(segments: Vec<RxSeg>) -> Self {
        Self {
            nb_desc: 1024,
            socket_id: SOCKET_ID_ANY,
            offloads: rx_offload::SCATTER | rx_offload::BUFFER_SPLIT,
            buffers: RxBuffers::Split(segments),
        }
    }

    /// Set the number of descriptors for the RX ring.
    pub fn nb_desc(mut self, n: u16) -> Self {
        self.nb_desc = n;
        self
    }

    /// Set the NUMA socket ID.
    ///
    /// Use -1 for automatic detection based on the device.
    pub fn socket_id(mut self, id: i32) -> Self {
        self.socket_id = id;
        self
    }

    /// Check whether this queue splits packets across pools.
    pub fn is_split(&self) -> bool {
        matches!(self.buffers, RxBuffers::Split(_))
    }
}

/// TX queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxQueueConf {
    /// Number of descriptors
    pub nb_desc: u16,
    /// NUMA socket ID (-1 for any)
    pub socket_id: i32,
    /// Per-queue TX offloads
    pub offloads: u64,
}

impl Default for TxQueueConf {
    fn default() -> Self {
        Self {
            nb_desc: 1024,
            socket_id: SOCKET_ID_ANY,
            offloads: 0,
        }
    }
}

impl TxQueueConf {
    /// Create a new TxQueueConf with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of descriptors for the TX ring.
    pub fn nb_desc(mut self, n: u16) -> Self {
        self.nb_desc = n;
        self
    }

    /// Set the NUMA socket ID.
    pub fn socket_id(mut self, id: i32) -> Self {
        self.socket_id = id;
        self
    }

    /// Set per-queue TX offloads.
    pub fn offloads(mut self, offloads: u64) -> Self {
        self.offloads = offloads;
        self
    }
}

/// Format MAC address as string
pub fn format_mac_addr(addr: &MacAddress) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]
    )
}

/// Parse a `aa:bb:cc:dd:ee:ff` (or `-` separated) MAC address.
pub fn parse_mac_addr(s: &str) -> Option<MacAddress> {
    let mut mac = [0u8; 6];
    let mut parts = s.trim().split([':', '-']);
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_format_parse() {
        let mac = [0x00, 0x1b, 0x21, 0xaa, 0xbb, 0x0c];
        let s = format_mac_addr(&mac);
        assert_eq!(s, "00:1b:21:aa:bb:0c");
        assert_eq!(parse_mac_addr(&s), Some(mac));
        assert_eq!(parse_mac_addr("00-1B-21-AA-BB-0C"), Some(mac));
        assert_eq!(parse_mac_addr("00:1b:21:aa:bb"), None);
        assert_eq!(parse_mac_addr("00:1b:21:aa:bb:0c:11"), None);
        assert_eq!(parse_mac_addr("00:1b:21:aa:bb:zz"), None);
    }

    #[test]
    fn test_desc_limits() {
        let lim = DescLimits {
            nb_min: 64,
            nb_max: 4096,
            nb_align: 32,
        };
        assert!(lim.accepts(512));
        assert!(!lim.accepts(32));
        assert!(!lim.accepts(8192));
        assert!(!lim.accepts(100));
        assert!(DescLimits::default().accepts(7));
    }

    #[test]
    fn test_offload_names() {
        let names = offload_names(
            rx_offload::IPV4_CKSUM | rx_offload::BUFFER_SPLIT | (1 << 40),
            rx_offload::NAMES,
        );
        assert_eq!(names, vec!["IPV4_CKSUM", "BUFFER_SPLIT", "0x10000000000"]);
        assert!(offload_names(0, tx_offload::NAMES).is_empty());
    }
}
