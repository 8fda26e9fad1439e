//! Capability traits implemented by a packet-I/O framework binding.
//!
//! Method names follow the framework calls they stand for. All calls are
//! synchronous and either complete or fail with an errno.

use super::Result;
use super::rte::eth::{
    DevInfo, EthConf, LinkStatus, MacAddress, PortId, QueueId, RxQueueConf, TxQueueConf,
};
use super::rte::flow::{FlowError, FlowHandle, FlowRule};
use super::rte::gpu::{GpuId, GpuInfo};
use super::rte::pktmbuf::{ExtMem, MemPool, MemPoolConfig};
use super::rte::queue::Burst;

/// Packet-I/O framework: EAL, ethdev, mempool and flow primitives.
pub trait RteBackend: Send + Sync {
    // EAL

    /// Initialize the environment with `args` (program name first).
    fn eal_init(&self, args: &[String]) -> Result<()>;

    fn eal_cleanup(&self) -> Result<()>;

    /// Number of NUMA sockets detected
    fn socket_count(&self) -> u32;

    // Ethernet devices

    fn eth_dev_count_avail(&self) -> u16;

    /// IDs of all available ports
    fn eth_dev_ids(&self) -> Vec<PortId>;

    fn eth_dev_info(&self, port_id: PortId) -> Result<DevInfo>;

    /// NUMA socket of the device, negative when unknown
    fn eth_dev_socket_id(&self, port_id: PortId) -> i32;

    fn eth_macaddr_get(&self, port_id: PortId) -> Result<MacAddress>;

    fn eth_dev_configure(
        &self,
        port_id: PortId,
        nb_rx_queues: u16,
        nb_tx_queues: u16,
        conf: &EthConf,
    ) -> Result<()>;

    fn eth_dev_set_mtu(&self, port_id: PortId, mtu: u16) -> Result<()>;

    fn eth_dev_get_mtu(&self, port_id: PortId) -> Result<u16>;

    /// Clamp descriptor counts to the device limits in place.
    fn eth_dev_adjust_nb_rx_tx_desc(
        &self,
        port_id: PortId,
        nb_rx_desc: &mut u16,
        nb_tx_desc: &mut u16,
    ) -> Result<()>;

    fn eth_rx_queue_setup(&self, port_id: PortId, queue_id: QueueId, conf: &RxQueueConf)
    -> Result<()>;

    fn eth_tx_queue_setup(&self, port_id: PortId, queue_id: QueueId, conf: &TxQueueConf)
    -> Result<()>;

    fn eth_dev_start(&self, port_id: PortId) -> Result<()>;

    fn eth_dev_stop(&self, port_id: PortId) -> Result<()>;

    /// Link status, waiting for the device to settle
    fn eth_link_get(&self, port_id: PortId) -> Result<LinkStatus>;

    /// Link status without waiting
    fn eth_link_get_nowait(&self, port_id: PortId) -> Result<LinkStatus>;

    // Packet I/O

    /// Receive up to `max` packets, appending them to `mbufs`.
    fn eth_rx_burst(&self, port_id: PortId, queue_id: QueueId, mbufs: &mut Burst, max: usize);

    /// Transmit packets from the front of `mbufs`, removing the ones
    /// accepted. Returns the number sent.
    fn eth_tx_burst(&self, port_id: PortId, queue_id: QueueId, mbufs: &mut Burst) -> usize;

    // Memory

    fn pktmbuf_pool_create(&self, name: &str, config: &MemPoolConfig) -> Result<MemPool>;

    /// Create a pool whose data buffers are carved from `ext_mem`.
    fn pktmbuf_pool_create_extbuf(
        &self,
        name: &str,
        config: &MemPoolConfig,
        ext_mem: &ExtMem,
    ) -> Result<MemPool>;

    /// Release a pool. Mbufs still referencing it keep their buffers.
    fn mempool_free(&self, pool: &MemPool);

    fn extmem_register(&self, ext_mem: &ExtMem, page_size: usize) -> Result<()>;

    fn extmem_unregister(&self, ext_mem: &ExtMem) -> Result<()>;

    fn dev_dma_map(&self, port_id: PortId, ext_mem: &ExtMem) -> Result<()>;

    fn dev_dma_unmap(&self, port_id: PortId, ext_mem: &ExtMem) -> Result<()>;

    // Flow rules

    fn flow_validate(&self, port_id: PortId, rule: &FlowRule) -> std::result::Result<(), FlowError>;

    fn flow_create(
        &self,
        port_id: PortId,
        rule: &FlowRule,
    ) -> std::result::Result<FlowHandle, FlowError>;

    fn flow_destroy(
        &self,
        port_id: PortId,
        handle: FlowHandle,
    ) -> std::result::Result<(), FlowError>;
}

/// GPU-memory collaborator: device inventory and device memory.
pub trait GpuBackend: Send + Sync {
    fn gpu_count_avail(&self) -> u16;

    fn gpu_info(&self, dev_id: GpuId) -> Result<GpuInfo>;

    /// Allocate `size` bytes of device memory aligned to `align`.
    ///
    /// Returns the device address of the allocation.
    fn gpu_mem_alloc(&self, dev_id: GpuId, size: usize, align: usize) -> Result<u64>;

    fn gpu_mem_free(&self, dev_id: GpuId, addr: u64) -> Result<()>;
}
