//! Buffer pools shared by the ports of a context.
//!
//! Host RX/TX pools are created lazily, once per NUMA socket, and reused by
//! every port on that socket. GPU RX pools are built per port over a GPU
//! memory region registered for DMA with that port's device.

use std::sync::Arc;

use crate::api::rte::eth::PortId;
use crate::api::rte::gpu::{CPU_PAGE_SIZE, GPU_PAGE_SIZE, GpuId, align_up};
use crate::api::rte::pktmbuf::{ExtMem, MemPool, MemPoolConfig, PKTMBUF_HEADROOM};
use crate::api::{GpuBackend, RteBackend};
use crate::error::{Result, TransportError};

/// Ethernet header plus CRC
const ETHER_OVERHEAD: u16 = 14 + 4;

/// Sizing shared by every pool of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub mtu: u16,
    /// Buffers per queue
    pub num_mbufs: u32,
    pub cache_size: u32,
}

impl PoolSizing {
    /// Data room of a host mbuf: headroom, Ethernet overhead and one MTU.
    pub fn mbuf_size(&self) -> u16 {
        self.mtu
            .saturating_add(PKTMBUF_HEADROOM)
            .saturating_add(ETHER_OVERHEAD)
    }
}

/// GPU memory registered for DMA with one port.
///
/// Dropping unmaps, unregisters and frees the region, in that order.
struct GpuRegion {
    rte: Arc<dyn RteBackend>,
    gpu: Arc<dyn GpuBackend>,
    gpu_id: GpuId,
    port_id: PortId,
    ext_mem: ExtMem,
    dma_mapped: bool,
    registered: bool,
}

impl GpuRegion {
    fn allocate(
        rte: Arc<dyn RteBackend>,
        gpu: Arc<dyn GpuBackend>,
        gpu_id: GpuId,
        port_id: PortId,
        sizing: &PoolSizing,
    ) -> Result<Self> {
        let buf_len = align_up(sizing.num_mbufs as usize * sizing.mtu as usize, GPU_PAGE_SIZE);
        let buf_addr = gpu
            .gpu_mem_alloc(gpu_id, buf_len, CPU_PAGE_SIZE)
            .map_err(|e| {
                tracing::error!(gpu_id, buf_len, error = %e, "Could not allocate GPU device memory");
                TransportError::memory(format!("GPU {gpu_id} memory allocation"))(e)
            })?;

        let mut region = Self {
            rte,
            gpu,
            gpu_id,
            port_id,
            ext_mem: ExtMem {
                buf_addr,
                buf_iova: None,
                buf_len,
                elt_size: sizing.mtu,
            },
            dma_mapped: false,
            registered: false,
        };

        region
            .rte
            .extmem_register(&region.ext_mem, GPU_PAGE_SIZE)
            .map_err(|e| {
                tracing::error!(gpu_id, error = %e, "Unable to register external memory");
                TransportError::memory("external memory registration")(e)
            })?;
        region.registered = true;

        region
            .rte
            .dev_dma_map(port_id, &region.ext_mem)
            .map_err(|e| {
                tracing::error!(port_id, gpu_id, error = %e, "Could not DMA map external memory");
                TransportError::memory(format!("DMA map for port {port_id}"))(e)
            })?;
        region.dma_mapped = true;

        tracing::debug!(
            port_id,
            gpu_id,
            buf_addr = format_args!("{buf_addr:#x}"),
            buf_len,
            "GPU memory region registered"
        );
        Ok(region)
    }
}

impl Drop for GpuRegion {
    fn drop(&mut self) {
        if self.dma_mapped {
            if let Err(e) = self.rte.dev_dma_unmap(self.port_id, &self.ext_mem) {
                tracing::warn!(port_id = self.port_id, error = %e, "DMA unmap failed");
            }
        }
        if self.registered {
            if let Err(e) = self.rte.extmem_unregister(&self.ext_mem) {
                tracing::warn!(error = %e, "External memory unregister failed");
            }
        }
        if let Err(e) = self.gpu.gpu_mem_free(self.gpu_id, self.ext_mem.buf_addr) {
            tracing::warn!(gpu_id = self.gpu_id, error = %e, "GPU memory free failed");
        }
    }
}

/// Owner of every buffer pool of a context.
///
/// Pools are released on drop, before the GPU regions they were built on.
pub struct BufferPoolRegistry {
    rte: Arc<dyn RteBackend>,
    sizing: PoolSizing,
    cpu_rx: Vec<Option<MemPool>>,
    cpu_tx: Vec<Option<MemPool>>,
    gpu_rx: Vec<(PortId, MemPool)>,
    gpu_regions: Vec<GpuRegion>,
}

impl BufferPoolRegistry {
    pub fn new(rte: Arc<dyn RteBackend>, sizing: PoolSizing) -> Self {
        let sockets = rte.socket_count().max(1) as usize;
        Self {
            rte,
            sizing,
            cpu_rx: vec![None; sockets],
            cpu_tx: vec![None; sockets],
            gpu_rx: Vec::new(),
            gpu_regions: Vec::new(),
        }
    }

    pub fn sizing(&self) -> &PoolSizing {
        &self.sizing
    }

    /// Host RX pool for `socket_id`, created with `num_bufs` buffers on
    /// first use. A negative socket maps to socket 0.
    pub fn cpu_rx_pool(&mut self, socket_id: i32, num_bufs: u32) -> Result<MemPool> {
        let config = MemPoolConfig::new()
            .num_mbufs(num_bufs)
            .cache_size(self.sizing.cache_size)
            .data_room_size(self.sizing.mbuf_size());
        Self::get_or_create(&self.rte, &mut self.cpu_rx, "cpu_rx_mbuf_pool", socket_id, config)
    }

    /// Host TX pool for `socket_id`, see [`Self::cpu_rx_pool`].
    pub fn cpu_tx_pool(&mut self, socket_id: i32, num_bufs: u32) -> Result<MemPool> {
        let config = MemPoolConfig::new()
            .num_mbufs(num_bufs)
            .cache_size(self.sizing.cache_size)
            .data_room_size(self.sizing.mbuf_size());
        Self::get_or_create(&self.rte, &mut self.cpu_tx, "cpu_tx_mbuf_pool", socket_id, config)
    }

    fn get_or_create(
        rte: &Arc<dyn RteBackend>,
        pools: &mut Vec<Option<MemPool>>,
        prefix: &str,
        socket_id: i32,
        config: MemPoolConfig,
    ) -> Result<MemPool> {
        let socket = socket_id.max(0) as usize;
        if socket >= pools.len() {
            pools.resize(socket + 1, None);
        }
        if let Some(pool) = &pools[socket] {
            return Ok(pool.clone());
        }

        let name = format!("{prefix}_{socket}");
        let pool = rte.pktmbuf_pool_create(&name, &config).map_err(|e| {
            tracing::error!(pool = %name, error = %e, "Could not allocate pktbuf pool");
            TransportError::memory(format!("pool {name} creation"))(e)
        })?;
        tracing::debug!(
            pool = %name,
            num_mbufs = config.num_mbufs,
            data_room = config.data_room_size,
            "Created pktbuf pool"
        );
        pools[socket] = Some(pool.clone());
        Ok(pool)
    }

    /// Build the GPU RX pool for `port_id` over a freshly registered region
    /// of GPU `gpu_id`.
    pub fn gpu_rx_pool(
        &mut self,
        gpu: Arc<dyn GpuBackend>,
        gpu_id: GpuId,
        port_id: PortId,
    ) -> Result<MemPool> {
        let region = GpuRegion::allocate(self.rte.clone(), gpu, gpu_id, port_id, &self.sizing)?;

        let name = format!("payload_mpool{port_id}");
        let config = MemPoolConfig::new()
            .num_mbufs(self.sizing.num_mbufs)
            .cache_size(0)
            .data_room_size(region.ext_mem.elt_size);
        // on failure the region is released by its drop
        let pool = self
            .rte
            .pktmbuf_pool_create_extbuf(&name, &config, &region.ext_mem)
            .map_err(|e| {
                tracing::error!(pool = %name, error = %e, "Could not create external memory pool");
                TransportError::memory(format!("pool {name} creation"))(e)
            })?;

        self.gpu_regions.push(region);
        self.gpu_rx.push((port_id, pool.clone()));
        Ok(pool)
    }

    /// Names of all pools owned by the registry
    pub fn pool_names(&self) -> Vec<String> {
        self.cpu_rx
            .iter()
            .chain(self.cpu_tx.iter())
            .flatten()
            .chain(self.gpu_rx.iter().map(|(_, pool)| pool))
            .map(|pool| pool.name().to_string())
            .collect()
    }
}

impl Drop for BufferPoolRegistry {
    fn drop(&mut self) {
        let host = self.cpu_rx.drain(..).chain(self.cpu_tx.drain(..)).flatten();
        for pool in host.collect::<Vec<_>>() {
            self.rte.mempool_free(&pool);
        }
        for (_, pool) in self.gpu_rx.drain(..) {
            self.rte.mempool_free(&pool);
        }
        // regions go last
        self.gpu_regions.clear();
    }
}
