//! In-process software implementation of [`RteBackend`] and [`GpuBackend`].
//!
//! Simulated NICs have configurable capability limits and failure modes, and
//! record what the transport did to them (EAL arguments, queue setup,
//! installed flows, transmitted frames) so tests can assert on it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::api::rte::eth::{
    DescLimits, DevInfo, EthConf, LinkStatus, MacAddress, PortId, QueueId, RxBuffers,
    RxQueueConf, TxQueueConf, rx_offload, tx_offload,
};
use crate::api::rte::flow::{FlowError, FlowHandle, FlowRule};
use crate::api::rte::gpu::{GpuId, GpuInfo};
use crate::api::rte::pktmbuf::{ExtMem, MbufPool, MemPool, MemPoolConfig, PoolMemory};
use crate::api::rte::queue::Burst;
use crate::api::{Errno, GpuBackend, Result, RteBackend};

/// rte_flow_error_type values reported by the simulator
const FLOW_ERROR_TYPE_UNSPECIFIED: i32 = 1;
const FLOW_ERROR_TYPE_HANDLE: i32 = 2;
const FLOW_ERROR_TYPE_ACTION_CONF: i32 = 16;

/// Description of one simulated NIC.
#[derive(Debug, Clone)]
pub struct SimNic {
    pub mac: MacAddress,
    pub socket_id: i32,
    pub info: DevInfo,
    /// Delay from device start to link up; `None` keeps the link down.
    pub link_up_after: Option<Duration>,
    pub link_speed_mbps: u32,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub flow_supported: bool,
    pub tx_ring_full: bool,
}

impl SimNic {
    /// A capable 100G NIC on socket 0 whose link comes up at start.
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            socket_id: 0,
            info: DevInfo {
                driver_name: "net_sim".to_string(),
                max_rx_queues: 16,
                max_tx_queues: 16,
                rx_offload_capa: rx_offload::IPV4_CKSUM
                    | rx_offload::UDP_CKSUM
                    | rx_offload::TCP_CKSUM
                    | rx_offload::SCATTER
                    | rx_offload::BUFFER_SPLIT
                    | rx_offload::RSS_HASH,
                tx_offload_capa: tx_offload::IPV4_CKSUM
                    | tx_offload::UDP_CKSUM
                    | tx_offload::TCP_CKSUM
                    | tx_offload::MULTI_SEGS,
                rx_desc_lim: DescLimits {
                    nb_min: 64,
                    nb_max: 8192,
                    nb_align: 8,
                },
                tx_desc_lim: DescLimits {
                    nb_min: 64,
                    nb_max: 8192,
                    nb_align: 8,
                },
                min_mtu: 68,
                max_mtu: 9600,
            },
            link_up_after: Some(Duration::ZERO),
            link_speed_mbps: 100_000,
            fail_start: false,
            fail_stop: false,
            flow_supported: true,
            tx_ring_full: false,
        }
    }

    pub fn socket_id(mut self, socket_id: i32) -> Self {
        self.socket_id = socket_id;
        self
    }

    pub fn max_queues(mut self, rx: u16, tx: u16) -> Self {
        self.info.max_rx_queues = rx;
        self.info.max_tx_queues = tx;
        self
    }

    pub fn rx_offload_capa(mut self, capa: u64) -> Self {
        self.info.rx_offload_capa = capa;
        self
    }

    pub fn tx_offload_capa(mut self, capa: u64) -> Self {
        self.info.tx_offload_capa = capa;
        self
    }

    pub fn desc_limits(mut self, limits: DescLimits) -> Self {
        self.info.rx_desc_lim = limits;
        self.info.tx_desc_lim = limits;
        self
    }

    pub fn max_mtu(mut self, mtu: u16) -> Self {
        self.info.max_mtu = mtu;
        self
    }

    pub fn link_up_after(mut self, delay: Option<Duration>) -> Self {
        self.link_up_after = delay;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Stop attempts are counted but fail, leaving the device started.
    pub fn fail_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn without_flow_support(mut self) -> Self {
        self.flow_supported = false;
        self
    }

    pub fn tx_ring_full(mut self) -> Self {
        self.tx_ring_full = true;
        self
    }
}

#[derive(Debug)]
struct SimPort {
    nic: SimNic,
    nb_queues: Option<(u16, u16)>,
    conf: Option<EthConf>,
    mtu: u16,
    rx_queues: BTreeMap<QueueId, RxQueueConf>,
    tx_queues: BTreeMap<QueueId, TxQueueConf>,
    started_at: Option<Instant>,
    stop_count: u32,
    rx_pending: HashMap<QueueId, VecDeque<Vec<u8>>>,
    tx_frames: Vec<(QueueId, Vec<u8>)>,
    flows: BTreeMap<u64, FlowRule>,
    fail_flow_create: bool,
    dma_maps: HashSet<u64>,
}

impl SimPort {
    fn new(nic: SimNic) -> Self {
        Self {
            nic,
            nb_queues: None,
            conf: None,
            mtu: 1500,
            rx_queues: BTreeMap::new(),
            tx_queues: BTreeMap::new(),
            started_at: None,
            stop_count: 0,
            rx_pending: HashMap::new(),
            tx_frames: Vec::new(),
            flows: BTreeMap::new(),
            fail_flow_create: false,
            dma_maps: HashSet::new(),
        }
    }

    fn link(&self) -> LinkStatus {
        let up = match (self.started_at, self.nic.link_up_after) {
            (Some(started), Some(delay)) => started.elapsed() >= delay,
            _ => false,
        };
        LinkStatus {
            up,
            speed_mbps: if up { self.nic.link_speed_mbps } else { 0 },
        }
    }

    fn check_rule(&self, rule: &FlowRule) -> std::result::Result<(), FlowError> {
        if !self.nic.flow_supported {
            return Err(FlowError::new(
                FLOW_ERROR_TYPE_UNSPECIFIED,
                "flow API not supported by device",
            ));
        }
        let nb_rx = self.nb_queues.map_or(0, |(rx, _)| rx);
        match rule.target_queue() {
            Some(q) if q < nb_rx => Ok(()),
            _ => Err(FlowError::new(
                FLOW_ERROR_TYPE_ACTION_CONF,
                "invalid queue index in action",
            )),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    eal_args: Option<Vec<String>>,
    eal_init_count: u32,
    eal_cleanup_count: u32,
    fail_eal_init: bool,
    ports: Vec<SimPort>,
    pools: HashMap<String, MemPool>,
    extmem: HashSet<u64>,
    next_flow: u64,
}

/// Simulated packet-I/O framework.
#[derive(Debug, Default)]
pub struct SimBackend {
    state: Mutex<SimState>,
}

impl SimBackend {
    /// Backend exposing `nics` as ports 0, 1, ...
    pub fn new(nics: Vec<SimNic>) -> Self {
        Self {
            state: Mutex::new(SimState {
                ports: nics.into_iter().map(SimPort::new).collect(),
                ..SimState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_port<T>(&self, port_id: PortId, f: impl FnOnce(&mut SimPort) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let port = state
            .ports
            .get_mut(port_id as usize)
            .ok_or(Errno::ENODEV)?;
        f(port)
    }

    fn inspect<T: Default>(&self, port_id: PortId, f: impl FnOnce(&SimPort) -> T) -> T {
        self.lock()
            .ports
            .get(port_id as usize)
            .map(f)
            .unwrap_or_default()
    }

    /// Make the next `eal_init` fail.
    pub fn fail_eal_init(&self) {
        self.lock().fail_eal_init = true;
    }

    /// Arguments of the last successful `eal_init`
    pub fn eal_args(&self) -> Option<Vec<String>> {
        self.lock().eal_args.clone()
    }

    pub fn eal_init_count(&self) -> u32 {
        self.lock().eal_init_count
    }

    pub fn eal_cleanup_count(&self) -> u32 {
        self.lock().eal_cleanup_count
    }

    pub fn is_started(&self, port_id: PortId) -> bool {
        self.inspect(port_id, |p| p.started_at.is_some())
    }

    pub fn stop_count(&self, port_id: PortId) -> u32 {
        self.inspect(port_id, |p| p.stop_count)
    }

    /// Queue counts passed to `eth_dev_configure`
    pub fn configured_queues(&self, port_id: PortId) -> Option<(u16, u16)> {
        self.inspect(port_id, |p| p.nb_queues)
    }

    pub fn eth_conf(&self, port_id: PortId) -> Option<EthConf> {
        self.inspect(port_id, |p| p.conf.clone())
    }

    pub fn rx_queue_conf(&self, port_id: PortId, queue_id: QueueId) -> Option<RxQueueConf> {
        self.inspect(port_id, |p| p.rx_queues.get(&queue_id).cloned())
    }

    pub fn tx_queue_conf(&self, port_id: PortId, queue_id: QueueId) -> Option<TxQueueConf> {
        self.inspect(port_id, |p| p.tx_queues.get(&queue_id).cloned())
    }

    /// Installed flow rules, oldest first
    pub fn flows(&self, port_id: PortId) -> Vec<(FlowHandle, FlowRule)> {
        self.inspect(port_id, |p| {
            p.flows
                .iter()
                .map(|(id, rule)| (FlowHandle(*id), rule.clone()))
                .collect()
        })
    }

    /// Make flow creation on `port_id` fail until cleared.
    pub fn set_fail_flow_create(&self, port_id: PortId, fail: bool) {
        let _ = self.with_port(port_id, |p| {
            p.fail_flow_create = fail;
            Ok(())
        });
    }

    pub fn set_tx_ring_full(&self, port_id: PortId, full: bool) {
        let _ = self.with_port(port_id, |p| {
            p.nic.tx_ring_full = full;
            Ok(())
        });
    }

    pub fn set_link_up_after(&self, port_id: PortId, delay: Option<Duration>) {
        let _ = self.with_port(port_id, |p| {
            p.nic.link_up_after = delay;
            Ok(())
        });
    }

    /// Queue a frame for reception on `queue_id`.
    pub fn inject_rx(&self, port_id: PortId, queue_id: QueueId, frame: &[u8]) {
        let _ = self.with_port(port_id, |p| {
            p.rx_pending
                .entry(queue_id)
                .or_default()
                .push_back(frame.to_vec());
            Ok(())
        });
    }

    /// Drain frames transmitted on `port_id` as `(queue, bytes)`.
    pub fn take_tx_frames(&self, port_id: PortId) -> Vec<(QueueId, Vec<u8>)> {
        self.with_port(port_id, |p| Ok(std::mem::take(&mut p.tx_frames)))
            .unwrap_or_default()
    }

    /// Names of all pools alive in the framework
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn extmem_registered(&self) -> usize {
        self.lock().extmem.len()
    }

    pub fn dma_mapped(&self, port_id: PortId) -> usize {
        self.inspect(port_id, |p| p.dma_maps.len())
    }
}

impl RteBackend for SimBackend {
    fn eal_init(&self, args: &[String]) -> Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_eal_init) {
            return Err(Errno::EINVAL);
        }
        state.eal_args = Some(args.to_vec());
        state.eal_init_count += 1;
        Ok(())
    }

    fn eal_cleanup(&self) -> Result<()> {
        self.lock().eal_cleanup_count += 1;
        Ok(())
    }

    fn socket_count(&self) -> u32 {
        let state = self.lock();
        state
            .ports
            .iter()
            .map(|p| p.nic.socket_id.max(0) as u32 + 1)
            .max()
            .unwrap_or(1)
    }

    fn eth_dev_count_avail(&self) -> u16 {
        self.lock().ports.len() as u16
    }

    fn eth_dev_ids(&self) -> Vec<PortId> {
        (0..self.eth_dev_count_avail()).collect()
    }

    fn eth_dev_info(&self, port_id: PortId) -> Result<DevInfo> {
        self.with_port(port_id, |p| Ok(p.nic.info.clone()))
    }

    fn eth_dev_socket_id(&self, port_id: PortId) -> i32 {
        self.inspect(port_id, |p| p.nic.socket_id)
    }

    fn eth_macaddr_get(&self, port_id: PortId) -> Result<MacAddress> {
        self.with_port(port_id, |p| Ok(p.nic.mac))
    }

    fn eth_dev_configure(
        &self,
        port_id: PortId,
        nb_rx_queues: u16,
        nb_tx_queues: u16,
        conf: &EthConf,
    ) -> Result<()> {
        self.with_port(port_id, |p| {
            let info = &p.nic.info;
            if nb_rx_queues > info.max_rx_queues || nb_tx_queues > info.max_tx_queues {
                return Err(Errno::EINVAL);
            }
            if conf.rx_mode.offloads & !info.rx_offload_capa != 0
                || conf.tx_mode.offloads & !info.tx_offload_capa != 0
            {
                return Err(Errno::EINVAL);
            }
            p.nb_queues = Some((nb_rx_queues, nb_tx_queues));
            p.conf = Some(conf.clone());
            p.rx_queues.clear();
            p.tx_queues.clear();
            Ok(())
        })
    }

    fn eth_dev_set_mtu(&self, port_id: PortId, mtu: u16) -> Result<()> {
        self.with_port(port_id, |p| {
            if mtu < p.nic.info.min_mtu || mtu > p.nic.info.max_mtu {
                return Err(Errno::EINVAL);
            }
            p.mtu = mtu;
            Ok(())
        })
    }

    fn eth_dev_get_mtu(&self, port_id: PortId) -> Result<u16> {
        self.with_port(port_id, |p| Ok(p.mtu))
    }

    fn eth_dev_adjust_nb_rx_tx_desc(
        &self,
        port_id: PortId,
        nb_rx_desc: &mut u16,
        nb_tx_desc: &mut u16,
    ) -> Result<()> {
        fn adjust(nb: u16, lim: &DescLimits) -> u16 {
            let align = lim.nb_align.max(1);
            let nb = nb.clamp(lim.nb_min, lim.nb_max);
            nb.div_ceil(align).saturating_mul(align).min(lim.nb_max)
        }
        self.with_port(port_id, |p| {
            *nb_rx_desc = adjust(*nb_rx_desc, &p.nic.info.rx_desc_lim);
            *nb_tx_desc = adjust(*nb_tx_desc, &p.nic.info.tx_desc_lim);
            Ok(())
        })
    }

    fn eth_rx_queue_setup(
        &self,
        port_id: PortId,
        queue_id: QueueId,
        conf: &RxQueueConf,
    ) -> Result<()> {
        self.with_port(port_id, |p| {
            let (nb_rx, _) = p.nb_queues.ok_or(Errno::EINVAL)?;
            if queue_id >= nb_rx {
                return Err(Errno::EINVAL);
            }
            if let RxBuffers::Split(segs) = &conf.buffers {
                let dev_offloads = p.conf.as_ref().map_or(0, |c| c.rx_mode.offloads);
                if segs.len() < 2 || dev_offloads & rx_offload::BUFFER_SPLIT == 0 {
                    return Err(Errno::ENOTSUP);
                }
            }
            p.rx_queues.insert(queue_id, conf.clone());
            Ok(())
        })
    }

    fn eth_tx_queue_setup(
        &self,
        port_id: PortId,
        queue_id: QueueId,
        conf: &TxQueueConf,
    ) -> Result<()> {
        self.with_port(port_id, |p| {
            let (_, nb_tx) = p.nb_queues.ok_or(Errno::EINVAL)?;
            if queue_id >= nb_tx {
                return Err(Errno::EINVAL);
            }
            p.tx_queues.insert(queue_id, conf.clone());
            Ok(())
        })
    }

    fn eth_dev_start(&self, port_id: PortId) -> Result<()> {
        self.with_port(port_id, |p| {
            if p.nic.fail_start || p.nb_queues.is_none() {
                return Err(Errno::EIO);
            }
            p.started_at = Some(Instant::now());
            Ok(())
        })
    }

    fn eth_dev_stop(&self, port_id: PortId) -> Result<()> {
        self.with_port(port_id, |p| {
            p.stop_count += 1;
            if p.nic.fail_stop {
                return Err(Errno::EIO);
            }
            p.started_at = None;
            p.flows.clear();
            Ok(())
        })
    }

    fn eth_link_get(&self, port_id: PortId) -> Result<LinkStatus> {
        self.with_port(port_id, |p| Ok(p.link()))
    }

    fn eth_link_get_nowait(&self, port_id: PortId) -> Result<LinkStatus> {
        self.with_port(port_id, |p| Ok(p.link()))
    }

    fn eth_rx_burst(&self, port_id: PortId, queue_id: QueueId, mbufs: &mut Burst, max: usize) {
        let mut state = self.lock();
        let Some(port) = state.ports.get_mut(port_id as usize) else {
            return;
        };
        if port.started_at.is_none() {
            return;
        }
        let pool = match port.rx_queues.get(&queue_id).map(|conf| &conf.buffers) {
            Some(RxBuffers::Pool(pool)) => pool.clone(),
            Some(RxBuffers::Split(segs)) => match segs.first() {
                Some(seg) => seg.pool.clone(),
                None => return,
            },
            None => return,
        };
        let Some(pending) = port.rx_pending.get_mut(&queue_id) else {
            return;
        };
        while mbufs.len() < max.min(mbufs.capacity()) {
            let Some(frame) = pending.front() else {
                break;
            };
            let Some(mut mbuf) = pool.try_alloc() else {
                break;
            };
            let len = frame.len().min(mbuf.capacity());
            mbuf.copy_from_slice(&frame[..len]);
            pending.pop_front();
            mbufs.push(mbuf);
        }
    }

    fn eth_tx_burst(&self, port_id: PortId, queue_id: QueueId, mbufs: &mut Burst) -> usize {
        let sent: Vec<_> = {
            let mut state = self.lock();
            let Some(port) = state.ports.get_mut(port_id as usize) else {
                return 0;
            };
            if port.started_at.is_none()
                || port.nic.tx_ring_full
                || !port.tx_queues.contains_key(&queue_id)
            {
                return 0;
            }
            for mbuf in mbufs.iter() {
                port.tx_frames.push((queue_id, mbuf.data().to_vec()));
            }
            mbufs.drain(..).collect()
        };
        // buffers go back to their pools outside the state lock
        sent.len()
    }

    fn pktmbuf_pool_create(&self, name: &str, config: &MemPoolConfig) -> Result<MemPool> {
        let mut state = self.lock();
        if state.pools.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        if config.num_mbufs == 0 {
            return Err(Errno::EINVAL);
        }
        let pool = MemPool::from_pool(Arc::new(SimPool::new(
            name,
            config,
            PoolMemory::Host {
                socket_id: config.socket_id,
            },
        )));
        state.pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    fn pktmbuf_pool_create_extbuf(
        &self,
        name: &str,
        config: &MemPoolConfig,
        ext_mem: &ExtMem,
    ) -> Result<MemPool> {
        let mut state = self.lock();
        if state.pools.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        if !state.extmem.contains(&ext_mem.buf_addr)
            || ext_mem.capacity() < config.num_mbufs as usize
        {
            return Err(Errno::EINVAL);
        }
        let config = config.clone().data_room_size(ext_mem.elt_size);
        let pool = MemPool::from_pool(Arc::new(SimPool::new(
            name,
            &config,
            PoolMemory::External {
                buf_addr: ext_mem.buf_addr,
            },
        )));
        state.pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    fn mempool_free(&self, pool: &MemPool) {
        self.lock().pools.remove(pool.name());
    }

    fn extmem_register(&self, ext_mem: &ExtMem, page_size: usize) -> Result<()> {
        if page_size == 0 || ext_mem.buf_len % page_size != 0 {
            return Err(Errno::EINVAL);
        }
        if self.lock().extmem.insert(ext_mem.buf_addr) {
            Ok(())
        } else {
            Err(Errno::EEXIST)
        }
    }

    fn extmem_unregister(&self, ext_mem: &ExtMem) -> Result<()> {
        if self.lock().extmem.remove(&ext_mem.buf_addr) {
            Ok(())
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn dev_dma_map(&self, port_id: PortId, ext_mem: &ExtMem) -> Result<()> {
        let mut state = self.lock();
        if !state.extmem.contains(&ext_mem.buf_addr) {
            return Err(Errno::EINVAL);
        }
        let port = state
            .ports
            .get_mut(port_id as usize)
            .ok_or(Errno::ENODEV)?;
        port.dma_maps.insert(ext_mem.buf_addr);
        Ok(())
    }

    fn dev_dma_unmap(&self, port_id: PortId, ext_mem: &ExtMem) -> Result<()> {
        self.with_port(port_id, |p| {
            if p.dma_maps.remove(&ext_mem.buf_addr) {
                Ok(())
            } else {
                Err(Errno::ENOENT)
            }
        })
    }

    fn flow_validate(&self, port_id: PortId, rule: &FlowRule) -> std::result::Result<(), FlowError> {
        let state = self.lock();
        let port = state.ports.get(port_id as usize).ok_or_else(|| {
            FlowError::new(FLOW_ERROR_TYPE_UNSPECIFIED, "no such port")
        })?;
        port.check_rule(rule)
    }

    fn flow_create(
        &self,
        port_id: PortId,
        rule: &FlowRule,
    ) -> std::result::Result<FlowHandle, FlowError> {
        let mut state = self.lock();
        let id = state.next_flow;
        let port = state.ports.get_mut(port_id as usize).ok_or_else(|| {
            FlowError::new(FLOW_ERROR_TYPE_UNSPECIFIED, "no such port")
        })?;
        port.check_rule(rule)?;
        if port.fail_flow_create {
            return Err(FlowError::new(
                FLOW_ERROR_TYPE_UNSPECIFIED,
                "hardware flow table full",
            ));
        }
        port.flows.insert(id, rule.clone());
        state.next_flow += 1;
        Ok(FlowHandle(id))
    }

    fn flow_destroy(
        &self,
        port_id: PortId,
        handle: FlowHandle,
    ) -> std::result::Result<(), FlowError> {
        let mut state = self.lock();
        let port = state.ports.get_mut(port_id as usize).ok_or_else(|| {
            FlowError::new(FLOW_ERROR_TYPE_UNSPECIFIED, "no such port")
        })?;
        port.flows
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| FlowError::new(FLOW_ERROR_TYPE_HANDLE, "unknown flow handle"))
    }
}

/// Buffer pool backed by heap buffers.
#[derive(Debug)]
struct SimPool {
    name: String,
    num_mbufs: u32,
    data_room_size: u16,
    memory: PoolMemory,
    inner: Mutex<SimPoolInner>,
}

#[derive(Debug, Default)]
struct SimPoolInner {
    free: Vec<Vec<u8>>,
    outstanding: u32,
}

impl SimPool {
    fn new(name: &str, config: &MemPoolConfig, memory: PoolMemory) -> Self {
        Self {
            name: name.to_string(),
            num_mbufs: config.num_mbufs,
            data_room_size: config.data_room_size,
            memory,
            inner: Mutex::new(SimPoolInner::default()),
        }
    }
}

impl MbufPool for SimPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn take(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.outstanding >= self.num_mbufs {
            return None;
        }
        inner.outstanding += 1;
        Some(
            inner
                .free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.data_room_size as usize]),
        )
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.free.push(buf);
    }

    fn avail_count(&self) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.num_mbufs - inner.outstanding
    }

    fn data_room_size(&self) -> u16 {
        self.data_room_size
    }

    fn memory(&self) -> PoolMemory {
        self.memory
    }
}

/// Simulated GPU-memory collaborator.
#[derive(Debug)]
pub struct SimGpu {
    devices: Vec<GpuInfo>,
    next_addr: AtomicU64,
    allocations: Mutex<HashMap<u64, (GpuId, usize)>>,
}

impl SimGpu {
    /// `count` identical GPUs with 16 GiB each
    pub fn new(count: u16) -> Self {
        Self {
            devices: (0..count)
                .map(|dev_id| GpuInfo {
                    dev_id,
                    name: format!("sim-gpu{dev_id}"),
                    parent: None,
                    numa_node: 0,
                    total_memory: 16 << 30,
                    processor_count: 108,
                })
                .collect(),
            next_addr: AtomicU64::new(0x7f00_0000_0000),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Live allocations as `(device, size)`
    pub fn allocations(&self) -> Vec<(GpuId, usize)> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }
}

impl GpuBackend for SimGpu {
    fn gpu_count_avail(&self) -> u16 {
        self.devices.len() as u16
    }

    fn gpu_info(&self, dev_id: GpuId) -> Result<GpuInfo> {
        self.devices
            .get(dev_id as usize)
            .cloned()
            .ok_or(Errno::ENODEV)
    }

    fn gpu_mem_alloc(&self, dev_id: GpuId, size: usize, align: usize) -> Result<u64> {
        if dev_id as usize >= self.devices.len() {
            return Err(Errno::ENODEV);
        }
        if size == 0 || !align.is_power_of_two() {
            return Err(Errno::EINVAL);
        }
        let align = align as u64;
        let span = (size as u64).div_ceil(align) * align;
        let raw = self.next_addr.fetch_add(span + align, Ordering::Relaxed);
        let addr = raw.div_ceil(align) * align;
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, (dev_id, size));
        Ok(addr)
    }

    fn gpu_mem_free(&self, _dev_id: GpuId, addr: u64) -> Result<()> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
            .map(|_| ())
            .ok_or(Errno::EINVAL)
    }
}
