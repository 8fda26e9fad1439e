//! Process-wide transport context.
//!
//! The context initializes the framework once, brings up every configured
//! NIC, waits for links and binds the ports to per-lcore I/O services.
//! Callers share it through [`TransportContext::get`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::api::rte::eal::{Eal, EalBuilder};
use crate::api::rte::eth::{LinkStatus, MacAddress, PortId, format_mac_addr};
use crate::api::{GpuBackend, RteBackend};
use crate::config::{MemoryPlan, NicConfig, TransportConfig};
use crate::error::{Result, TransportError};
use crate::io_service::IoService;
use crate::pool::{BufferPoolRegistry, PoolSizing};
use crate::port::{Port, PortConfig, PortPools};

/// Link polling interval during bring-up
pub const LINK_STATUS_INTERVAL: Duration = Duration::from_millis(250);

/// Service queue depth of every I/O service
pub const SERVICE_QUEUE_DEPTH: usize = 32;

static CONTEXT: Mutex<Weak<TransportContext>> = Mutex::new(Weak::new());

/// Everything built by a successful bring-up.
///
/// Field order is drop order: services, ports, pools, then the framework.
struct ContextState {
    io_services: Vec<IoService>,
    ports: BTreeMap<PortId, Arc<Port>>,
    _pools: BufferPoolRegistry,
    _eal: Eal,
    mtu: u16,
    memory: MemoryPlan,
}

/// Shared handle to the NIC transport of this process.
pub struct TransportContext {
    rte: Arc<dyn RteBackend>,
    gpu: Arc<dyn GpuBackend>,
    init_lock: Mutex<()>,
    state: OnceLock<ContextState>,
}

impl TransportContext {
    /// Get the process-wide context, creating it over `rte` and `gpu` if no
    /// live instance exists.
    ///
    /// While an instance is alive the backends passed here are ignored.
    pub fn get(rte: Arc<dyn RteBackend>, gpu: Arc<dyn GpuBackend>) -> Arc<Self> {
        let mut slot = CONTEXT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ctx) = slot.upgrade() {
            return ctx;
        }
        let ctx = Arc::new(Self {
            rte,
            gpu,
            init_lock: Mutex::new(()),
            state: OnceLock::new(),
        });
        *slot = Arc::downgrade(&ctx);
        ctx
    }

    /// Bring up the transport. Later calls return immediately.
    ///
    /// On failure nothing is kept: started ports are stopped, pools freed
    /// and the framework cleaned up, and a later call may retry.
    pub fn init(&self, cfg: &TransportConfig) -> Result<()> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.get().is_some() {
            return Ok(());
        }
        let state = self.bring_up(cfg)?;
        let _ = self.state.set(state);
        tracing::info!(ports = self.port_count(), "Transport initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    fn bring_up(&self, cfg: &TransportConfig) -> Result<ContextState> {
        let eal = EalBuilder::from_device_args(&cfg.eal_args)
            .init(self.rte.clone())
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to initialize EAL");
                TransportError::Init(e)
            })?;

        tracing::trace!(
            mtu = cfg.mtu,
            num_mbufs = cfg.num_mbufs,
            mbuf_cache_size = cfg.mbuf_cache_size,
            memory = ?cfg.memory,
            "Transport configuration"
        );

        if let MemoryPlan::Gpu { gpu_id } = cfg.memory {
            self.check_gpu(gpu_id)?;
        }

        if self.rte.eth_dev_count_avail() == 0 {
            tracing::error!("No available devices (ports) found");
            return Err(TransportError::NoDevice);
        }

        let managed = self.match_nics(cfg)?;
        let queue_count: u32 = managed.iter().map(|(_, nic)| u32::from(nic.num_queues)).sum();

        let sizing = PoolSizing {
            mtu: cfg.mtu,
            num_mbufs: cfg.num_mbufs,
            cache_size: cfg.mbuf_cache_size,
        };
        let mut pools = BufferPoolRegistry::new(self.rte.clone(), sizing);
        let mut ports: BTreeMap<PortId, Arc<Port>> = BTreeMap::new();
        let mut lcore_ports: BTreeMap<u32, Vec<Arc<Port>>> = BTreeMap::new();

        for (port_id, nic) in &managed {
            let port_id = *port_id;
            let lcore_id = nic.lcore.ok_or_else(|| {
                tracing::error!(port_id, "Managed NIC has no dpdk_lcore");
                TransportError::config(format!(
                    "NIC {} has dpdk_ipv4 but no dpdk_lcore",
                    format_mac_addr(&nic.mac)
                ))
            })?;

            let socket_id = self.rte.eth_dev_socket_id(port_id);
            let num_bufs = cfg.num_mbufs.saturating_mul(queue_count);
            let port_pools = PortPools {
                cpu_rx: pools.cpu_rx_pool(socket_id, num_bufs)?,
                cpu_tx: pools.cpu_tx_pool(socket_id, num_bufs)?,
                gpu_rx: match cfg.memory {
                    MemoryPlan::HostOnly => None,
                    MemoryPlan::Gpu { gpu_id } => {
                        Some(pools.gpu_rx_pool(self.gpu.clone(), gpu_id, port_id)?)
                    }
                },
                gpu_tx: None,
            };

            tracing::info!(
                port_id,
                lcore_id,
                mac = %format_mac_addr(&nic.mac),
                memory = ?cfg.memory,
                "Initializing NIC"
            );
            let port_cfg = PortConfig {
                port_id,
                mtu: cfg.mtu,
                num_rx_queues: nic.num_queues,
                num_tx_queues: nic.num_queues,
                num_desc: nic.num_desc,
                ipv4: nic.ipv4.clone().unwrap_or_default(),
            };
            let port = Arc::new(Port::new(self.rte.clone(), &port_cfg, port_pools)?);
            ports.insert(port_id, port.clone());
            lcore_ports.entry(lcore_id).or_default().push(port);
        }

        self.wait_for_links(&ports, cfg.link_timeout)?;

        let io_services = lcore_ports
            .into_iter()
            .map(|(lcore_id, ports)| IoService::new(lcore_id, ports, SERVICE_QUEUE_DEPTH))
            .collect();

        Ok(ContextState {
            io_services,
            ports,
            _pools: pools,
            _eal: eal,
            mtu: cfg.mtu,
            memory: cfg.memory,
        })
    }

    fn check_gpu(&self, gpu_id: u16) -> Result<()> {
        let count = self.gpu.gpu_count_avail();
        tracing::info!(count, "GPUs found");
        for dev_id in 0..count {
            match self.gpu.gpu_info(dev_id) {
                Ok(info) => tracing::info!(
                    dev_id = info.dev_id,
                    parent = ?info.parent,
                    name = %info.name,
                    numa_node = info.numa_node,
                    memory_mb = info.total_memory / (1024 * 1024),
                    processors = info.processor_count,
                    "GPU"
                ),
                Err(e) => {
                    tracing::error!(dev_id, error = %e, "Can't get GPU info");
                    return Err(TransportError::Init(e));
                }
            }
        }
        if gpu_id >= count {
            tracing::error!(gpu_id, count, "Invalid gpu_id");
            return Err(TransportError::config(format!(
                "gpu_id {gpu_id} out of range, {count} GPUs available"
            )));
        }
        Ok(())
    }

    /// Discovered ports whose MAC matches a NIC entry with an address.
    fn match_nics<'a>(&self, cfg: &'a TransportConfig) -> Result<Vec<(PortId, &'a NicConfig)>> {
        let mut managed = Vec::new();
        for port_id in self.rte.eth_dev_ids() {
            let mac = self
                .rte
                .eth_macaddr_get(port_id)
                .map_err(TransportError::device(port_id, "rte_eth_macaddr_get"))?;
            match cfg.nic(&mac).filter(|nic| nic.is_managed()) {
                Some(nic) => managed.push((port_id, nic)),
                None => tracing::debug!(
                    port_id,
                    mac = %format_mac_addr(&mac),
                    "NIC not configured, leaving unmanaged"
                ),
            }
        }
        Ok(managed)
    }

    fn wait_for_links(&self, ports: &BTreeMap<PortId, Arc<Port>>, timeout: Duration) -> Result<()> {
        tracing::trace!("Waiting for links to come up...");
        let deadline = Instant::now() + timeout;
        loop {
            let mut down = Vec::new();
            for (port_id, _) in ports {
                let link = self
                    .rte
                    .eth_link_get(*port_id)
                    .map_err(TransportError::device(*port_id, "rte_eth_link_get"))?;
                tracing::trace!(port_id, up = link.up, speed_mbps = link.speed_mbps, "Link status");
                if !link.up {
                    down.push(*port_id);
                }
            }
            if down.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(?down, "Links did not report as up");
                return Err(TransportError::LinkTimeout { down });
            }
            std::thread::sleep(LINK_STATUS_INTERVAL.min(deadline - now));
        }
    }

    fn state(&self) -> Option<&ContextState> {
        self.state.get()
    }

    /// Configured MTU, once initialized
    pub fn mtu(&self) -> Option<u16> {
        self.state().map(|s| s.mtu)
    }

    pub fn memory_plan(&self) -> Option<MemoryPlan> {
        self.state().map(|s| s.memory)
    }

    pub fn get_port(&self, port_id: PortId) -> Option<&Port> {
        self.state()?.ports.get(&port_id).map(Arc::as_ref)
    }

    pub fn get_port_by_mac(&self, mac: &MacAddress) -> Option<&Port> {
        self.ports().find(|port| port.mac_addr() == *mac)
    }

    /// Managed ports in port-id order
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.state()
            .into_iter()
            .flat_map(|s| s.ports.values().map(Arc::as_ref))
    }

    pub fn port_count(&self) -> usize {
        self.state().map_or(0, |s| s.ports.len())
    }

    fn port(&self, port_id: PortId) -> Result<&Port> {
        self.get_port(port_id)
            .ok_or_else(|| TransportError::Lookup(format!("no such port ID: {port_id}")))
    }

    pub fn link_status(&self, port_id: PortId) -> Result<LinkStatus> {
        self.port(port_id)?.link_status()
    }

    pub fn rx_queue_count(&self, port_id: PortId) -> Result<u16> {
        Ok(self.port(port_id)?.rx_queue_count())
    }

    pub fn tx_queue_count(&self, port_id: PortId) -> Result<u16> {
        Ok(self.port(port_id)?.tx_queue_count())
    }

    /// First port with its link up whose subnet contains `addr`.
    pub fn get_route(&self, addr: &str) -> Option<&Port> {
        let ip: Ipv4Addr = match addr.trim().parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!(addr, error = %e, "Not an IPv4 address");
                return None;
            }
        };
        self.ports().find(|port| {
            port.dst_is_local(ip) && port.link_status().is_ok_and(|link| link.up)
        })
    }

    /// Steer every port's ingress to its host queues.
    ///
    /// Best effort: every port is attempted and the first failure is
    /// returned. Ports already switched are not rolled back.
    pub fn route_to_host(&self) -> Result<()> {
        self.for_each_port(Port::route_to_host)
    }

    /// Steer every port's sample-stream ingress to its GPU queue, see
    /// [`Self::route_to_host`].
    pub fn route_to_device(&self) -> Result<()> {
        self.for_each_port(Port::route_to_device)
    }

    fn for_each_port(&self, op: impl Fn(&Port) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for port in self.ports() {
            if let Err(e) = op(port) {
                tracing::warn!(port_id = port.port_id(), error = %e, "Steering change failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// I/O service that polls `port_id`.
    pub fn get_io_service(&self, port_id: PortId) -> Result<&IoService> {
        self.io_services()
            .iter()
            .find(|srv| srv.serves(port_id))
            .ok_or_else(|| {
                let msg = format!("cannot look up I/O service for port ID {port_id}: no such port ID");
                tracing::error!("{msg}");
                TransportError::Lookup(msg)
            })
    }

    pub fn io_services(&self) -> &[IoService] {
        self.state()
            .map(|s| s.io_services.as_slice())
            .unwrap_or_default()
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        if self.state.get().is_some() {
            tracing::debug!("Tearing down transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimGpu, SimNic};

    const MAC0: MacAddress = [0x02, 0, 0, 0, 0, 1];
    const MAC1: MacAddress = [0x02, 0, 0, 0, 0, 2];

    fn sim_context(nics: Vec<SimNic>, gpus: u16) -> (Arc<SimBackend>, Arc<SimGpu>, Arc<TransportContext>) {
        let sim = Arc::new(SimBackend::new(nics));
        let gpu = Arc::new(SimGpu::new(gpus));
        let ctx = TransportContext::get(sim.clone(), gpu.clone());
        (sim, gpu, ctx)
    }

    #[test]
    #[serial_test::serial]
    fn test_singleton_shared_while_alive() {
        let (_sim, _gpu, ctx) = sim_context(vec![SimNic::new(MAC0)], 0);
        let other = TransportContext::get(
            Arc::new(SimBackend::new(vec![])),
            Arc::new(SimGpu::new(0)),
        );
        assert!(Arc::ptr_eq(&ctx, &other));
        drop(other);
        drop(ctx);

        let (_sim, _gpu, fresh) = sim_context(vec![], 0);
        assert!(!fresh.is_initialized());
    }

    #[test]
    #[serial_test::serial]
    fn test_bring_up_and_teardown_order() {
        let (sim, gpu, ctx) = sim_context(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 1);
        let cfg: TransportConfig = "gpu_id=0,dpdk_no_huge,\
             dpdk_mac[0]=02:00:00:00:00:01,dpdk_ipv4[0]=192.168.10.2/24,dpdk_lcore[0]=1,\
             dpdk_mac[1]=02:00:00:00:00:02,dpdk_ipv4[1]=192.168.20.2/24,dpdk_lcore[1]=2"
            .parse()
            .unwrap();
        ctx.init(&cfg).unwrap();

        assert_eq!(ctx.port_count(), 2);
        assert_eq!(ctx.io_services().len(), 2);
        assert_eq!(ctx.memory_plan(), Some(MemoryPlan::Gpu { gpu_id: 0 }));
        assert_eq!(ctx.rx_queue_count(0).unwrap(), 2);
        assert_eq!(ctx.tx_queue_count(1).unwrap(), 1);
        assert_eq!(
            sim.pool_names(),
            vec![
                "cpu_rx_mbuf_pool_0",
                "cpu_tx_mbuf_pool_0",
                "payload_mpool0",
                "payload_mpool1"
            ]
        );
        assert_eq!(gpu.allocations().len(), 2);

        drop(ctx);
        assert!(!sim.is_started(0));
        assert!(!sim.is_started(1));
        assert!(sim.pool_names().is_empty());
        assert_eq!(sim.extmem_registered(), 0);
        assert!(gpu.allocations().is_empty());
        assert_eq!(sim.eal_cleanup_count(), 1);
    }

    #[test]
    #[serial_test::serial]
    fn test_failed_bring_up_releases_everything() {
        let (sim, gpu, ctx) = sim_context(
            vec![SimNic::new(MAC0), SimNic::new(MAC1).max_queues(1, 1)],
            1,
        );
        let cfg: TransportConfig = "gpu_id=0,\
             dpdk_mac[0]=02:00:00:00:00:01,dpdk_ipv4[0]=192.168.10.2/24,dpdk_lcore[0]=1,\
             dpdk_mac[1]=02:00:00:00:00:02,dpdk_ipv4[1]=192.168.20.2/24,dpdk_lcore[1]=1"
            .parse()
            .unwrap();
        let err = ctx.init(&cfg).unwrap_err();
        assert!(matches!(err, TransportError::Capability { port_id: 1, .. }));
        assert!(!ctx.is_initialized());
        assert!(ctx.get_port(0).is_none());
        assert!(!sim.is_started(0));
        assert!(sim.pool_names().is_empty());
        assert!(gpu.allocations().is_empty());
        assert_eq!(sim.eal_cleanup_count(), 1);
        assert!(!Eal::is_initialized());
    }
}
