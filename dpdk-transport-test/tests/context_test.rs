//! Transport context bring-up, lookup and teardown against simulated NICs.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dpdk_transport::api::rte::eal::Eal;
use dpdk_transport::port::FlowTarget;
use dpdk_transport::sim::SimNic;
use dpdk_transport::{MemoryPlan, TransportError};
use dpdk_transport_test::bed::{MAC0, MAC1, MAC2, TestBed};
use dpdk_transport_test::util::nic_args;

const NIC0: &str = "02:00:00:00:00:01";
const NIC1: &str = "02:00:00:00:00:02";

fn two_nics(extra: &str) -> String {
    format!(
        "{extra}{},{}",
        nic_args(0, NIC0, "192.168.10.2/24", 1),
        nic_args(1, NIC1, "192.168.20.2/24", 2)
    )
}

#[test]
#[serial_test::serial]
fn test_host_only_bring_up() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 0);
    bed.init(&two_nics("dpdk_mtu=1500,")).unwrap();

    let ctx = &bed.ctx;
    assert!(ctx.is_initialized());
    assert_eq!(ctx.mtu(), Some(1500));
    assert_eq!(ctx.memory_plan(), Some(MemoryPlan::HostOnly));
    assert_eq!(ctx.port_count(), 2);

    let port = ctx.get_port(1).unwrap();
    assert_eq!(port.mac_addr(), MAC1);
    assert_eq!(port.ipv4().to_string(), "192.168.20.2");
    assert_eq!(port.netmask().to_string(), "255.255.255.0");
    assert!(ctx.get_port(2).is_none());
    assert_eq!(ctx.get_port_by_mac(&MAC0).map(|p| p.port_id()), Some(0));

    assert_eq!(ctx.rx_queue_count(0).unwrap(), 1);
    assert_eq!(ctx.tx_queue_count(0).unwrap(), 1);
    assert!(ctx.link_status(0).unwrap().up);
    assert!(bed.sim.flows(0).is_empty());
    assert_eq!(
        bed.sim.pool_names(),
        vec!["cpu_rx_mbuf_pool_0", "cpu_tx_mbuf_pool_0"]
    );
}

#[test]
#[serial_test::serial]
fn test_init_is_idempotent() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    let args = nic_args(0, NIC0, "10.0.0.2/8", 1);
    bed.init(&args).unwrap();
    bed.init(&nic_args(0, NIC0, "172.16.0.2/16", 5)).unwrap();
    bed.init(&args).unwrap();

    assert_eq!(bed.sim.eal_init_count(), 1);
    assert_eq!(bed.sim.stop_count(0), 0);
    assert_eq!(bed.ctx.port_count(), 1);
    assert_eq!(bed.ctx.get_port(0).unwrap().ipv4().to_string(), "10.0.0.2");
    assert_eq!(bed.ctx.io_services()[0].lcore_id(), 1);
}

#[test]
#[serial_test::serial]
fn test_gpu_bring_up_installs_host_flow() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 2);
    bed.init(&two_nics("gpu_id=1,")).unwrap();

    let ctx = &bed.ctx;
    assert_eq!(ctx.memory_plan(), Some(MemoryPlan::Gpu { gpu_id: 1 }));
    assert_eq!(ctx.rx_queue_count(0).unwrap(), 2);
    assert_eq!(ctx.tx_queue_count(0).unwrap(), 1);
    for port in ctx.ports() {
        let flows = bed.sim.flows(port.port_id());
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].1.target_queue(), Some(0));
        assert_eq!(port.steering().target(), Some(FlowTarget::Host));
    }
    assert!(bed.gpu.allocations().iter().all(|(gpu_id, _)| *gpu_id == 1));
    assert_eq!(bed.sim.dma_mapped(0), 1);
}

#[test]
#[serial_test::serial]
fn test_unmanaged_nics_are_skipped() {
    let bed = TestBed::new(
        vec![SimNic::new(MAC0), SimNic::new(MAC1), SimNic::new(MAC2)],
        0,
    );
    // NIC1 is described but has no address.
    let args = format!(
        "{},dpdk_mac[1]={NIC1},dpdk_lcore[1]=3",
        nic_args(0, NIC0, "192.168.10.2/24", 1)
    );
    bed.init(&args).unwrap();

    assert_eq!(bed.ctx.port_count(), 1);
    assert!(bed.sim.is_started(0));
    assert!(!bed.sim.is_started(1));
    assert!(!bed.sim.is_started(2));
    assert!(matches!(
        bed.ctx.rx_queue_count(1),
        Err(TransportError::Lookup(_))
    ));
}

#[test]
#[serial_test::serial]
fn test_missing_lcore_is_config_error() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    let err = bed
        .init(&format!("dpdk_mac[0]={NIC0},dpdk_ipv4[0]=192.168.10.2/24"))
        .unwrap_err();
    assert!(matches!(err, TransportError::Config(_)));
    assert!(!bed.ctx.is_initialized());
    assert_eq!(bed.sim.eal_cleanup_count(), 1);
}

#[test]
#[serial_test::serial]
fn test_no_device() {
    let bed = TestBed::new(vec![], 0);
    let err = bed.init(&nic_args(0, NIC0, "192.168.10.2/24", 1)).unwrap_err();
    assert!(matches!(err, TransportError::NoDevice));
    assert!(!Eal::is_initialized());
}

#[test]
#[serial_test::serial]
fn test_eal_failure_allows_retry() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    bed.sim.fail_eal_init();
    let args = nic_args(0, NIC0, "192.168.10.2/24", 1);

    let err = bed.init(&args).unwrap_err();
    assert!(matches!(err, TransportError::Init(_)));
    assert!(!bed.ctx.is_initialized());

    bed.init(&args).unwrap();
    assert!(bed.ctx.is_initialized());
    assert_eq!(bed.sim.eal_init_count(), 1);
}

#[test]
#[serial_test::serial]
fn test_bad_gpu_id() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 1);
    let err = bed
        .init(&format!("gpu_id=3,{}", nic_args(0, NIC0, "192.168.10.2/24", 1)))
        .unwrap_err();
    assert!(matches!(err, TransportError::Config(_)));
    assert!(!bed.sim.is_started(0));
    assert_eq!(bed.sim.eal_cleanup_count(), 1);
}

#[test]
#[serial_test::serial]
fn test_capability_failure_leaves_no_port() {
    let bed = TestBed::new(
        vec![SimNic::new(MAC0), SimNic::new(MAC1).max_queues(1, 1)],
        1,
    );
    let err = bed.init(&two_nics("gpu_id=0,")).unwrap_err();
    assert!(matches!(err, TransportError::Capability { port_id: 1, .. }));

    assert!(bed.ctx.get_port(0).is_none());
    assert!(bed.ctx.io_services().is_empty());
    assert!(!bed.sim.is_started(0));
    assert!(bed.sim.flows(0).is_empty());
    assert!(bed.sim.pool_names().is_empty());
    assert_eq!(bed.sim.extmem_registered(), 0);
    assert!(bed.gpu.allocations().is_empty());
}

#[test]
#[serial_test::serial]
fn test_link_timeout() {
    let bed = TestBed::new(
        vec![SimNic::new(MAC0), SimNic::new(MAC1).link_up_after(None)],
        0,
    );
    let start = Instant::now();
    let err = bed.init(&two_nics("dpdk_link_timeout=300,")).unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(300));
    match err {
        TransportError::LinkTimeout { down } => assert_eq!(down, vec![1]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!bed.sim.is_started(0));
    assert!(!bed.sim.is_started(1));
}

#[test]
#[serial_test::serial]
fn test_slow_link_within_timeout() {
    let bed = TestBed::new(
        vec![SimNic::new(MAC0).link_up_after(Some(Duration::from_millis(300)))],
        0,
    );
    bed.init(&format!(
        "dpdk_link_timeout=5000,{}",
        nic_args(0, NIC0, "192.168.10.2/24", 1)
    ))
    .unwrap();
    assert!(bed.ctx.link_status(0).unwrap().up);
}

#[test]
#[serial_test::serial]
fn test_eal_args_come_from_globals() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    bed.init(&format!(
        "dpdk_no_huge,dpdk_vdev=net_null0|net_null1,dpdk_file_prefix=radio,{}",
        nic_args(0, NIC0, "192.168.10.2/24", 1)
    ))
    .unwrap();
    let args = bed.sim.eal_args().unwrap();
    assert_eq!(
        &args[1..],
        &[
            "--no-huge",
            "--vdev=net_null0",
            "--vdev=net_null1",
            "--file-prefix=radio"
        ]
    );
}

#[test]
#[serial_test::serial]
fn test_get_route() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 0);
    bed.init(&two_nics("")).unwrap();
    let ctx = &bed.ctx;

    assert_eq!(ctx.get_route("192.168.20.77").map(|p| p.port_id()), Some(1));
    assert_eq!(ctx.get_route(" 192.168.10.9 ").map(|p| p.port_id()), Some(0));
    assert!(ctx.get_route("10.1.1.1").is_none());
    assert!(ctx.get_route("not-an-ip").is_none());

    bed.sim.set_link_up_after(1, None);
    assert!(ctx.get_route("192.168.20.77").is_none());
}

#[test]
#[serial_test::serial]
fn test_io_services_group_ports_by_lcore() {
    let bed = TestBed::new(
        vec![SimNic::new(MAC0), SimNic::new(MAC1), SimNic::new(MAC2)],
        0,
    );
    bed.init(&format!(
        "{},{},{}",
        nic_args(0, NIC0, "192.168.10.2/24", 4),
        nic_args(1, NIC1, "192.168.20.2/24", 2),
        nic_args(2, "02:00:00:00:00:03", "192.168.30.2/24", 4)
    ))
    .unwrap();
    let ctx = &bed.ctx;

    let lcores: Vec<u32> = ctx.io_services().iter().map(|s| s.lcore_id()).collect();
    assert_eq!(lcores, vec![2, 4]);

    let srv = ctx.get_io_service(2).unwrap();
    assert_eq!(srv.lcore_id(), 4);
    assert_eq!(srv.port_ids(), vec![0, 2]);
    assert!(std::ptr::eq(srv, ctx.get_io_service(0).unwrap()));
    assert!(matches!(
        ctx.get_io_service(9),
        Err(TransportError::Lookup(_))
    ));
}

#[test]
#[serial_test::serial]
fn test_route_switching_is_best_effort() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 1);
    bed.init(&two_nics("gpu_id=0,")).unwrap();
    let ctx = &bed.ctx;

    ctx.route_to_device().unwrap();
    for port_id in 0..2 {
        let flows = bed.sim.flows(port_id);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].1.target_queue(), Some(1));
    }

    ctx.route_to_host().unwrap();
    bed.sim.set_fail_flow_create(0, true);
    let err = ctx.route_to_device().unwrap_err();
    assert!(matches!(err, TransportError::FlowRule(_)));
    assert!(bed.sim.flows(0).is_empty());
    assert_eq!(ctx.get_port(0).unwrap().steering().target(), None);
    assert_eq!(
        ctx.get_port(1).unwrap().steering().target(),
        Some(FlowTarget::Device)
    );

    bed.sim.set_fail_flow_create(0, false);
    ctx.route_to_device().unwrap();
    assert_eq!(bed.sim.flows(0).len(), 1);
    assert_eq!(bed.sim.flows(1).len(), 1);
}

#[test]
#[serial_test::serial]
fn test_teardown_releases_resources_in_order() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 1);
    bed.init(&two_nics("gpu_id=0,")).unwrap();
    assert_eq!(bed.sim.pool_names().len(), 4);
    assert_eq!(bed.sim.extmem_registered(), 2);

    let TestBed { sim, gpu, ctx } = bed;
    drop(ctx);

    assert!(!sim.is_started(0));
    assert!(!sim.is_started(1));
    assert!(sim.flows(0).is_empty());
    assert!(sim.pool_names().is_empty());
    assert_eq!(sim.extmem_registered(), 0);
    assert_eq!(sim.dma_mapped(0), 0);
    assert!(gpu.allocations().is_empty());
    assert_eq!(sim.eal_cleanup_count(), 1);
    assert!(!Eal::is_initialized());
}

#[test]
#[serial_test::serial]
fn test_teardown_after_walking_service_ports() {
    let bed = TestBed::new(vec![SimNic::new(MAC0), SimNic::new(MAC1)], 0);
    bed.init(&two_nics("")).unwrap();

    let served: Vec<_> = bed
        .ctx
        .io_services()
        .iter()
        .flat_map(|srv| srv.ports().map(|port| port.port_id()))
        .collect();
    assert_eq!(served, vec![0, 1]);

    let TestBed { sim, gpu: _gpu, ctx } = bed;
    drop(ctx);

    assert!(!sim.is_started(0));
    assert!(!sim.is_started(1));
    assert!(sim.pool_names().is_empty());
    assert_eq!(sim.eal_cleanup_count(), 1);
}

#[test]
#[serial_test::serial]
fn test_blocked_resolver_keeps_context_alive() {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    bed.init(&nic_args(0, NIC0, "192.168.10.2/24", 1)).unwrap();
    let TestBed { sim, gpu: _gpu, ctx } = bed;

    let waiter = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            ctx.get_port(0)
                .unwrap()
                .resolve(Ipv4Addr::new(192, 168, 10, 40), Duration::from_millis(300))
        })
    };
    while sim.take_tx_frames(0).is_empty() {
        std::thread::sleep(Duration::from_millis(5));
    }

    drop(ctx);
    assert!(sim.is_started(0));
    assert_eq!(sim.eal_cleanup_count(), 0);

    let res = waiter.join().unwrap();
    assert!(!res.resolved);
    assert_eq!(res.mac, None);
    assert!(!sim.is_started(0));
    assert!(sim.pool_names().is_empty());
    assert_eq!(sim.eal_cleanup_count(), 1);
}
