//! Polling, ARP handling and address resolution through the I/O services.

use std::net::Ipv4Addr;
use std::time::Duration;

use dpdk_transport::RxPacket;
use dpdk_transport::port::arp::ArpMessage;
use dpdk_transport::sim::SimNic;
use dpdk_transport_test::bed::{MAC0, TestBed};
use dpdk_transport_test::frames::{BROADCAST, arp_reply, arp_request, udp_frame};
use dpdk_transport_test::util::nic_args;

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 2);
const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 40);
const PEER_MAC: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

fn single_nic_bed(num_queues: u16) -> TestBed {
    let bed = TestBed::new(vec![SimNic::new(MAC0)], 0);
    bed.init(&format!(
        "dpdk_num_queues={num_queues},{}",
        nic_args(0, "02:00:00:00:00:01", "192.168.10.2/24", 1)
    ))
    .unwrap();
    bed
}

#[test]
#[serial_test::serial]
fn test_poll_answers_arp_and_returns_data() {
    let bed = single_nic_bed(2);
    let srv = bed.ctx.get_io_service(0).unwrap();

    let data = udp_frame(
        (PEER_MAC, PEER_IP, 49153),
        (MAC0, LOCAL_IP, 5000),
        b"samples",
    );
    bed.sim.inject_rx(0, 1, &arp_request(PEER_MAC, PEER_IP, LOCAL_IP));
    bed.sim.inject_rx(0, 0, &data);
    // Not for us: consumed without a reply.
    bed.sim
        .inject_rx(0, 0, &arp_request(PEER_MAC, PEER_IP, Ipv4Addr::new(192, 168, 10, 99)));

    let mut out: Vec<RxPacket> = Vec::new();
    assert_eq!(srv.poll(&mut out), 1);
    assert_eq!(out[0].port_id, 0);
    assert_eq!(out[0].queue_id, 0);
    assert_eq!(out[0].mbuf.data(), &data[..]);

    let sent = bed.sim.take_tx_frames(0);
    assert_eq!(sent.len(), 1);
    let (queue_id, frame) = &sent[0];
    assert_eq!(*queue_id, 1);
    assert_eq!(&frame[0..6], &PEER_MAC);
    assert_eq!(
        ArpMessage::parse(frame),
        Some(ArpMessage::Reply {
            sender_mac: MAC0,
            sender_ip: LOCAL_IP,
        })
    );

    out.clear();
    assert_eq!(srv.poll(&mut out), 0);
}

#[test]
#[serial_test::serial]
fn test_resolve_completes_from_polled_reply() {
    let bed = single_nic_bed(1);
    let ctx = bed.ctx.clone();
    let waiter = std::thread::spawn(move || {
        ctx.get_port(0)
            .unwrap()
            .resolve(PEER_IP, Duration::from_secs(5))
    });

    let request = loop {
        let mut sent = bed.sim.take_tx_frames(0);
        if let Some((_, frame)) = sent.pop() {
            break frame;
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(&request[0..6], &BROADCAST);
    assert_eq!(
        ArpMessage::parse(&request),
        Some(ArpMessage::Request {
            sender_mac: MAC0,
            sender_ip: LOCAL_IP,
            target_ip: PEER_IP,
        })
    );

    bed.sim
        .inject_rx(0, 0, &arp_reply(PEER_MAC, PEER_IP, (MAC0, LOCAL_IP)));
    let mut out = Vec::new();
    let srv = bed.ctx.get_io_service(0).unwrap();
    assert_eq!(srv.poll(&mut out), 0);

    let res = waiter.join().unwrap();
    assert!(res.resolved);
    assert_eq!(res.mac, Some(PEER_MAC));
    assert_eq!(bed.ctx.get_port(0).unwrap().arp_lookup(&PEER_IP), Some(PEER_MAC));
}

#[test]
#[serial_test::serial]
fn test_resolve_off_subnet_and_timeout() {
    let bed = single_nic_bed(1);
    let port = bed.ctx.get_port(0).unwrap();

    let res = port.resolve(Ipv4Addr::new(10, 0, 0, 1), Duration::from_secs(5));
    assert!(!res.resolved);
    assert!(bed.sim.take_tx_frames(0).is_empty());

    let res = port.resolve(PEER_IP, Duration::from_millis(50));
    assert!(!res.resolved);
    assert_eq!(bed.sim.take_tx_frames(0).len(), 1);
    assert_eq!(port.resolver().waiter_count(&PEER_IP), 0);
}

#[test]
#[serial_test::serial]
fn test_transport_ports_in_network_order() {
    let bed = single_nic_bed(1);
    let port = bed.ctx.get_port(0).unwrap();

    let fixed = port.alloc_transport_port(5000u16.to_be());
    assert_eq!(u16::from_be(fixed), 5000);
    assert_eq!(port.alloc_transport_port(5000u16.to_be()), 0);

    let first = u16::from_be(port.alloc_transport_port(0));
    let second = u16::from_be(port.alloc_transport_port(0));
    assert_ne!(first, 0);
    assert_ne!(first, second);

    assert!(port.free_transport_port(fixed));
    assert_eq!(u16::from_be(port.alloc_transport_port(5000u16.to_be())), 5000);
}
