//! Frame builders for injecting traffic into simulated queues.

use std::net::Ipv4Addr;

use dpdk_transport::api::rte::eth::MacAddress;
use dpdk_transport::port::arp::{ARP_FRAME_LEN, emit_arp_frame};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, EthernetAddress, EthernetFrame, EthernetProtocol, IpAddress, IpProtocol,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

pub const BROADCAST: MacAddress = [0xff; 6];

/// Broadcast who-has `target_ip`.
pub fn arp_request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut buf = vec![0u8; ARP_FRAME_LEN];
    emit_arp_frame(
        &mut buf,
        ArpOperation::Request,
        (sender_mac, sender_ip),
        (BROADCAST, target_ip),
    );
    buf
}

/// `sender_ip` is-at `sender_mac`, addressed to `target`.
pub fn arp_reply(
    sender_mac: MacAddress,
    sender_ip: Ipv4Addr,
    target: (MacAddress, Ipv4Addr),
) -> Vec<u8> {
    let mut buf = vec![0u8; ARP_FRAME_LEN];
    emit_arp_frame(&mut buf, ArpOperation::Reply, (sender_mac, sender_ip), target);
    buf
}

/// Ethernet/IPv4/UDP frame carrying `payload`.
pub fn udp_frame(
    src: (MacAddress, Ipv4Addr, u16),
    dst: (MacAddress, Ipv4Addr, u16),
    payload: &[u8],
) -> Vec<u8> {
    let udp = UdpRepr {
        src_port: src.2,
        dst_port: dst.2,
    };
    let ip = Ipv4Repr {
        src_addr: src.1,
        dst_addr: dst.1,
        next_header: IpProtocol::Udp,
        payload_len: udp.header_len() + payload.len(),
        hop_limit: 64,
    };
    let mut buf = vec![0u8; EthernetFrame::<&[u8]>::header_len() + ip.buffer_len() + ip.payload_len];

    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.set_src_addr(EthernetAddress(src.0));
    eth.set_dst_addr(EthernetAddress(dst.0));
    eth.set_ethertype(EthernetProtocol::Ipv4);

    let caps = ChecksumCapabilities::default();
    let mut ip_packet = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip.emit(&mut ip_packet, &caps);
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp.emit(
        &mut udp_packet,
        &IpAddress::Ipv4(src.1),
        &IpAddress::Ipv4(dst.1),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );
    buf
}
