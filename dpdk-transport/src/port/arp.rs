//! Next-hop address resolution for one port.
//!
//! Each destination moves through `UNRESOLVED` (no entry), `PENDING` (entry
//! with waiters) and `RESOLVED` (entry with a link address). Waiters block
//! on the entry's condition with a timeout and always receive an explicit
//! [`Resolution`]; teardown releases every waiter unresolved.
//!
//! Resolved bindings are also published as an immutable snapshot so polling
//! cores can look them up without taking the table lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
};

use crate::api::rte::eth::MacAddress;

/// Ethernet header (14) + ARP for IPv4 over Ethernet (28)
pub const ARP_FRAME_LEN: usize = 42;

/// Outcome delivered to every resolution waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: bool,
    pub mac: Option<MacAddress>,
}

impl Resolution {
    pub fn resolved(mac: MacAddress) -> Self {
        Self {
            resolved: true,
            mac: Some(mac),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            resolved: false,
            mac: None,
        }
    }
}

/// Result of registering interest in a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Already known (or the resolver is closed); no need to wait.
    Done(Resolution),
    /// Registered as waiter `id`. `new_entry` is set when this call created
    /// the pending entry and a request should go out.
    Waiting { id: u64, new_entry: bool },
}

#[derive(Debug)]
struct ArpEntry {
    mac: Option<MacAddress>,
    waiters: Vec<u64>,
    cond: Arc<Condvar>,
}

#[derive(Debug, Default)]
struct ArpTable {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    closed: bool,
    next_waiter: u64,
}

/// Address-resolution table with blocking waiters.
#[derive(Debug)]
pub struct AddressResolver {
    table: Mutex<ArpTable>,
    resolved: ArcSwap<HashMap<Ipv4Addr, MacAddress>>,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ArpTable::default()),
            resolved: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArpTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock-free lookup of a resolved binding.
    #[inline]
    pub fn lookup(&self, ip: &Ipv4Addr) -> Option<MacAddress> {
        self.resolved.load().get(ip).copied()
    }

    /// Register interest in `ip`, creating a pending entry if needed.
    pub fn register(&self, ip: Ipv4Addr) -> Registration {
        let mut table = self.lock();
        if table.closed {
            return Registration::Done(Resolution::unresolved());
        }
        let id = table.next_waiter;
        let new_entry = match table.entries.get_mut(&ip) {
            Some(ArpEntry { mac: Some(mac), .. }) => {
                return Registration::Done(Resolution::resolved(*mac));
            }
            Some(entry) => {
                entry.waiters.push(id);
                false
            }
            None => {
                table.entries.insert(
                    ip,
                    ArpEntry {
                        mac: None,
                        waiters: vec![id],
                        cond: Arc::new(Condvar::new()),
                    },
                );
                true
            }
        };
        table.next_waiter += 1;
        Registration::Waiting { id, new_entry }
    }

    /// Block waiter `id` until `ip` resolves, the resolver is torn down, or
    /// `timeout` elapses.
    ///
    /// A timed-out waiter is removed from the entry; a pending entry left
    /// without waiters is dropped.
    pub fn wait(&self, ip: Ipv4Addr, id: u64, timeout: Duration) -> Resolution {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock();
        loop {
            let Some(entry) = table.entries.get(&ip) else {
                return Resolution::unresolved();
            };
            if let Some(mac) = entry.mac {
                return Resolution::resolved(mac);
            }
            if !entry.waiters.contains(&id) {
                return Resolution::unresolved();
            }
            let cond = entry.cond.clone();

            let now = Instant::now();
            if now >= deadline {
                Self::remove_waiter(&mut table, ip, id);
                tracing::debug!(%ip, waiter = id, "Address resolution timed out");
                return Resolution::unresolved();
            }
            table = cond
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Register for `ip` and wait. Does not send any request.
    pub fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Resolution {
        match self.register(ip) {
            Registration::Done(res) => res,
            Registration::Waiting { id, .. } => self.wait(ip, id, timeout),
        }
    }

    fn remove_waiter(table: &mut ArpTable, ip: Ipv4Addr, id: u64) {
        if let Some(entry) = table.entries.get_mut(&ip) {
            entry.waiters.retain(|w| *w != id);
            if entry.mac.is_none() && entry.waiters.is_empty() {
                table.entries.remove(&ip);
            }
        }
    }

    /// Apply a reply from `ip`. Returns whether a known entry was updated.
    ///
    /// Replies for addresses nobody asked about are ignored.
    pub fn on_reply(&self, ip: Ipv4Addr, mac: MacAddress) -> bool {
        let mut table = self.lock();
        if table.closed {
            return false;
        }
        let Some(entry) = table.entries.get_mut(&ip) else {
            tracing::trace!(%ip, "Ignoring unsolicited ARP reply");
            return false;
        };
        let woken = entry.waiters.len();
        entry.mac = Some(mac);
        entry.waiters.clear();
        entry.cond.notify_all();

        let mut snapshot = (**self.resolved.load()).clone();
        snapshot.insert(ip, mac);
        self.resolved.store(Arc::new(snapshot));

        tracing::debug!(%ip, waiters = woken, "Address resolved");
        true
    }

    /// Release every entry and wake every waiter unresolved.
    ///
    /// Later registrations complete immediately, unresolved.
    pub fn teardown(&self) {
        let mut table = self.lock();
        table.closed = true;
        for (_, entry) in table.entries.drain() {
            entry.cond.notify_all();
        }
        self.resolved.store(Arc::new(HashMap::new()));
    }

    /// Number of entries (pending or resolved)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of waiters registered on `ip`
    pub fn waiter_count(&self, ip: &Ipv4Addr) -> usize {
        self.lock()
            .entries
            .get(ip)
            .map_or(0, |entry| entry.waiters.len())
    }
}

/// An ARP message carried in an Ethernet frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpMessage {
    Request {
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    },
    Reply {
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
    },
}

impl ArpMessage {
    /// Parse an Ethernet frame. Returns `None` for anything but an
    /// IPv4-over-Ethernet ARP request or reply.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Arp {
            return None;
        }
        let packet = ArpPacket::new_checked(eth.payload()).ok()?;
        match ArpRepr::parse(&packet).ok()? {
            ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => match operation {
                ArpOperation::Request => Some(ArpMessage::Request {
                    sender_mac: source_hardware_addr.0,
                    sender_ip: source_protocol_addr,
                    target_ip: target_protocol_addr,
                }),
                ArpOperation::Reply => Some(ArpMessage::Reply {
                    sender_mac: source_hardware_addr.0,
                    sender_ip: source_protocol_addr,
                }),
                ArpOperation::Unknown(_) => None,
            },
            _ => None,
        }
    }
}

/// Write an ARP frame into `buf` (at least [`ARP_FRAME_LEN`] bytes).
///
/// `dst.0` is the Ethernet destination. Requests carry a zero target
/// hardware address, replies carry `dst.0`.
pub fn emit_arp_frame(
    buf: &mut [u8],
    operation: ArpOperation,
    src: (MacAddress, Ipv4Addr),
    dst: (MacAddress, Ipv4Addr),
) {
    let mut eth = EthernetFrame::new_unchecked(&mut buf[..ARP_FRAME_LEN]);
    eth.set_dst_addr(EthernetAddress(dst.0));
    eth.set_src_addr(EthernetAddress(src.0));
    eth.set_ethertype(EthernetProtocol::Arp);

    let repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: EthernetAddress(src.0),
        source_protocol_addr: src.1,
        target_hardware_addr: match operation {
            ArpOperation::Request => EthernetAddress([0; 6]),
            _ => EthernetAddress(dst.0),
        },
        target_protocol_addr: dst.1,
    };
    let mut packet = ArpPacket::new_unchecked(eth.payload_mut());
    repr.emit(&mut packet);
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 5);
    const PEER_MAC: MacAddress = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];

    #[test]
    fn test_reply_wakes_all_waiters() {
        let resolver = Arc::new(AddressResolver::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let Registration::Waiting { id, .. } = resolver.register(PEER_IP) else {
                    panic!("expected pending entry");
                };
                let resolver = resolver.clone();
                thread::spawn(move || resolver.wait(PEER_IP, id, Duration::from_secs(10)))
            })
            .collect();
        assert_eq!(resolver.waiter_count(&PEER_IP), 3);

        assert!(resolver.on_reply(PEER_IP, PEER_MAC));
        for w in waiters {
            assert_eq!(w.join().unwrap(), Resolution::resolved(PEER_MAC));
        }
        assert_eq!(resolver.lookup(&PEER_IP), Some(PEER_MAC));
        assert_eq!(
            resolver.resolve(PEER_IP, Duration::ZERO),
            Resolution::resolved(PEER_MAC)
        );
    }

    #[test]
    fn test_first_registration_creates_entry() {
        let resolver = AddressResolver::new();
        assert!(matches!(
            resolver.register(PEER_IP),
            Registration::Waiting {
                new_entry: true,
                ..
            }
        ));
        assert!(matches!(
            resolver.register(PEER_IP),
            Registration::Waiting {
                new_entry: false,
                ..
            }
        ));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_timeout_removes_waiter() {
        let resolver = AddressResolver::new();
        let res = resolver.resolve(PEER_IP, Duration::from_millis(20));
        assert_eq!(res, Resolution::unresolved());
        assert!(resolver.is_empty());

        let Registration::Waiting { id: stay, .. } = resolver.register(PEER_IP) else {
            panic!("expected pending entry");
        };
        let res = resolver.resolve(PEER_IP, Duration::from_millis(20));
        assert!(!res.resolved);
        assert_eq!(resolver.waiter_count(&PEER_IP), 1);

        assert!(resolver.on_reply(PEER_IP, PEER_MAC));
        assert_eq!(
            resolver.wait(PEER_IP, stay, Duration::ZERO),
            Resolution::resolved(PEER_MAC)
        );
    }

    #[test]
    fn test_unsolicited_reply_ignored() {
        let resolver = AddressResolver::new();
        assert!(!resolver.on_reply(PEER_IP, PEER_MAC));
        assert!(resolver.is_empty());
        assert_eq!(resolver.lookup(&PEER_IP), None);
    }

    #[test]
    fn test_teardown_releases_waiters() {
        let resolver = Arc::new(AddressResolver::new());
        let Registration::Waiting { id, .. } = resolver.register(PEER_IP) else {
            panic!("expected pending entry");
        };
        let waiter = {
            let resolver = resolver.clone();
            thread::spawn(move || resolver.wait(PEER_IP, id, Duration::from_secs(30)))
        };
        resolver.teardown();
        assert_eq!(waiter.join().unwrap(), Resolution::unresolved());
        assert!(resolver.is_empty());

        let start = Instant::now();
        assert_eq!(
            resolver.resolve(PEER_IP, Duration::from_secs(30)),
            Resolution::unresolved()
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!resolver.on_reply(PEER_IP, PEER_MAC));
    }

    #[test]
    fn test_frame_roundtrip() {
        let our_mac = [0x02, 0, 0, 0, 0, 1];
        let our_ip = Ipv4Addr::new(192, 168, 10, 2);

        let mut buf = [0u8; ARP_FRAME_LEN];
        emit_arp_frame(
            &mut buf,
            ArpOperation::Reply,
            (our_mac, our_ip),
            (PEER_MAC, PEER_IP),
        );
        assert_eq!(&buf[0..6], &PEER_MAC);
        assert_eq!(&buf[6..12], &our_mac);
        assert_eq!(&buf[12..14], &[0x08, 0x06]);
        assert_eq!(&buf[20..22], &[0x00, 0x02]);
        assert_eq!(&buf[32..38], &PEER_MAC);
        assert_eq!(
            ArpMessage::parse(&buf),
            Some(ArpMessage::Reply {
                sender_mac: our_mac,
                sender_ip: our_ip
            })
        );
    }

    #[test]
    fn test_request_has_zero_target_hardware_addr() {
        let our_mac = [0x02, 0, 0, 0, 0, 1];
        let our_ip = Ipv4Addr::new(192, 168, 10, 2);

        let mut buf = [0u8; ARP_FRAME_LEN];
        emit_arp_frame(
            &mut buf,
            ArpOperation::Request,
            (our_mac, our_ip),
            ([0xff; 6], PEER_IP),
        );
        assert_eq!(&buf[0..6], &[0xff; 6]);
        assert_eq!(&buf[20..22], &[0x00, 0x01]);
        assert_eq!(&buf[32..38], &[0; 6]);
        assert_eq!(&buf[38..42], &PEER_IP.octets());
        assert_eq!(
            ArpMessage::parse(&buf),
            Some(ArpMessage::Request {
                sender_mac: our_mac,
                sender_ip: our_ip,
                target_ip: PEER_IP
            })
        );
    }

    #[test]
    fn test_parse_rejects_non_arp() {
        let mut frame = [0u8; 60];
        frame[12] = 0x08;
        assert_eq!(ArpMessage::parse(&frame), None);
        assert_eq!(ArpMessage::parse(&frame[..20]), None);
    }
}
