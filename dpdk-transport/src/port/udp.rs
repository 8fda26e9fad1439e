use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Number of usable transport ports (1..=65535)
const PORT_SPACE: usize = u16::MAX as usize;

/// Ephemeral transport-port bookkeeping for one NIC.
///
/// Automatic allocation searches downward from a cursor that persists
/// across calls. The cursor wraps from 1 to 65535; port 0 is never handed
/// out.
#[derive(Debug)]
pub struct EphemeralPorts {
    inner: Mutex<PortSet>,
}

#[derive(Debug)]
struct PortSet {
    taken: HashSet<u16>,
    next: u16,
}

impl Default for EphemeralPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralPorts {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PortSet {
                taken: HashSet::new(),
                next: u16::MAX,
            }),
        }
    }

    /// Allocate `requested`, or the next free port when `requested` is 0.
    ///
    /// Ports are in host byte order. Returns `None` if the requested port
    /// is taken or no port remains.
    pub fn allocate(&self, requested: u16) -> Option<u16> {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if requested != 0 {
            return set.taken.insert(requested).then_some(requested);
        }

        if set.taken.len() >= PORT_SPACE {
            tracing::warn!("Attempted to allocate a transport port, but none remain");
            return None;
        }

        let mut candidate = set.next;
        for _ in 0..PORT_SPACE {
            if !set.taken.contains(&candidate) {
                set.taken.insert(candidate);
                set.next = step_down(candidate);
                return Some(candidate);
            }
            candidate = step_down(candidate);
        }
        tracing::warn!("Attempted to allocate a transport port, but none remain");
        None
    }

    /// Release `port` (host byte order). Returns whether it was allocated.
    pub fn free(&self, port: u16) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .taken
            .remove(&port)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .taken
            .contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .taken
            .len()
    }
}

fn step_down(port: u16) -> u16 {
    if port <= 1 { u16::MAX } else { port - 1 }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_descending_allocation() {
        let ports = EphemeralPorts::new();
        assert_eq!(ports.allocate(0), Some(65535));
        assert_eq!(ports.allocate(0), Some(65534));
        assert_eq!(ports.allocate(65533), Some(65533));
        assert_eq!(ports.allocate(0), Some(65532));
        assert_eq!(ports.allocated_count(), 4);
    }

    #[test]
    fn test_specific_port() {
        let ports = EphemeralPorts::new();
        assert_eq!(ports.allocate(5000), Some(5000));
        assert_eq!(ports.allocate(5000), None);
        assert!(ports.free(5000));
        assert!(!ports.free(5000));
        assert_eq!(ports.allocate(5000), Some(5000));
    }

    #[test]
    fn test_cursor_skips_taken_and_wraps() {
        let ports = EphemeralPorts::new();
        for p in [65535, 65534] {
            ports.allocate(p).unwrap();
        }
        assert_eq!(ports.allocate(0), Some(65533));

        let ports = EphemeralPorts::new();
        ports.inner.lock().unwrap().next = 1;
        assert_eq!(ports.allocate(0), Some(1));
        // never 0
        assert_eq!(ports.allocate(0), Some(65535));
    }

    #[test]
    fn test_exhaustion() {
        let ports = EphemeralPorts::new();
        for expected in (1..=u16::MAX).rev() {
            assert_eq!(ports.allocate(0), Some(expected));
        }
        assert_eq!(ports.allocate(0), None);
        assert!(ports.free(4242));
        assert_eq!(ports.allocate(0), Some(4242));
        assert_eq!(ports.allocate(0), None);
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        let ports = Arc::new(EphemeralPorts::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| ports.allocate(0).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for p in h.join().unwrap() {
                assert!(all.insert(p), "port {p} handed out twice");
            }
        }
        assert_eq!(all.len(), 2000);
    }
}
