// pktmbuf pool API
// Mirrors rte_pktmbuf_pool_create / rte_pktmbuf_pool_create_extbuf.

use std::fmt;
use std::sync::Arc;

use super::mbuf::Mbuf;

/// Default headroom reserved at the front of each mbuf (RTE_PKTMBUF_HEADROOM)
pub const PKTMBUF_HEADROOM: u16 = 128;

/// Default data room of an mbuf, excluding headroom
pub const MBUF_DEFAULT_DATAROOM: u16 = 2048;

/// Memory domain backing a pool's data buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMemory {
    /// Host hugepage memory on a NUMA socket (-1 for any)
    Host { socket_id: i32 },
    /// Externally registered memory (GPU), by region address
    External { buf_addr: u64 },
}

/// A pool of fixed-size packet buffers provided by the framework.
///
/// Implementations hand out raw data buffers; [`MemPool`] wraps them into
/// [`Mbuf`]s that return themselves to the pool on drop.
pub trait MbufPool: Send + Sync {
    /// Pool name (unique per process)
    fn name(&self) -> &str;

    /// Take a free data buffer of `data_room_size()` bytes, if any.
    fn take(&self) -> Option<Vec<u8>>;

    /// Return a buffer previously obtained from `take`.
    fn give_back(&self, buf: Vec<u8>);

    /// Number of free buffers
    fn avail_count(&self) -> u32;

    /// Data room size of every buffer (including headroom)
    fn data_room_size(&self) -> u16;

    /// Memory domain of the data buffers
    fn memory(&self) -> PoolMemory;
}

/// Shared handle to a framework buffer pool.
///
/// Cloning is cheap; the underlying pool is released when the last handle
/// drops.
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<dyn MbufPool>,
}

impl MemPool {
    /// Wrap a framework pool implementation.
    pub fn from_pool(inner: Arc<dyn MbufPool>) -> Self {
        Self { inner }
    }

    /// Pool name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Get the number of available (free) objects in the pool
    #[inline]
    pub fn avail_count(&self) -> u32 {
        self.inner.avail_count()
    }

    /// Get the data room size for mbufs in this pool.
    #[inline]
    pub fn data_room_size(&self) -> u16 {
        self.inner.data_room_size()
    }

    /// Memory domain backing the pool
    pub fn memory(&self) -> PoolMemory {
        self.inner.memory()
    }

    /// Try to allocate an mbuf from this pool.
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn try_alloc(&self) -> Option<Mbuf> {
        self.inner
            .take()
            .map(|buf| Mbuf::from_pool_buffer(buf, self.clone()))
    }

    /// Check whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &MemPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn give_back(&self, buf: Vec<u8>) {
        self.inner.give_back(buf);
    }
}

impl fmt::Debug for MemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("name", &self.name())
            .field("memory", &self.memory())
            .field("avail", &self.avail_count())
            .finish()
    }
}

/// Configuration for creating a MemPool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemPoolConfig {
    /// Number of mbufs in the pool (optimum: 2^q - 1)
    pub num_mbufs: u32,
    /// Per-core cache size (0 to disable caching)
    pub cache_size: u32,
    /// Private area size between rte_mbuf struct and data buffer
    pub priv_size: u16,
    /// Data room size including headroom
    pub data_room_size: u16,
    /// NUMA socket ID (-1 for SOCKET_ID_ANY)
    pub socket_id: i32,
}

impl Default for MemPoolConfig {
    fn default() -> Self {
        Self {
            num_mbufs: 8191, // 2^13 - 1
            cache_size: 256,
            priv_size: 0,
            data_room_size: MBUF_DEFAULT_DATAROOM + PKTMBUF_HEADROOM,
            socket_id: -1, // SOCKET_ID_ANY
        }
    }
}

impl MemPoolConfig {
    /// Create a new MemPoolConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of mbufs in the pool.
    pub fn num_mbufs(mut self, n: u32) -> Self {
        self.num_mbufs = n;
        self
    }

    /// Set the per-core cache size.
    ///
    /// Set to 0 to disable caching. Should be less than num_mbufs / 1.5.
    pub fn cache_size(mut self, size: u32) -> Self {
        self.cache_size = size;
        self
    }

    /// Set the private area size between rte_mbuf struct and data buffer.
    pub fn priv_size(mut self, size: u16) -> Self {
        self.priv_size = size;
        self
    }

    /// Set the data room size (including headroom).
    pub fn data_room_size(mut self, size: u16) -> Self {
        self.data_room_size = size;
        self
    }

    /// Set the NUMA socket ID.
    pub fn socket_id(mut self, id: i32) -> Self {
        self.socket_id = id;
        self
    }
}

/// Externally allocated memory handed to the framework (rte_pktmbuf_extmem)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtMem {
    /// Device address of the region
    pub buf_addr: u64,
    /// IO address, `None` when the framework must resolve it (RTE_BAD_IOVA)
    pub buf_iova: Option<u64>,
    /// Region length in bytes
    pub buf_len: usize,
    /// Size of each buffer carved from the region
    pub elt_size: u16,
}

impl ExtMem {
    /// Number of `elt_size` buffers that fit in the region
    pub fn capacity(&self) -> usize {
        if self.elt_size == 0 {
            0
        } else {
            self.buf_len / self.elt_size as usize
        }
    }
}
