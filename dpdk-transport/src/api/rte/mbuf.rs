// Mbuf API

use std::fmt;

use super::pktmbuf::MemPool;

/// A packet buffer borrowed from a [`MemPool`].
///
/// The buffer is returned to its pool when dropped.
pub struct Mbuf {
    buf: Vec<u8>,
    len: usize,
    pool: MemPool,
}

impl Mbuf {
    /// Wrap a raw data buffer taken from `pool`.
    ///
    /// The buffer's length is its capacity; the packet starts empty.
    pub fn from_pool_buffer(buf: Vec<u8>, pool: MemPool) -> Self {
        Self { buf, len: 0, pool }
    }

    /// Get the current data length (bytes of valid data).
    #[inline]
    pub fn data_len(&self) -> usize {
        self.len
    }

    /// Get the total capacity of the data buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Get the tailroom (unused space at the end of the buffer).
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.capacity() - self.len
    }

    /// Get an immutable slice of the packet data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Get a mutable slice of the packet data.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// Append space to the end of the packet data.
    ///
    /// Returns a mutable slice to the newly appended (zeroed) region,
    /// or `None` if there's not enough tailroom.
    #[inline]
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let start = self.len;
        self.len += len;
        let region = &mut self.buf[start..self.len];
        region.fill(0);
        Some(region)
    }

    /// Replace the packet data with `data`.
    ///
    /// Returns `false` if `data` does not fit.
    pub fn copy_from_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.capacity() {
            return false;
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }

    /// Pool this mbuf belongs to
    pub fn pool(&self) -> &MemPool {
        &self.pool
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name())
            .field("data_len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
