//! Boundary to the packet-I/O framework and the GPU-memory collaborator.
//!
//! Everything the transport needs from the outside world goes through the
//! [`RteBackend`] and [`GpuBackend`] traits. The value types they exchange
//! live under [`rte`].

pub mod backend;
pub mod error;
pub mod rte;

pub use backend::{GpuBackend, RteBackend};
pub use error::{Errno, Result};
