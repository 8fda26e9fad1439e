//! Per-core DPDK port management for radio streaming.
//!
//! A [`TransportContext`] starts the framework, brings up the NICs named in
//! the device arguments, and hands each port to the I/O service of its
//! lcore. Ports answer ARP, resolve neighbours, allocate UDP ports and can
//! steer the sample stream between host queues and a GPU-backed queue.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod io_service;
pub mod pool;
pub mod port;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::{DeviceArgs, MemoryPlan, NicConfig, TransportConfig};
pub use context::TransportContext;
pub use error::{Result, TransportError};
pub use io_service::{IoService, RxPacket};
pub use port::Port;
