use std::fmt;

use crate::api::Errno;
use crate::api::rte::eth::PortId;
use crate::api::rte::flow::FlowError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Error type for transport bring-up and port operations.
#[derive(Debug)]
pub enum TransportError {
    /// Malformed configuration value (address, GPU id, device argument).
    Config(String),
    /// The NIC lacks queues, offloads or descriptor ranges the port needs.
    Capability { port_id: PortId, reason: String },
    /// Framework initialization failed.
    Init(Errno),
    /// No NIC is available to the framework.
    NoDevice,
    /// Links still down when the link-up timeout elapsed.
    LinkTimeout { down: Vec<PortId> },
    /// Installing or removing an ingress flow rule failed.
    FlowRule(FlowError),
    /// No port or I/O service matches the query.
    Lookup(String),
    /// A device or queue operation failed.
    Device {
        port_id: PortId,
        op: &'static str,
        errno: Errno,
    },
    /// A buffer pool or GPU memory region could not be set up.
    Memory { what: String, errno: Errno },
}

impl TransportError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }

    pub(crate) fn capability(port_id: PortId, reason: impl Into<String>) -> Self {
        TransportError::Capability {
            port_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn device(port_id: PortId, op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| TransportError::Device { port_id, op, errno }
    }

    pub(crate) fn memory(what: impl Into<String>) -> impl FnOnce(Errno) -> Self {
        let what = what.into();
        move |errno| TransportError::Memory { what, errno }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Config(msg) => write!(f, "configuration error: {msg}"),
            TransportError::Capability { port_id, reason } => {
                write!(f, "port {port_id}: insufficient capability: {reason}")
            }
            TransportError::Init(e) => write!(f, "framework initialization failed: {e}"),
            TransportError::NoDevice => write!(f, "no network devices available"),
            TransportError::LinkTimeout { down } => {
                write!(f, "link-up timeout, ports still down: {down:?}")
            }
            TransportError::FlowRule(e) => write!(f, "flow rule error: {e}"),
            TransportError::Lookup(what) => write!(f, "lookup failed: {what}"),
            TransportError::Device { port_id, op, errno } => {
                write!(f, "port {port_id}: {op} failed: {errno}")
            }
            TransportError::Memory { what, errno } => write!(f, "{what} failed: {errno}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Init(e)
            | TransportError::Device { errno: e, .. }
            | TransportError::Memory { errno: e, .. } => Some(e),
            TransportError::FlowRule(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FlowError> for TransportError {
    fn from(e: FlowError) -> Self {
        TransportError::FlowRule(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = TransportError::capability(2, "GPU split requires at least 2 RX queues");
        assert_eq!(
            e.to_string(),
            "port 2: insufficient capability: GPU split requires at least 2 RX queues"
        );

        let e = TransportError::device(0, "rte_eth_dev_start")(Errno::EIO);
        assert!(e.to_string().starts_with("port 0: rte_eth_dev_start failed"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_from_flow_error() {
        let e: TransportError = FlowError::new(1, "unsupported pattern").into();
        assert!(matches!(e, TransportError::FlowRule(_)));
        assert!(e.to_string().contains("unsupported pattern"));
    }
}
