// Generic flow API
// Mirrors the rte_flow pattern/action model used for ingress steering.

use std::fmt;

use super::eth::QueueId;

/// Well-known source UDP port of sample-stream traffic
pub const VITA_UDP_PORT: u16 = 49153;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Flow rule attributes (rte_flow_attr)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
}

impl FlowAttr {
    /// Ingress rule in group 0 at the highest priority
    pub fn ingress() -> Self {
        Self {
            ingress: true,
            ..Self::default()
        }
    }
}

/// One item of a match pattern; `None` fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowItem {
    /// Any Ethernet header
    Eth,
    /// IPv4 header, optionally matching `next_proto_id` under `mask`
    Ipv4 { next_proto: Option<(u8, u8)> },
    /// UDP header, optionally matching ports under their masks
    Udp {
        src_port: Option<(u16, u16)>,
        dst_port: Option<(u16, u16)>,
    },
}

/// Flow rule action (rte_flow_action)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Deliver matching packets to an RX queue
    Queue(QueueId),
    /// Drop matching packets
    Drop,
}

/// A complete flow rule: attributes, pattern and actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub attr: FlowAttr,
    pub pattern: Vec<FlowItem>,
    pub actions: Vec<FlowAction>,
}

impl FlowRule {
    /// Catch-all ingress rule delivering every packet to `queue`.
    pub fn to_queue(queue: QueueId) -> Self {
        Self {
            attr: FlowAttr::ingress(),
            pattern: Vec::new(),
            actions: vec![FlowAction::Queue(queue)],
        }
    }

    /// Ingress rule delivering UDP packets from the sample-stream source
    /// port to `queue`.
    pub fn vita_to_queue(queue: QueueId) -> Self {
        Self {
            attr: FlowAttr::ingress(),
            pattern: vec![
                FlowItem::Eth,
                FlowItem::Ipv4 {
                    next_proto: Some((IPPROTO_UDP, 0xff)),
                },
                FlowItem::Udp {
                    src_port: Some((VITA_UDP_PORT, 0xffff)),
                    dst_port: None,
                },
            ],
            actions: vec![FlowAction::Queue(queue)],
        }
    }

    /// Queue targeted by the rule's first queue action
    pub fn target_queue(&self) -> Option<QueueId> {
        self.actions.iter().find_map(|action| match action {
            FlowAction::Queue(q) => Some(*q),
            FlowAction::Drop => None,
        })
    }
}

/// Handle to an installed flow rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle(pub u64);

/// Error reported by the flow API (rte_flow_error)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    /// Framework error type code
    pub kind: i32,
    pub message: String,
}

impl FlowError {
    pub fn new(kind: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow error (type {}): {}", self.kind, self.message)
    }
}

impl std::error::Error for FlowError {}
