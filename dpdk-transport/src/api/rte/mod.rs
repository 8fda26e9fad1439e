pub mod eal;
pub mod eth;
pub mod flow;
pub mod gpu;
pub mod mbuf;
pub mod pktmbuf;
pub mod queue;
