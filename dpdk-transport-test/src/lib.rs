//! Shared helpers for the transport integration tests.
//!
//! Everything runs against the simulated backend, so no hugepages, NICs or
//! GPUs are needed.

pub mod frames;

pub mod util {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static TRACING: Once = Once::new();

    /// Install a test subscriber once per process, filtered by `RUST_LOG`.
    pub fn init_tracing() {
        TRACING.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_test_writer()
                .init();
        });
    }

    /// Indexed device arguments for one NIC.
    pub fn nic_args(index: usize, mac: &str, ipv4: &str, lcore: u32) -> String {
        format!("dpdk_mac[{index}]={mac},dpdk_ipv4[{index}]={ipv4},dpdk_lcore[{index}]={lcore}")
    }
}

pub mod bed {
    use std::sync::Arc;

    use dpdk_transport::api::rte::eth::MacAddress;
    use dpdk_transport::sim::{SimBackend, SimGpu, SimNic};
    use dpdk_transport::{TransportConfig, TransportContext};

    pub const MAC0: MacAddress = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    pub const MAC1: MacAddress = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    pub const MAC2: MacAddress = [0x02, 0x00, 0x00, 0x00, 0x00, 0x03];

    /// Simulated NICs and GPUs behind a fresh transport context.
    ///
    /// Only one bed may be alive at a time; tests using it run serially.
    pub struct TestBed {
        pub sim: Arc<SimBackend>,
        pub gpu: Arc<SimGpu>,
        pub ctx: Arc<TransportContext>,
    }

    impl TestBed {
        pub fn new(nics: Vec<SimNic>, gpus: u16) -> Self {
            crate::util::init_tracing();
            let sim = Arc::new(SimBackend::new(nics));
            let gpu = Arc::new(SimGpu::new(gpus));
            let ctx = TransportContext::get(sim.clone(), gpu.clone());
            assert!(
                !ctx.is_initialized(),
                "a previous transport context is still alive"
            );
            Self { sim, gpu, ctx }
        }

        /// Parse `args` and initialize the context with them.
        pub fn init(&self, args: &str) -> dpdk_transport::Result<()> {
            let cfg: TransportConfig = args.parse()?;
            self.ctx.init(&cfg)
        }
    }
}
