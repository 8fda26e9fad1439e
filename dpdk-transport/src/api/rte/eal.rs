// EAL (Environment Abstraction Layer) startup arguments and lifetime guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::RteBackend;
use crate::config::DeviceArgs;

/// Global flag to track if EAL has been initialized
static EAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Program name handed to the framework when none is configured.
pub const DEFAULT_PROGRAM_NAME: &str = "dpdk-transport";

/// Well-known EAL options as strongly-typed enum variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EalOption {
    /// Don't use hugepages (--no-huge)
    NoHuge,
    /// Don't scan PCI bus (--no-pci)
    NoPci,
    /// Add a virtual device (--vdev=<device>)
    Vdev(String),
    /// Core mask in hex (e.g., "0xf" for cores 0-3)
    CoreMask(String),
    /// Core list (e.g., "0-3" or "0,2,4")
    CoreList(String),
    /// Lcore to CPU map (--lcores <map>)
    CoreMap(String),
    /// Main lcore id (--main-lcore <id>)
    MainLcore(String),
    /// File prefix for multi-process (--file-prefix=<prefix>)
    FilePrefix(String),
    /// Hugepage mount directory (--huge-dir <dir>)
    HugeDir(String),
    /// Log level (--log-level=<level>)
    LogLevel(LogLevel),
    /// In-memory mode, no persistent files (--in-memory)
    InMemory,
    /// Allow a PCI device (-a <pci_addr>)
    Allow(String),
    /// Block a PCI device (-b <pci_addr>)
    Block(String),
    /// Load an external driver or driver directory (-d <path>)
    Driver(String),
    /// Custom argument (pass-through)
    Custom(String),
}

impl EalOption {
    /// Convert to command-line argument strings
    fn to_args(&self) -> Vec<String> {
        match self {
            EalOption::NoHuge => vec!["--no-huge".to_string()],
            EalOption::NoPci => vec!["--no-pci".to_string()],
            EalOption::Vdev(dev) => vec![format!("--vdev={}", dev)],
            EalOption::CoreMask(mask) => vec!["-c".to_string(), mask.clone()],
            EalOption::CoreList(list) => vec!["-l".to_string(), list.clone()],
            EalOption::CoreMap(map) => vec!["--lcores".to_string(), map.clone()],
            EalOption::MainLcore(id) => vec!["--main-lcore".to_string(), id.clone()],
            EalOption::FilePrefix(prefix) => vec![format!("--file-prefix={}", prefix)],
            EalOption::HugeDir(dir) => vec!["--huge-dir".to_string(), dir.clone()],
            EalOption::LogLevel(level) => vec![format!("--log-level={}", level.as_str())],
            EalOption::InMemory => vec!["--in-memory".to_string()],
            EalOption::Allow(pci_addr) => vec!["-a".to_string(), pci_addr.clone()],
            EalOption::Block(pci_addr) => vec!["-b".to_string(), pci_addr.clone()],
            EalOption::Driver(path) => vec!["-d".to_string(), path.clone()],
            EalOption::Custom(arg) => vec![arg.clone()],
        }
    }
}

/// EAL log levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
    /// Numeric level (1-8) or a per-component expression such as `pmd.net.*:debug`
    Raw(String),
}

impl LogLevel {
    /// Parse a level name as written in device arguments.
    ///
    /// Unknown names are passed through verbatim.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "emergency" | "emerg" => LogLevel::Emergency,
            "alert" => LogLevel::Alert,
            "critical" | "crit" => LogLevel::Critical,
            "error" | "err" => LogLevel::Error,
            "warning" | "warn" => LogLevel::Warning,
            "notice" => LogLevel::Notice,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Raw(value.to_string()),
        }
    }

    fn as_str(&self) -> String {
        match self {
            LogLevel::Emergency => "1".to_string(),
            LogLevel::Alert => "2".to_string(),
            LogLevel::Critical => "3".to_string(),
            LogLevel::Error => "4".to_string(),
            LogLevel::Warning => "5".to_string(),
            LogLevel::Notice => "6".to_string(),
            LogLevel::Info => "7".to_string(),
            LogLevel::Debug => "8".to_string(),
            LogLevel::Raw(s) => s.clone(),
        }
    }
}

/// Builder for EAL initialization options.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use dpdk_transport::api::rte::eal::{EalBuilder, LogLevel};
/// # fn backend() -> Arc<dyn dpdk_transport::api::RteBackend> { unimplemented!() }
///
/// let _eal = EalBuilder::new()
///     .core_list("0-3")
///     .allow("0000:00:04.0")
///     .log_level(LogLevel::Warning)
///     .init(backend())
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct EalBuilder {
    program_name: Option<String>,
    options: Vec<EalOption>,
}

impl EalBuilder {
    /// Create a new EAL builder.
    pub fn new() -> Self {
        Self {
            program_name: None,
            options: Vec::new(),
        }
    }

    /// Assemble startup options from the `dpdk_*` keys of device arguments.
    ///
    /// Keys are applied in the order they appear in `args`. Keys that are
    /// not EAL options are ignored.
    pub fn from_device_args(args: &DeviceArgs) -> Self {
        let mut builder = Self::new();
        for (key, val) in args.iter() {
            builder = match key {
                "dpdk_coremask" => builder.core_mask(val),
                // May contain commas, so only settable programmatically
                "dpdk_corelist" => builder.core_list(val),
                "dpdk_coremap" => builder.option(EalOption::CoreMap(val.to_string())),
                "dpdk_main_lcore" | "dpdk_master_lcore" => {
                    builder.option(EalOption::MainLcore(val.to_string()))
                }
                "dpdk_pci_blacklist" => builder.block(val),
                "dpdk_pci_whitelist" => split_devices(val).fold(builder, |b, dev| b.allow(dev)),
                "dpdk_vdev" => split_devices(val).fold(builder, |b, dev| b.vdev(dev)),
                "dpdk_log_level" => builder.log_level(LogLevel::parse(val)),
                "dpdk_huge_dir" => builder.huge_dir(val),
                "dpdk_file_prefix" => builder.file_prefix(val),
                "dpdk_driver" => builder.option(EalOption::Driver(val.to_string())),
                "dpdk_no_huge" if is_enabled(val) => builder.no_huge(),
                "dpdk_no_pci" if is_enabled(val) => builder.no_pci(),
                "dpdk_in_memory" if is_enabled(val) => builder.in_memory(),
                _ => builder,
            };
        }
        builder
    }

    /// Set the program name (first argument)
    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = Some(name.into());
        self
    }

    /// Add --no-huge option (don't use hugepages)
    pub fn no_huge(mut self) -> Self {
        self.options.push(EalOption::NoHuge);
        self
    }

    /// Add --no-pci option (don't scan PCI bus)
    pub fn no_pci(mut self) -> Self {
        self.options.push(EalOption::NoPci);
        self
    }

    /// Add a virtual device (--vdev=<device>)
    pub fn vdev(mut self, device: impl Into<String>) -> Self {
        self.options.push(EalOption::Vdev(device.into()));
        self
    }

    /// Set core mask in hex (-c <mask>)
    pub fn core_mask(mut self, mask: impl Into<String>) -> Self {
        self.options.push(EalOption::CoreMask(mask.into()));
        self
    }

    /// Set core list (-l <list>)
    pub fn core_list(mut self, list: impl Into<String>) -> Self {
        self.options.push(EalOption::CoreList(list.into()));
        self
    }

    /// Set file prefix for multi-process (--file-prefix=<prefix>)
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.push(EalOption::FilePrefix(prefix.into()));
        self
    }

    /// Set the hugepage directory (--huge-dir <dir>)
    pub fn huge_dir(mut self, dir: impl Into<String>) -> Self {
        self.options.push(EalOption::HugeDir(dir.into()));
        self
    }

    /// Set log level (--log-level=<level>)
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.options.push(EalOption::LogLevel(level));
        self
    }

    /// Enable in-memory mode (--in-memory)
    pub fn in_memory(mut self) -> Self {
        self.options.push(EalOption::InMemory);
        self
    }

    /// Allow a PCI device (-a <pci_addr>)
    pub fn allow(mut self, pci_addr: impl Into<String>) -> Self {
        self.options.push(EalOption::Allow(pci_addr.into()));
        self
    }

    /// Block a PCI device (-b <pci_addr>)
    pub fn block(mut self, pci_addr: impl Into<String>) -> Self {
        self.options.push(EalOption::Block(pci_addr.into()));
        self
    }

    /// Add a custom option
    pub fn option(mut self, opt: EalOption) -> Self {
        self.options.push(opt);
        self
    }

    /// Add a custom raw argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.options.push(EalOption::Custom(arg.into()));
        self
    }

    /// Build the argument list
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        let program_name = self
            .program_name
            .clone()
            .unwrap_or_else(|| DEFAULT_PROGRAM_NAME.to_string());
        args.push(program_name);

        for opt in &self.options {
            args.extend(opt.to_args());
        }

        args
    }

    /// Initialize EAL with the configured options.
    ///
    /// Returns an RAII guard that cleans up EAL on drop.
    pub fn init(self, rte: Arc<dyn RteBackend>) -> crate::api::Result<Eal> {
        let args = self.build_args();
        tracing::info!(args = ?args, "Initializing EAL");
        Eal::init(rte, args)
    }
}

fn split_devices(val: &str) -> impl Iterator<Item = &str> {
    val.split('|').map(str::trim).filter(|dev| !dev.is_empty())
}

fn is_enabled(val: &str) -> bool {
    matches!(val, "" | "1" | "true" | "yes" | "on")
}

/// RAII guard for the EAL environment.
///
/// When dropped, cleans up the framework.
/// Note: EAL cannot be reinitialized while a guard is alive.
pub struct Eal {
    rte: Arc<dyn RteBackend>,
}

impl Eal {
    /// Initialize the EAL environment and return an RAII guard.
    ///
    /// # Errors
    /// Returns an error if EAL initialization fails or if EAL is already initialized.
    pub fn init<I, S>(rte: Arc<dyn RteBackend>, args: I) -> crate::api::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if EAL_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(nix::errno::Errno::EALREADY);
        }

        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        if args.iter().any(|a| a.contains('\0')) {
            EAL_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(nix::errno::Errno::EINVAL);
        }

        if let Err(e) = rte.eal_init(&args) {
            // Reset flag on failure so user can retry
            EAL_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(Eal { rte })
    }

    /// Check if EAL has been initialized.
    pub fn is_initialized() -> bool {
        EAL_INITIALIZED.load(Ordering::SeqCst)
    }
}

impl Drop for Eal {
    fn drop(&mut self) {
        // Best effort cleanup - ignore errors during drop
        let _ = self.rte.eal_cleanup();
        EAL_INITIALIZED.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_order() {
        let args = EalBuilder::new()
            .program_name("prog")
            .no_huge()
            .core_list("0-3")
            .allow("0000:00:04.0")
            .log_level(LogLevel::Warning)
            .build_args();
        assert_eq!(
            args,
            vec![
                "prog",
                "--no-huge",
                "-l",
                "0-3",
                "-a",
                "0000:00:04.0",
                "--log-level=5"
            ]
        );
    }

    #[test]
    fn test_from_device_args() {
        let mut dev_args = DeviceArgs::new();
        dev_args.set("dpdk_coremask", "0x3");
        dev_args.set("dpdk_pci_whitelist", "0000:01:00.0|0000:01:00.1");
        dev_args.set("dpdk_huge_dir", "/dev/hugepages");
        dev_args.set("dpdk_mtu", "9000");
        dev_args.set("dpdk_master_lcore", "1");
        dev_args.set("dpdk_log_level", "debug");

        let args = EalBuilder::from_device_args(&dev_args).build_args();
        assert_eq!(args[0], DEFAULT_PROGRAM_NAME);
        assert_eq!(
            &args[1..],
            &[
                "-c",
                "0x3",
                "-a",
                "0000:01:00.0",
                "-a",
                "0000:01:00.1",
                "--huge-dir",
                "/dev/hugepages",
                "--main-lcore",
                "1",
                "--log-level=8",
            ]
        );
    }

    #[test]
    fn test_flags_respect_value() {
        let mut dev_args = DeviceArgs::new();
        dev_args.set("dpdk_no_huge", "1");
        dev_args.set("dpdk_no_pci", "false");
        let args = EalBuilder::from_device_args(&dev_args).build_args();
        assert_eq!(&args[1..], &["--no-huge"]);
    }
}
