//! Device arguments and the typed transport configuration derived from them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::api::rte::eth::{MacAddress, parse_mac_addr};
use crate::api::rte::gpu::GpuId;
use crate::error::{Result, TransportError};

pub const DEFAULT_MTU: u16 = 8000;
pub const DEFAULT_NUM_MBUFS: u32 = 1024;
pub const DEFAULT_MBUF_CACHE_SIZE: u32 = 315;
pub const DEFAULT_NUM_QUEUES: u16 = 1;
pub const DEFAULT_NUM_DESC: u16 = 512;
pub const DEFAULT_LINK_TIMEOUT_MS: u64 = 1000;

/// Ordered string key/value arguments, `"k1=v1,k2=v2"`.
///
/// Keys may carry an index suffix (`dpdk_mac[1]=...`) to address one of
/// several devices; see [`DeviceArgs::separate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs {
    entries: Vec<(String, String)>,
}

impl DeviceArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `"k1=v1,k2=v2"`. A key without `=` gets an empty value.
    pub fn parse(s: &str) -> Self {
        let mut args = Self::new();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some((k, v)) => args.set(k.trim(), v.trim()),
                None => args.set(token, ""),
            }
        }
        args
    }

    /// Set `key`, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse `key` as `T`, or return `default` when the key is absent.
    pub fn cast<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e| {
                TransportError::config(format!("invalid value {raw:?} for {key}: {e}"))
            }),
        }
    }

    /// Merge `other` into `self`. Existing keys are replaced only when
    /// `overwrite` is set.
    pub fn update(&mut self, other: &DeviceArgs, overwrite: bool) {
        for (k, v) in other.iter() {
            if overwrite || !self.has_key(k) {
                self.set(k, v);
            }
        }
    }

    /// Keys without an index suffix.
    pub fn globals(&self) -> DeviceArgs {
        DeviceArgs {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| split_index(k).is_none())
                .cloned()
                .collect(),
        }
    }

    /// Split indexed keys into one `DeviceArgs` per index, in index order.
    ///
    /// `dpdk_mac[0]=a,dpdk_mac[1]=b` yields two sets each holding a plain
    /// `dpdk_mac`. Un-indexed keys are not included.
    pub fn separate(&self) -> Vec<DeviceArgs> {
        let mut groups: BTreeMap<usize, DeviceArgs> = BTreeMap::new();
        for (key, value) in self.iter() {
            if let Some((base, index)) = split_index(key) {
                groups.entry(index).or_default().set(base, value);
            }
        }
        groups.into_values().collect()
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceArgs {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

fn split_index(key: &str) -> Option<(&str, usize)> {
    let open = key.find('[')?;
    let inner = key[open + 1..].strip_suffix(']')?;
    let index = inner.parse().ok()?;
    Some((&key[..open], index))
}

/// Where payload buffers live, resolved once at context bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPlan {
    HostOnly,
    Gpu { gpu_id: GpuId },
}

/// Per-NIC configuration, matched to hardware by MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicConfig {
    pub mac: MacAddress,
    /// `a.b.c.d/n`; NICs without one are left unmanaged
    pub ipv4: Option<String>,
    pub lcore: Option<u32>,
    pub num_queues: u16,
    pub num_desc: u16,
}

impl NicConfig {
    pub fn from_args(args: &DeviceArgs) -> Result<Self> {
        let raw_mac = args
            .get("dpdk_mac")
            .ok_or_else(|| TransportError::config("NIC entry without dpdk_mac"))?;
        let mac = parse_mac_addr(raw_mac)
            .ok_or_else(|| TransportError::config(format!("invalid dpdk_mac {raw_mac:?}")))?;
        let lcore = match args.get("dpdk_lcore") {
            Some(_) => Some(args.cast("dpdk_lcore", 0u32)?),
            None => None,
        };
        Ok(Self {
            mac,
            ipv4: args
                .get("dpdk_ipv4")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            lcore,
            num_queues: args.cast("dpdk_num_queues", DEFAULT_NUM_QUEUES)?,
            num_desc: args.cast("dpdk_num_desc", DEFAULT_NUM_DESC)?,
        })
    }

    /// Whether this NIC is brought up by the transport.
    pub fn is_managed(&self) -> bool {
        self.ipv4.is_some()
    }
}

/// Typed transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Global (un-indexed) arguments, used for framework start-up
    pub eal_args: DeviceArgs,
    pub mtu: u16,
    pub num_mbufs: u32,
    pub mbuf_cache_size: u32,
    pub memory: MemoryPlan,
    pub link_timeout: Duration,
    pub nics: Vec<NicConfig>,
}

impl TransportConfig {
    /// Build the configuration from device arguments.
    ///
    /// Per-NIC keys are given with an index suffix; un-indexed per-NIC keys
    /// act as defaults for every NIC. Without indexed keys, a global
    /// `dpdk_mac` describes a single NIC.
    pub fn from_args(args: &DeviceArgs) -> Result<Self> {
        let globals = args.globals();

        let mut nic_args = args.separate();
        if nic_args.is_empty() && globals.has_key("dpdk_mac") {
            nic_args.push(DeviceArgs::new());
        }
        let nics = nic_args
            .into_iter()
            .map(|mut nic| {
                nic.update(&globals, false);
                NicConfig::from_args(&nic)
            })
            .collect::<Result<Vec<_>>>()?;

        let memory = match globals.get("gpu_id") {
            Some(_) => MemoryPlan::Gpu {
                gpu_id: globals.cast("gpu_id", 0)?,
            },
            None => MemoryPlan::HostOnly,
        };

        Ok(Self {
            mtu: globals.cast("dpdk_mtu", DEFAULT_MTU)?,
            num_mbufs: globals.cast("dpdk_num_mbufs", DEFAULT_NUM_MBUFS)?,
            mbuf_cache_size: globals.cast("dpdk_mbuf_cache_size", DEFAULT_MBUF_CACHE_SIZE)?,
            link_timeout: Duration::from_millis(
                globals.cast("dpdk_link_timeout", DEFAULT_LINK_TIMEOUT_MS)?,
            ),
            memory,
            nics,
            eal_args: globals,
        })
    }

    /// Configuration for the NIC with `mac`, if any.
    pub fn nic(&self, mac: &MacAddress) -> Option<&NicConfig> {
        self.nics.iter().find(|nic| nic.mac == *mac)
    }
}

impl FromStr for TransportConfig {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_args(&DeviceArgs::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let args = DeviceArgs::parse(" a=1, b = two ,flag,,c=");
        assert_eq!(args.len(), 4);
        assert_eq!(args.get("a"), Some("1"));
        assert_eq!(args.get("b"), Some("two"));
        assert_eq!(args.get("flag"), Some(""));
        assert_eq!(args.get("c"), Some(""));
        assert!(!args.has_key("d"));
        assert_eq!(args.to_string(), "a=1,b=two,flag=,c=");
    }

    #[test]
    fn test_cast() {
        let args = DeviceArgs::parse("mtu=9000,bad=x");
        assert_eq!(args.cast("mtu", 1500u16).unwrap(), 9000);
        assert_eq!(args.cast("missing", 1500u16).unwrap(), 1500);
        let err = args.cast("bad", 0u32).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_update() {
        let mut a = DeviceArgs::parse("x=1,y=2");
        a.update(&DeviceArgs::parse("y=3,z=4"), false);
        assert_eq!(a.to_string(), "x=1,y=2,z=4");
        a.update(&DeviceArgs::parse("y=3"), true);
        assert_eq!(a.get("y"), Some("3"));
    }

    #[test]
    fn test_separate() {
        let args = DeviceArgs::parse(
            "dpdk_mtu=9000,dpdk_mac[1]=00:00:00:00:00:02,dpdk_mac[0]=00:00:00:00:00:01,\
             dpdk_lcore[0]=2,bogus[x]=1",
        );
        let groups = args.separate();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].get("dpdk_mac"), Some("00:00:00:00:00:01"));
        assert_eq!(groups[0].get("dpdk_lcore"), Some("2"));
        assert_eq!(groups[1].get("dpdk_mac"), Some("00:00:00:00:00:02"));
        assert!(!groups[1].has_key("dpdk_lcore"));

        let globals = args.globals();
        assert_eq!(globals.to_string(), "dpdk_mtu=9000,bogus[x]=1");
    }

    #[test]
    fn test_transport_config_defaults() {
        let cfg: TransportConfig = "dpdk_mac=02:00:00:00:00:01,dpdk_ipv4=10.0.0.1/24,dpdk_lcore=1"
            .parse()
            .unwrap();
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert_eq!(cfg.num_mbufs, DEFAULT_NUM_MBUFS);
        assert_eq!(cfg.mbuf_cache_size, DEFAULT_MBUF_CACHE_SIZE);
        assert_eq!(cfg.memory, MemoryPlan::HostOnly);
        assert_eq!(cfg.link_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.nics.len(), 1);
        let nic = &cfg.nics[0];
        assert_eq!(nic.mac, [0x02, 0, 0, 0, 0, 1]);
        assert_eq!(nic.ipv4.as_deref(), Some("10.0.0.1/24"));
        assert_eq!(nic.lcore, Some(1));
        assert_eq!(nic.num_queues, DEFAULT_NUM_QUEUES);
        assert_eq!(nic.num_desc, DEFAULT_NUM_DESC);
        assert!(nic.is_managed());
    }

    #[test]
    fn test_transport_config_multi_nic() {
        let cfg: TransportConfig = "gpu_id=1,dpdk_mtu=9000,dpdk_num_desc=1024,\
             dpdk_mac[0]=02:00:00:00:00:01,dpdk_ipv4[0]=10.0.0.1/24,dpdk_lcore[0]=1,\
             dpdk_mac[1]=02:00:00:00:00:02,dpdk_num_desc[1]=256"
            .parse()
            .unwrap();
        assert_eq!(cfg.memory, MemoryPlan::Gpu { gpu_id: 1 });
        assert_eq!(cfg.mtu, 9000);
        assert_eq!(cfg.nics.len(), 2);
        assert_eq!(cfg.nics[0].num_desc, 1024);
        assert_eq!(cfg.nics[1].num_desc, 256);
        assert!(!cfg.nics[1].is_managed());
        assert!(cfg.nic(&[0x02, 0, 0, 0, 0, 2]).is_some());
        assert!(cfg.nic(&[0x02, 0, 0, 0, 0, 3]).is_none());
    }

    #[test]
    fn test_transport_config_errors() {
        assert!(matches!(
            "dpdk_mac[0]=zz".parse::<TransportConfig>(),
            Err(TransportError::Config(_))
        ));
        assert!(matches!(
            "dpdk_ipv4[0]=10.0.0.1/24".parse::<TransportConfig>(),
            Err(TransportError::Config(_))
        ));
        assert!(matches!(
            "gpu_id=-1".parse::<TransportConfig>(),
            Err(TransportError::Config(_))
        ));
    }
}
