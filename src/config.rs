//! Configuration file loading.
//!
//! The format is line-oriented: `#` starts a comment, blank lines are
//! ignored, and each remaining line is a key followed by its
//! whitespace-separated value. `interface <name>` opens a section; every
//! key after it applies to that interface until the next `interface`
//! line. `include <path>` pulls in another file (absolute paths only)
//! with the section state carried across the boundary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::addr::{HwAddr, Ipv4};
use crate::error::{Error, Result};
use crate::pool::prefix_mask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Critical,
}

impl LogLevel {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// The equivalent `tracing` filter directive.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Critical => "error",
        }
    }
}

/// Validated settings for one served interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub network: Ipv4,
    pub prefix: u8,
    pub routers: Ipv4,
    pub server_id: Ipv4,
    pub dhcp_first: Ipv4,
    pub dhcp_last: Ipv4,
    pub dns_servers: Vec<Ipv4>,
    pub lease_time: u32,
    pub renewal_time: u32,
    pub rebinding_time: u32,
    pub lease_file: PathBuf,
    pub reservations: HashMap<HwAddr, Ipv4>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pidfile: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub loglevel: LogLevel,
    pub interfaces: BTreeMap<String, InterfaceConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut loader = Loader {
            primary: path.to_path_buf(),
            visited: HashSet::from([path.to_path_buf()]),
            pidfile: None,
            logfile: None,
            loglevel: LogLevel::default(),
            sections: Vec::new(),
            current: None,
        };
        loader.parse_file(path)?;
        loader.finish()
    }
}

#[derive(Debug, Default)]
struct InterfaceBuilder {
    network: Option<(Ipv4, u8)>,
    routers: Option<Ipv4>,
    server_id: Option<Ipv4>,
    dhcp_first: Option<Ipv4>,
    dhcp_last: Option<Ipv4>,
    dns_servers: Option<Vec<Ipv4>>,
    lease_time: Option<u32>,
    renewal_time: Option<u32>,
    rebinding_time: Option<u32>,
    lease_file: Option<PathBuf>,
    reservations: HashMap<HwAddr, Ipv4>,
    reserved_ips: HashSet<Ipv4>,
}

fn parse_address(key: &str, value: &str) -> Result<Ipv4> {
    match Ipv4::parse(value) {
        Some(ip) if !ip.is_unspecified() => Ok(ip),
        _ => Err(Error::Config(format!(
            "'{}' needs an IPv4 address, got '{}'",
            key, value
        ))),
    }
}

impl InterfaceBuilder {
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "network" => {
                let (addr, prefix) = value.split_once('/').ok_or_else(|| {
                    Error::Config("'network' must be specified with CIDR notation".to_string())
                })?;
                let network = parse_address(key, addr)?;
                let prefix: u8 = prefix.parse().ok().filter(|p| (1..=30).contains(p)).ok_or_else(
                    || Error::Config(format!("'network' has an invalid prefix length '{}'", prefix)),
                )?;
                self.network = Some((network, prefix));
            }
            "routers" => self.routers = Some(parse_address(key, value)?),
            "serverid" => self.server_id = Some(parse_address(key, value)?),
            "dhcp_first" => self.dhcp_first = Some(parse_address(key, value)?),
            "dhcp_last" => self.dhcp_last = Some(parse_address(key, value)?),
            "dns_servers" => {
                let mut servers = Vec::new();
                for part in value.split_whitespace() {
                    servers.push(parse_address(key, part)?);
                }
                if servers.is_empty() {
                    return Err(Error::Config(
                        "'dns_servers' needs at least one address".to_string(),
                    ));
                }
                self.dns_servers = Some(servers);
            }
            "lease_time" => {
                let seconds: u32 = value.parse().ok().filter(|&t| t > 0).ok_or_else(|| {
                    Error::Config(format!("'lease_time' must be a positive number of seconds, got '{}'", value))
                })?;
                self.lease_time = Some(seconds);
            }
            "renewal_time" => {
                let seconds: u32 = value.parse().map_err(|_| {
                    Error::Config(format!("'renewal_time' must be a number of seconds, got '{}'", value))
                })?;
                self.renewal_time = Some(seconds);
            }
            "rebinding_time" => {
                let seconds: u32 = value.parse().map_err(|_| {
                    Error::Config(format!("'rebinding_time' must be a number of seconds, got '{}'", value))
                })?;
                self.rebinding_time = Some(seconds);
            }
            "lease_file" => {
                if value.is_empty() {
                    return Err(Error::Config("'lease_file' needs a path".to_string()));
                }
                self.lease_file = Some(PathBuf::from(value));
            }
            "reserve" => {
                let (hw, ip) = value.split_once(char::is_whitespace).ok_or_else(|| {
                    Error::Config("'reserve' needs a hardware address and an IPv4 address".to_string())
                })?;
                let hw = HwAddr::parse(hw.trim()).ok_or_else(|| {
                    Error::Config(format!("'reserve' has an invalid hardware address '{}'", hw))
                })?;
                let ip = parse_address(key, ip.trim())?;
                if !self.reserved_ips.insert(ip) {
                    return Err(Error::Config(format!(
                        "address {} is reserved more than once",
                        ip
                    )));
                }
                if self.reservations.insert(hw, ip).is_some() {
                    return Err(Error::Config(format!(
                        "hardware address {} has more than one reservation",
                        hw
                    )));
                }
            }
            other => {
                return Err(Error::Config(format!("unknown config key '{}'", other)));
            }
        }
        Ok(())
    }

    fn finish(self, name: &str) -> Result<InterfaceConfig> {
        let missing = |key: &str| Error::Config(format!("interface {}: missing key '{}'", name, key));

        let (network, prefix) = self.network.ok_or_else(|| missing("network"))?;
        let routers = self.routers.ok_or_else(|| missing("routers"))?;
        let server_id = self.server_id.ok_or_else(|| missing("serverid"))?;
        let dhcp_first = self.dhcp_first.ok_or_else(|| missing("dhcp_first"))?;
        let dhcp_last = self.dhcp_last.ok_or_else(|| missing("dhcp_last"))?;
        let dns_servers = self.dns_servers.ok_or_else(|| missing("dns_servers"))?;
        let lease_time = self.lease_time.ok_or_else(|| missing("lease_time"))?;
        let lease_file = self.lease_file.ok_or_else(|| missing("lease_file"))?;

        if dhcp_first > dhcp_last {
            return Err(Error::Config(format!(
                "interface {}: dhcp_first {} is above dhcp_last {}",
                name, dhcp_first, dhcp_last
            )));
        }

        let renewal_time = self.renewal_time.unwrap_or(lease_time / 2);
        let rebinding_time = self
            .rebinding_time
            .unwrap_or((u64::from(lease_time) * 7 / 8) as u32);

        if renewal_time >= rebinding_time || rebinding_time >= lease_time {
            return Err(Error::Config(format!(
                "interface {}: timers must satisfy renewal_time < rebinding_time < lease_time \
                 (got {} / {} / {})",
                name, renewal_time, rebinding_time, lease_time
            )));
        }

        let mask = prefix_mask(prefix);
        let network_address = Ipv4(network.0 & mask);
        let broadcast = Ipv4(network_address.0 | !mask);
        for (&hw, &ip) in &self.reservations {
            let admissible = (ip.0 & mask) == network_address.0
                && ip != network_address
                && ip != broadcast
                && ip >= dhcp_first
                && ip <= dhcp_last;
            if !admissible {
                return Err(Error::Config(format!(
                    "interface {}: reservation {} -> {} is outside the allocatable range",
                    name, hw, ip
                )));
            }
        }

        Ok(InterfaceConfig {
            network,
            prefix,
            routers,
            server_id,
            dhcp_first,
            dhcp_last,
            dns_servers,
            lease_time,
            renewal_time,
            rebinding_time,
            lease_file,
            reservations: self.reservations,
        })
    }
}

struct Loader {
    primary: PathBuf,
    visited: HashSet<PathBuf>,
    pidfile: Option<PathBuf>,
    logfile: Option<PathBuf>,
    loglevel: LogLevel,
    sections: Vec<(String, InterfaceBuilder)>,
    current: Option<usize>,
}

impl Loader {
    fn parse_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("cannot read {}: {}", path.display(), err))
        })?;

        for (number, raw) in contents.lines().enumerate() {
            let line = match raw.find('#') {
                Some(position) => &raw[..position],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, rest)) => (key, rest.trim()),
                None => (line, ""),
            };

            self.handle_line(path, key, value).map_err(|err| match err {
                Error::Config(message) => Error::Config(format!(
                    "{}:{}: {}",
                    path.display(),
                    number + 1,
                    message
                )),
                other => other,
            })?;
        }

        Ok(())
    }

    fn handle_line(&mut self, _file: &Path, key: &str, value: &str) -> Result<()> {
        match key {
            "interface" => {
                if value.is_empty() {
                    return Err(Error::Config("'interface' needs a device name".to_string()));
                }
                let index = match self.sections.iter().position(|(name, _)| name == value) {
                    Some(index) => index,
                    None => {
                        self.sections
                            .push((value.to_string(), InterfaceBuilder::default()));
                        self.sections.len() - 1
                    }
                };
                self.current = Some(index);
            }
            "pidfile" => {
                if value.is_empty() {
                    return Err(Error::Config("'pidfile' needs a path".to_string()));
                }
                self.pidfile = Some(PathBuf::from(value));
            }
            "logfile" => {
                if value.is_empty() {
                    return Err(Error::Config("'logfile' needs a path".to_string()));
                }
                self.logfile = Some(PathBuf::from(value));
            }
            "loglevel" => {
                self.loglevel = LogLevel::parse(value).ok_or_else(|| {
                    Error::Config(format!(
                        "'loglevel' must be debug, info, warning or critical, got '{}'",
                        value
                    ))
                })?;
            }
            "include" => {
                let include = PathBuf::from(value);
                if !include.is_absolute() {
                    return Err(Error::Config(format!(
                        "'include' paths must be absolute, got '{}'",
                        value
                    )));
                }
                if include == self.primary {
                    return Err(Error::Config(
                        "'include' may not pull in the primary configuration file".to_string(),
                    ));
                }
                if !self.visited.insert(include.clone()) {
                    return Err(Error::Config(format!(
                        "{} is included more than once",
                        include.display()
                    )));
                }
                self.parse_file(&include)?;
            }
            _ => {
                let Some(index) = self.current else {
                    return Err(Error::Config(format!(
                        "'interface' must be defined before '{}'",
                        key
                    )));
                };
                self.sections[index].1.apply(key, value)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Config> {
        if self.sections.is_empty() {
            return Err(Error::Config("no interfaces configured".to_string()));
        }

        let mut interfaces = BTreeMap::new();
        for (name, builder) in self.sections {
            let interface = builder.finish(&name)?;
            interfaces.insert(name, interface);
        }

        Ok(Config {
            pidfile: self.pidfile,
            logfile: self.logfile,
            loglevel: self.loglevel,
            interfaces,
        })
    }
}
