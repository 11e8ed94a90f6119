//! `HOST_CONFIG`: the human-editable host list behind the FSA.
//!
//! One host per line, colon separated, `#` starts a comment:
//!
//! ```text
//! alias:host1:host2:toggle:proxy:allowed_transfers:max_errors:retry_interval:block_size:transfer_timeout:protocol_options:host_status
//! ```
//!
//! Missing trailing fields take their defaults. The order of lines is the
//! order of hosts in the FSA.

use std::fmt::Write as _;
use std::path::Path;

use afd_config::log_status_warn;
use tracing::warn;

use crate::fsa::{HOST_DISABLED, PAUSE_QUEUE, STOP_TRANSFER};
use crate::{Result, StatusError};

pub const DEFAULT_ALLOWED_TRANSFERS: i32 = 2;
pub const DEFAULT_MAX_ERRORS: i32 = 10;
pub const DEFAULT_RETRY_INTERVAL: i32 = 120;
pub const DEFAULT_BLOCK_SIZE: i32 = 4096;
pub const DEFAULT_TRANSFER_TIMEOUT: i64 = 120;

/// Host alias length limit, not counting the terminating NUL
pub const MAX_HOSTNAME_LENGTH: usize = 8;

/// Status bits that survive a restart through HOST_CONFIG
pub const PERSISTENT_STATUS: u32 = PAUSE_QUEUE | STOP_TRANSFER | HOST_DISABLED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostToggle {
    /// Only the first real hostname is used
    #[default]
    None,
    /// Operator switches between the two hostnames
    Manual,
    /// Switch to the other hostname after a failed connect
    Auto,
}

impl HostToggle {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(HostToggle::None),
            "manual" => Some(HostToggle::Manual),
            "auto" => Some(HostToggle::Auto),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            HostToggle::None => "",
            HostToggle::Manual => "manual",
            HostToggle::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfigEntry {
    pub alias: String,
    pub real_hostname: [String; 2],
    pub toggle: HostToggle,
    pub proxy_name: String,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub transfer_timeout: i64,
    pub protocol_options: u32,
    pub host_status: u32,
}

impl HostConfigEntry {
    /// Entry with defaults; the real hostname is the alias
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            real_hostname: [alias.to_string(), String::new()],
            toggle: HostToggle::None,
            proxy_name: String::new(),
            allowed_transfers: DEFAULT_ALLOWED_TRANSFERS,
            max_errors: DEFAULT_MAX_ERRORS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            block_size: DEFAULT_BLOCK_SIZE,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            protocol_options: 0,
            host_status: 0,
        }
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.real_hostname[0] = hostname.to_string();
        self
    }

    fn parse_line(line: &str, lineno: usize) -> Result<Self> {
        let fields: Vec<&str> = line.split(':').map(str::trim).collect();
        let bad = |reason: String| StatusError::HostConfig {
            line: lineno,
            reason,
        };

        let alias = fields[0];
        if alias.is_empty() {
            return Err(bad("empty host alias".into()));
        }
        if alias.len() > MAX_HOSTNAME_LENGTH {
            return Err(bad(format!(
                "host alias {} longer than {} characters",
                alias, MAX_HOSTNAME_LENGTH
            )));
        }

        let mut entry = HostConfigEntry::new(alias);
        let field = |i: usize| fields.get(i).copied().unwrap_or("");

        if !field(1).is_empty() {
            entry.real_hostname[0] = field(1).to_string();
        }
        entry.real_hostname[1] = field(2).to_string();
        entry.toggle =
            HostToggle::parse(field(3)).ok_or_else(|| bad(format!("bad toggle {:?}", field(3))))?;
        entry.proxy_name = field(4).to_string();

        fn num<T: std::str::FromStr>(s: &str, default: T) -> std::result::Result<T, String> {
            if s.is_empty() {
                Ok(default)
            } else {
                s.parse().map_err(|_| format!("bad number {:?}", s))
            }
        }

        entry.allowed_transfers = num(field(5), DEFAULT_ALLOWED_TRANSFERS).map_err(&bad)?;
        if !(1..=crate::fsa::MAX_NO_PARALLEL_JOBS as i32).contains(&entry.allowed_transfers) {
            return Err(bad(format!(
                "allowed transfers {} outside 1..={}",
                entry.allowed_transfers,
                crate::fsa::MAX_NO_PARALLEL_JOBS
            )));
        }
        entry.max_errors = num(field(6), DEFAULT_MAX_ERRORS).map_err(&bad)?;
        entry.retry_interval = num(field(7), DEFAULT_RETRY_INTERVAL).map_err(&bad)?;
        entry.block_size = num(field(8), DEFAULT_BLOCK_SIZE).map_err(&bad)?;
        entry.transfer_timeout = num(field(9), DEFAULT_TRANSFER_TIMEOUT).map_err(&bad)?;
        entry.protocol_options = num(field(10), 0).map_err(&bad)?;
        entry.host_status = num::<u32>(field(11), 0).map_err(&bad)? & PERSISTENT_STATUS;
        Ok(entry)
    }

    fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.alias,
            self.real_hostname[0],
            self.real_hostname[1],
            self.toggle.as_str(),
            self.proxy_name,
            self.allowed_transfers,
            self.max_errors,
            self.retry_interval,
            self.block_size,
            self.transfer_timeout,
            self.protocol_options,
            self.host_status & PERSISTENT_STATUS
        )
    }
}

/// Parse HOST_CONFIG text. Malformed lines are logged and skipped.
pub fn parse(text: &str) -> Vec<HostConfigEntry> {
    let mut hosts: Vec<HostConfigEntry> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match HostConfigEntry::parse_line(line, i + 1) {
            Ok(entry) => {
                if hosts.iter().any(|h| h.alias == entry.alias) {
                    log_status_warn!("Duplicate host alias ignored", alias = entry.alias.as_str(), line = i + 1);
                    continue;
                }
                hosts.push(entry);
            }
            Err(e) => {
                warn!(error = %e, "Skipping HOST_CONFIG line");
            }
        }
    }
    hosts
}

/// Load HOST_CONFIG; a missing file is an empty host list
pub fn load(path: &Path) -> Result<Vec<HostConfigEntry>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn render(hosts: &[HostConfigEntry]) -> String {
    let mut out = String::from(
        "# alias:host1:host2:toggle:proxy:allowed_transfers:max_errors:retry_interval:block_size:transfer_timeout:protocol_options:host_status\n",
    );
    for host in hosts {
        let _ = writeln!(out, "{}", host.to_line());
    }
    out
}

/// Write HOST_CONFIG atomically (temp file + rename)
pub fn write(path: &Path, hosts: &[HostConfigEntry]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, render(hosts))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
