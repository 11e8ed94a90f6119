//! # afd-cli
//!
//! Operator commands for a running AFD: start it, stop it, look at its
//! hosts and directories and steer individual hosts.

pub mod control;
pub mod host;
pub mod status;

/// Process exit codes of `afd`
pub mod exit {
    pub const SUCCESS: u8 = 0;
    pub const INCORRECT: u8 = 1;
    /// No AFD holds the active lock
    pub const NO_ACTIVE_AFD: u8 = 2;
}

use std::time::Duration;

use afd_config::Config;

/// How long to wait for the AFD to answer
pub fn response_time(config: &Config) -> Duration {
    Duration::from_secs(config.afd.default_response_time.max(1))
}
