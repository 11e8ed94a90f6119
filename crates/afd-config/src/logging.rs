//! Structured logging utilities for AFD components.
//!
//! Provides consistent logging with component prefixes and structured fields,
//! plus the AFD sign set used in the audit text logs.
//!
//! # Usage
//!
//! ```ignore
//! use afd_config::logging::*;
//!
//! log_amg_info!("Directory scanned", dir_id = 0x1f2e3d4c_u32, files = 3);
//! log_fd_warn!("Transfer failed", host = "h1");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const AFD: &'static str = "AFD";
    pub const AMG: &'static str = "AMG";
    pub const FD: &'static str = "FD";
    pub const CATALOG: &'static str = "CATALOG";
    pub const STATUS: &'static str = "STATUS";
    pub const LOG: &'static str = "LOG";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Severity sign written into AFD text logs (`<I>`, `<W>`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Info,
    Debug,
    Config,
    Warn,
    Error,
    Fatal,
    /// Error whose notification is suppressed by a declared outage window
    ErrorOffline,
}

impl Sign {
    pub fn as_char(&self) -> char {
        match self {
            Sign::Info => 'I',
            Sign::Debug => 'D',
            Sign::Config => 'C',
            Sign::Warn => 'W',
            Sign::Error => 'E',
            Sign::Fatal => 'F',
            Sign::ErrorOffline => 'O',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'I' => Sign::Info,
            'D' => Sign::Debug,
            'C' => Sign::Config,
            'W' => Sign::Warn,
            'E' => Sign::Error,
            'F' => Sign::Fatal,
            'O' => Sign::ErrorOffline,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Sign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.as_char())
    }
}

// === AFD (supervisor) logging macros ===

#[macro_export]
macro_rules! log_afd_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "AFD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_afd_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "AFD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_afd_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "AFD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_afd_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "AFD", $($key = $value,)* $msg)
    };
}

// === AMG logging macros ===

#[macro_export]
macro_rules! log_amg_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "AMG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_amg_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "AMG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_amg_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "AMG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_amg_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "AMG", $($key = $value,)* $msg)
    };
}

// === FD logging macros ===

#[macro_export]
macro_rules! log_fd_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FD", $($key = $value,)* $msg)
    };
}

// === CATALOG logging macros ===

#[macro_export]
macro_rules! log_catalog_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CATALOG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_catalog_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CATALOG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_catalog_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CATALOG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_catalog_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CATALOG", $($key = $value,)* $msg)
    };
}

// === STATUS logging macros ===

#[macro_export]
macro_rules! log_status_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STATUS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_status_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "STATUS", $($key = $value,)* $msg)
    };
}

// === LOG pipeline macros ===

#[macro_export]
macro_rules! log_pipeline_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "LOG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_pipeline_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOG", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `AFD_LOG` wins over `RUST_LOG`, which wins over `level`.
pub fn init_logging(level: LogLevel) {
    init_logging_with(level.as_filter())
}

/// Same as [`init_logging`] with a free-form default filter string.
pub fn init_logging_with(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("AFD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Timestamp prefix of AFD text log lines (`dd mm HH:MM:SS`)
pub fn log_timestamp(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%d %m %H:%M:%S").to_string()
}
