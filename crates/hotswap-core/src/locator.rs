//! Process locator
//!
//! Resolves the process a controller attaches to. An explicit pid string is
//! parsed directly; otherwise the locator asks its [`PidStrategy`] chain for
//! the calling process's own pid.

use hotswap_runtime::ManagedRuntime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Debug;

static RUNTIME_NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^([0-9]+)@.+$").ok());

/// Platform-specific way of discovering the current process's pid
pub trait PidStrategy: Send + Sync + Debug {
    /// Pid of the calling process, `None` if this strategy cannot tell
    fn current_pid(&self) -> Option<u32>;

    /// Strategy name (for logs and [`TargetProcess::resolved_by`])
    fn name(&self) -> &'static str;
}

/// Parses the pid out of the runtime's `<pid>@<host>` management name
#[derive(Debug, Clone, Default)]
pub struct RuntimeNameStrategy {
    name: Option<String>,
}

impl RuntimeNameStrategy {
    /// Read the name from the process-wide runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a fixed name instead
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl PidStrategy for RuntimeNameStrategy {
    fn current_pid(&self) -> Option<u32> {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| ManagedRuntime::global().management().name());
        let captures = RUNTIME_NAME.as_ref()?.captures(&name)?;
        parse_pid(captures.get(1)?.as_str()).ok()
    }

    fn name(&self) -> &'static str {
        "runtime-name"
    }
}

/// Reads the `/proc/self` symlink (Linux)
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsStrategy;

impl PidStrategy for ProcfsStrategy {
    #[cfg(target_os = "linux")]
    fn current_pid(&self) -> Option<u32> {
        let link = std::fs::read_link("/proc/self").ok()?;
        parse_pid(link.file_name()?.to_str()?).ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn current_pid(&self) -> Option<u32> {
        None
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

/// Asks the operating system directly
#[derive(Debug, Clone, Copy, Default)]
pub struct OsStrategy;

impl PidStrategy for OsStrategy {
    fn current_pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn name(&self) -> &'static str {
        "os"
    }
}

/// Resolved target of an attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProcess {
    pid: u32,
    is_self: bool,
    resolved_by: &'static str,
}

impl TargetProcess {
    #[inline]
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the target is the calling process
    #[inline]
    #[must_use]
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    /// Strategy that produced the pid, or `"explicit"`
    #[must_use]
    pub fn resolved_by(&self) -> &'static str {
        self.resolved_by
    }
}

/// Locator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    /// No strategy could determine the current pid
    #[error("no strategy could determine the current process id")]
    NoIdentifier,

    /// Explicit identifier is not a positive integer
    #[error("invalid process identifier `{0}`")]
    InvalidIdentifier(String),
}

/// Ordered chain of pid strategies
#[derive(Debug, Default)]
pub struct ProcessLocator {
    strategies: Vec<Box<dyn PidStrategy>>,
}

impl ProcessLocator {
    /// Locator with no strategies; self resolution always fails
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime name first, then procfs where available, then the OS
    #[must_use]
    pub fn platform_default() -> Self {
        let locator = Self::new().with_strategy(RuntimeNameStrategy::new());
        #[cfg(target_os = "linux")]
        let locator = locator.with_strategy(ProcfsStrategy);
        locator.with_strategy(OsStrategy)
    }

    /// Append a strategy to the chain
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl PidStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Resolve `target`, or the calling process when `None`
    ///
    /// # Errors
    /// - [`LocatorError::InvalidIdentifier`] for a malformed explicit pid
    /// - [`LocatorError::NoIdentifier`] when no strategy yields a pid
    pub fn locate(&self, target: Option<&str>) -> Result<TargetProcess, LocatorError> {
        if let Some(raw) = target {
            let pid = parse_pid(raw)?;
            return Ok(TargetProcess {
                pid,
                is_self: pid == std::process::id(),
                resolved_by: "explicit",
            });
        }

        for strategy in &self.strategies {
            if let Some(pid) = strategy.current_pid() {
                tracing::debug!(pid, strategy = strategy.name(), "resolved own pid");
                return Ok(TargetProcess {
                    pid,
                    is_self: true,
                    resolved_by: strategy.name(),
                });
            }
            tracing::debug!(strategy = strategy.name(), "strategy yielded no pid");
        }
        Err(LocatorError::NoIdentifier)
    }
}

/// Parse a positive decimal pid
///
/// # Errors
/// Returns [`LocatorError::InvalidIdentifier`] for anything else
pub fn parse_pid(raw: &str) -> Result<u32, LocatorError> {
    let trimmed = raw.trim();
    let invalid = || LocatorError::InvalidIdentifier(raw.to_string());
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match trimmed.parse::<u32>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(pid) => Ok(pid),
    }
}
