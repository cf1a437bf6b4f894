//! Management surface
//!
//! Self-description of the running runtime. The `name` follows the
//! `<pid>@<host>` convention; controllers parse the pid out of it.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Self-description of a runtime instance
#[derive(Debug, Clone)]
pub struct RuntimeManagement {
    pid: u32,
    host: String,
    started_at: DateTime<Utc>,
}

impl RuntimeManagement {
    pub(crate) fn detect() -> Self {
        Self {
            pid: std::process::id(),
            host: detect_host(),
            started_at: Utc::now(),
        }
    }

    /// `<pid>@<host>`
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}@{}", self.pid, self.host)
    }

    /// Host name part of [`RuntimeManagement::name`]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// When the runtime was created
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the runtime was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Runtime implementation version
    #[must_use]
    pub fn version(&self) -> &'static str {
        crate::VERSION
    }
}

fn detect_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
