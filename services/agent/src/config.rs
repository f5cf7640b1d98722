//! Agent configuration.
//!
//! Flags come from the environment (`SKIFF_*` variables) or are built
//! programmatically by tests. Durations are given in seconds.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use skiff_messages::{Attributes, SlaveInfo};
use skiff_resources::Resources;

use crate::system::SystemResources;

/// How many torn-down frameworks the agent remembers for inspection.
pub const MAX_COMPLETED_FRAMEWORKS: usize = 50;

/// How many completed executors each framework remembers.
pub const MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK: usize = 150;

/// How many completed tasks each executor remembers.
pub const MAX_COMPLETED_TASKS_PER_EXECUTOR: usize = 200;

/// What to do with checkpointed state found at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Reconnect to executors that survived the restart.
    Reconnect,
    /// Shut every recovered executor down.
    Cleanup,
}

impl std::str::FromStr for RecoveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconnect" => Ok(RecoveryMode::Reconnect),
            "cleanup" => Ok(RecoveryMode::Cleanup),
            other => bail!("unknown recovery mode {other:?} (expected reconnect|cleanup)"),
        }
    }
}

/// The agent's recognised options.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Advertised resource bundle. Autodetected when absent.
    pub resources: Option<Resources>,

    /// Static key=value labels.
    pub attributes: Attributes,

    /// Advertised hostname.
    pub hostname: String,

    /// Root of executor sandboxes; checkpoints live under `meta/`.
    pub work_dir: PathBuf,

    /// Enable durable logging. Per-framework opt-in is authoritative for
    /// framework state; this gates the agent's own checkpoints and
    /// whether recovery runs at all.
    pub checkpoint: bool,

    /// Recovery policy at startup.
    pub recover: RecoveryMode,

    /// Treat recovery and durable-log errors as fatal.
    pub strict: bool,

    /// How long a launched executor may take to register.
    pub executor_registration_timeout: Duration,

    /// Grace between the soft shutdown message and the forced destroy.
    pub executor_shutdown_grace_period: Duration,

    /// How long recovered executors may take to re-register.
    pub executor_reregistration_timeout: Duration,

    /// How long sandboxes linger before garbage collection.
    pub gc_delay: Duration,

    /// Disk-usage probe period.
    pub disk_watch_interval: Duration,

    /// Base interval for status-update retransmission backoff.
    pub status_update_retry_interval: Duration,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            resources: None,
            attributes: Attributes::new(),
            hostname: "localhost".to_string(),
            work_dir: PathBuf::from("/tmp/skiff"),
            checkpoint: true,
            recover: RecoveryMode::Reconnect,
            strict: false,
            executor_registration_timeout: Duration::from_secs(60),
            executor_shutdown_grace_period: Duration::from_secs(5),
            executor_reregistration_timeout: Duration::from_secs(10),
            gc_delay: Duration::from_secs(7 * 24 * 60 * 60),
            disk_watch_interval: Duration::from_secs(60),
            status_update_retry_interval: Duration::from_secs(10),
        }
    }
}

impl Flags {
    pub fn from_env() -> Result<Self> {
        let mut flags = Flags::default();

        if let Ok(value) = std::env::var("SKIFF_RESOURCES") {
            flags.resources =
                Some(Resources::parse(&value).context("parsing SKIFF_RESOURCES")?);
        }

        if let Ok(value) = std::env::var("SKIFF_ATTRIBUTES") {
            flags.attributes = parse_attributes(&value)?;
        }

        if let Ok(value) = std::env::var("SKIFF_HOSTNAME") {
            flags.hostname = value;
        }

        if let Ok(value) = std::env::var("SKIFF_WORK_DIR") {
            flags.work_dir = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("SKIFF_CHECKPOINT") {
            flags.checkpoint = value == "1" || value.eq_ignore_ascii_case("true");
        }

        if let Ok(value) = std::env::var("SKIFF_RECOVER") {
            flags.recover = value.parse()?;
        }

        if let Ok(value) = std::env::var("SKIFF_STRICT") {
            flags.strict = value == "1" || value.eq_ignore_ascii_case("true");
        }

        for (var, field) in [
            (
                "SKIFF_EXECUTOR_REGISTRATION_TIMEOUT_SECS",
                &mut flags.executor_registration_timeout,
            ),
            (
                "SKIFF_EXECUTOR_SHUTDOWN_GRACE_PERIOD_SECS",
                &mut flags.executor_shutdown_grace_period,
            ),
            (
                "SKIFF_EXECUTOR_REREGISTRATION_TIMEOUT_SECS",
                &mut flags.executor_reregistration_timeout,
            ),
            ("SKIFF_GC_DELAY_SECS", &mut flags.gc_delay),
            ("SKIFF_DISK_WATCH_INTERVAL_SECS", &mut flags.disk_watch_interval),
            (
                "SKIFF_STATUS_UPDATE_RETRY_INTERVAL_SECS",
                &mut flags.status_update_retry_interval,
            ),
        ] {
            if let Ok(value) = std::env::var(var) {
                let secs: u64 = value.parse().with_context(|| format!("parsing {var}"))?;
                *field = Duration::from_secs(secs);
            }
        }

        Ok(flags)
    }

    /// Root of checkpointed state.
    pub fn meta_dir(&self) -> PathBuf {
        self.work_dir.join("meta")
    }

    /// The advertised bundle: the flag if given, else autodetected.
    pub fn advertised_resources(&self) -> Resources {
        self.resources
            .clone()
            .unwrap_or_else(|| SystemResources::measure().to_resources())
    }

    /// The slave description announced to the master.
    pub fn slave_info(&self) -> SlaveInfo {
        SlaveInfo {
            hostname: self.hostname.clone(),
            resources: self.advertised_resources(),
            attributes: self.attributes.clone(),
            checkpoint: self.checkpoint,
        }
    }
}

/// Parses `key=value;key2=value2` attribute lists.
pub fn parse_attributes(input: &str) -> Result<Attributes> {
    let mut attributes = Attributes::new();
    for segment in input.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some((key, value)) = segment.split_once('=') else {
            bail!("invalid attribute {segment:?} (expected key=value)");
        };
        attributes.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let flags = Flags::default();
        assert_eq!(flags.recover, RecoveryMode::Reconnect);
        assert!(flags.checkpoint);
        assert!(!flags.strict);
        assert_eq!(flags.executor_registration_timeout, Duration::from_secs(60));
        assert_eq!(flags.meta_dir(), PathBuf::from("/tmp/skiff/meta"));
    }

    #[test]
    fn test_recovery_mode_parse() {
        assert_eq!(
            "reconnect".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::Reconnect
        );
        assert_eq!(
            "cleanup".parse::<RecoveryMode>().unwrap(),
            RecoveryMode::Cleanup
        );
        assert!("restore".parse::<RecoveryMode>().is_err());
    }

    #[test]
    fn test_parse_attributes() {
        let attributes = parse_attributes("rack=r1; zone=z2").unwrap();
        assert_eq!(attributes.get("rack").map(String::as_str), Some("r1"));
        assert_eq!(attributes.get("zone").map(String::as_str), Some("z2"));
        assert!(parse_attributes("rack").is_err());
    }

    #[test]
    fn test_advertised_resources_prefers_flag() {
        let flags = Flags {
            resources: Some(Resources::parse("cpus:2;mem:512").unwrap()),
            ..Flags::default()
        };
        assert_eq!(flags.advertised_resources().scalar("cpus"), Some(2.0));
    }
}
