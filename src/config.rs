//! Runtime configuration.
//!
//! Every process attaching to the same segment should use the same
//! `shm_key`, `shm_dir` and `system_size`; the remaining switches are
//! per-process except `request_queues`, which is stored in the segment
//! once any process enables it.
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::{Affinity, Config};
//!
//! let config = Config::new()
//!     .shm_key("job42")
//!     .system_size(64)
//!     .affinity(Affinity::NearbyOnly);
//!
//! // Or from CORELEND_* environment variables
//! let config = Config::from_env();
//! ```

use crate::cpuinfo::Affinity;
use crate::cpuset::MAX_CPUS;
use crate::policy::PolicyKind;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Directory holding the shared segment by default.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Default time to wait for a segment to become ready when attaching.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Environment variable prefix read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "CORELEND_";

/// Configuration for attaching to and operating on the CPU table.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Segment name suffix; `None` uses the current user id.
    pub shm_key: Option<String>,
    /// Directory in which the segment file lives.
    pub shm_dir: PathBuf,
    /// Number of CPUs on the node.
    pub system_size: usize,
    /// Queue unsatisfied acquires so freed CPUs are handed out automatically.
    pub request_queues: bool,
    /// Treat CPUs outside every registered mask as unavailable.
    pub respect_cpuset: bool,
    /// Leave a finalized owner's CPUs lent to everyone instead of disabling them.
    pub public_post_mortem: bool,
    /// Accumulate per-CPU idle/owned/guested times.
    pub cpu_stats: bool,
    /// How long `attach` waits for initialization and the segment lock.
    pub lock_timeout: Duration,
    /// Candidate ordering for count-based acquire and borrow.
    pub affinity: Affinity,
    /// Balancing policy variant.
    pub policy: PolicyKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_key: None,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            system_size: num_cpus::get().clamp(1, MAX_CPUS),
            request_queues: true,
            respect_cpuset: true,
            public_post_mortem: false,
            cpu_stats: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            affinity: Affinity::default(),
            policy: PolicyKind::default(),
        }
    }
}

impl Config {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment key.
    pub fn shm_key(mut self, key: impl Into<String>) -> Self {
        self.shm_key = Some(key.into());
        self
    }

    /// Set the segment directory.
    pub fn shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    /// Set the node size. Sizes outside `1..=MAX_CPUS` are rejected by
    /// [`crate::CpuTable::attach`].
    pub fn system_size(mut self, size: usize) -> Self {
        self.system_size = size;
        self
    }

    /// Enable or disable request queues.
    pub fn request_queues(mut self, enabled: bool) -> Self {
        self.request_queues = enabled;
        self
    }

    /// Enable or disable respecting process masks.
    pub fn respect_cpuset(mut self, enabled: bool) -> Self {
        self.respect_cpuset = enabled;
        self
    }

    /// Enable or disable post-mortem lending.
    pub fn public_post_mortem(mut self, enabled: bool) -> Self {
        self.public_post_mortem = enabled;
        self
    }

    /// Enable or disable CPU usage statistics.
    pub fn cpu_stats(mut self, enabled: bool) -> Self {
        self.cpu_stats = enabled;
        self
    }

    /// Set the attach timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the candidate affinity.
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// Set the policy variant.
    pub fn policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Key used in the segment file name.
    pub fn effective_key(&self) -> String {
        match &self.shm_key {
            Some(key) => key.clone(),
            None => rustix::process::getuid().as_raw().to_string(),
        }
    }

    /// Build a configuration from `CORELEND_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from `(name, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in vars {
            let Some(name) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "SHM_KEY" => config.shm_key = Some(value.to_string()),
                "SHM_DIR" => config.shm_dir = PathBuf::from(value),
                "SYSTEM_SIZE" => {
                    if let Some(size) = parse_var::<usize>(name, value) {
                        config = config.system_size(size);
                    }
                }
                "REQUEST_QUEUES" => set_flag(&mut config.request_queues, name, value),
                "RESPECT_CPUSET" => set_flag(&mut config.respect_cpuset, name, value),
                "PUBLIC_POST_MORTEM" => set_flag(&mut config.public_post_mortem, name, value),
                "CPU_STATS" => set_flag(&mut config.cpu_stats, name, value),
                "LOCK_TIMEOUT_MS" => {
                    if let Some(ms) = parse_var::<u64>(name, value) {
                        config.lock_timeout = Duration::from_millis(ms);
                    }
                }
                "AFFINITY" => {
                    if let Some(affinity) = parse_var::<Affinity>(name, value) {
                        config.affinity = affinity;
                    }
                }
                "POLICY" => {
                    if let Some(policy) = parse_var::<PolicyKind>(name, value) {
                        config.policy = policy;
                    }
                }
                _ => tracing::debug!(variable = %name, "ignoring unknown configuration variable"),
            }
        }
        config
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(
                variable = %name,
                value = %value,
                "invalid configuration value, keeping default"
            );
            None
        }
    }
}

fn set_flag(flag: &mut bool, name: &str, value: &str) {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => *flag = true,
        "0" | "no" | "false" | "off" => *flag = false,
        _ => tracing::warn!(
            variable = %name,
            value = %value,
            "invalid boolean, keeping default"
        ),
    }
}
