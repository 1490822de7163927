use std::str::FromStr;
use std::time::Duration;

/// When the runtime state of an execution is written to its record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// After every completed step; a crash repeats at most the in-flight step
    #[default]
    EveryStep,
    /// After every N completed steps
    EveryNSteps(u32),
    /// Only when the loop parks for a pause and at finalize
    FinalizeOnly,
}

impl SnapshotPolicy {
    /// Whether a snapshot is due after `completed_since_last` steps
    pub fn is_due(&self, completed_since_last: u32) -> bool {
        match self {
            Self::EveryStep => completed_since_last >= 1,
            Self::EveryNSteps(n) => completed_since_last >= (*n).max(1),
            Self::FinalizeOnly => false,
        }
    }
}

impl FromStr for SnapshotPolicy {
    type Err = String;

    /// Accepts `every_step`, `every:N` and `finalize_only`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "every_step" => Ok(Self::EveryStep),
            "finalize_only" => Ok(Self::FinalizeOnly),
            other => other
                .strip_prefix("every:")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(Self::EveryNSteps)
                .ok_or_else(|| format!("invalid snapshot policy '{}'", other)),
        }
    }
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each broadcast topic
    pub event_buffer_size: usize,
    /// Capacity of each worker's command inbox
    pub command_buffer_size: usize,
    /// How long a finished worker keeps answering `get_state` before exiting
    pub idle_timeout: Duration,
    /// Crashes tolerated per execution before it is marked failed
    pub max_restarts: u32,
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            command_buffer_size: 64,
            idle_timeout: Duration::from_secs(30),
            max_restarts: 3,
            snapshot_policy: SnapshotPolicy::EveryStep,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FLOW_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse("FLOW_EVENT_BUFFER") {
            config.event_buffer_size = n;
        }
        if let Some(n) = env_parse("FLOW_COMMAND_BUFFER") {
            config.command_buffer_size = n;
        }
        if let Some(ms) = env_parse("FLOW_IDLE_TIMEOUT_MS") {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("FLOW_MAX_RESTARTS") {
            config.max_restarts = n;
        }
        if let Some(policy) = env_parse("FLOW_SNAPSHOT_POLICY") {
            config.snapshot_policy = policy;
        }
        config
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
