//! # Procheck - Instance-Domain Conformance Checker
//!
//! An external conformance client for process-indexed metrics agents. It
//! resolves a requested set of metrics, inspects their shared instance
//! domain, enumerates the live instances, and verifies that instance
//! identity, name encoding, profile-restricted fetching, and write
//! rejection are mutually consistent - while tolerating the natural
//! lifecycle of the domain (processes appear and vanish at any time).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                          PROCHECK DRIVER                               │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │  NAME FORMAT → RESOLVE → SNAPSHOT → PROBE WAIT → CONSISTENCY PASSES    │
//! │             → PROFILE/FETCH ROUNDS → WRITE REJECTION                   │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Checks
//!
//! - **Name format**: instance names must encode their numeric id, either
//!   fixed-width zero-padded or plain decimal, derived once per run
//! - **Round-trips**: id→name and name→id lookups must agree with the
//!   snapshot, except for instances that verifiably died in between
//! - **Profiles**: a fetch never leaks an instance outside the active
//!   server-side filter
//! - **Write rejection**: storing a fetched result back must be refused
//!   with a permission-class error
//!
//! Every check is fail-fast: the first violation aborts the run with a
//! diagnostic naming the instance or metric involved, and a non-zero exit
//! status.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::sleep;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{anyhow, Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Process Identity
// ----------------------------------------------------------------------------
use nix::unistd::{getpid, getppid};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the checker.
// ============================================================================

/// Checker version - follows semantic versioning
pub const CHECKER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CHECKER_NAME: &str = "procheck";
pub const CHECKER_FULL_NAME: &str = "Procheck Conformance Checker";

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Default Unix socket path for the metrics agent
pub const DEFAULT_AGENT_SOCKET: &str = "/tmp/procheck-agent.sock";

/// Default root of the process enumeration source
pub const DEFAULT_PROCFS_ROOT: &str = "/proc";

/// Default agent refresh interval assumption (seconds)
pub const DEFAULT_REFRESH_SECS: u64 = 1;

/// Default number of restricted-profile fetch rounds
pub const DEFAULT_FETCH_ITERATIONS: u32 = 1;

// ----------------------------------------------------------------------------
// Limits
// ----------------------------------------------------------------------------

/// Maximum number of metrics accepted for a single run
pub const MAX_REQUESTED_METRICS: usize = 1024;

/// Size of the restricted profile: own process id and parent process id
pub const RESTRICTED_PROFILE_SIZE: usize = 2;

// ----------------------------------------------------------------------------
// Metric Families
// ----------------------------------------------------------------------------

/// Prefix of the always-on process metric family
pub const PROC_METRIC_PREFIX: &str = "proc.";

/// Prefix of the sampled "hot" process metric family
pub const HOTPROC_METRIC_PREFIX: &str = "hotproc.";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data types that flow through the checker. Identity types are opaque
// newtypes; snapshots and fetch results are immutable once captured.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Identity Types
// ----------------------------------------------------------------------------

/// Opaque metric identifier assigned by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct MetricId(u32);

impl MetricId {
    /// Raw numeric form, for diagnostics only.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MetricId {
    fn from(raw: u32) -> Self {
        MetricId(raw)
    }
}

/// Opaque instance-domain identifier assigned by the agent.
///
/// A descriptor that is not measured per-instance carries no domain at all
/// (`Option::None` at the descriptor level); there is no in-band sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct InstanceDomainId(u32);

impl InstanceDomainId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Display for InstanceDomainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceDomainId {
    fn from(raw: u32) -> Self {
        InstanceDomainId(raw)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Descriptors
// ----------------------------------------------------------------------------

/// Resolved descriptor for one requested metric. Immutable after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Requested metric name
    pub name: String,
    /// Agent-assigned identifier
    pub id: MetricId,
    /// Instance domain the metric is measured over, if any
    pub domain: Option<InstanceDomainId>,
}

// ----------------------------------------------------------------------------
// 3.3 Instances & Snapshots
// ----------------------------------------------------------------------------

/// One member of an instance domain: a live process, as the agent saw it.
///
/// Instances are server-owned and dynamic; the checker only ever observes
/// them, it never creates or mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Numeric instance id (the process id)
    pub id: u32,
    /// Instance name; encodes the id, optionally followed by a label
    pub name: CompactString,
}

/// Point-in-time enumeration of an instance domain.
///
/// Immutable once taken, and possibly already stale relative to the live
/// system by the time it is used - the consistency passes tolerate that.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    /// Domain the snapshot was taken from
    pub domain: InstanceDomainId,
    /// Capture time
    pub taken_at: DateTime<Utc>,
    /// Ordered (id, name) entries as returned by the agent
    pub instances: Vec<Instance>,
}

impl InstanceSnapshot {
    /// Instance ids in snapshot order.
    pub fn ids(&self) -> Vec<u32> {
        self.instances.iter().map(|inst| inst.id).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 3.4 Fetched Values
// ----------------------------------------------------------------------------

/// A single metric value. The checker treats values as opaque payloads;
/// only the instance ids they are attached to are ever validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Unsigned(v) => write!(f, "{}", v),
            MetricValue::Signed(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Value for one instance of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceValue {
    /// Instance the value belongs to
    pub instance: u32,
    /// The value itself
    pub value: MetricValue,
}

/// All values returned for one metric in one fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSet {
    /// Metric the set belongs to
    pub metric: MetricId,
    /// One entry per instance selected by the active profile and alive
    pub values: Vec<InstanceValue>,
}

/// Result of one fetch round. Transient: inspected, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Fetch time as reported by the checker
    pub taken_at: DateTime<Utc>,
    /// One value set per requested metric, in request order
    pub sets: Vec<ValueSet>,
}

impl FetchResult {
    /// Total number of (instance, value) pairs across all sets.
    pub fn value_count(&self) -> usize {
        self.sets.iter().map(|set| set.values.len()).sum()
    }
}

// ----------------------------------------------------------------------------
// 3.5 Metric Families
// ----------------------------------------------------------------------------

/// The two process metric families the checker understands.
///
/// The family decides two externally-supplied facts: whether the agent's
/// write path exists for these metrics at all, and whether the agent
/// refreshes its instance list on a timer (and therefore needs a settle
/// delay before the snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricFamily {
    /// `proc.` - every live process, writes are refused with a permission error
    Process,
    /// `hotproc.` - sampled active subset, no write path
    HotProcess,
}

impl MetricFamily {
    /// Classify a requested metric list into one family.
    ///
    /// Mixing families, or naming a metric outside both, is fatal: the
    /// whole run operates on one agent and one instance domain.
    pub fn classify(names: &[String]) -> CheckResult<Self> {
        if names.is_empty() {
            return Err(CheckError::Precondition(
                "at least one metric must be requested".into(),
            ));
        }

        let mut family: Option<MetricFamily> = None;
        for name in names {
            let this = if name.starts_with(HOTPROC_METRIC_PREFIX) {
                MetricFamily::HotProcess
            } else if name.starts_with(PROC_METRIC_PREFIX) {
                MetricFamily::Process
            } else {
                return Err(CheckError::Family(format!(
                    "metric '{}' is outside the {} and {} families",
                    name, PROC_METRIC_PREFIX, HOTPROC_METRIC_PREFIX
                )));
            };

            match family {
                None => family = Some(this),
                Some(seen) if seen != this => {
                    return Err(CheckError::Family(format!(
                        "metric '{}' mixes families: all requested metrics \
                         must come from one of {} or {}",
                        name, PROC_METRIC_PREFIX, HOTPROC_METRIC_PREFIX
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(family.expect("non-empty metric list always yields a family"))
    }

    /// Whether the agent exposes a (refusing) write path for this family.
    pub fn supports_writes(self) -> bool {
        matches!(self, MetricFamily::Process)
    }

    /// Whether the agent needs time to refresh its active list before a
    /// snapshot can include a freshly spawned process.
    pub fn needs_refresh_delay(self) -> bool {
        matches!(self, MetricFamily::HotProcess)
    }
}

impl Display for MetricFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricFamily::Process => write!(f, "proc"),
            MetricFamily::HotProcess => write!(f, "hotproc"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Run Summary
// ----------------------------------------------------------------------------

/// Outcome of a completed conformance run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    /// Checks that ran and passed
    pub checks_passed: u32,
    /// Tolerated irregularities (e.g. restricted fetch returning fewer
    /// instances than profiled)
    pub warnings: u32,
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Two layers: AgentError for the transport/service boundary, CheckError for
// the conformance verdicts. Every CheckError is fatal - the run is fail-fast
// and never aggregates violations.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Agent Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the metrics agent or its transport.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Typed "instance not found" signal. The one error class that is
    /// expected and tolerated in specific consistency-pass situations.
    #[error("instance not found")]
    InstanceNotFound,

    /// The agent refused the operation with its own permission error.
    #[error("operation not permitted by agent")]
    PermissionDenied,

    /// The agent refused the operation with a POSIX-style access error.
    #[error("access denied")]
    AccessDenied,

    /// The connection to the agent failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The agent answered with something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Any other agent-reported failure.
    #[error("agent error ({code:?}): {message}")]
    Agent { code: AgentErrorCode, message: String },
}

impl AgentError {
    /// The tolerated not-found signal, as opposed to every other failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::InstanceNotFound)
    }

    /// Whether this is one of the two acceptable write-rejection classes.
    pub fn is_permission_class(&self) -> bool {
        matches!(self, AgentError::PermissionDenied | AgentError::AccessDenied)
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Check Errors
// ----------------------------------------------------------------------------

/// The main error type of the checker. Every variant is fatal: the first
/// violation terminates the run with a non-zero exit status.
#[derive(Error, Debug)]
pub enum CheckError {
    /// The process enumeration source produced nothing - no checks are
    /// possible at all. Distinct from agent failures.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// One or more requested metric names are unknown to the agent.
    #[error("unknown metrics: {}", unknown.join(", "))]
    NameResolution { unknown: Vec<String> },

    /// Descriptor retrieval failed at the transport level.
    #[error("descriptor lookup failed: {0}")]
    DescriptorLookup(AgentError),

    /// The first requested metric is not measured over any instance domain.
    #[error("metric '{metric}' has no instance domain")]
    NullInstanceDomain { metric: String },

    /// Two requested metrics disagree about their instance domain.
    #[error(
        "metric '{metric}' reports instance domain {got}, but '{first_metric}' \
         reports {expected}; all requested metrics must share one instance domain"
    )]
    DescriptorMismatch {
        metric: String,
        got: String,
        first_metric: String,
        expected: InstanceDomainId,
    },

    /// An id/name round-trip over the snapshot broke.
    #[error("instance consistency violation for ({id}, \"{name}\"): {detail}")]
    Consistency { id: u32, name: String, detail: String },

    /// A fetch returned an instance outside the active profile.
    #[error("profile violation: metric '{metric}' returned instance {instance} outside the active profile")]
    Profile { metric: String, instance: u32 },

    /// The write path did not reject the way it must.
    #[error("expected the store to be rejected with a permission-class error, but {outcome}")]
    ExpectedFailureNotRaised { outcome: String },

    /// The requested metrics do not form one supported family.
    #[error("metric family error: {0}")]
    Family(String),

    /// Any other agent failure; always fatal, never retried.
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CheckError {
    /// Error category for structured logging.
    pub fn category(&self) -> &'static str {
        match self {
            CheckError::Precondition(_) => "precondition",
            CheckError::NameResolution { .. } => "resolution",
            CheckError::DescriptorLookup(_) => "descriptor",
            CheckError::NullInstanceDomain { .. } => "descriptor",
            CheckError::DescriptorMismatch { .. } => "descriptor",
            CheckError::Consistency { .. } => "consistency",
            CheckError::Profile { .. } => "profile",
            CheckError::ExpectedFailureNotRaised { .. } => "store",
            CheckError::Family(_) => "family",
            CheckError::Agent(_) => "agent",
            CheckError::Config(_) => "config",
            CheckError::Io(_) => "io",
            CheckError::Internal(_) => "internal",
        }
    }
}

/// Convenience alias used throughout the checker.
pub type CheckResult<T> = Result<T, CheckError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with environment overrides, validation, and a
// generate-default path. CLI flags override individual fields afterwards.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// How to reach the metrics agent
    #[serde(default)]
    pub agent: AgentConfig,

    /// Run parameters
    #[serde(default)]
    pub run: RunConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            run: RunConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CheckerConfig {
    /// Load configuration from file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROCHECK_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing).
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Render a default configuration file.
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Agent Connection Configuration
// ----------------------------------------------------------------------------

/// Where the metrics agent listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unix socket path of the agent
    #[serde(default = "default_agent_socket")]
    pub socket: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket: default_agent_socket(),
        }
    }
}

fn default_agent_socket() -> PathBuf {
    PathBuf::from(DEFAULT_AGENT_SOCKET)
}

// ----------------------------------------------------------------------------
// 5.3 Run Configuration
// ----------------------------------------------------------------------------

/// Parameters of a single conformance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root of the process enumeration source used to derive the name format
    #[serde(default = "default_procfs_root")]
    pub procfs_root: PathBuf,

    /// Agent refresh interval assumption in seconds; the probe lifetime is
    /// sized to span two of these
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Number of restricted-profile fetch rounds
    #[serde(default = "default_fetch_iterations")]
    pub iterations: u32,

    /// Upper bound on the number of requested metrics
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            procfs_root: default_procfs_root(),
            refresh_secs: default_refresh_secs(),
            iterations: default_fetch_iterations(),
            max_metrics: default_max_metrics(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_secs == 0 {
            return Err(ConfigError::invalid_value(
                "run.refresh_secs",
                "refresh interval must be at least 1 second",
            ));
        }
        if self.iterations == 0 {
            return Err(ConfigError::invalid_value(
                "run.iterations",
                "at least one fetch round is required",
            ));
        }
        if self.max_metrics == 0 {
            return Err(ConfigError::invalid_value(
                "run.max_metrics",
                "metric limit must be at least 1",
            ));
        }
        Ok(())
    }

    /// Probe lifetime: spans at least two agent refresh intervals.
    pub fn probe_lifetime(&self) -> Duration {
        Duration::from_secs(2 * self.refresh_secs + 1)
    }

    /// Settle delay for timer-refreshed families.
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(2 * self.refresh_secs)
    }
}

fn default_procfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROCFS_ROOT)
}

fn default_refresh_secs() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_fetch_iterations() -> u32 {
    DEFAULT_FETCH_ITERATIONS
}

fn default_max_metrics() -> usize {
    MAX_REQUESTED_METRICS
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for the pretty/compact formats
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source file/line in log output
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "pretty" | "compact" | "json" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}' (expected pretty, compact or json)", other),
            )),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & CHECK REPORTING
// ============================================================================
// tracing-based logging plus the structured per-check report lines that a
// downstream script greps: one line per check under the `procheck::check`
// target with `check` and `outcome` fields.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration.
pub fn init_logging(config: &LoggingConfig) -> CheckResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CheckError::Internal(format!("failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CheckError::Internal(format!("failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CheckError::Internal(format!("failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "procheck::init",
        level = %config.level,
        format = %config.format,
        "logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Check Reporter
// ----------------------------------------------------------------------------

/// Emits one structured line per check and keeps the pass count.
///
/// The line format is stable: target `procheck::check`, fields `check` and
/// `outcome` (`pass` or `fail`, with skipped checks reported by the driver
/// as `skip`). Downstream scripts key off these fields.
#[derive(Debug, Default)]
struct CheckReporter {
    passed: u32,
}

impl CheckReporter {
    /// Record a check result: log it and pass the value (or error) through.
    fn record<T>(&mut self, check: &'static str, result: CheckResult<T>) -> CheckResult<T> {
        match result {
            Ok(value) => {
                self.passed += 1;
                info!(target: "procheck::check", check, outcome = "pass");
                Ok(value)
            }
            Err(err) => {
                error!(
                    target: "procheck::check",
                    check,
                    outcome = "fail",
                    category = err.category(),
                    error = %err,
                );
                Err(err)
            }
        }
    }
}

// ============================================================================
// SECTION 7: METRICS AGENT INTERFACE & TRANSPORT
// ============================================================================
// The opaque remote capability the checker verifies against, expressed as an
// async trait, plus one concrete conformant transport: newline-delimited
// JSON frames over a Unix domain socket. Any other implementation of the
// trait (a different IPC, an in-memory fake) is equally valid - the checks
// only depend on the contracts below.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Agent Capability Trait
// ----------------------------------------------------------------------------

/// The operations the checker consumes from the metrics agent.
///
/// All calls are awaited to completion before the next one is issued; the
/// checker never retries and never applies a client-side timeout. The
/// session behind the trait (connection state and the active profile) is
/// owned exclusively by one driver for the duration of a run and must be
/// released with [`MetricsAgent::close`] on every exit path.
#[async_trait]
pub trait MetricsAgent: Send {
    /// Resolve metric names to identifiers, batched. Unknown names come
    /// back as `None` rather than failing the whole batch.
    async fn lookup_names(&mut self, names: &[String]) -> Result<Vec<Option<MetricId>>, AgentError>;

    /// Fetch descriptors for previously resolved identifiers, batched.
    async fn lookup_descriptors(
        &mut self,
        ids: &[MetricId],
    ) -> Result<Vec<MetricDescriptor>, AgentError>;

    /// Enumerate all current instances of a domain, in agent order.
    async fn instances(&mut self, domain: InstanceDomainId) -> Result<Vec<Instance>, AgentError>;

    /// Map an instance name to its id. Returns the typed not-found error
    /// when the instance no longer exists.
    async fn lookup_instance_by_name(
        &mut self,
        domain: InstanceDomainId,
        name: &str,
    ) -> Result<u32, AgentError>;

    /// Map an instance id to its name. Returns the typed not-found error
    /// when the instance no longer exists.
    async fn lookup_instance_by_id(
        &mut self,
        domain: InstanceDomainId,
        id: u32,
    ) -> Result<String, AgentError>;

    /// Drop the session's instance filter for a domain.
    async fn clear_profile(&mut self, domain: InstanceDomainId) -> Result<(), AgentError>;

    /// Add instances to the session's filter for a domain.
    async fn extend_profile(
        &mut self,
        domain: InstanceDomainId,
        ids: &[u32],
    ) -> Result<(), AgentError>;

    /// Fetch current values for the given metrics, filtered by the active
    /// profile.
    async fn fetch(&mut self, ids: &[MetricId]) -> Result<FetchResult, AgentError>;

    /// Write a previously fetched result back. Conformant agents refuse
    /// this with a permission-class error.
    async fn store(&mut self, result: &FetchResult) -> Result<(), AgentError>;

    /// Release the session. Idempotence is not required; the driver calls
    /// this exactly once per run.
    async fn close(&mut self) -> Result<(), AgentError>;

    /// Replace the session's filter with exactly `ids`: destructive
    /// delete-then-add, never additive.
    async fn replace_profile(
        &mut self,
        domain: InstanceDomainId,
        ids: &[u32],
    ) -> Result<(), AgentError> {
        self.clear_profile(domain).await?;
        self.extend_profile(domain, ids).await
    }
}

// ----------------------------------------------------------------------------
// 7.2 Wire Protocol
// ----------------------------------------------------------------------------

/// Requests the Unix-socket transport sends, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    LookupNames { names: Vec<String> },
    LookupDescriptors { ids: Vec<MetricId> },
    Instances { domain: InstanceDomainId },
    LookupInstanceByName { domain: InstanceDomainId, name: String },
    LookupInstanceById { domain: InstanceDomainId, id: u32 },
    ClearProfile { domain: InstanceDomainId },
    ExtendProfile { domain: InstanceDomainId, ids: Vec<u32> },
    Fetch { ids: Vec<MetricId> },
    Store { result: FetchResult },
    Close,
}

/// Responses the agent sends, one JSON object per line, matching the
/// request order one-to-one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    Ids { ids: Vec<Option<MetricId>> },
    Descriptors { descriptors: Vec<MetricDescriptor> },
    Instances { instances: Vec<Instance> },
    InstanceId { id: u32 },
    InstanceName { name: String },
    Ack,
    Values { result: FetchResult },
    Error { code: AgentErrorCode, message: String },
}

/// Error codes an agent can put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorCode {
    InstanceNotFound,
    PermissionDenied,
    AccessDenied,
    UnknownMetric,
    Internal,
}

impl AgentErrorCode {
    /// Lift a wire-level error into the typed agent error.
    fn into_error(self, message: String) -> AgentError {
        match self {
            AgentErrorCode::InstanceNotFound => AgentError::InstanceNotFound,
            AgentErrorCode::PermissionDenied => AgentError::PermissionDenied,
            AgentErrorCode::AccessDenied => AgentError::AccessDenied,
            code => AgentError::Agent { code, message },
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Unix Socket Client
// ----------------------------------------------------------------------------

/// Metrics agent client over a Unix domain socket.
///
/// Framing is newline-delimited JSON in both directions. Calls are strictly
/// request/response; there is no pipelining and no client-side timeout - a
/// hung agent hangs the run, and a transport failure aborts it.
#[derive(Debug)]
pub struct UdsAgentClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl UdsAgentClient {
    /// Connect to the agent socket. The connection is the session: profile
    /// state lives and dies with it.
    pub async fn connect(path: &Path) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        debug!(
            target: "procheck::agent",
            socket = %path.display(),
            "connected to metrics agent"
        );
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// One request/response exchange. Agent-reported errors come back as
    /// `Err`; every `Ok` is a non-error response variant.
    async fn call(&mut self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let mut line = serde_json::to_string(&request)
            .map_err(|e| AgentError::Protocol(format!("cannot encode request: {}", e)))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(AgentError::Protocol("agent closed the connection".into()));
        }

        let response: AgentResponse = serde_json::from_str(buf.trim_end())
            .map_err(|e| AgentError::Protocol(format!("cannot decode response: {}", e)))?;

        match response {
            AgentResponse::Error { code, message } => Err(code.into_error(message)),
            other => Ok(other),
        }
    }

    fn unexpected(expected: &str, got: &AgentResponse) -> AgentError {
        AgentError::Protocol(format!("expected {} response, got {:?}", expected, got))
    }
}

#[async_trait]
impl MetricsAgent for UdsAgentClient {
    async fn lookup_names(&mut self, names: &[String]) -> Result<Vec<Option<MetricId>>, AgentError> {
        match self
            .call(AgentRequest::LookupNames {
                names: names.to_vec(),
            })
            .await?
        {
            AgentResponse::Ids { ids } => Ok(ids),
            other => Err(Self::unexpected("ids", &other)),
        }
    }

    async fn lookup_descriptors(
        &mut self,
        ids: &[MetricId],
    ) -> Result<Vec<MetricDescriptor>, AgentError> {
        match self
            .call(AgentRequest::LookupDescriptors { ids: ids.to_vec() })
            .await?
        {
            AgentResponse::Descriptors { descriptors } => Ok(descriptors),
            other => Err(Self::unexpected("descriptors", &other)),
        }
    }

    async fn instances(&mut self, domain: InstanceDomainId) -> Result<Vec<Instance>, AgentError> {
        match self.call(AgentRequest::Instances { domain }).await? {
            AgentResponse::Instances { instances } => Ok(instances),
            other => Err(Self::unexpected("instances", &other)),
        }
    }

    async fn lookup_instance_by_name(
        &mut self,
        domain: InstanceDomainId,
        name: &str,
    ) -> Result<u32, AgentError> {
        match self
            .call(AgentRequest::LookupInstanceByName {
                domain,
                name: name.to_string(),
            })
            .await?
        {
            AgentResponse::InstanceId { id } => Ok(id),
            other => Err(Self::unexpected("instance_id", &other)),
        }
    }

    async fn lookup_instance_by_id(
        &mut self,
        domain: InstanceDomainId,
        id: u32,
    ) -> Result<String, AgentError> {
        match self
            .call(AgentRequest::LookupInstanceById { domain, id })
            .await?
        {
            AgentResponse::InstanceName { name } => Ok(name),
            other => Err(Self::unexpected("instance_name", &other)),
        }
    }

    async fn clear_profile(&mut self, domain: InstanceDomainId) -> Result<(), AgentError> {
        match self.call(AgentRequest::ClearProfile { domain }).await? {
            AgentResponse::Ack => Ok(()),
            other => Err(Self::unexpected("ack", &other)),
        }
    }

    async fn extend_profile(
        &mut self,
        domain: InstanceDomainId,
        ids: &[u32],
    ) -> Result<(), AgentError> {
        match self
            .call(AgentRequest::ExtendProfile {
                domain,
                ids: ids.to_vec(),
            })
            .await?
        {
            AgentResponse::Ack => Ok(()),
            other => Err(Self::unexpected("ack", &other)),
        }
    }

    async fn fetch(&mut self, ids: &[MetricId]) -> Result<FetchResult, AgentError> {
        match self.call(AgentRequest::Fetch { ids: ids.to_vec() }).await? {
            AgentResponse::Values { result } => Ok(result),
            other => Err(Self::unexpected("values", &other)),
        }
    }

    async fn store(&mut self, result: &FetchResult) -> Result<(), AgentError> {
        match self
            .call(AgentRequest::Store {
                result: result.clone(),
            })
            .await?
        {
            AgentResponse::Ack => Ok(()),
            other => Err(Self::unexpected("ack", &other)),
        }
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(&AgentRequest::Close)
            .map_err(|e| AgentError::Protocol(format!("cannot encode request: {}", e)))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            // Agent released the session and hung up without an ack.
            debug!(target: "procheck::agent", "agent closed the connection on release");
            return Ok(());
        }

        let response: AgentResponse = serde_json::from_str(buf.trim_end())
            .map_err(|e| AgentError::Protocol(format!("cannot decode response: {}", e)))?;
        match response {
            AgentResponse::Ack => Ok(()),
            AgentResponse::Error { code, message } => Err(code.into_error(message)),
            other => Err(Self::unexpected("ack", &other)),
        }
    }
}

// ============================================================================
// SECTION 8: INSTANCE NAME FORMAT
// ============================================================================
// Instance names encode the numeric id of the process behind them. Whether
// the encoding is fixed-width zero-padded or plain decimal is a property of
// the platform, derived exactly once per run from the process enumeration
// source - never from the agent under test.
// ============================================================================

/// How instance names encode their numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameFormat {
    /// Zero-padded decimal of exactly this many digits, e.g. `00100`
    FixedWidth(usize),
    /// Plain decimal of whatever width, e.g. `100`
    Variable,
}

impl NameFormat {
    /// Decode the leading numeric id from an instance name.
    ///
    /// Returns `None` when the name does not begin with a digit. Under a
    /// fixed-width format at most `width` digits participate; anything after
    /// them belongs to the label.
    pub fn decode(self, name: &str) -> Option<u32> {
        let run = leading_digit_len(name);
        if run == 0 {
            return None;
        }
        let take = match self {
            NameFormat::FixedWidth(width) => run.min(width),
            NameFormat::Variable => run,
        };
        name[..take].parse().ok()
    }

    /// Render an id the way instance names encode it.
    pub fn encode(self, id: u32) -> String {
        match self {
            NameFormat::FixedWidth(width) => format!("{:0width$}", id, width = width),
            NameFormat::Variable => id.to_string(),
        }
    }

    /// Whether `name` is a valid rendering of `id` under this format.
    ///
    /// The encoded id must be followed by end-of-string or a space (names
    /// may carry a trailing descriptive label). Names with extra leading
    /// zeros are accepted by retrying against the plain decimal form after
    /// stripping them.
    pub fn matches(self, id: u32, name: &str) -> bool {
        if prefix_with_boundary(name, &self.encode(id)) {
            return true;
        }
        let stripped = name.trim_start_matches('0');
        prefix_with_boundary(stripped, &id.to_string())
    }
}

impl Display for NameFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NameFormat::FixedWidth(width) => write!(f, "fixed-width({})", width),
            NameFormat::Variable => write!(f, "variable"),
        }
    }
}

fn leading_digit_len(s: &str) -> usize {
    s.bytes().take_while(u8::is_ascii_digit).count()
}

fn prefix_with_boundary(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(' '),
        None => false,
    }
}

/// Derive the platform's name format from a directory of digit-named
/// process entries.
///
/// One scan: if every digit-named entry has the same length the format is
/// fixed-width of that length; any disagreement means plain decimal and the
/// scan may stop there. An unreadable directory, or one with no digit-named
/// entries at all, is a fatal precondition failure - nothing downstream can
/// be checked without a format.
pub fn derive_name_format(procfs_root: &Path) -> CheckResult<NameFormat> {
    let entries = fs::read_dir(procfs_root).map_err(|e| {
        CheckError::Precondition(format!(
            "cannot enumerate processes under {}: {}",
            procfs_root.display(),
            e
        ))
    })?;

    let mut width: Option<usize> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }

        match width {
            None => width = Some(name.len()),
            Some(seen) if seen != name.len() => {
                debug!(
                    target: "procheck::run",
                    "process entry widths disagree, instance names are plain decimal"
                );
                return Ok(NameFormat::Variable);
            }
            Some(_) => {}
        }
    }

    match width {
        Some(width) => Ok(NameFormat::FixedWidth(width)),
        None => Err(CheckError::Precondition(format!(
            "no process entries under {}",
            procfs_root.display()
        ))),
    }
}

// ============================================================================
// SECTION 8 TESTS
// ============================================================================


// ============================================================================
// SECTION 9: METRIC CATALOG RESOLVER
// ============================================================================
// Names to identifiers to descriptors, with the shared-domain invariant
// enforced up front: every later step (snapshot, profile, fetch) assumes
// one instance domain for the whole requested set.
// ============================================================================

/// The resolved catalog state threaded through the rest of the run.
#[derive(Debug, Clone)]
pub struct ResolvedMetrics {
    /// Requested names, in request order
    pub names: Vec<String>,
    /// Resolved identifiers, parallel to `names`
    pub ids: Vec<MetricId>,
    /// Descriptors, parallel to `names`
    pub descriptors: Vec<MetricDescriptor>,
    /// The one instance domain every descriptor shares
    pub domain: InstanceDomainId,
}

impl ResolvedMetrics {
    /// Requested name for a metric id, for diagnostics.
    pub fn name_of(&self, id: MetricId) -> &str {
        self.ids
            .iter()
            .position(|&m| m == id)
            .map(|i| self.names[i].as_str())
            .unwrap_or("<unknown metric>")
    }
}

/// Resolve the requested metric names and enforce the shared-domain
/// invariant.
pub async fn resolve_metrics<A>(agent: &mut A, names: &[String]) -> CheckResult<ResolvedMetrics>
where
    A: MetricsAgent + ?Sized,
{
    let lookups = agent.lookup_names(names).await?;
    if lookups.len() != names.len() {
        return Err(CheckError::Agent(AgentError::Protocol(format!(
            "agent resolved {} names out of {} requested",
            lookups.len(),
            names.len()
        ))));
    }

    let mut ids = Vec::with_capacity(names.len());
    let mut unknown = Vec::new();
    for (name, id) in names.iter().zip(lookups) {
        match id {
            Some(id) => ids.push(id),
            None => unknown.push(name.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(CheckError::NameResolution { unknown });
    }

    let descriptors = agent
        .lookup_descriptors(&ids)
        .await
        .map_err(CheckError::DescriptorLookup)?;
    if descriptors.len() != ids.len() {
        return Err(CheckError::DescriptorLookup(AgentError::Protocol(format!(
            "agent returned {} descriptors for {} metrics",
            descriptors.len(),
            ids.len()
        ))));
    }

    let first = &descriptors[0];
    let domain = first.domain.ok_or_else(|| CheckError::NullInstanceDomain {
        metric: first.name.clone(),
    })?;

    for descriptor in &descriptors[1..] {
        if descriptor.domain != Some(domain) {
            return Err(CheckError::DescriptorMismatch {
                metric: descriptor.name.clone(),
                got: descriptor
                    .domain
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "none".into()),
                first_metric: first.name.clone(),
                expected: domain,
            });
        }
    }

    debug!(
        target: "procheck::run",
        metrics = names.len(),
        domain = %domain,
        "resolved metric catalog"
    );

    Ok(ResolvedMetrics {
        names: names.to_vec(),
        ids,
        descriptors,
        domain,
    })
}

// ============================================================================
// SECTION 10: INSTANCE DOMAIN SNAPSHOT
// ============================================================================

/// Enumerate the domain's instances at one point in time.
///
/// A single round trip with no retries: the domain is required for every
/// subsequent step, so a failure here is fatal. An empty snapshot is valid -
/// the domain simply has no live instances right now.
pub async fn snapshot_instances<A>(
    agent: &mut A,
    domain: InstanceDomainId,
) -> CheckResult<InstanceSnapshot>
where
    A: MetricsAgent + ?Sized,
{
    let instances = agent.instances(domain).await?;

    debug!(
        target: "procheck::run",
        domain = %domain,
        instances = instances.len(),
        "captured instance snapshot"
    );
    for instance in &instances {
        trace!(
            target: "procheck::run",
            id = instance.id,
            name = %instance.name,
            "instance map entry"
        );
    }

    Ok(InstanceSnapshot {
        domain,
        taken_at: Utc::now(),
        instances,
    })
}

// ============================================================================
// SECTION 11: PROBE LIFECYCLE
// ============================================================================
// A disposable child process that exists solely to die on schedule. Its pid
// is recorded before the snapshot, and the driver waits for its exit before
// any lookup referencing it - giving every run exactly one instance that is
// deterministically known to be dead at lookup time.
// ============================================================================

/// A short-lived child process owned by the checker.
#[derive(Debug)]
pub struct Probe {
    child: Child,
    pid: u32,
}

impl Probe {
    /// Spawn the probe. The lifetime must span at least two agent refresh
    /// intervals so the probe is visible in the snapshot.
    pub fn spawn(lifetime: Duration) -> io::Result<Self> {
        let mut command = Command::new("sleep");
        command.arg(lifetime.as_secs().to_string());
        command.kill_on_drop(true);

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("probe exited before its pid could be read"))?;

        debug!(
            target: "procheck::run",
            pid,
            lifetime_secs = lifetime.as_secs(),
            "spawned probe process"
        );
        Ok(Self { child, pid })
    }

    /// The probe's process id - a known instance id of the domain.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the probe has exited. After this returns, the pid is
    /// certainly dead and lookups on it must report not-found.
    pub async fn wait(mut self) -> io::Result<()> {
        let status = self.child.wait().await?;
        debug!(
            target: "procheck::run",
            pid = self.pid,
            code = ?status.code(),
            "probe exited"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 12: CONSISTENCY CHECKER
// ============================================================================
// Three independent passes over the snapshot. Each is fail-fast, and each
// tolerates exactly one thing: an instance that no longer exists. Only the
// probe's death is certain; for every other instance a not-found lookup is
// accepted as an independent death, never demanded.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Format Pass
// ----------------------------------------------------------------------------

/// Verify that every snapshot entry's name encodes its id under the derived
/// format.
pub fn check_instance_names(snapshot: &InstanceSnapshot, format: NameFormat) -> CheckResult<()> {
    for instance in &snapshot.instances {
        match format.decode(&instance.name) {
            None => {
                return Err(CheckError::Consistency {
                    id: instance.id,
                    name: instance.name.to_string(),
                    detail: "cannot parse a leading numeric id from the instance name".into(),
                });
            }
            Some(decoded) if decoded != instance.id => {
                return Err(CheckError::Consistency {
                    id: instance.id,
                    name: instance.name.to_string(),
                    detail: format!(
                        "name encodes id {} under {} format",
                        decoded, format
                    ),
                });
            }
            Some(_) => {}
        }
    }

    debug!(
        target: "procheck::run",
        instances = snapshot.len(),
        format = %format,
        "instance names encode their ids"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 12.2 Name-to-Id Pass
// ----------------------------------------------------------------------------

/// Look up every snapshot entry by name and verify the returned id.
///
/// `dead_pid` is the probe's id, already waited on: a not-found result for
/// it is the required outcome. A successful lookup of the probe is also
/// accepted - the agent's refresh may not have caught up yet - but logged.
pub async fn check_name_to_id<A>(
    agent: &mut A,
    snapshot: &InstanceSnapshot,
    format: NameFormat,
    dead_pid: u32,
) -> CheckResult<()>
where
    A: MetricsAgent + ?Sized,
{
    let mut vanished = 0usize;
    for instance in &snapshot.instances {
        match agent
            .lookup_instance_by_name(snapshot.domain, instance.name.as_str())
            .await
        {
            Err(err) if err.is_not_found() => {
                if instance.id == dead_pid {
                    info!(
                        target: "procheck::run",
                        pid = dead_pid,
                        "probe death detected in name lookup"
                    );
                } else {
                    vanished += 1;
                    debug!(
                        target: "procheck::run",
                        id = instance.id,
                        name = %instance.name,
                        "instance vanished since the snapshot"
                    );
                }
            }
            Err(err) => {
                return Err(CheckError::Consistency {
                    id: instance.id,
                    name: instance.name.to_string(),
                    detail: format!("name lookup failed: {}", err),
                });
            }
            Ok(returned) => {
                if instance.id == dead_pid {
                    info!(
                        target: "procheck::run",
                        pid = dead_pid,
                        "probe still visible after exit; agent refresh has not caught up"
                    );
                }
                let Some(decoded) = format.decode(&instance.name) else {
                    return Err(CheckError::Consistency {
                        id: instance.id,
                        name: instance.name.to_string(),
                        detail: "cannot parse a leading numeric id from the instance name".into(),
                    });
                };
                if decoded != returned {
                    return Err(CheckError::Consistency {
                        id: instance.id,
                        name: instance.name.to_string(),
                        detail: format!(
                            "agent mapped the name to instance {}, expected {}",
                            returned, decoded
                        ),
                    });
                }
                trace!(
                    target: "procheck::run",
                    name = %instance.name,
                    id = returned,
                    "name lookup round-trip"
                );
            }
        }
    }

    debug!(
        target: "procheck::run",
        instances = snapshot.len(),
        vanished,
        "name-to-id lookups are consistent"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 12.3 Id-to-Name Pass
// ----------------------------------------------------------------------------

/// Look up every snapshot entry by id and verify the returned name encodes
/// the id, with the same death tolerance as the name-to-id pass.
pub async fn check_id_to_name<A>(
    agent: &mut A,
    snapshot: &InstanceSnapshot,
    format: NameFormat,
    dead_pid: u32,
) -> CheckResult<()>
where
    A: MetricsAgent + ?Sized,
{
    let mut vanished = 0usize;
    for instance in &snapshot.instances {
        match agent
            .lookup_instance_by_id(snapshot.domain, instance.id)
            .await
        {
            Err(err) if err.is_not_found() => {
                if instance.id == dead_pid {
                    info!(
                        target: "procheck::run",
                        pid = dead_pid,
                        "probe death detected in id lookup"
                    );
                } else {
                    vanished += 1;
                    debug!(
                        target: "procheck::run",
                        id = instance.id,
                        "instance vanished since the snapshot"
                    );
                }
            }
            Err(err) => {
                return Err(CheckError::Consistency {
                    id: instance.id,
                    name: instance.name.to_string(),
                    detail: format!("id lookup failed: {}", err),
                });
            }
            Ok(name) => {
                if !format.matches(instance.id, &name) {
                    return Err(CheckError::Consistency {
                        id: instance.id,
                        name,
                        detail: format!(
                            "returned name does not encode instance {} under {} format",
                            instance.id, format
                        ),
                    });
                }
                trace!(
                    target: "procheck::run",
                    id = instance.id,
                    name = %name,
                    "id lookup round-trip"
                );
            }
        }
    }

    debug!(
        target: "procheck::run",
        instances = snapshot.len(),
        vanished,
        "id-to-name lookups are consistent"
    );
    Ok(())
}

// ============================================================================
// SECTION 13: PROFILE / FETCH VERIFIER
// ============================================================================
// Server-side instance filtering. Round one restricts the profile to the
// checker's own process and its parent and verifies nothing else leaks
// through; round two widens the profile to the full snapshot and verifies
// the unrestricted path fetches at all.
// ============================================================================

/// Restricted round: profile = {own pid, parent pid}, then `iterations`
/// fetches.
///
/// A result set with fewer (or more) than two instances is only a warning -
/// one of the two can be legitimately absent from the domain - but any
/// instance outside the pair is a violation. Returns the warning count.
pub async fn check_restricted_fetch<A>(
    agent: &mut A,
    resolved: &ResolvedMetrics,
    pids: [u32; RESTRICTED_PROFILE_SIZE],
    iterations: u32,
) -> CheckResult<u32>
where
    A: MetricsAgent + ?Sized,
{
    agent.replace_profile(resolved.domain, &pids).await?;
    debug!(
        target: "procheck::run",
        own = pids[0],
        parent = pids[1],
        "profile restricted to own and parent process"
    );

    let mut warnings = 0u32;
    for round in 0..iterations {
        let result = agent.fetch(&resolved.ids).await?;
        trace_fetch_result(&result);

        for set in &result.sets {
            let metric = resolved.name_of(set.metric);

            if set.values.len() != RESTRICTED_PROFILE_SIZE {
                warnings += 1;
                warn!(
                    target: "procheck::run",
                    metric,
                    round,
                    instances = set.values.len(),
                    "restricted fetch did not return exactly the profiled pair"
                );
            }

            for value in &set.values {
                if !pids.contains(&value.instance) {
                    return Err(CheckError::Profile {
                        metric: metric.to_string(),
                        instance: value.instance,
                    });
                }
            }
        }
    }

    debug!(
        target: "procheck::run",
        rounds = iterations,
        warnings,
        "restricted fetches stayed inside the profile"
    );
    Ok(warnings)
}

/// Unrestricted round: profile = the full snapshot id set, one fetch that
/// must succeed. No per-instance restriction is meaningful here.
pub async fn check_unrestricted_fetch<A>(
    agent: &mut A,
    resolved: &ResolvedMetrics,
    snapshot: &InstanceSnapshot,
) -> CheckResult<()>
where
    A: MetricsAgent + ?Sized,
{
    let all = snapshot.ids();
    agent.replace_profile(resolved.domain, &all).await?;

    let result = agent.fetch(&resolved.ids).await?;
    trace_fetch_result(&result);

    debug!(
        target: "procheck::run",
        profiled = all.len(),
        values = result.value_count(),
        "fetch over the entire instance domain succeeded"
    );
    Ok(())
}

fn trace_fetch_result(result: &FetchResult) {
    for set in &result.sets {
        for value in &set.values {
            trace!(
                target: "procheck::run",
                metric = %set.metric,
                instance = value.instance,
                value = %value.value,
                "fetched value"
            );
        }
    }
}

// ============================================================================
// SECTION 14: WRITE REJECTION CHECKER
// ============================================================================

/// Fetch current values and try to store them straight back. A conformant
/// agent refuses with a permission-class error; anything else - success
/// included - means the wrong path was exercised.
pub async fn check_write_rejection<A>(agent: &mut A, resolved: &ResolvedMetrics) -> CheckResult<()>
where
    A: MetricsAgent + ?Sized,
{
    let result = agent.fetch(&resolved.ids).await?;

    match agent.store(&result).await {
        Ok(()) => Err(CheckError::ExpectedFailureNotRaised {
            outcome: "the store succeeded".into(),
        }),
        Err(err) if err.is_permission_class() => {
            debug!(
                target: "procheck::run",
                error = %err,
                "store was refused with a permission-class error"
            );
            Ok(())
        }
        Err(err) => Err(CheckError::ExpectedFailureNotRaised {
            outcome: format!("the store failed with the wrong error class: {}", err),
        }),
    }
}

// ============================================================================
// SECTION 15: CHECK DRIVER
// ============================================================================
// The single sequential control flow: every piece of derived state (name
// format, resolved catalog, snapshot) is threaded through explicitly, the
// probe's exit is awaited before the lookup passes, and the agent session
// is released on every exit path.
// ============================================================================

/// Run the full conformance sequence against one agent session.
///
/// The session is released via [`MetricsAgent::close`] whether the run
/// passes or aborts.
pub async fn run_conformance<A>(
    agent: &mut A,
    run: &RunConfig,
    metrics: &[String],
) -> CheckResult<CheckSummary>
where
    A: MetricsAgent + ?Sized,
{
    let outcome = drive(agent, run, metrics).await;
    if let Err(err) = agent.close().await {
        warn!(
            target: "procheck::agent",
            error = %err,
            "failed to release the agent session"
        );
    }
    outcome
}

async fn drive<A>(agent: &mut A, run: &RunConfig, metrics: &[String]) -> CheckResult<CheckSummary>
where
    A: MetricsAgent + ?Sized,
{
    let own_pid = getpid().as_raw() as u32;
    let parent_pid = getppid().as_raw() as u32;
    info!(
        target: "procheck::run",
        pid = own_pid,
        ppid = parent_pid,
        metrics = metrics.len(),
        "starting conformance run"
    );

    if metrics.len() > run.max_metrics {
        return Err(CheckError::Precondition(format!(
            "{} metrics requested, limit is {}",
            metrics.len(),
            run.max_metrics
        )));
    }

    let mut reporter = CheckReporter::default();

    let family = reporter.record("metric-family", MetricFamily::classify(metrics))?;
    info!(target: "procheck::run", family = %family, "requested metrics classified");

    let format = reporter.record("name-format", derive_name_format(&run.procfs_root))?;
    info!(target: "procheck::run", format = %format, "derived instance name format");

    let resolved = reporter.record("resolve", resolve_metrics(agent, metrics).await)?;

    // The probe must exist before the snapshot so the snapshot can contain
    // it, and must be waited on before any lookup referencing its pid.
    let probe = Probe::spawn(run.probe_lifetime())?;
    let probe_pid = probe.pid();

    if family.needs_refresh_delay() {
        debug!(
            target: "procheck::run",
            delay_secs = run.refresh_delay().as_secs(),
            "waiting for the agent to refresh its active list"
        );
        sleep(run.refresh_delay()).await;
    }

    let snapshot = reporter.record(
        "snapshot",
        snapshot_instances(agent, resolved.domain).await,
    )?;

    let mut summary = CheckSummary::default();

    reporter.record("instance-names", check_instance_names(&snapshot, format))?;

    probe.wait().await?;

    reporter.record(
        "name-to-id",
        check_name_to_id(agent, &snapshot, format, probe_pid).await,
    )?;
    reporter.record(
        "id-to-name",
        check_id_to_name(agent, &snapshot, format, probe_pid).await,
    )?;

    summary.warnings += reporter.record(
        "restricted-fetch",
        check_restricted_fetch(agent, &resolved, [own_pid, parent_pid], run.iterations).await,
    )?;
    reporter.record(
        "unrestricted-fetch",
        check_unrestricted_fetch(agent, &resolved, &snapshot).await,
    )?;

    if family.supports_writes() {
        reporter.record(
            "write-rejection",
            check_write_rejection(agent, &resolved).await,
        )?;
    } else {
        info!(
            target: "procheck::check",
            check = "write-rejection",
            outcome = "skip",
            "write path unsupported for this metric family"
        );
    }

    summary.checks_passed = reporter.passed;
    info!(
        target: "procheck::run",
        checks = summary.checks_passed,
        warnings = summary.warnings,
        "conformance run complete"
    );
    Ok(summary)
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Procheck CLI
#[derive(Parser, Debug)]
#[command(
    name = "procheck",
    version,
    about = "Conformance checker for process-indexed metrics agents",
    long_about = "Procheck drives a metrics agent through its instance-domain \
                  contract: name/id round-trips over a live process domain, \
                  profile-restricted fetching, and write rejection. The first \
                  violation aborts the run with a non-zero exit status."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "procheck.toml", env = "PROCHECK_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PROCHECK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PROCHECK_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the conformance checks against an agent
    Run {
        /// Metrics to verify; all must come from one family (proc. or hotproc.)
        #[arg(required = true)]
        metrics: Vec<String>,

        /// Agent socket path override
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Agent refresh interval override (seconds)
        #[arg(short = 't', long)]
        refresh: Option<u64>,

        /// Restricted-fetch round count override
        #[arg(short, long)]
        iterations: Option<u32>,
    },

    /// Validate the configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show checker version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand.
fn handle_validate(config_path: &Path, verbose: bool) -> CheckResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match CheckerConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nConfiguration summary:");
            println!("  • Agent socket: {}", config.agent.socket.display());
            println!("  • Process enumeration root: {}", config.run.procfs_root.display());
            println!("  • Refresh interval: {}s", config.run.refresh_secs);
            println!("  • Fetch iterations: {}", config.run.iterations);
            println!("  • Log level: {}", config.logging.level);

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(CheckError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand.
fn handle_generate_config(output: Option<&Path>) -> CheckResult<()> {
    let config_str = CheckerConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand.
fn handle_version() {
    println!("{} v{}", CHECKER_FULL_NAME, CHECKER_VERSION);
    println!();
    println!("Build information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Checks:");
    println!("  • Instance name format derivation");
    println!("  • Shared instance-domain resolution");
    println!("  • Id/name round-trip consistency with death tolerance");
    println!("  • Profile-restricted and full-domain fetching");
    println!("  • Write rejection");
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the checker.
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need configuration or logging.
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        CheckerConfig::load(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?
    } else {
        CheckerConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    match cli.command {
        Some(Commands::Run {
            metrics,
            socket,
            refresh,
            iterations,
        }) => {
            let mut run_config = config.run.clone();
            if let Some(refresh) = refresh {
                run_config.refresh_secs = refresh;
            }
            if let Some(iterations) = iterations {
                run_config.iterations = iterations;
            }
            run_config.validate().map_err(CheckError::Config)?;

            let socket_path = socket.unwrap_or_else(|| config.agent.socket.clone());
            let mut agent = UdsAgentClient::connect(&socket_path).await.map_err(|e| {
                anyhow!(e).context(format!(
                    "cannot connect to the metrics agent at {}",
                    socket_path.display()
                ))
            })?;

            let summary = run_conformance(&mut agent, &run_config, &metrics)
                .await
                .map_err(|err| {
                    error!(
                        target: "procheck::run",
                        category = err.category(),
                        error = %err,
                        "conformance run failed"
                    );
                    anyhow!(err)
                })?;

            info!(
                target: "procheck::run",
                checks = summary.checks_passed,
                warnings = summary.warnings,
                "all conformance checks passed"
            );
            Ok(())
        }
        None => Err(anyhow!("no subcommand given; see --help")),
        _ => unreachable!("early subcommands already handled"),
    }
}

// ============================================================================
// SECTION 18: PROTOCOL & CONFIGURATION TESTS
// ============================================================================



// ============================================================================
// SECTION 19: CONFORMANCE TESTS
// ============================================================================
// Driven by an in-memory agent with scriptable instance liveness, profile
// tracking, and store behavior - the checks only see the capability trait.
// ============================================================================


#[cfg(test)]
mod conformance_tests {
    use super::*;
    use std::collections::HashSet;

    // ------------------------------------------------------------------------
    // Fake agent
    // ------------------------------------------------------------------------

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum StoreOutcome {
        /// POSIX-style access refusal
        #[default]
        AccessDenied,
        /// Agent-level permission refusal
        PermissionDenied,
        /// Store is wrongly accepted
        Succeeds,
        /// Store fails, but not with a permission-class error
        WrongError,
    }

    #[derive(Debug, Clone)]
    struct FakeMetric {
        name: String,
        id: MetricId,
        domain: Option<InstanceDomainId>,
    }

    /// In-memory agent with scriptable behavior. Instances move from `live`
    /// to `dead` via [`FakeAgent::kill`]; lookups answer from `live` only.
    #[derive(Debug, Default)]
    struct FakeAgent {
        metrics: Vec<FakeMetric>,
        live: Vec<Instance>,
        dead: HashSet<u32>,
        profile: Vec<u32>,
        /// Extra instance id injected into every fetched value set
        rogue_instance: Option<u32>,
        /// Misreport one name lookup: (name, wrong id)
        misreport_name_lookup: Option<(String, u32)>,
        /// Misreport one id lookup: (id, wrong name)
        misreport_id_lookup: Option<(u32, String)>,
        store_outcome: StoreOutcome,
        closed: bool,
    }

    const TEST_DOMAIN: InstanceDomainId = InstanceDomainId(7);

    impl FakeAgent {
        fn with_proc_metrics() -> Self {
            let mut agent = FakeAgent::default();
            agent.add_metric("proc.psinfo.utime", 1, Some(TEST_DOMAIN));
            agent.add_metric("proc.psinfo.stime", 2, Some(TEST_DOMAIN));
            agent.push_live(100, "00100 init");
            agent.push_live(4096, "04096 httpd");
            agent
        }

        fn with_hotproc_metric() -> Self {
            let mut agent = FakeAgent::default();
            agent.add_metric("hotproc.psinfo.utime", 11, Some(TEST_DOMAIN));
            agent.push_live(100, "00100 init");
            agent
        }

        fn add_metric(&mut self, name: &str, id: u32, domain: Option<InstanceDomainId>) {
            self.metrics.push(FakeMetric {
                name: name.into(),
                id: MetricId::from(id),
                domain,
            });
        }

        fn push_live(&mut self, id: u32, name: &str) {
            self.live.push(Instance {
                id,
                name: CompactString::from(name),
            });
        }

        /// The instance dies: it disappears from lookups from now on.
        fn kill(&mut self, id: u32) {
            self.live.retain(|inst| inst.id != id);
            self.dead.insert(id);
        }

        fn metric_names(&self) -> Vec<String> {
            self.metrics.iter().map(|m| m.name.clone()).collect()
        }
    }

    #[async_trait]
    impl MetricsAgent for FakeAgent {
        async fn lookup_names(
            &mut self,
            names: &[String],
        ) -> Result<Vec<Option<MetricId>>, AgentError> {
            Ok(names
                .iter()
                .map(|name| {
                    self.metrics
                        .iter()
                        .find(|m| &m.name == name)
                        .map(|m| m.id)
                })
                .collect())
        }

        async fn lookup_descriptors(
            &mut self,
            ids: &[MetricId],
        ) -> Result<Vec<MetricDescriptor>, AgentError> {
            ids.iter()
                .map(|id| {
                    self.metrics
                        .iter()
                        .find(|m| m.id == *id)
                        .map(|m| MetricDescriptor {
                            name: m.name.clone(),
                            id: m.id,
                            domain: m.domain,
                        })
                        .ok_or_else(|| AgentError::Agent {
                            code: AgentErrorCode::UnknownMetric,
                            message: format!("no descriptor for metric {}", id),
                        })
                })
                .collect()
        }

        async fn instances(
            &mut self,
            _domain: InstanceDomainId,
        ) -> Result<Vec<Instance>, AgentError> {
            Ok(self.live.clone())
        }

        async fn lookup_instance_by_name(
            &mut self,
            _domain: InstanceDomainId,
            name: &str,
        ) -> Result<u32, AgentError> {
            if let Some((misreported, wrong_id)) = &self.misreport_name_lookup {
                if misreported == name {
                    return Ok(*wrong_id);
                }
            }
            self.live
                .iter()
                .find(|inst| inst.name == name)
                .map(|inst| inst.id)
                .ok_or(AgentError::InstanceNotFound)
        }

        async fn lookup_instance_by_id(
            &mut self,
            _domain: InstanceDomainId,
            id: u32,
        ) -> Result<String, AgentError> {
            if let Some((misreported, wrong_name)) = &self.misreport_id_lookup {
                if *misreported == id {
                    return Ok(wrong_name.clone());
                }
            }
            self.live
                .iter()
                .find(|inst| inst.id == id)
                .map(|inst| inst.name.to_string())
                .ok_or(AgentError::InstanceNotFound)
        }

        async fn clear_profile(&mut self, _domain: InstanceDomainId) -> Result<(), AgentError> {
            self.profile.clear();
            Ok(())
        }

        async fn extend_profile(
            &mut self,
            _domain: InstanceDomainId,
            ids: &[u32],
        ) -> Result<(), AgentError> {
            self.profile.extend_from_slice(ids);
            Ok(())
        }

        async fn fetch(&mut self, ids: &[MetricId]) -> Result<FetchResult, AgentError> {
            let selected: Vec<u32> = self
                .profile
                .iter()
                .copied()
                .filter(|id| self.live.iter().any(|inst| inst.id == *id))
                .chain(self.rogue_instance)
                .collect();

            Ok(FetchResult {
                taken_at: Utc::now(),
                sets: ids
                    .iter()
                    .map(|metric| ValueSet {
                        metric: *metric,
                        values: selected
                            .iter()
                            .map(|&instance| InstanceValue {
                                instance,
                                value: MetricValue::Unsigned(1),
                            })
                            .collect(),
                    })
                    .collect(),
            })
        }

        async fn store(&mut self, _result: &FetchResult) -> Result<(), AgentError> {
            match self.store_outcome {
                StoreOutcome::AccessDenied => Err(AgentError::AccessDenied),
                StoreOutcome::PermissionDenied => Err(AgentError::PermissionDenied),
                StoreOutcome::Succeeds => Ok(()),
                StoreOutcome::WrongError => Err(AgentError::Agent {
                    code: AgentErrorCode::Internal,
                    message: "unrelated failure".into(),
                }),
            }
        }

        async fn close(&mut self) -> Result<(), AgentError> {
            self.closed = true;
            Ok(())
        }
    }

    async fn snapshot_of(agent: &mut FakeAgent) -> InstanceSnapshot {
        snapshot_instances(agent, TEST_DOMAIN).await.unwrap()
    }

    async fn resolve_all(agent: &mut FakeAgent) -> CheckResult<ResolvedMetrics> {
        let names = agent.metric_names();
        resolve_metrics(agent, &names).await
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn resolves_metrics_sharing_one_domain() {
        let mut agent = FakeAgent::with_proc_metrics();
        let resolved = resolve_all(&mut agent).await.unwrap();

        assert_eq!(resolved.domain, TEST_DOMAIN);
        assert_eq!(resolved.ids, vec![MetricId::from(1), MetricId::from(2)]);
        assert_eq!(resolved.name_of(MetricId::from(2)), "proc.psinfo.stime");
    }

    #[tokio::test]
    async fn resolution_reports_exactly_the_unknown_names() {
        let mut agent = FakeAgent::with_proc_metrics();
        let names = vec![
            "proc.psinfo.utime".to_string(),
            "proc.psinfo.nope".to_string(),
        ];

        let err = resolve_metrics(&mut agent, &names).await.unwrap_err();
        let CheckError::NameResolution { unknown } = err else {
            panic!("expected a name resolution error");
        };
        assert_eq!(unknown, vec!["proc.psinfo.nope".to_string()]);
    }

    #[tokio::test]
    async fn resolution_rejects_a_metric_without_a_domain() {
        let mut agent = FakeAgent::default();
        agent.add_metric("proc.nprocs", 1, None);

        let err = resolve_all(&mut agent).await.unwrap_err();
        assert!(matches!(err, CheckError::NullInstanceDomain { .. }));
    }

    #[tokio::test]
    async fn resolution_rejects_mismatched_domains() {
        let mut agent = FakeAgent::default();
        agent.add_metric("proc.psinfo.utime", 1, Some(InstanceDomainId::from(7)));
        agent.add_metric("proc.memory.rss", 2, Some(InstanceDomainId::from(8)));

        let err = resolve_all(&mut agent).await.unwrap_err();
        let CheckError::DescriptorMismatch {
            metric,
            got,
            first_metric,
            expected,
        } = err
        else {
            panic!("expected a descriptor mismatch");
        };
        assert_eq!(metric, "proc.memory.rss");
        assert_eq!(got, "8");
        assert_eq!(first_metric, "proc.psinfo.utime");
        assert_eq!(expected, InstanceDomainId::from(7));
    }

    // ------------------------------------------------------------------------
    // Consistency passes
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn format_pass_accepts_a_consistent_snapshot() {
        let mut agent = FakeAgent::with_proc_metrics();
        let snapshot = snapshot_of(&mut agent).await;
        check_instance_names(&snapshot, NameFormat::FixedWidth(5)).unwrap();
    }

    #[tokio::test]
    async fn format_pass_flags_a_name_encoding_the_wrong_id() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.push_live(31337, "00042 impostor");
        let snapshot = snapshot_of(&mut agent).await;

        let err = check_instance_names(&snapshot, NameFormat::FixedWidth(5)).unwrap_err();
        let CheckError::Consistency { id, name, .. } = err else {
            panic!("expected a consistency violation");
        };
        assert_eq!(id, 31337);
        assert_eq!(name, "00042 impostor");
    }

    #[tokio::test]
    async fn format_pass_flags_an_unparsable_name() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.push_live(50, "sched");
        let snapshot = snapshot_of(&mut agent).await;

        let err = check_instance_names(&snapshot, NameFormat::FixedWidth(5)).unwrap_err();
        assert!(matches!(err, CheckError::Consistency { id: 50, .. }));
    }

    #[tokio::test]
    async fn name_lookup_requires_not_found_for_the_dead_probe() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.push_live(7, "00007 sh");
        let snapshot = snapshot_of(&mut agent).await;

        // The probe exits between the snapshot and the lookup pass.
        agent.kill(7);

        check_name_to_id(&mut agent, &snapshot, NameFormat::FixedWidth(5), 7)
            .await
            .unwrap();
        check_id_to_name(&mut agent, &snapshot, NameFormat::FixedWidth(5), 7)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lookups_tolerate_an_unrelated_death() {
        let mut agent = FakeAgent::with_proc_metrics();
        let snapshot = snapshot_of(&mut agent).await;

        agent.kill(4096);

        check_name_to_id(&mut agent, &snapshot, NameFormat::FixedWidth(5), 31337)
            .await
            .unwrap();
        check_id_to_name(&mut agent, &snapshot, NameFormat::FixedWidth(5), 31337)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn name_lookup_flags_an_id_mismatch() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.misreport_name_lookup = Some(("00100 init".into(), 222));
        let snapshot = snapshot_of(&mut agent).await;

        let err = check_name_to_id(&mut agent, &snapshot, NameFormat::FixedWidth(5), 31337)
            .await
            .unwrap_err();
        let CheckError::Consistency { id: 100, detail, .. } = err else {
            panic!("expected a consistency violation for instance 100");
        };
        assert!(detail.contains("222"));
    }

    #[tokio::test]
    async fn id_lookup_flags_a_name_mismatch() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.misreport_id_lookup = Some((4096, "09999 impostor".into()));
        let snapshot = snapshot_of(&mut agent).await;

        let err = check_id_to_name(&mut agent, &snapshot, NameFormat::FixedWidth(5), 31337)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Consistency { id: 4096, .. }));
    }

    #[tokio::test]
    async fn id_lookup_accepts_zero_padded_names_under_variable_format() {
        let mut agent = FakeAgent::with_proc_metrics();
        let snapshot = snapshot_of(&mut agent).await;

        // Variable-format platforms may still hand back padded names.
        check_id_to_name(&mut agent, &snapshot, NameFormat::Variable, 31337)
            .await
            .unwrap();
    }

    // ------------------------------------------------------------------------
    // Profile / fetch
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn profile_replacement_is_destructive() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.replace_profile(TEST_DOMAIN, &[5]).await.unwrap();
        agent.replace_profile(TEST_DOMAIN, &[6, 7]).await.unwrap();
        assert_eq!(agent.profile, vec![6, 7]);
    }

    #[tokio::test]
    async fn restricted_fetch_stays_inside_the_profile() {
        let mut agent = FakeAgent::with_proc_metrics();
        let resolved = resolve_all(&mut agent).await.unwrap();

        let warnings = check_restricted_fetch(&mut agent, &resolved, [100, 4096], 2)
            .await
            .unwrap();
        assert_eq!(warnings, 0);
        assert_eq!(agent.profile, vec![100, 4096]);
    }

    #[tokio::test]
    async fn restricted_fetch_warns_when_an_instance_is_absent() {
        let mut agent = FakeAgent::with_proc_metrics();
        let resolved = resolve_all(&mut agent).await.unwrap();

        // 9999 is profiled but not alive: both metrics come back short.
        let warnings = check_restricted_fetch(&mut agent, &resolved, [100, 9999], 1)
            .await
            .unwrap();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn restricted_fetch_flags_an_out_of_profile_instance() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.push_live(31337, "31337 rogue");
        agent.rogue_instance = Some(31337);
        let resolved = resolve_all(&mut agent).await.unwrap();

        let err = check_restricted_fetch(&mut agent, &resolved, [100, 4096], 1)
            .await
            .unwrap_err();
        let CheckError::Profile { instance, .. } = err else {
            panic!("expected a profile violation");
        };
        assert_eq!(instance, 31337);
    }

    #[tokio::test]
    async fn unrestricted_fetch_covers_the_snapshot() {
        let mut agent = FakeAgent::with_proc_metrics();
        let resolved = resolve_all(&mut agent).await.unwrap();
        let snapshot = snapshot_of(&mut agent).await;

        check_unrestricted_fetch(&mut agent, &resolved, &snapshot)
            .await
            .unwrap();
        assert_eq!(agent.profile, snapshot.ids());
    }

    // ------------------------------------------------------------------------
    // Write rejection
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn store_rejection_accepts_both_permission_classes() {
        for outcome in [StoreOutcome::AccessDenied, StoreOutcome::PermissionDenied] {
            let mut agent = FakeAgent::with_proc_metrics();
            agent.store_outcome = outcome;
            let resolved = resolve_all(&mut agent).await.unwrap();

            check_write_rejection(&mut agent, &resolved).await.unwrap();
        }
    }

    #[tokio::test]
    async fn store_success_is_a_violation() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.store_outcome = StoreOutcome::Succeeds;
        let resolved = resolve_all(&mut agent).await.unwrap();

        let err = check_write_rejection(&mut agent, &resolved).await.unwrap_err();
        assert!(matches!(err, CheckError::ExpectedFailureNotRaised { .. }));
    }

    #[tokio::test]
    async fn store_failing_with_the_wrong_class_is_a_violation() {
        let mut agent = FakeAgent::with_proc_metrics();
        agent.store_outcome = StoreOutcome::WrongError;
        let resolved = resolve_all(&mut agent).await.unwrap();

        let err = check_write_rejection(&mut agent, &resolved).await.unwrap_err();
        let CheckError::ExpectedFailureNotRaised { outcome } = err else {
            panic!("expected the wrong-class violation");
        };
        assert!(outcome.contains("wrong error class"));
    }

    // ------------------------------------------------------------------------
    // Full runs
    // ------------------------------------------------------------------------

    fn run_config_with_procfs(dir: &Path) -> RunConfig {
        RunConfig {
            procfs_root: dir.to_path_buf(),
            refresh_secs: 1,
            iterations: 2,
            max_metrics: MAX_REQUESTED_METRICS,
        }
    }

    fn fixed_width_procfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00100", "04096"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn full_proc_run_passes_and_releases_the_session() {
        let procfs = fixed_width_procfs();
        let mut agent = FakeAgent::with_proc_metrics();
        let metrics = agent.metric_names();

        let summary = run_conformance(&mut agent, &run_config_with_procfs(procfs.path()), &metrics)
            .await
            .unwrap();

        // family, format, resolve, snapshot, instance-names, name-to-id,
        // id-to-name, restricted-fetch, unrestricted-fetch, write-rejection
        assert_eq!(summary.checks_passed, 10);
        assert!(agent.closed);
    }

    #[tokio::test]
    async fn hotproc_run_skips_the_write_rejection_check() {
        let procfs = fixed_width_procfs();
        let mut agent = FakeAgent::with_hotproc_metric();
        // Would fail the run if the store check executed.
        agent.store_outcome = StoreOutcome::Succeeds;
        let metrics = agent.metric_names();

        let summary = run_conformance(&mut agent, &run_config_with_procfs(procfs.path()), &metrics)
            .await
            .unwrap();

        assert_eq!(summary.checks_passed, 9);
        assert!(agent.closed);
    }

    #[tokio::test]
    async fn failed_runs_still_release_the_session() {
        let procfs = fixed_width_procfs();
        let mut agent = FakeAgent::with_proc_metrics();

        let err = run_conformance(
            &mut agent,
            &run_config_with_procfs(procfs.path()),
            &["proc.psinfo.nosuch".to_string()],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CheckError::NameResolution { .. }));
        assert!(agent.closed);
    }
}
