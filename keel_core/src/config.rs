//! Library configuration resolved from environment variables.
//!
//! A single struct captures every tunable, resolved once at startup so the
//! hot paths read plain fields.

use crate::error::{KeelError, KeelResult};
use std::sync::OnceLock;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables of the object substrate and the communication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeelConfig {
    /// Start split reductions with a non-blocking collective at flush time.
    ///
    /// Default: false (`KEEL_SPLIT_REDUCTION_ASYNC`)
    pub split_reduction_async: bool,

    /// Number of value slots a split reduction reserves up front.
    ///
    /// Default: 32 (`KEEL_SPLIT_REDUCTION_INITIAL`)
    pub split_reduction_initial_ops: usize,

    /// Upper bound on values queued in one split-reduction round.
    ///
    /// Default: 65536 (`KEEL_SPLIT_REDUCTION_MAX_OPS`)
    pub split_reduction_max_ops: usize,

    /// Keep released duplicated contexts on a free list for reuse.
    ///
    /// Default: true (`KEEL_COMM_REUSE`)
    pub reuse_communicators: bool,

    /// Verify logically collective arguments in debug builds.
    ///
    /// Default: true (`KEEL_CHECK_COLLECTIVE`)
    pub check_collective_arguments: bool,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            split_reduction_async: false,
            split_reduction_initial_ops: 32,
            split_reduction_max_ops: 1 << 16,
            reuse_communicators: true,
            check_collective_arguments: true,
        }
    }
}

impl KeelConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let split_reduction_async = lookup("KEEL_SPLIT_REDUCTION_ASYNC")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.split_reduction_async);

        let split_reduction_initial_ops = lookup("KEEL_SPLIT_REDUCTION_INITIAL")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.split_reduction_initial_ops);

        let split_reduction_max_ops = lookup("KEEL_SPLIT_REDUCTION_MAX_OPS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.split_reduction_max_ops);

        let reuse_communicators = lookup("KEEL_COMM_REUSE")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.reuse_communicators);

        let check_collective_arguments = lookup("KEEL_CHECK_COLLECTIVE")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.check_collective_arguments);

        Self {
            split_reduction_async,
            split_reduction_initial_ops: split_reduction_initial_ops.min(split_reduction_max_ops),
            split_reduction_max_ops,
            reuse_communicators,
            check_collective_arguments,
        }
    }
}

/// A variable counts as set when it is non-empty and not a false spelling.
#[inline]
fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !value.eq_ignore_ascii_case("0")
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("no")
        && !value.eq_ignore_ascii_case("off")
}

// =============================================================================
// Global Configuration
// =============================================================================

static CONFIG: OnceLock<KeelConfig> = OnceLock::new();

/// Get the process-wide configuration, resolving it from the environment on
/// first use.
pub fn config() -> &'static KeelConfig {
    CONFIG.get_or_init(KeelConfig::from_env)
}

/// Install the process-wide configuration.
///
/// Fails once the configuration has been read or installed.
pub fn configure(config: KeelConfig) -> KeelResult<()> {
    CONFIG
        .set(config)
        .map_err(|_| KeelError::usage("configuration is already in use"))
}

// =============================================================================
// Tests
// =============================================================================
