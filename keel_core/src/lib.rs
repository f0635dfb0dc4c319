//! Shared foundation of the keel crates.
//!
//! This crate provides:
//! - The error type every fallible operation returns (`KeelError`)
//! - Numeric aliases (`Int`, `Real`, `Scalar`)
//! - `Spinlock` and the named locks for shared text streams
//! - Library configuration resolved from the environment
//! - Tracing subscriber installation

pub mod config;
pub mod error;
pub mod logging;
pub mod spinlock;
pub mod types;

pub use config::{KeelConfig, config, configure};
pub use error::{KeelError, KeelResult};
pub use spinlock::{ASCII_STDERR_LOCK, ASCII_STDOUT_LOCK, AsciiStream, Spinlock, SpinlockGuard};
pub use types::{Int, Real, Scalar};
