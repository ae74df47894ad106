//! # Error Taxonomy
//!
//! Library-level failures are expressed as [`BenchError`]. Most of them never
//! escape a device thread: timeouts and malformed responses are counted and
//! logged, socket failures stop the owning device, and an aborted barrier is
//! a cooperative "stop and clean up" signal. Only configuration problems
//! (bad URI, wrong address family, a run already active) reach the caller.
//!
//! Application code (`main`, the controller and agent loops) wraps these in
//! `anyhow::Error` with added context.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures raised while mutating a [`crate::coap::frame::Frame`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The 3-byte Observe sequence overflowed. The option has been reset to
    /// zero length and the observe relationship must end.
    #[error("observe sequence space exhausted")]
    ObserveExhausted,

    /// The frame carries no Observe option where one was expected.
    #[error("frame has no observe option")]
    MissingObserve,

    /// The buffer is shorter than its header claims.
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),
}

/// Errors produced by the benchmark engine.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error("socket failure while {context}: {source}")]
    SocketFailure {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("agent {agent} unreachable: {reason}")]
    AgentUnreachable { agent: SocketAddr, reason: String },

    #[error("barrier aborted")]
    BarrierAborted,

    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("bind address {bind} is not in the same address family as target {target}")]
    AddressFamilyMismatch { bind: std::net::IpAddr, target: SocketAddr },

    #[error("a benchmark run is already active")]
    RunActive,

    #[error("no target URI configured")]
    NoTarget,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("codec error: {0}")]
    Codec(String),
}

impl BenchError {
    /// Shorthand for wrapping an I/O error with what was being attempted.
    pub fn socket(context: &'static str, source: io::Error) -> Self {
        BenchError::SocketFailure { context, source }
    }

    /// Whether the error only affects a single exchange and the device
    /// should keep looping.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BenchError::Timeout(_) | BenchError::MalformedResponse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
