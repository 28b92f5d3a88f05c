//! Structured build progress events
//!
//! The scheduler reports through a caller-supplied sink; events are emitted
//! from the driver thread only, never from workers.

use std::fmt;

/// Build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Phase A: AVIS sequence encoding.
    Sequences,
    /// Phase B: scatter AVIF encoding.
    Images,
    /// Write phase: verbatim passthrough and manifest embedding.
    Copy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sequences => write!(f, "AVIS sequences"),
            Phase::Images => write!(f, "AVIF images"),
            Phase::Copy => write!(f, "copy"),
        }
    }
}

/// One progress event.
///
/// `original_bytes` / `compressed_bytes` are running totals over everything
/// encoded so far, so a sink can render an overall ratio at any point.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseStart {
        phase: Phase,
    },
    TaskDone {
        done: usize,
        total: usize,
        original_bytes: u64,
        compressed_bytes: u64,
        message: String,
    },
    PhaseEnd {
        phase: Phase,
    },
    Warning {
        message: String,
    },
}

/// Receives build progress. Implementations need not be thread-safe; the
/// scheduler calls from one thread.
pub trait ProgressSink {
    fn event(&mut self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&mut self, _event: &ProgressEvent) {}
}
