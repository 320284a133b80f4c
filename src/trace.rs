//! Propagation trace
//!
//! Lightweight timing instrumentation for the forward recording and
//! backward propagation paths. Disabled by default; when enabled, the
//! global tracer collects per-phase durations that can be summarized after
//! a run. Tracing never changes numeric results.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// The phases of one attribution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceStep {
    /// Forward pass recording activations
    Forward,
    /// Graph canonization
    Canonize,
    /// Composite rule assignment
    Assign,
    /// One backward relevance step
    Step,
    /// Relevance split or merge at a branch point
    Merge,
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single timing measurement.
#[derive(Debug, Clone)]
pub struct TraceMeasurement {
    pub step: TraceStep,
    pub duration: Duration,
    pub metadata: String,
}

/// Thread-safe tracer for collecting timing measurements.
pub struct Tracer {
    measurements: Mutex<Vec<TraceMeasurement>>,
    active_spans: Mutex<HashMap<TraceStep, Instant>>,
    enabled: Mutex<bool>,
}

impl Tracer {
    /// Create a new tracer.
    pub fn new() -> Self {
        Self {
            measurements: Mutex::new(Vec::new()),
            active_spans: Mutex::new(HashMap::new()),
            enabled: Mutex::new(false), // Disabled by default for performance
        }
    }

    /// Enable tracing.
    pub fn enable(&self) {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Disable tracing.
    pub fn disable(&self) {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Check if tracing is enabled.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a timing span. A second `start` for the same step before `end`
    /// restarts the span.
    pub fn start(&self, step: TraceStep) {
        if !self.is_enabled() {
            return;
        }
        self.active_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step, Instant::now());
    }

    /// End a timing span, recording its duration with `metadata`.
    pub fn end(&self, step: TraceStep, metadata: impl Into<String>) {
        if !self.is_enabled() {
            return;
        }
        let started = self
            .active_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&step);
        if let Some(t0) = started {
            self.measurements
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(TraceMeasurement {
                    step,
                    duration: t0.elapsed(),
                    metadata: metadata.into(),
                });
        }
    }

    /// Snapshot of all recorded measurements.
    pub fn measurements(&self) -> Vec<TraceMeasurement> {
        self.measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear all measurements and open spans.
    pub fn clear(&self) {
        self.measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.active_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Formatted per-step timing table, sorted by total duration.
    pub fn report(&self) -> String {
        let measurements = self.measurements.lock().unwrap_or_else(PoisonError::into_inner);
        if measurements.is_empty() {
            return "No measurements recorded. Enable tracing with TRACER.enable()".to_string();
        }

        let mut totals: HashMap<TraceStep, Duration> = HashMap::new();
        let mut counts: HashMap<TraceStep, usize> = HashMap::new();
        let mut total_time = Duration::ZERO;
        for m in measurements.iter() {
            *totals.entry(m.step).or_default() += m.duration;
            *counts.entry(m.step).or_default() += 1;
            total_time += m.duration;
        }

        let mut output = String::from("\nPROPAGATION TRACE REPORT\n");
        output.push_str(&format!("Total Measured Time: {total_time:.2?}\n"));
        output.push_str(&format!(
            "{:<10} | {:<8} | {:<15} | {:<8}\n",
            "Step", "Count", "Duration", "% Time"
        ));
        let mut sorted_steps: Vec<_> = totals.keys().collect();
        sorted_steps.sort_by(|a, b| totals[b].cmp(&totals[a]));
        for step in sorted_steps {
            let duration = totals[step];
            let pct = if total_time.is_zero() {
                0.0
            } else {
                100.0 * duration.as_secs_f64() / total_time.as_secs_f64()
            };
            output.push_str(&format!(
                "{:<10} | {:<8} | {:<15} | {pct:>6.1}%\n",
                step.to_string(),
                counts[step],
                format!("{duration:.2?}"),
            ));
        }
        output
    }

    /// Call count and total time per step.
    pub fn summary(&self) -> HashMap<TraceStep, (usize, Duration)> {
        let mut out: HashMap<TraceStep, (usize, Duration)> = HashMap::new();
        for m in self
            .measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            let entry = out.entry(m.step).or_insert((0, Duration::ZERO));
            entry.0 += 1;
            entry.1 += m.duration;
        }
        out
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Global tracer shared by the recording and propagation paths.
pub static TRACER: LazyLock<Tracer> = LazyLock::new(Tracer::new);
