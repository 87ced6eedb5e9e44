//! Function invocation statistics.
//!
//! Each invocation gets a `DeferredInvocationStatistics`. Output sizes are
//! reported as the cache writes them, which may be after the item has
//! finished; the aggregate record goes to the sink once the last expected
//! output has been reported, and never again.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

/// One invocation, as reported to a statistics sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRecord {
    pub configuration: String,
    pub function_id: String,
    pub invocation_count: u64,
    pub invocation_nanos: u64,
    /// Mean input size in bytes. NaN when there were no inputs.
    pub data_input_bytes: f64,
    /// Mean output size in bytes. NaN when there were no outputs.
    pub data_output_bytes: f64,
}

pub trait FunctionInvocationStatisticsSink: Send + Sync {
    fn record_invocation(&self, record: InvocationRecord);
}

/// Drops every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingStatisticsSink;

impl FunctionInvocationStatisticsSink for DiscardingStatisticsSink {
    fn record_invocation(&self, _record: InvocationRecord) {}
}

// ── Per-invocation recorder ───────────────────────────────────────────────────

struct RecorderState {
    started: Option<Instant>,
    invocation_nanos: u64,
    data_input_bytes: f64,
    expected_outputs: Option<usize>,
    reported_outputs: usize,
    data_output_bytes: u64,
    emitted: bool,
}

#[derive(Clone)]
pub struct DeferredInvocationStatistics {
    configuration: Arc<str>,
    function_id: Arc<str>,
    sink: Arc<dyn FunctionInvocationStatisticsSink>,
    state: Arc<Mutex<RecorderState>>,
}

impl DeferredInvocationStatistics {
    pub fn new(
        configuration: &str,
        function_id: &str,
        sink: Arc<dyn FunctionInvocationStatisticsSink>,
    ) -> Self {
        Self {
            configuration: Arc::from(configuration),
            function_id: Arc::from(function_id),
            sink,
            state: Arc::new(Mutex::new(RecorderState {
                started: None,
                invocation_nanos: 0,
                data_input_bytes: f64::NAN,
                expected_outputs: None,
                reported_outputs: 0,
                data_output_bytes: 0,
                emitted: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_invocation(&self) {
        self.lock().started = Some(Instant::now());
    }

    pub fn end_invocation(&self) {
        let mut state = self.lock();
        if let Some(started) = state.started {
            state.invocation_nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        }
    }

    /// Total input bytes over `samples` inputs.
    pub fn set_data_input_bytes(&self, bytes: u64, samples: usize) {
        self.lock().data_input_bytes = if samples == 0 {
            f64::NAN
        } else {
            bytes as f64 / samples as f64
        };
    }

    /// Number of output size reports to wait for. Zero emits immediately.
    pub fn set_expected_data_output_samples(&self, samples: usize) {
        let record = {
            let mut state = self.lock();
            state.expected_outputs = Some(samples);
            self.take_record(&mut state)
        };
        self.emit(record);
    }

    pub fn add_data_output_bytes(&self, bytes: u64) {
        let record = {
            let mut state = self.lock();
            if state.emitted {
                return;
            }
            state.reported_outputs += 1;
            state.data_output_bytes += bytes;
            self.take_record(&mut state)
        };
        self.emit(record);
    }

    pub fn is_emitted(&self) -> bool {
        self.lock().emitted
    }

    fn take_record(&self, state: &mut RecorderState) -> Option<InvocationRecord> {
        let expected = state.expected_outputs?;
        if state.emitted || state.reported_outputs < expected {
            return None;
        }
        state.emitted = true;
        let data_output_bytes = if state.reported_outputs == 0 {
            f64::NAN
        } else {
            state.data_output_bytes as f64 / state.reported_outputs as f64
        };
        Some(InvocationRecord {
            configuration: self.configuration.to_string(),
            function_id: self.function_id.to_string(),
            invocation_count: 1,
            invocation_nanos: state.invocation_nanos,
            data_input_bytes: state.data_input_bytes,
            data_output_bytes,
        })
    }

    fn emit(&self, record: Option<InvocationRecord>) {
        if let Some(record) = record {
            self.sink.record_invocation(record);
        }
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct FunctionTotals {
    invocations: u64,
    invocation_nanos: u64,
    input_bytes: f64,
    input_samples: u64,
    output_bytes: f64,
    output_samples: u64,
}

/// Per (configuration, function) means, as reported by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionStatisticsSummary {
    pub configuration: String,
    pub function_id: String,
    pub invocations: u64,
    pub mean_invocation_nanos: f64,
    pub mean_data_input_bytes: Option<f64>,
    pub mean_data_output_bytes: Option<f64>,
}

/// Sums records per (configuration, function).
#[derive(Clone, Default)]
pub struct InvocationStatisticsAggregator {
    totals: Arc<DashMap<(String, String), FunctionTotals>>,
}

impl InvocationStatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FunctionStatisticsSummary> {
        let mut out: Vec<FunctionStatisticsSummary> = self
            .totals
            .iter()
            .map(|entry| {
                let (configuration, function_id) = entry.key();
                let t = entry.value();
                FunctionStatisticsSummary {
                    configuration: configuration.clone(),
                    function_id: function_id.clone(),
                    invocations: t.invocations,
                    mean_invocation_nanos: if t.invocations == 0 {
                        0.0
                    } else {
                        t.invocation_nanos as f64 / t.invocations as f64
                    },
                    mean_data_input_bytes: (t.input_samples > 0)
                        .then(|| t.input_bytes / t.input_samples as f64),
                    mean_data_output_bytes: (t.output_samples > 0)
                        .then(|| t.output_bytes / t.output_samples as f64),
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.configuration, &a.function_id).cmp(&(&b.configuration, &b.function_id))
        });
        out
    }

    pub fn invocations(&self, configuration: &str, function_id: &str) -> u64 {
        self.totals
            .get(&(configuration.to_string(), function_id.to_string()))
            .map(|t| t.invocations)
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.totals.clear();
    }
}

impl FunctionInvocationStatisticsSink for InvocationStatisticsAggregator {
    fn record_invocation(&self, record: InvocationRecord) {
        let mut totals = self
            .totals
            .entry((record.configuration, record.function_id))
            .or_default();
        totals.invocations += record.invocation_count;
        totals.invocation_nanos += record.invocation_nanos;
        // NaN means "no samples"; it must not poison the running mean.
        if !record.data_input_bytes.is_nan() {
            totals.input_bytes += record.data_input_bytes;
            totals.input_samples += 1;
        }
        if !record.data_output_bytes.is_nan() {
            totals.output_bytes += record.data_output_bytes;
            totals.output_samples += 1;
        }
    }
}
