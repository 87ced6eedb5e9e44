//! Per-item execution log collection.
//!
//! The node creates one `ExecutionLogCollector` per job item and hands it to
//! the invoker inside the `InvocationContext`. Events are always forwarded
//! to the host's `LogSink`; while the collector is attached they are also
//! recorded for the item's `ExecutionLog`, according to its mode.

use std::collections::BTreeSet;
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use calcnode_core::log::{CapturedException, ExecutionLog, ExecutionLogMode, LogEvent, LogLevel};

/// Host-owned destination for function log output.
pub trait LogSink: Send + Sync {
    fn log(&self, function_id: &str, event: &LogEvent);
}

/// Emits function log events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, function_id: &str, event: &LogEvent) {
        let message = event.message.as_str();
        match event.level {
            LogLevel::Trace => tracing::trace!(function = function_id, "{message}"),
            LogLevel::Debug => tracing::debug!(function = function_id, "{message}"),
            LogLevel::Info => tracing::info!(function = function_id, "{message}"),
            LogLevel::Warn => tracing::warn!(function = function_id, "{message}"),
            LogLevel::Error => tracing::error!(function = function_id, "{message}"),
        }
    }
}

struct CollectorState {
    attached: bool,
    levels: BTreeSet<LogLevel>,
    events: Vec<LogEvent>,
    exception: Option<CapturedException>,
}

#[derive(Clone)]
pub struct ExecutionLogCollector {
    function_id: Arc<str>,
    mode: ExecutionLogMode,
    sink: Arc<dyn LogSink>,
    state: Arc<Mutex<CollectorState>>,
}

impl ExecutionLogCollector {
    pub fn new(function_id: &str, mode: ExecutionLogMode, sink: Arc<dyn LogSink>) -> Self {
        Self {
            function_id: Arc::from(function_id),
            mode,
            sink,
            state: Arc::new(Mutex::new(CollectorState {
                attached: false,
                levels: BTreeSet::new(),
                events: Vec::new(),
                exception: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> ExecutionLogMode {
        self.mode
    }

    /// Start recording. Recording stops when the guard drops.
    pub fn attach(&self) -> AttachGuard {
        self.lock().attached = true;
        AttachGuard {
            collector: self.clone(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let event = LogEvent {
            level,
            message: message.into(),
        };
        self.sink.log(&self.function_id, &event);

        let mut state = self.lock();
        if !state.attached {
            return;
        }
        state.levels.insert(level);
        if self.mode == ExecutionLogMode::Full {
            state.events.push(event);
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Record an exception from pre-formatted parts.
    pub fn set_exception(
        &self,
        class_name: impl Into<String>,
        message: Option<String>,
        stack_trace: Option<String>,
    ) {
        let mut state = self.lock();
        state.levels.insert(LogLevel::Error);
        if self.mode == ExecutionLogMode::None {
            return;
        }
        state.exception = Some(CapturedException {
            class_name: class_name.into(),
            message,
            stack_trace,
        });
    }

    /// Record a live error. The source chain becomes the trace.
    pub fn capture_error<E: Error + 'static>(&self, error: &E) {
        let class_name = short_type_name(std::any::type_name::<E>());
        self.set_exception(class_name, Some(error.to_string()), format_source_chain(error));
    }

    /// Snapshot of what was collected.
    pub fn finish(&self) -> ExecutionLog {
        let state = self.lock();
        ExecutionLog {
            log_levels: state.levels.clone(),
            events: (self.mode == ExecutionLogMode::Full).then(|| state.events.clone()),
            exception: state.exception.clone(),
        }
    }
}

/// Detaches its collector on drop.
pub struct AttachGuard {
    collector: ExecutionLogCollector,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.collector.lock().attached = false;
    }
}

fn short_type_name(name: &str) -> &str {
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

/// "caused by" lines for each error in the source chain.
pub fn format_source_chain(error: &(dyn Error + 'static)) -> Option<String> {
    let mut lines = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}
