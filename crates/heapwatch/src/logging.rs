//! Barrier and Validation Logging
//!
//! Event logging for heapwatch operations, useful for:
//! - Diagnosing heap corruption reports
//! - Watching validation backpressure
//! - Debugging collector table handling
//!
//! Log Levels:
//! - ERROR: Corruption, fatal termination
//! - WARN: Forced collections, shadow heap mismatches
//! - INFO: Validation passes
//! - DEBUG: Bounds updates, table resets
//! - TRACE: Per-object events (pinned arguments)
//!
//! Every event is forwarded to the `log` facade. Console output and event
//! retention are controlled by [`WatchLoggerConfig`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for heapwatch events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Heapwatch event types
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Collector published new heap bounds
    BoundsUpdated {
        lowest: usize,
        highest: usize,
        ephemeral_low: usize,
        ephemeral_high: usize,
    },

    /// Collector cleared a card range
    CardsCleared { start: usize, end: usize, cards: usize },

    /// Collector harvested and reset write watch pages
    WriteWatchReset { pages: usize },

    /// Validation queue exceeded its limit and forced a collection
    BackpressureCollection { pending: usize, limit: usize },

    /// Safepoint validation pass completed
    ValidationPass { entries: usize, duration_us: u64 },

    /// Object validation failed
    CorruptionDetected { pointer: usize, culprit: String },

    /// Managed object pinned for an interop call
    PinnedArgument {
        object: usize,
        size: usize,
        method: Option<String>,
    },

    /// Shadow heap disagrees with the real heap
    ShadowMismatch {
        slot: usize,
        expected: usize,
        actual: usize,
    },

    /// Process is about to terminate
    Fatal { message: String },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct WatchLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Retain events in memory for inspection
    pub retain: bool,

    /// Most events retained; the oldest are dropped first
    pub max_events: usize,
}

impl Default for WatchLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
            retain: true,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

/// Retained events kept by default
pub const DEFAULT_MAX_EVENTS: usize = 4096;

/// Centralized event logger
pub struct WatchLogger {
    config: WatchLoggerConfig,
    events: Mutex<VecDeque<(Instant, WatchEvent)>>,
    enabled: AtomicBool,
}

impl WatchLogger {
    /// Create new logger
    pub fn new(config: WatchLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log an event
    pub fn log(&self, event: WatchEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = event_level(&event);
        if level > self.config.level {
            return;
        }

        log::log!(log::Level::from(level), "{}", render_human(&event));

        if self.config.console {
            self.output_console(&event);
        }

        if self.config.retain && self.config.max_events > 0 {
            let mut events = self.events.lock();
            if events.len() == self.config.max_events {
                events.pop_front();
            }
            events.push_back((Instant::now(), event));
        }
    }

    fn output_console(&self, event: &WatchEvent) {
        let line = if self.config.json {
            render_json(event).to_string()
        } else {
            render_human(event)
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            eprintln!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), line);
        } else {
            eprintln!("{}", line);
        }
    }

    /// Get all retained events
    pub fn get_events(&self) -> Vec<(Instant, WatchEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    /// Clear retained events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Retained event count
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for WatchLogger {
    fn default() -> Self {
        Self::new(WatchLoggerConfig::default())
    }
}

/// Level assigned to an event
pub fn event_level(event: &WatchEvent) -> LogLevel {
    match event {
        WatchEvent::CorruptionDetected { .. } | WatchEvent::Fatal { .. } => LogLevel::Error,
        WatchEvent::BackpressureCollection { .. } | WatchEvent::ShadowMismatch { .. } => {
            LogLevel::Warn
        },
        WatchEvent::ValidationPass { .. } => LogLevel::Info,
        WatchEvent::BoundsUpdated { .. }
        | WatchEvent::CardsCleared { .. }
        | WatchEvent::WriteWatchReset { .. } => LogLevel::Debug,
        WatchEvent::PinnedArgument { .. } => LogLevel::Trace,
    }
}

/// Human-readable rendering
pub fn render_human(event: &WatchEvent) -> String {
    match event {
        WatchEvent::BoundsUpdated {
            lowest,
            highest,
            ephemeral_low,
            ephemeral_high,
        } => format!(
            "[heapwatch] bounds [{:#x}, {:#x}) ephemeral [{:#x}, {:#x})",
            lowest, highest, ephemeral_low, ephemeral_high
        ),
        WatchEvent::CardsCleared { start, end, cards } => format!(
            "[heapwatch] cleared {} cards over [{:#x}, {:#x})",
            cards, start, end
        ),
        WatchEvent::WriteWatchReset { pages } => {
            format!("[heapwatch] write watch reset, {} pages touched", pages)
        },
        WatchEvent::BackpressureCollection { pending, limit } => format!(
            "[heapwatch] {} pending byref validations exceed limit {}, forcing collection",
            pending, limit
        ),
        WatchEvent::ValidationPass {
            entries,
            duration_us,
        } => format!(
            "[heapwatch] validated {} byrefs in {} us",
            entries, duration_us
        ),
        WatchEvent::CorruptionDetected { pointer, culprit } => format!(
            "[heapwatch] corruption near {:#x}, culprit {}",
            pointer, culprit
        ),
        WatchEvent::PinnedArgument {
            object,
            size,
            method: Some(method),
        } => format!(
            "Managed object {:#x} with size '{:#x}' pinned for interop to Method [{}]",
            object, size, method
        ),
        WatchEvent::PinnedArgument {
            object,
            size,
            method: None,
        } => format!(
            "Managed object {:#x} pinned for interop with size '{:#x}'",
            object, size
        ),
        WatchEvent::ShadowMismatch {
            slot,
            expected,
            actual,
        } => format!(
            "[heapwatch] shadow mismatch at {:#x}: shadow {:#x}, heap {:#x}",
            slot, expected, actual
        ),
        WatchEvent::Fatal { message } => format!("[heapwatch] FATAL: {}", message),
    }
}

/// JSON rendering
pub fn render_json(event: &WatchEvent) -> serde_json::Value {
    match event {
        WatchEvent::BoundsUpdated {
            lowest,
            highest,
            ephemeral_low,
            ephemeral_high,
        } => serde_json::json!({
            "type": "bounds_updated",
            "lowest": lowest,
            "highest": highest,
            "ephemeral_low": ephemeral_low,
            "ephemeral_high": ephemeral_high
        }),
        WatchEvent::CardsCleared { start, end, cards } => serde_json::json!({
            "type": "cards_cleared",
            "start": start,
            "end": end,
            "cards": cards
        }),
        WatchEvent::WriteWatchReset { pages } => serde_json::json!({
            "type": "write_watch_reset",
            "pages": pages
        }),
        WatchEvent::BackpressureCollection { pending, limit } => serde_json::json!({
            "type": "backpressure_collection",
            "pending": pending,
            "limit": limit
        }),
        WatchEvent::ValidationPass {
            entries,
            duration_us,
        } => serde_json::json!({
            "type": "validation_pass",
            "entries": entries,
            "duration_us": duration_us
        }),
        WatchEvent::CorruptionDetected { pointer, culprit } => serde_json::json!({
            "type": "corruption_detected",
            "pointer": pointer,
            "culprit": culprit
        }),
        WatchEvent::PinnedArgument {
            object,
            size,
            method,
        } => serde_json::json!({
            "type": "pinned_argument",
            "object": object,
            "size": size,
            "method": method
        }),
        WatchEvent::ShadowMismatch {
            slot,
            expected,
            actual,
        } => serde_json::json!({
            "type": "shadow_mismatch",
            "slot": slot,
            "expected": expected,
            "actual": actual
        }),
        WatchEvent::Fatal { message } => serde_json::json!({
            "type": "fatal",
            "message": message
        }),
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<WatchLogger> = Mutex::new(WatchLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: WatchEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Replace the global logger configuration
pub fn configure_logger(config: WatchLoggerConfig) {
    *GLOBAL_LOGGER.lock() = WatchLogger::new(config);
}

/// Global logger event count
pub fn get_event_count() -> usize {
    GLOBAL_LOGGER.lock().event_count()
}

/// Snapshot of events retained by the global logger
pub fn get_events() -> Vec<WatchEvent> {
    GLOBAL_LOGGER
        .lock()
        .get_events()
        .into_iter()
        .map(|(_, event)| event)
        .collect()
}
