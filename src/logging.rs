/// Severity for messages buffered on an `OrchestrationContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Emit buffered orchestration logs through `tracing`, tagged with the instance.
pub fn flush(instance: &str, turn_index: u64, logs: Vec<(LogLevel, String)>) {
    for (level, msg) in logs {
        match level {
            LogLevel::Debug => tracing::debug!(instance, turn_index, "{msg}"),
            LogLevel::Info => tracing::info!(instance, turn_index, "{msg}"),
            LogLevel::Warn => tracing::warn!(instance, turn_index, "{msg}"),
            LogLevel::Error => tracing::error!(instance, turn_index, "{msg}"),
        }
    }
}

// Replay-safe macros: silent while the orchestration is replaying history.

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
