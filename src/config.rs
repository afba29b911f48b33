//! Engine configuration
//!
//! Deserialisable from any serde format; [`EngineConfig::from_env`] layers
//! `RETROCORE_*` environment overrides on top of the defaults.

use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run through the trace JIT when the model supports it
    pub jit: bool,
    /// Maximum instructions per compiled trace
    pub max_trace_length: usize,
    /// The debugger runs on a different thread from the emulation loop
    pub cross_thread_debug: bool,
    /// Breakpoints park the emulation thread. Defaults to `cross_thread_debug`.
    pub breakpoints_pause: Option<bool>,
    /// Capacity of the recently-executed-address ring; 0 disables it
    pub trace_buffer: usize,
    /// Open bus keeps the last data byte (true) or the low address byte
    pub open_bus_is_data: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            jit: false,
            max_trace_length: 32,
            cross_thread_debug: true,
            breakpoints_pause: None,
            trace_buffer: 0,
            open_bus_is_data: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `RETROCORE_JIT`, `RETROCORE_TRACE_LEN` and
    /// `RETROCORE_TRACE_BUFFER`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("RETROCORE_JIT") {
            self.jit = matches!(v.trim(), "1" | "true" | "on" | "yes");
        }
        if let Some(v) = get("RETROCORE_TRACE_LEN") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_trace_length = n,
                _ => warn!(value = %v, "ignoring invalid RETROCORE_TRACE_LEN"),
            }
        }
        if let Some(v) = get("RETROCORE_TRACE_BUFFER") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.trace_buffer = n,
                Err(_) => warn!(value = %v, "ignoring invalid RETROCORE_TRACE_BUFFER"),
            }
        }
    }

    pub fn breakpoints_pause(&self) -> bool {
        self.breakpoints_pause.unwrap_or(self.cross_thread_debug)
    }
}
