use serde::{Deserialize, Serialize};

/// Structured logging configuration. There is no metrics or trace export
/// surface here — only the `tracing` subscriber setup every crate emits
/// spans and events into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// The `service.name` field attached to every emitted event.
    #[serde(default = "d_service_name")]
    pub service_name: String,
    /// A `tracing_subscriber::EnvFilter` directive string, e.g.
    /// `"uds_scheduler=debug,info"`.
    #[serde(default = "d_log_filter")]
    pub log_filter: String,
    /// Emit newline-delimited JSON instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: d_service_name(),
            log_filter: d_log_filter(),
            json: false,
        }
    }
}

fn d_service_name() -> String {
    "uds-engine".into()
}

fn d_log_filter() -> String {
    "info".into()
}
