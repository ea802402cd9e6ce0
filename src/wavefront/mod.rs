//! Wavefront telemetry: a queueing sender with proxy and direct ingestion
//! transports, plus the OpenTelemetry reporter and tracer built on top of it.

use once_cell::sync::Lazy;

pub mod application_tags;
pub mod direct;
pub mod format;
pub mod proxy;
pub mod registration;
pub mod reporter;
pub mod sender;
pub mod span_reporter;

pub use application_tags::ApplicationTags;
pub use direct::DirectIngestionClientBuilder;
pub use proxy::ProxyClientBuilder;
pub use registration::{
    add_wavefront_direct_ingestion, add_wavefront_proxy, register, RegistrationError,
    WavefrontTelemetry,
};
pub use reporter::WavefrontReporter;
pub use sender::{DataKind, SenderError, WavefrontClient};
pub use span_reporter::{WavefrontSpanReporter, WavefrontTracer};

const HOST_NAME_FILES: [&str; 2] = ["/proc/sys/kernel/hostname", "/etc/hostname"];

fn host_name(env_value: Option<String>, files: &[&str]) -> String {
    env_value
        .into_iter()
        .chain(
            files
                .iter()
                .filter_map(|path| std::fs::read_to_string(path).ok()),
        )
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Source reported when none is configured: `$HOSTNAME`, else the kernel's
/// host name, else `localhost`.
pub static DEFAULT_SOURCE: Lazy<String> =
    Lazy::new(|| host_name(std::env::var("HOSTNAME").ok(), &HOST_NAME_FILES));
