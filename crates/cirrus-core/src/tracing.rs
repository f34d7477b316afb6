//! Tracing initialization for the CLI and embedding services.

use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize tracing.
///
/// Uses the `RUST_LOG` environment variable for filtering, defaulting to `info`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init();
}

/// Logs how long a phase took when dropped.
#[derive(Debug)]
pub struct Stopwatch {
    label: String,
    start: Instant,
}

impl Stopwatch {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        tracing::debug!("Starting: {label}");
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        tracing::info!("{} took {}ms", self.label, self.start.elapsed().as_millis());
    }
}
