use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ATTENDD_LOG";

/// Installs the stderr subscriber. stdout carries IPC responses and must stay clean.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
