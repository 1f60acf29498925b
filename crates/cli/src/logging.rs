use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "SITESCAN_LOG";

/// Install the global subscriber. Logs go to stderr so stdout stays usable
/// for `--json` output.
pub fn init(verbosity: u8) {
    let fallback = match verbosity {
        0 => "warn,sitescan=info",
        1 => "info,sitescan=debug",
        _ => "debug,sitescan=trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbosity > 1))
        .with(filter)
        .init();
}
