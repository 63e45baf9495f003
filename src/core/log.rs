use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, filter::Targets, fmt, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Installs the global subscriber. `serve` keeps info-level output on so the
/// background loops stay observable; the one-shot commands stay quiet unless
/// `verbose` is set.
pub fn init_logging(verbose: bool, daemon: bool) {
    let (level_filter, level) = match (verbose, daemon) {
        (true, _) => (LevelFilter::DEBUG, "debug"),
        (false, true) => (LevelFilter::INFO, "info"),
        (false, false) => (LevelFilter::OFF, "off"),
    };
    let app_filter = Targets::new().with_target("marketcache", level_filter);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(app_filter).with(env_filter);
    if daemon {
        registry.with(fmt::layer().compact()).init();
    } else {
        registry.with(fmt::layer().pretty().without_time()).init();
    }
}
