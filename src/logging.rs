use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Structured logging goes to stdout only under `--verbose`; a cron
/// invocation stays silent so the scheduler does not mail every pass.
pub fn init(verbose: bool, level: &str) {
    if !verbose {
        return;
    }
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

pub(crate) fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
