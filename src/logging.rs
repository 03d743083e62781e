pub const LOG_ENV: &str = "DUALMIGRATE_LOG";
const DEFAULT_FILTER: &str = "dualmigrate=info,sqlx=warn";

/// Install the JSON tracing subscriber and route `log` records into it.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place. The filter comes from `DUALMIGRATE_LOG`.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .json()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
}
