/// Installs the `env_logger` backend for the `log` facade
///
/// Log level is Debug in development builds and Info in production builds.
/// `RUST_LOG` overrides both. HTTP client internals are capped at Warn.
///
/// Calling it more than once is harmless; only the first call installs a logger.
pub fn init() {
    let _ = env_logger::builder()
        .filter_level(if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .filter_module("hyper_util", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .format_timestamp_millis()
        .parse_default_env()
        .try_init();
}
