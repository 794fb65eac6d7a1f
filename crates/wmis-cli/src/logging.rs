use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "WMIS_LOG_LEVEL";

/// `--debug` wins, then `RUST_LOG`, then `WMIS_LOG_LEVEL`, then `info`.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(fallback_level(std::env::var(LOG_LEVEL_ENV).ok())))
    };

    // stdout carries command output.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_error: a global subscriber is already installed");
    }
}

fn fallback_level(configured: Option<String>) -> String {
    configured
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_level_defaults_to_info() {
        assert_eq!(fallback_level(None), "info");
        assert_eq!(fallback_level(Some("  ".to_string())), "info");
        assert_eq!(fallback_level(Some("warn".to_string())), "warn");
    }
}
