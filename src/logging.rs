use env_logger::{Builder, Env};

/// Installs the global logger. `RUST_LOG` wins over `default_filter`. Calling
/// it again is a no-op, so tests may initialise freely.
pub fn init(default_filter: &str) {
    let _ = Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init("debug");
        super::init("info");
        log::debug!("logger installed");
    }
}
