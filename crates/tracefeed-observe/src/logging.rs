use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TRACEFEED_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract:
/// - Always include `training_step_id` on coordinator events.
/// - Always include `shard` on shard events.
/// - Include `generation` on any compute-pool lifecycle event.
pub fn init_tracing() {
    let filter = env_filter();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TRACEFEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
