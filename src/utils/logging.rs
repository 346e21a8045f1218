use tracing_subscriber::EnvFilter;

/// Installs the bridge's `tracing` subscriber.
///
/// `directives` is a bare level (`error`, `warn`/`warning`, `info`, `debug`,
/// `trace`) or a full filter such as `amqp_bridge=debug,lapin=info`. A bare
/// level of `info` or below keeps the AMQP client at `warn`.
///
/// What the bridge emits:
/// - `info`: connections opened and closed, publisher start and stop, every
///   received delivery, every publish request and every downstream write
/// - `warn`: rejected deliveries, aborted drains, failed connection closes
/// - `error`: whatever ended the consume loop or the publisher loop
///
/// Lines carry the thread name so the consume loop and the publisher loop can
/// be told apart when they run on different workers. Calling it again is a
/// no-op.
pub fn init(directives: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(directives))
        .with_thread_names(true)
        .try_init();
}

fn filter(directives: &str) -> EnvFilter {
    let level = match directives.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "info" => "info,lapin=warn",
        "debug" => "debug,lapin=warn",
        "trace" => "trace,lapin=warn",
        _ => {
            return EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
        }
    };
    EnvFilter::new(level)
}
