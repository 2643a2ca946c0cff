use tracing_subscriber::EnvFilter;

/// Crates whose events are emitted at the configured level.
const CRATES: [&str; 2] = ["gcpsd", "gcp"];

/// Build the filter directive for `level`, `off` silences everything.
pub fn levels(level: &str) -> String {
    match level {
        "off" => "off".to_string(),
        level => CRATES
            .iter()
            .map(|name| format!("{name}={level}"))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Install the global subscriber, calling it twice keeps the first one.
pub fn init(color: bool, json: bool, levels: &str) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(levels))
        .with_ansi(color);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };

    if let Err(err) = result {
        debug!(message = "tracing subscriber already installed", %err);
    }
}
