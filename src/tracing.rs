use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logs to stderr. `RUST_LOG`, when set, overrides the configured level.
pub fn init() -> anyhow::Result<()> {
    let level = crate::conf::global().log_level;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!(
            "{crate_name}={level},tower_http=warn,sqlx=warn,info",
            crate_name = env!("CARGO_PKG_NAME"),
            level = level.as_str().to_lowercase(),
        )),
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        )
        .with(filter)
        .try_init()?;
    Ok(())
}
