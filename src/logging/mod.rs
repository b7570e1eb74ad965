use crate::config::LogLevel;

pub fn init(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("fastsearch={}", level.as_directive())
                    .parse()
                    .unwrap(),
            ),
        )
        .with_writer(std::io::stderr)
        .init();
}
