use env_logger::{Builder, Env, Target};
use std::io::Write;

/// Initialise `env_logger`; `RUST_LOG` overrides `default_level`.
pub fn setup_logging(default_level: &str) {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_level));

    builder
        .target(Target::Stdout)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    // A second init (e.g. from tests) is harmless.
    let _ = builder.try_init();
}
