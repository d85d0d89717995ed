use env_logger::{Builder, Env};
use log::LevelFilter;

/// Installs the global logger. `RUST_LOG` picks the level unless `verbose`
/// forces debug output. Calling this twice is harmless.
pub fn init_logging(verbose: bool) {
    let mut builder = if verbose {
        let mut builder = Builder::new();
        builder.filter_level(LevelFilter::Debug);
        builder
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };
    builder.format_target(false);
    let _ = builder.try_init();
}
