use std::fmt;
use std::path::Path;
use std::time::Instant;

use boot_init::config::CONFIG_PATH;
use boot_init::{BootConfig, BootPaths, Orchestrator, Platform, Stage, StageError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, config_error) = match BootConfig::load(Path::new(CONFIG_PATH)) {
        Ok(config) => (config, None),
        Err(e) => (
            BootConfig::default(),
            Some(StageError::new(Stage::Config, e.to_string())),
        ),
    };

    let platform = Platform::system(&config);
    let mut orchestrator = Orchestrator::new(config, BootPaths::default(), platform);
    let err = match config_error {
        Some(err) => err,
        None => orchestrator.boot(),
    };
    orchestrator.fallback(&err);
}
