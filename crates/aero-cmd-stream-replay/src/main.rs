use std::path::PathBuf;

use aero_cmd_stream::ChannelConfig;
use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "aero-cmd-stream-replay",
    version,
    about = "Replay a command-stream workload script and print what the client observes."
)]
struct Args {
    /// Workload script (JSON)
    script: PathBuf,

    /// Channel configuration (JSON); defaults apply to missing fields.
    ///
    /// Environment variable: `AERO_CMD_STREAM_CONFIG`.
    #[arg(long, value_name = "PATH", env = "AERO_CMD_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (tracing-subscriber EnvFilter syntax). Falls back to `RUST_LOG`.
    ///
    /// Environment variable: `AERO_CMD_STREAM_LOG`.
    #[arg(long, env = "AERO_CMD_STREAM_LOG")]
    log_level: Option<String>,

    /// Output format.
    ///
    /// Environment variable: `AERO_CMD_STREAM_FORMAT`.
    #[arg(long, value_enum, default_value_t = Format::Text, env = "AERO_CMD_STREAM_FORMAT")]
    format: Format,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log filter {level:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => aero_cmd_stream_replay::load_config(path)?,
        None => ChannelConfig::default(),
    };
    let script = aero_cmd_stream_replay::load_script(&args.script)?;
    tracing::info!(
        script = %args.script.display(),
        steps = script.steps.len(),
        "replaying"
    );

    let log = aero_cmd_stream_replay::replay_script(config, &script)
        .with_context(|| format!("replaying {}", args.script.display()))?;

    match args.format {
        Format::Text => print!("{}", log.render_text()),
        Format::Json => println!("{}", serde_json::to_string_pretty(&log)?),
    }
    Ok(())
}
