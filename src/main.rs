mod repl;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use sop_voice::config::Config;

#[derive(Parser)]
#[command(name = "sop-voice", about = "Voice commands for SOP authoring (typed lines stand in for speech)")]
struct Cli {
    /// Config file (default: sop-voice.toml in the working directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep listening after each utterance
    #[arg(long)]
    continuous: bool,

    /// What recognized speech feeds: command, title, step or material
    #[arg(long, default_value = "command")]
    target: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };
    if cli.continuous {
        config.recognition.continuous = true;
    }

    let target = repl::Target::parse(&cli.target)
        .with_context(|| format!("unknown target {:?}", cli.target))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(repl::run(config, target))
}
