mod simulate;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use optistore::config::Config;
use optistore::logging;

#[derive(Parser, Debug)]
#[command(name = "optistore")]
#[command(about = "Tiered cache, read strategies and optimistic mutations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/optistore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a simulated storefront session and print per-tier cache statistics
  Simulate {
    /// Number of simulated user requests
    #[arg(long, default_value_t = 60)]
    requests: u32,

    /// Fail every Nth call to the fake API (0 never fails)
    #[arg(long, default_value_t = 7)]
    fail_every: u32,
  },
  /// Print the resolved configuration as YAML
  ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::ShowConfig => {
      print!("{}", serde_yaml::to_string(&config)?);
    }
    Command::Simulate {
      requests,
      fail_every,
    } => {
      // Flushes the log file when dropped
      let _guard = logging::init(&config.logging)?;
      let report = simulate::run(&config, requests, fail_every).await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
  }

  Ok(())
}
