use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flagdb::dispatcher::Dispatcher;
use log::info;

use flagd::config::ConfigLoad;
use flagd::{service, trace};

#[derive(Debug, Parser)]
#[command(version, author, about = "flagd: named-flag transactional KV service")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/flagd.json")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the TCP listener, serving the operation surface.
    Serve {
        /// Overrides the config file's bind address.
        #[clap(long)]
        bind: Option<String>,
    },
    /// Install/start/stop/restart/uninstall tokens for external process
    /// supervisors. Process supervision itself is out of scope; this
    /// prints the received token and exits.
    Control {
        #[clap(value_enum)]
        action: ControlAction,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum ControlAction {
    Install,
    Start,
    Stop,
    Restart,
    Uninstall,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = format!("{}/.flagd", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;

    let cfg = ConfigLoad::load(std::path::Path::new(&args.config)).unwrap_or_default();
    info!("flagd starting with config: {:?}", &cfg);

    match args.cmd {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or(cfg.bind.clone());
            let dispatcher = Arc::new(Dispatcher::new(PathBuf::from(&cfg.data_dir))?);
            service::serve(&bind, dispatcher).await?;
        }
        Command::Control { action } => {
            println!("control: received {action:?} (process supervision is not implemented by this service)");
        }
    }

    Ok(())
}
