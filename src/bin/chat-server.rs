use std::fs;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatroom::config::Config;
use chatroom::daemon::{self, Options};

/// Runs the chat server.
#[derive(Parser, Debug)]
#[command(name = "chat-server", about = "Multi-room chat server")]
struct Args {
    /// Port to listen on, as a bare positional (`chat-server 5000`).
    port_positional: Option<u16>,

    /// Port to listen on, as a flag. Equivalent to the positional
    /// form; exactly one of the two must be given.
    #[arg(long = "port")]
    port_flag: Option<u16>,

    /// Tab-separated `username\tpassword` credentials file.
    #[arg(long)]
    passwords: Option<String>,

    /// TOML config file overriding connection/backlog defaults.
    #[arg(long)]
    config: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<String>,

    /// Increase log verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    let port = args
        .port_positional
        .or(args.port_flag)
        .context("a port is required, either as a bare positional or via --port")?;

    let users = match &args.passwords {
        Some(path) => {
            let contents = fs::read_to_string(path).with_context(|| format!("reading passwords file {path}"))?;
            daemon::load_password_file(&contents)?
        }
        None => Default::default(),
    };

    let config = match &args.config {
        Some(path) => {
            let contents = fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
            Config::from_toml_str(&contents)?
        }
        None => Config::default(),
    };

    daemon::run(Options { port, users, config })
}

fn init_logging(verbose: u8, log_file: Option<&str>) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = fs::File::create(path).with_context(|| format!("creating log file {path}"))?;
            builder.with_writer(file).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
