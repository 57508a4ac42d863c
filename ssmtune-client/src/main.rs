//! SSM command line client
//!
//! Polls live parameters from an ECU and manages its live-tune RAM region,
//! over a TCP link such as the mock ECU server or a serial bridge.
//!
//! Usage: cargo run -p ssmtune-client -- [OPTIONS] <COMMAND>

mod livetune;
mod poll;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ssmtune")]
#[command(about = "Poll parameters and live-tune tables on an SSM ECU")]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:35000", global = true)]
    address: String,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll parameters and print values and query rate
    Poll(poll::PollArgs),
    /// Inspect or change the live-tune RAM region
    Livetune(livetune::LiveTuneArgs),
}

/// Parse `0x`-prefixed hex or decimal
fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    match &args.command {
        Command::Poll(poll_args) => poll::run(&args.address, poll_args),
        Command::Livetune(livetune_args) => livetune::run(&args.address, livetune_args),
    }
}
