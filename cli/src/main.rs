use std::process::ExitCode;
use std::sync::OnceLock;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;
mod ledger;
mod subscriber;
mod util;

fn main() -> ExitCode {
    if std::env::var("RUST_BACKTRACE").is_err() {
        // SAFETY: Nothing else is running yet.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }

    match App::parse().run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

/// Shard block scanner
#[derive(Parser)]
#[clap(name = "shardscan")]
#[clap(version = version_string())]
#[clap(subcommand_required = true, arg_required_else_help = true)]
struct App {
    #[clap(subcommand)]
    cmd: Cmd,
}

impl App {
    fn run(self) -> Result<()> {
        match self.cmd {
            Cmd::Run(cmd) => cmd.run(),
            Cmd::Height(cmd) => cmd.run(),
            Cmd::DecodeHeight(cmd) => cmd.run(),
            Cmd::InitConfig(cmd) => cmd.run(),
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    Run(cmd::run::CmdRun),
    Height(cmd::height::CmdHeight),
    DecodeHeight(cmd::height::CmdDecodeHeight),
    InitConfig(cmd::init_config::CmdInitConfig),
}

fn version_string() -> &'static str {
    static STRING: OnceLock<String> = OnceLock::new();
    STRING.get_or_init(|| format!("(release {SHARDSCAN_VERSION}) (rustc {RUSTC_VERSION})"))
}

static SHARDSCAN_VERSION: &str = env!("SHARDSCAN_VERSION");
static RUSTC_VERSION: &str = env!("SHARDSCAN_RUSTC_VERSION");
