// vim: tw=80
use std::{
    fs::OpenOptions,
    io::{self, IsTerminal},
    path::PathBuf,
    process,
};

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use log::{error, info};

use fwapply::{
    actions::ApplyOptions,
    apply::{apply, check},
    block_cache::BlockCache,
    errors::Result,
    manifest::Manifest,
    progress::{Progress, ProgressMode},
};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device or image file to write
    #[arg(
        short = 'd',
        long = "destination",
        value_name = "PATH",
        required_unless_present = "check"
    )]
    destination: Option<PathBuf>,

    /// Task to run
    #[arg(short = 't', long = "task", default_value = "complete")]
    task: String,

    /// Validate the bundle's manifest and exit
    #[arg(long = "check")]
    check: bool,

    /// Permit actions that write host paths or spawn subprocesses
    #[arg(long = "unsafe")]
    allow_unsafe: bool,

    /// Always show numeric progress, even without a terminal
    #[arg(short = 'p', long = "progress")]
    progress: bool,

    #[command(flatten)]
    verbose: Verbosity,

    /// Bundle directory holding manifest.toml and data/
    bundle: PathBuf,
}

fn run(cli: &Cli) -> Result<()> {
    let manifest = Manifest::load(&cli.bundle.join("manifest.toml"))?;

    if cli.check {
        check(&manifest)?;
        info!("manifest validates");
        return Ok(());
    }

    let dest = cli.destination.as_ref().expect("destination is required");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dest)
        .map_err(|e| {
            io::Error::new(e.kind(), format!("{}: {e}", dest.display()))
        })?;
    let mut output = BlockCache::new(file)?;

    // Percentages are for people; pipelines get to stay quiet.
    let mode = if cli.progress || io::stdout().is_terminal() {
        ProgressMode::Numeric
    } else {
        ProgressMode::Quiet
    };
    let mut progress = Progress::new(mode);

    apply(
        &manifest,
        &cli.bundle,
        &cli.task,
        &mut output,
        ApplyOptions {
            allow_unsafe: cli.allow_unsafe,
        },
        &mut progress,
    )
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .format_timestamp(None)
        .filter_level(cli.verbose.log_level_filter())
        .parse_default_env()
        .init();

    if let Err(e) = run(&cli) {
        error!("{e}");
        process::exit(1);
    }
}
