//! Command-line interface for the ipakit packaging pipeline.
//!
//! Builds a signed ad-hoc IPA, an App Store upload, or an unsigned IPA
//! from a project directory and a TOML build configuration.

use clap::Parser;
use ipakit::{BuildConfig, ErrorKind, IpaBuilder, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ipakit")]
#[command(about = "Package a project as an iOS app")]
struct Cli {
    /// Project directory (contains assets/ and src/)
    project: PathBuf,

    /// Build configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Output format, overriding the configuration (ad-hoc, app-store, unsigned)
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// Directory for the finished artifacts
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Scratch directory
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// ZIP compression level (0-9), overriding the configuration
    #[arg(short = 'z', long)]
    zip_level: Option<u32>,

    /// Print the task plan and exit
    #[arg(long)]
    plan: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("IPAKIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BuildConfig::load(&cli.config)?;
    if let Some(format) = cli.format {
        config.format = format;
    }
    if let Some(level) = cli.zip_level {
        config.compression_level = level;
    }

    let mut builder = IpaBuilder::new().project(&cli.project).config(config);
    if let Some(output) = &cli.output {
        builder = builder.deploy_dir(output);
    }
    if let Some(work_dir) = &cli.work_dir {
        builder = builder.work_dir(work_dir);
    }

    if cli.plan {
        let (pipeline, _) = builder.prepare()?;
        for (phase, task) in pipeline.plan() {
            println!("{:<9} {}", phase.as_str(), task);
        }
        return Ok(());
    }

    match builder.build() {
        Ok(outputs) => {
            for output in outputs {
                println!("{}", output.display());
            }
            Ok(())
        }
        Err(e) => {
            if e.kind() == ErrorKind::MissingAsset {
                eprintln!("The project is missing something the build needs.");
            }
            Err(e.into())
        }
    }
}
