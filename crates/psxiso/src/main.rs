//! PlayStation disc image builder / extractor CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use psxiso::build::{self, BuildOptions};
use psxiso::extract::{self, ExtractOptions};
use psxiso::project::Project;

#[derive(Parser)]
#[command(name = "psxiso")]
#[command(about = "Build and extract PlayStation disc images (ISO 9660 + CD-XA)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a disc image from a project description
    Build {
        /// Project description file (JSON)
        project: PathBuf,

        /// Output image path (overrides the project's image_name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cue sheet path (overrides the project's cue_sheet)
        #[arg(long)]
        cuefile: Option<PathBuf>,

        /// Volume identifier override
        #[arg(short, long)]
        label: Option<String>,

        /// Write an LBA listing of all files
        #[arg(long)]
        lba: Option<PathBuf>,

        /// Write an LBA listing as a C header
        #[arg(long)]
        lbahead: Option<PathBuf>,

        /// Overwrite an existing image
        #[arg(short = 'y', long)]
        overwrite: bool,

        /// Plan the layout and listings without generating the image
        #[arg(long)]
        noisogen: bool,

        /// Build a plain ISO 9660 filesystem without CD-XA attributes
        #[arg(long)]
        noxa: bool,
    },

    /// Extract a disc image into loose files plus a project description
    Extract {
        /// Disc image (.bin, 2352 bytes per sector)
        image: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Write a rebuildable project description here
        #[arg(short, long)]
        script: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::WARN
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            project,
            output,
            cuefile,
            label,
            lba,
            lbahead,
            overwrite,
            noisogen,
            noxa,
        } => {
            let text = std::fs::read_to_string(&project)
                .with_context(|| format!("cannot read project {}", project.display()))?;
            let parsed = Project::from_json(&text)
                .with_context(|| format!("cannot parse project {}", project.display()))?;

            let project_dir = project
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));

            let options = BuildOptions {
                project_dir,
                output,
                cue_file: cuefile,
                volume_label: label,
                lba_list: lba,
                lba_header: lbahead,
                overwrite,
                no_image: noisogen,
                no_xa: noxa,
                timestamp: None,
            };

            let summary = build::build(&parsed, &options)?;
            match &summary.image {
                Some(image) => info!(
                    "built {} ({} sectors, {} files, {} directories)",
                    image.display(),
                    summary.total_sectors,
                    summary.files,
                    summary.directories
                ),
                None => info!(
                    "planned {} sectors, {} files, {} directories",
                    summary.total_sectors, summary.files, summary.directories
                ),
            }
            Ok(())
        }

        Commands::Extract { image, out, script } => {
            let summary = extract::extract(&image, &ExtractOptions { out_dir: out, script })?;
            if summary.skipped > 0 {
                anyhow::bail!("{} entries could not be extracted", summary.skipped);
            }
            Ok(())
        }
    }
}
