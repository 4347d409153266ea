use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use remote_file::Result;
use remote_file::config::{self, ResolvedManifest};
use remote_file::executor::{self, ExecCtx, ExecSink, NullSink, RunInputs, RunReport, StdoutSink};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Increase diagnostic verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring every remote file in a manifest to its declared state
    Apply {
        /// Path to a manifest TOML
        manifest: PathBuf,
        /// Decide and report actions without touching the filesystem
        #[arg(long)]
        dry_run: bool,
        /// Max number of resources to reconcile concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
        /// Print the run report as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },
    /// Dry run; exits with status 2 when anything would change
    Check {
        /// Path to a manifest TOML
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a manifest and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a manifest TOML
        manifest: PathBuf,
    },
    /// Print the hex digest of a local file
    Digest {
        file: PathBuf,
        #[arg(long, short, default_value = "md5")]
        algorithm: String,
    },
    /// List supported checksum algorithms
    Algorithms,
}

fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "warn",
        1 => "remote_file=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);
    match args.cmd {
        Command::Apply {
            manifest,
            dry_run,
            max_parallel,
            json,
        } => cmd_apply(&manifest, dry_run, max_parallel, json),
        Command::Check { manifest, json } => cmd_check(&manifest, json),
        Command::Resolve { manifest } => cmd_resolve(&manifest),
        Command::Digest { file, algorithm } => {
            println!(
                "{}  {}",
                remote_file::checksum::digest(&algorithm, &file)?,
                file.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Algorithms => {
            for name in remote_file::checksum::known_algorithms() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run(
    manifest: &ResolvedManifest,
    dry_run: bool,
    max_parallel: usize,
    quiet: bool,
) -> Result<RunReport> {
    let sink: Arc<dyn ExecSink> = if quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(StdoutSink::default())
    };
    let mut ctx = ExecCtx::new(dry_run, sink);
    let inputs = RunInputs {
        resources: &manifest.resources,
        settings: &manifest.settings,
        catalog: manifest.catalog.clone(),
    };
    if max_parallel == 1 {
        executor::execute_resources(&inputs, &mut ctx)
    } else {
        executor::execute_resources_parallel(&inputs, &ctx, max_parallel)
    }
}

fn print_json(report: &RunReport) -> Result<()> {
    let s = serde_json::to_string_pretty(report)
        .map_err(|e| remote_file::Error::msg(format!("failed to encode report: {e}")))?;
    println!("{s}");
    Ok(())
}

fn cmd_apply(path: &Path, dry_run: bool, max_parallel: usize, json: bool) -> Result<ExitCode> {
    let manifest = config::load_manifest(path)?;
    let report = run(&manifest, dry_run, max_parallel, json)?;
    if json {
        print_json(&report)?;
    }
    Ok(if report.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_check(path: &Path, json: bool) -> Result<ExitCode> {
    let manifest = config::load_manifest(path)?;
    let report = run(&manifest, true, 1, json)?;
    if json {
        print_json(&report)?;
    }
    Ok(if !report.ok() {
        ExitCode::FAILURE
    } else if report.changed() > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_resolve(path: &Path) -> Result<ExitCode> {
    let doc = config::load(path)?;
    config::Manifest::from_doc(&doc)?.resolve()?;
    print!("{}", doc.to_toml_string()?);
    Ok(ExitCode::SUCCESS)
}
