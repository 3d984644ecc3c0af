use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use manifest_sync::app::{App, RunOptions};
use manifest_sync::config::{ConfigLoader, ResolvedConfig};
use manifest_sync::driver;
use manifest_sync::error::SyncError;
use manifest_sync::fetch::{HttpFetcher, RetryPolicy};
use manifest_sync::output::{ConsoleProgress, JsonOutput, OutputMode};
use manifest_sync::store::{self, Store};
use manifest_sync::text::RunClock;
use manifest_sync::upload::AwsCliUploader;

#[derive(Parser)]
#[command(name = "manifest-sync")]
#[command(about = "Resumable manifest-driven downloads with background S3 uploads")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Job config (defaults to ./manifest-sync.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Local storage root (defaults to the user data directory)
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show the remaining work without downloading")]
    Plan,
    #[command(about = "Download remaining files and upload them in batches")]
    Run(RunArgs),
    #[command(about = "Upload a directory and record it in the upload log")]
    Upload(UploadArgs),
    #[command(about = "Download the chromedriver matching the installed Chrome")]
    Driver(DriverArgs),
    #[command(about = "List files in a directory by extension and depth")]
    Files(FilesArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct UploadArgs {
    dir: PathBuf,
}

#[derive(Args)]
struct DriverArgs {
    #[arg(long)]
    dest: Option<PathBuf>,
}

#[derive(Args)]
struct FilesArgs {
    dir: PathBuf,

    #[arg(long, default_value = "html")]
    ext: String,

    #[arg(long, default_value_t = 1)]
    depth: usize,

    #[arg(long)]
    recursive: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::ManifestNotFound(_) | SyncError::MissingConfig | SyncError::DriverNotFound(_) => 2,
        SyncError::Http(_)
        | SyncError::HttpStatus { .. }
        | SyncError::Connectivity(_)
        | SyncError::MissingTool(_)
        | SyncError::UploadCommand(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let clock = RunClock::start();
    let store = match cli.root {
        Some(root) => Store::new_with_root(root),
        None => Store::new()?,
    };

    match cli.command {
        Commands::Plan => {
            let config = ConfigLoader::resolve(cli.config.as_deref(), &store)?;
            let app = build_app(&config, clock)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.plan(&config, &JsonOutput)?;
                    JsonOutput::print_plan(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let progress = ConsoleProgress::new();
                    let result = app.plan(&config, &progress)?;
                    progress.finish();
                    for item in &result.remaining {
                        println!("{}\t{}", item.id, item.url);
                    }
                }
            }
            Ok(())
        }
        Commands::Run(args) => {
            let config = ConfigLoader::resolve(cli.config.as_deref(), &store)?;
            let app = build_app(&config, clock)?;
            let options = RunOptions {
                batch_size: args.batch_size,
                dry_run: args.dry_run,
            };
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.run(&config, options, &JsonOutput)?;
                    JsonOutput::print_run(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let progress = ConsoleProgress::new();
                    let result = app.run(&config, options, &progress)?;
                    progress.finish();
                    print_run_summary(&result);
                }
            }
            Ok(())
        }
        Commands::Upload(args) => {
            let config = ConfigLoader::resolve(cli.config.as_deref(), &store)?;
            let app = build_app(&config, clock)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.upload(&config, &args.dir, &JsonOutput)?;
                    JsonOutput::print_upload(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let progress = ConsoleProgress::new();
                    let result = app.upload(&config, &args.dir, &progress)?;
                    progress.finish();
                    println!(
                        "uploaded {} files ({} bytes) in {}",
                        result.summary.uploaded,
                        result.summary.bytes,
                        clock.format_elapsed()
                    );
                }
            }
            Ok(())
        }
        Commands::Driver(args) => {
            let fetcher = HttpFetcher::new(RetryPolicy::default())?;
            let dest = args
                .dest
                .unwrap_or_else(|| store.root().as_std_path().to_path_buf());
            let path = driver::download_chrome_driver(&fetcher, &dest)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_json(&serde_json::json!({ "path": path })).into_diagnostic()?
                }
                OutputMode::Interactive => println!("chromedriver installed at {}", path.display()),
            }
            Ok(())
        }
        Commands::Files(args) => {
            let files = if args.recursive {
                store::list_files_recursive(&args.dir)
            } else {
                store::list_files(&args.dir, &args.ext, args.depth)
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_json(&files).into_diagnostic()?,
                OutputMode::Interactive => {
                    eprintln!("{} files in {}", files.len(), args.dir.display());
                    for file in &files {
                        println!("{}", file.display());
                    }
                }
            }
            Ok(())
        }
    }
}

fn build_app(
    config: &ResolvedConfig,
    clock: RunClock,
) -> miette::Result<App<HttpFetcher, AwsCliUploader>> {
    let fetcher = if config.verify_tls {
        HttpFetcher::new(config.retry.clone())?
    } else {
        HttpFetcher::insecure(config.retry.clone())?
    };
    Ok(App::new(fetcher, AwsCliUploader::new(), clock))
}

fn print_run_summary(result: &manifest_sync::app::RunResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}manifest-sync summary ({}){reset}", result.elapsed);
    println!(
        "{cyan}manifest {} | already uploaded {} | already downloaded {}{reset}",
        result.report.manifest_total, result.report.log_matched, result.report.disk_matched
    );
    println!("{green}downloaded: {}{reset}", result.downloaded);
    let uploaded: usize = result.batches.iter().map(|batch| batch.uploaded).sum();
    println!(
        "{green}uploaded: {uploaded} in {} batches{reset}",
        result.batches.len()
    );
    if !result.not_found.is_empty() {
        println!("{yellow}not found: {}{reset}", result.not_found.join(", "));
    }
    if !result.failed.is_empty() {
        println!("{yellow}failed: {}{reset}", result.failed.join(", "));
    }
    if result.failed_batches > 0 {
        println!("{yellow}failed upload batches: {}{reset}", result.failed_batches);
    }
}
