use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use lims_run_uploader::app::{Uploader, UploadOptions, load_run_manifest};
use lims_run_uploader::client::LimsHttpClient;
use lims_run_uploader::config::ConfigLoader;
use lims_run_uploader::domain::UploadStatus;
use lims_run_uploader::error::UploaderError;
use lims_run_uploader::output::{ConsoleProgress, JsonOutput, OutputMode};
use lims_run_uploader::progress::SinkSet;
use lims_run_uploader::session::SessionManager;
use lims_run_uploader::state::RunStateMachine;
use lims_run_uploader::upload::CancelToken;

#[derive(Parser)]
#[command(name = "lims-ru")]
#[command(about = "Resumable sequencer-run uploader for hypermedia LIMS servers")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload a run directory to the LIMS")]
    Upload(UploadArgs),
    #[command(about = "Show the persisted upload status of a run directory")]
    Status(StatusArgs),
}

#[derive(Args)]
struct UploadArgs {
    run_dir: String,

    #[arg(long)]
    config: Option<String>,

    /// Re-upload from scratch, even a COMPLETE or ERROR run.
    #[arg(long)]
    force: bool,

    /// Resume a PARTIAL run, skipping already-accepted samples.
    #[arg(long = "continue")]
    continue_partial: bool,
}

#[derive(Args)]
struct StatusArgs {
    run_dir: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<UploaderError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UploaderError) -> u8 {
    match error {
        UploaderError::MissingConfig(_)
        | UploaderError::ConfigRead(_)
        | UploaderError::ConfigParse(_)
        | UploaderError::ConfigValue { .. }
        | UploaderError::MissingManifest(_)
        | UploaderError::ManifestParse(_)
        | UploaderError::InvalidRun(_)
        | UploaderError::InvalidSample { .. }
        | UploaderError::AttemptRejected(_)
        | UploaderError::RunDelayed(_)
        | UploaderError::StatusRead(_)
        | UploaderError::StatusWrite(_) => 2,
        UploaderError::Connection(_)
        | UploaderError::Authentication(_)
        | UploaderError::Status { .. }
        | UploaderError::ResourceNotFound(_)
        | UploaderError::Contract(_)
        | UploaderError::FileIo { .. } => 3,
        UploaderError::UploadCanceled(_) => 1,
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

    match cli.command {
        Commands::Upload(args) => run_upload(args, output_mode),
        Commands::Status(args) => run_status(args, output_mode),
    }
}

fn run_upload(args: UploadArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    let run_dir = Utf8PathBuf::from(args.run_dir);

    let run = load_run_manifest(&run_dir).into_diagnostic()?;

    let mut sinks = SinkSet::new();
    if matches!(output_mode, OutputMode::Interactive) {
        sinks.attach(Arc::new(ConsoleProgress));
    }

    let delay_minutes = config.delay_minutes;
    let session = Arc::new(SessionManager::new(config).into_diagnostic()?);
    let client = LimsHttpClient::new(session, sinks.clone());
    let uploader = Uploader::new(client, sinks);

    let options = UploadOptions {
        force: args.force,
        continue_partial: args.continue_partial,
        delay_minutes,
    };
    let token = CancelToken::new();

    let result = uploader
        .upload_run(&run, &run_dir, options, &token)
        .into_diagnostic()?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_upload(&result).into_diagnostic()?,
        OutputMode::Interactive => print_upload_summary(&result),
    }
    Ok(())
}

fn run_status(args: StatusArgs, output_mode: OutputMode) -> miette::Result<()> {
    let run_dir = Utf8PathBuf::from(args.run_dir);
    let machine = RunStateMachine::load(&run_dir).into_diagnostic()?;
    let record = machine.record();

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(record).into_diagnostic()?,
        OutputMode::Interactive => {
            println!("status: {}", record.status);
            if let Some(run_id) = &record.run_id {
                println!("run id: {run_id}");
            }
            if let Some(message) = &record.message {
                println!("message: {message}");
            }
            if !record.uploaded_samples.is_empty() {
                println!("uploaded samples: {}", record.uploaded_samples.join(", "));
            }
        }
    }
    Ok(())
}

fn print_upload_summary(result: &lims_run_uploader::app::RunUploadResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    let color = match result.status {
        UploadStatus::Complete => green,
        UploadStatus::Partial => yellow,
        _ => cyan,
    };
    println!("{cyan}run {} finished{reset}", result.run_id);
    println!("{color}status: {}{reset}", result.status);
    println!(
        "{green}uploaded: {} sample(s){reset}",
        result.uploaded_samples.len()
    );
    if !result.skipped_samples.is_empty() {
        println!(
            "{cyan}skipped (already on server): {}{reset}",
            result.skipped_samples.join(", ")
        );
    }
    for failed in &result.failed_samples {
        println!(
            "{yellow}failed: {} ({}){reset}",
            failed.sample_name, failed.reason
        );
    }
    if let Some(message) = &result.message {
        println!("{yellow}{message}{reset}");
    }
}
