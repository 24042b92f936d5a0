//! distfork CLI
//!
//! Entry point for the `distfork` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use distfork::config::default_config_path;
use distfork::{check_label, RunRequest, Settings, SignalHandler};
use distfork_protocol::{ExecutionResult, EXIT_CODE_INCOMPLETE};
use distfork_worker::{CancelToken, ControllerStreams, Dispatcher, ExecutionContext, LocalChannel, Orchestrator};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "distfork")]
#[command(about = "Run a command on a worker with live stdio", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a worker
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Run on a worker with this label
    #[arg(short = 'l', long)]
    label: Option<String>,

    /// Display name of the task
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Estimated duration in milliseconds (-1 = unknown)
    #[arg(short = 'd', long, allow_negative_numbers = true)]
    duration: Option<i64>,

    /// Zip or tgz archive to expand into the workspace before launch
    #[arg(short = 'z', long)]
    bootstrap: Option<PathBuf>,

    /// Archive every file created or modified during the run into this file
    #[arg(short = 'Z', long = "return-archive")]
    return_archive: Option<PathBuf>,

    /// Environment variable for the process (NAME=VAL)
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Copy a local file into the workspace before launch (REMOTE=LOCAL)
    #[arg(short = 'f', long = "file")]
    input_files: Vec<String>,

    /// Copy a workspace file back after the run (LOCAL=REMOTE)
    #[arg(short = 'F', long = "return-file")]
    output_files: Vec<String>,

    /// Forward a local port to a host reachable from the worker (PORT:HOST:PORT)
    #[arg(short = 'L')]
    local_to_remote: Vec<String>,

    /// Forward a worker port to a host reachable from here (PORT:HOST:PORT)
    #[arg(short = 'R')]
    remote_to_local: Vec<String>,

    /// Print the execution result as JSON on stderr
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Config file (default: ~/.config/distfork/config.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// The command to run (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl RunArgs {
    fn request(&self) -> RunRequest {
        RunRequest {
            label: self.label.clone(),
            display_name: self.name.clone(),
            estimated_duration_ms: self.duration,
            bootstrap_archive: self.bootstrap.clone(),
            return_archive: self.return_archive.clone(),
            env: self.env.clone(),
            input_files: self.input_files.clone(),
            output_files: self.output_files.clone(),
            local_to_remote: self.local_to_remote.clone(),
            remote_to_local: self.remote_to_local.clone(),
            command: self.command.clone(),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => process::exit(run(args)),
    }
}

fn incomplete() -> i32 {
    i32::from(ExecutionResult::completed(EXIT_CODE_INCOMPLETE).process_exit_code())
}

fn run(args: RunArgs) -> i32 {
    let overrides = args.verbose.then(|| {
        let mut logging = toml::Table::new();
        logging.insert("filter".to_string(), toml::Value::String("debug".to_string()));
        let mut root = toml::Table::new();
        root.insert("logging".to_string(), toml::Value::Table(logging));
        toml::Value::Table(root)
    });
    let (config_path, required) = match &args.config {
        Some(path) => (Some(path.clone()), true),
        None => (default_config_path(), false),
    };
    let settings = match Settings::load(config_path.as_deref(), required, overrides) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return incomplete();
        }
    };

    init_logging(&settings.logging.filter);

    let spec = match args.request().assemble() {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("Error: {}", e);
            return incomplete();
        }
    };

    if let Err(e) = check_label(&settings.worker, spec.label.as_deref()) {
        eprintln!("{}", e);
        return incomplete();
    }

    let cancel = CancelToken::new();
    if let Err(e) = SignalHandler::new(cancel.clone()).install() {
        tracing::warn!(error = %e, "failed to install signal handler");
    }

    let ctx = ExecutionContext {
        controller: Arc::new(LocalChannel::new("", std::env::temp_dir())),
        worker: Arc::new(LocalChannel::new(settings.worker.name.clone(), settings.worker.root.clone())),
        streams: ControllerStreams::inherit(),
        cancel,
    };
    let dispatcher = Dispatcher::new(Orchestrator::new(&settings.worker));
    let result = dispatcher.submit(spec, ctx).wait();

    if args.json {
        match serde_json::to_string(&result) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => tracing::warn!(error = %e, "failed to serialize result"),
        }
    }

    i32::from(result.process_exit_code())
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
