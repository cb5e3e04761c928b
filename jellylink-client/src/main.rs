use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use jellylink_client::{
    config::{ConnectConfig, default_user_agent, log_filter, settings_path},
    navigation::{Destination, Navigator},
    onboarding::{Submission, submit_address},
    orchestrator::Validator,
    probe::HttpProbe,
    progress::ProgressQueue,
    retry::{RetryController, RetryEvent, RetryOutcome, RetryScheduler},
    settings::{JsonSettingsStore, SettingsStore},
};
use jellylink_core::{CandidateEndpoint, InputError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const EXIT_CONNECTED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;

#[derive(Parser, Debug, Clone)]
#[command(name = "jellylink", about = "Find and validate a Jellyfin server")]
struct ClientArgs {
    /// Server address as a user would type it; defaults to the saved address.
    #[arg(long)]
    server: Option<String>,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 60)]
    retry_interval_secs: u64,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long)]
    config_dir: Option<PathBuf>,
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Report temporary failures instead of waiting and retrying.
    #[arg(long, default_value_t = false)]
    no_retry: bool,
}

impl ClientArgs {
    fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            probe_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            user_agent: self.user_agent.clone().unwrap_or_else(default_user_agent),
        }
    }
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

/// Terminal stand-in for the shell's page frame.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, destination: Destination) {
        match destination {
            Destination::Main => println!("Connected."),
            Destination::Onboarding { error_message } => {
                println!(
                    "Back to server setup: {}",
                    error_message.as_deref().unwrap_or("no details")
                );
            }
            Destination::RetryWait {
                retry_after: Some(delay),
            } => println!("Server unreachable, retrying in {}s.", delay.as_secs()),
            Destination::RetryWait { retry_after: None } => {
                println!("Server unreachable, retrying shortly.");
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let code = run(args).await;
    // Stdin is read on a blocking thread that cannot be cancelled.
    let _ = io::stdout().flush();
    std::process::exit(code);
}

async fn run(args: ClientArgs) -> i32 {
    let config = args.connect_config();
    let settings = Arc::new(JsonSettingsStore::open(settings_path(
        args.config_dir.as_deref(),
    )));
    info!(settings = %settings.path().display(), "jellylink starting");

    let Some(input) = args.server.clone().or_else(|| settings.server_address()) else {
        eprintln!("{}", InputError::Empty);
        return EXIT_BAD_INPUT;
    };

    let probe = match HttpProbe::new(&config) {
        Ok(probe) => probe,
        Err(err) => {
            error!("failed to build HTTP client: {err}");
            return EXIT_FAILED;
        }
    };
    let progress = ProgressQueue::new();
    spawn_progress_reporter(&progress);
    let validator = Arc::new(
        Validator::new(Arc::new(probe), settings, config.attempt_timeout()).with_progress(progress),
    );
    let navigator: Arc<dyn Navigator> = Arc::new(ConsoleNavigator);

    let submission = match submit_address(&input, &validator, navigator.as_ref()).await {
        Ok(submission) => submission,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_BAD_INPUT;
        }
    };

    match submission {
        Submission::Connected(server) => {
            println!(
                "{} (Jellyfin {}) at {}",
                server.server_name.as_deref().unwrap_or("Jellyfin Server"),
                server.version,
                server.resolved_uri
            );
            EXIT_CONNECTED
        }
        Submission::Rejected(_) => EXIT_FAILED,
        Submission::RetryScheduled { reason, .. } if args.no_retry => {
            eprintln!("{reason}");
            EXIT_FAILED
        }
        Submission::RetryScheduled {
            candidates,
            retry_after,
            reason,
        } => {
            warn!("server unreachable, will retry: {reason}");
            run_retry_cycle(validator, navigator, candidates, &input, &config, retry_after).await
        }
    }
}

async fn run_retry_cycle(
    validator: Arc<Validator>,
    navigator: Arc<dyn Navigator>,
    candidates: Vec<CandidateEndpoint>,
    input: &str,
    config: &ConnectConfig,
    retry_after: Option<Duration>,
) -> i32 {
    let scheduler = RetryScheduler::new(
        validator,
        navigator,
        candidates,
        input,
        config.retry_interval,
    );
    let mut handle = match scheduler.begin(retry_after) {
        Ok(handle) => handle,
        Err(err) => {
            error!("{err}");
            return EXIT_FAILED;
        }
    };

    eprintln!("Type 'r' + Enter to retry now, 'q' + Enter (or Ctrl-C) to give up.");
    let stdin_task = tokio::spawn(read_commands(handle.controller()));
    let ctrl_c = handle.controller();
    let ctrl_c_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.abort();
        }
    });

    while let Some(event) = handle.next_event().await {
        match event {
            RetryEvent::Tick { message, .. } => {
                eprint!("\r{message}    ");
                let _ = io::stderr().flush();
            }
            RetryEvent::Probing { message } => eprintln!("\n{message}"),
            RetryEvent::Finished(_) => break,
        }
    }
    stdin_task.abort();
    ctrl_c_task.abort();

    match handle.join().await {
        RetryOutcome::Connected(uri) => {
            println!("Connected to {uri}");
            EXIT_CONNECTED
        }
        RetryOutcome::Rejected(_) => EXIT_FAILED,
        RetryOutcome::Aborted => {
            println!("Gave up waiting for the server.");
            EXIT_FAILED
        }
    }
}

async fn read_commands(controller: RetryController) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "r" | "retry" => {
                if !controller.interrupt() {
                    eprintln!("Already checking the server.");
                }
            }
            "q" | "abort" => {
                controller.abort();
                break;
            }
            _ => {}
        }
    }
}

fn spawn_progress_reporter(progress: &ProgressQueue) {
    let mut rx = progress.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if let Some(entry) = rx.borrow_and_update().as_ref() {
                info!("{}", entry.label);
            }
        }
    });
}

fn init_logging(log_file: Option<&Path>) {
    let directives = std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV).ok();
    let env_filter = log_filter(directives.as_deref());

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
