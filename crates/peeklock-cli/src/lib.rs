//! # peeklock CLI
//!
//! Command-line runner for the peeklock runtime.
//!
//! This module provides CLI commands for:
//! - Running a receiver in any dispatch topology against a seeded in-memory
//!   broker and reporting how every message was settled
//! - Printing the resolved, validated worker settings

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use peeklock::providers::memory::{dead_letter_path, entity_path, BrokerOperation};
use peeklock::settings::DispatchMode;
use peeklock::{
    BatchHandler, BatchOutcome, BusError, BusTransport, ConfigurationError, Disposition, Handler,
    HandlerError, HandlerOutcome, HandlerSet, InMemoryTransport, MessageContext, OutMessage,
    ReceivedMessage, Receiver, WorkerSettings,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// peeklock - peek-lock message consumption runtime
#[derive(Parser, Debug)]
#[command(name = "peeklock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Peek-lock message consumption runtime")]
pub struct Cli {
    /// Settings file path (YAML, TOML or JSON)
    #[arg(short, long, env = "PEEKLOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level; overrides the settings file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed an in-memory broker and drain it with a simulated handler
    Run(RunArgs),

    /// Validate and print the resolved settings
    Config {
        /// Output format for the settings
        #[arg(short = 'f', long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Arguments of the `run` command
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Queue or topic to read; overrides the settings file
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Dispatch topology; overrides the settings file
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Number of messages to seed
    #[arg(short = 'n', long, default_value = "10")]
    pub messages: usize,

    /// Parallel worker count; overrides the settings file
    #[arg(long)]
    pub handlers: Option<usize>,

    /// Messages per fetch in serial and batch mode; overrides the settings file
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Renew message locks instead of bounding processing with a deadline
    #[arg(long)]
    pub renew: bool,

    /// Simulated processing time per message, in milliseconds
    #[arg(long, default_value = "0")]
    pub processing_ms: u64,

    /// Abandon every Nth message on its first delivery (0 disables)
    #[arg(long, default_value = "0")]
    pub abandon_every: usize,

    /// Dead-letter every Nth message (0 disables)
    #[arg(long, default_value = "0")]
    pub dead_letter_every: usize,

    /// Give up if the queue has not drained after this many seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Output format for the summary
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Dispatch topology selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    Parallel,
    Serial,
    Batch,
}

impl From<ModeArg> for DispatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Parallel => DispatchMode::Parallel,
            ModeArg::Serial => DispatchMode::Serial,
            ModeArg::Batch => DispatchMode::Batch,
        }
    }
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Runtime error: {0}")]
    Bus(#[from] BusError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Bus(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Logging { .. } => 5,
        }
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Parse arguments, set up logging, run the command and print its output
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;
    init_logging(&settings.logging.level, settings.logging.json_format)?;

    let output = execute(cli.command, settings).await?;
    println!("{}", output);
    Ok(())
}

/// Load settings and apply the global flags to the logging section
pub fn resolve_settings(cli: &Cli) -> Result<WorkerSettings, CliError> {
    let mut settings = WorkerSettings::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }
    if cli.json_logs {
        settings.logging.json_format = true;
    }
    Ok(settings)
}

/// Filter directive for a level; a bare level applies to the peeklock crates
pub fn log_directive(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("peeklock={level},peeklock_cli={level}")
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_directive(level)))
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Run a command against resolved settings, returning what it prints
pub async fn execute(command: Commands, settings: WorkerSettings) -> Result<String, CliError> {
    match command {
        Commands::Run(args) => {
            let format = args.format;
            let summary = execute_run_command(args, settings).await?;
            summary.render(format)
        }
        Commands::Config { format } => execute_config_command(&settings, format),
    }
}

// ============================================================================
// Config Command
// ============================================================================

fn execute_config_command(
    settings: &WorkerSettings,
    format: ConfigFormat,
) -> Result<String, CliError> {
    settings.validate()?;

    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(settings).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(settings).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::to_string_pretty(settings).map_err(|e| e.to_string()),
    };
    rendered.map_err(|message| CliError::CommandFailed { message })
}

// ============================================================================
// Run Command
// ============================================================================

/// Property carrying the 1-based seed index of a simulated message
pub const SEQUENCE_PROPERTY: &str = "peeklock-sequence";

/// How the simulated handler treats each message
#[derive(Debug, Clone, Copy)]
pub struct Behaviour {
    pub processing: Duration,
    pub abandon_every: usize,
    pub dead_letter_every: usize,
}

impl Behaviour {
    fn from_args(args: &RunArgs) -> Self {
        Self {
            processing: Duration::from_millis(args.processing_ms),
            abandon_every: args.abandon_every,
            dead_letter_every: args.dead_letter_every,
        }
    }

    /// Disposition for a message, with the error explaining it
    pub fn decide(&self, message: &ReceivedMessage) -> (Disposition, Option<HandlerError>) {
        let sequence = message
            .application_properties
            .get(SEQUENCE_PROPERTY)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        let every = |n: usize| n > 0 && sequence > 0 && sequence % n == 0;

        if every(self.dead_letter_every) {
            (
                Disposition::Deadletter,
                Some(anyhow::anyhow!("simulated rejection of message {}", sequence)),
            )
        } else if every(self.abandon_every) && message.delivery_count == 1 {
            (
                Disposition::Abandon,
                Some(anyhow::anyhow!("simulated transient failure of message {}", sequence)),
            )
        } else {
            (Disposition::Complete, None)
        }
    }

    async fn process(&self, context: &MessageContext) {
        if self.processing.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.processing) => {}
            _ = context.cancellation().cancelled() => {
                debug!("Simulated processing interrupted");
            }
        }
    }
}

/// Per-message handler driven by a [`Behaviour`]
pub struct SimulatedHandler {
    behaviour: Behaviour,
}

impl SimulatedHandler {
    pub fn new(behaviour: Behaviour) -> Self {
        Self { behaviour }
    }
}

#[async_trait]
impl Handler for SimulatedHandler {
    async fn handle(&self, context: MessageContext, message: &ReceivedMessage) -> HandlerOutcome {
        self.behaviour.process(&context).await;
        let (disposition, error) = self.behaviour.decide(message);
        HandlerOutcome::new(disposition, context, error)
    }
}

/// Batch handler driven by a [`Behaviour`]
pub struct SimulatedBatchHandler {
    behaviour: Behaviour,
}

impl SimulatedBatchHandler {
    pub fn new(behaviour: Behaviour) -> Self {
        Self { behaviour }
    }
}

#[async_trait]
impl BatchHandler for SimulatedBatchHandler {
    async fn handle(&self, context: MessageContext, messages: &[ReceivedMessage]) -> BatchOutcome {
        self.behaviour.process(&context).await;

        let mut dispositions = Vec::with_capacity(messages.len());
        let mut first_error = None;
        for message in messages {
            let (disposition, error) = self.behaviour.decide(message);
            dispositions.push(disposition);
            if first_error.is_none() {
                first_error = error;
            }
        }
        BatchOutcome::new(dispositions, context, first_error)
    }
}

/// Settlement totals reported by `run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub entity: String,
    pub mode: String,
    pub seeded: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub dead_lettered: usize,
    /// Messages left in the dead-letter sub-queue
    pub dead_letter_queue: usize,
    pub lock_renewals: usize,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn render(&self, format: OutputFormat) -> Result<String, CliError> {
        match format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| CliError::CommandFailed {
                    message: e.to_string(),
                })
            }
            OutputFormat::Text => Ok(format!(
                "Receiver:          {}\n\
                 Mode:              {}\n\
                 Seeded:            {}\n\
                 Completed:         {}\n\
                 Abandoned:         {}\n\
                 Dead-lettered:     {}\n\
                 Dead-letter queue: {}\n\
                 Lock renewals:     {}\n\
                 Elapsed:           {} ms",
                self.entity,
                self.mode,
                self.seeded,
                self.completed,
                self.abandoned,
                self.dead_lettered,
                self.dead_letter_queue,
                self.lock_renewals,
                self.elapsed_ms
            )),
        }
    }
}

/// Entity used when neither the settings nor the arguments name one
pub const DEMO_QUEUE: &str = "peeklock-demo";

fn apply_run_overrides(args: &RunArgs, settings: &mut WorkerSettings) {
    let receiver = &mut settings.receiver;
    if let Some(queue) = &args.queue {
        receiver.topic_or_queue_name = queue.clone();
        receiver.subscription_name.clear();
    }
    if receiver.topic_or_queue_name.is_empty() {
        receiver.topic_or_queue_name = DEMO_QUEUE.to_string();
    }
    if let Some(mode) = args.mode {
        receiver.mode = mode.into();
    }
    if let Some(handlers) = args.handlers {
        receiver.handlers = handlers;
    }
    if let Some(batch_size) = args.batch_size {
        receiver.incoming_messages = batch_size;
    }
    if args.renew {
        receiver.renew_message_lock = true;
    }
}

/// Seed the broker, run the receiver until the entity drains and summarize
pub async fn execute_run_command(
    args: RunArgs,
    mut settings: WorkerSettings,
) -> Result<RunSummary, CliError> {
    apply_run_overrides(&args, &mut settings);
    settings.receiver.validate()?;
    let config = settings.receiver.to_receiver_config()?;
    let behaviour = Behaviour::from_args(&args);

    let broker = InMemoryTransport::default();
    let entity = config.entity();
    let path = entity_path(&entity);

    // Seed where the receiver will read
    let seed_target = match &config.subscription_name {
        Some(subscription) => {
            broker.create_subscription(config.topic_or_queue_name.as_str(), subscription.as_str());
            config.topic_or_queue_name.to_string()
        }
        None => config.topic_or_queue_name.to_string(),
    };
    let seed_target = if config.dead_letter {
        dead_letter_path(&path)
    } else {
        seed_target
    };
    for sequence in 1..=args.messages {
        broker.enqueue(
            &seed_target,
            OutMessage::new(format!("message-{}", sequence))
                .with_property(SEQUENCE_PROPERTY, sequence.to_string()),
        );
    }

    let handlers = match settings.receiver.mode {
        DispatchMode::Parallel => HandlerSet::parallel(
            (0..settings.receiver.handlers)
                .map(|_| Arc::new(SimulatedHandler::new(behaviour)) as Arc<dyn Handler>)
                .collect(),
        ),
        DispatchMode::Serial => HandlerSet::serial(
            Arc::new(SimulatedHandler::new(behaviour)),
            settings.receiver.incoming_messages,
        ),
        DispatchMode::Batch => HandlerSet::batch(
            Arc::new(SimulatedBatchHandler::new(behaviour)),
            settings.receiver.incoming_messages,
        ),
    };

    let transport: Arc<dyn BusTransport> = Arc::new(broker.clone());
    let receiver = Arc::new(Receiver::new(transport, config, handlers)?);
    info!(
        receiver = %receiver,
        mode = settings.receiver.mode.as_str(),
        messages = args.messages,
        "Running simulated receiver"
    );

    let started = Instant::now();
    let mut listening = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.listen().await })
    };
    let drained = tokio::time::timeout(
        Duration::from_secs(args.timeout),
        wait_until_drained(&broker, &path),
    );

    tokio::select! {
        stopped = &mut listening => {
            let result = stopped.map_err(|e| CliError::CommandFailed { message: e.to_string() })?;
            result?;
            return Err(CliError::CommandFailed {
                message: "receiver stopped before the entity drained".to_string(),
            });
        }
        drained = drained => {
            if drained.is_err() {
                warn!(timeout = args.timeout, "Entity did not drain in time");
                receiver.shutdown().await?;
                return Err(CliError::CommandFailed {
                    message: format!("entity did not drain within {}s", args.timeout),
                });
            }
        }
    }

    receiver.shutdown().await?;
    listening
        .await
        .map_err(|e| CliError::CommandFailed {
            message: e.to_string(),
        })??;

    let settled = |operation: BrokerOperation| {
        broker
            .operations(operation)
            .iter()
            .filter(|e| e.succeeded && e.entity == path)
            .count()
    };
    let summary = RunSummary {
        entity: receiver.to_string(),
        mode: settings.receiver.mode.as_str().to_string(),
        seeded: args.messages,
        completed: settled(BrokerOperation::Complete),
        abandoned: settled(BrokerOperation::Abandon),
        dead_lettered: settled(BrokerOperation::DeadLetter),
        dead_letter_queue: broker.dead_letter_count(&path),
        lock_renewals: settled(BrokerOperation::RenewLock),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        completed = summary.completed,
        abandoned = summary.abandoned,
        dead_lettered = summary.dead_lettered,
        "Simulated run finished"
    );
    Ok(summary)
}

async fn wait_until_drained(broker: &InMemoryTransport, path: &str) {
    let mut poll = tokio::time::interval(Duration::from_millis(10));
    loop {
        poll.tick().await;
        if broker.active_message_count(path) == 0 && broker.locked_message_count(path) == 0 {
            return;
        }
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
