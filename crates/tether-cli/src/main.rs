//! Tether CLI
//!
//! Command-line interface for the Tether console core.
//! Connects a console to an in-process simulated endpoint and drives one
//! feature session, printing every notification as text or JSON.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tether_core::events::StdoutEventSink;
use tether_core::messages::RegistryValueKind;
use tether_core::{channel_pair, Console, ConsoleConfig, ConnectionInfo};
use tracing_subscriber::EnvFilter;

mod commands;
mod simulate;

use commands::{Operator, RegistryEdit};
use simulate::SimulatedEndpoint;

/// Tether - remote operator console
///
/// Open a feature session against a simulated endpoint and watch what the
/// console sees.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// JSON configuration file
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Where retrieved files are stored (overrides the config file)
    #[arg(long)]
    download_root: Option<PathBuf>,

    /// Request timeout in seconds (overrides the config file)
    #[arg(long)]
    timeout: Option<u64>,

    /// Endpoint address reported by the simulated client
    #[arg(long, default_value = "127.0.0.1:4782")]
    endpoint: String,

    /// Display name reported by the simulated client
    #[arg(short, long, default_value = "SIMULATED-PC")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Retrieve the endpoint's logs into the download directory
    Logs {
        /// Print the stored log file names afterwards
        #[arg(long)]
        list: bool,
    },

    /// Stream audio from a capture device
    Audio {
        #[arg(short, long, default_value_t = 0)]
        device: u32,

        /// Sample rate in Hz
        #[arg(short, long, default_value_t = 44_100)]
        bitrate: u32,

        /// Number of frames to receive before stopping
        #[arg(long, default_value_t = 5)]
        frames: usize,
    },

    /// Edit the endpoint's registry
    Registry {
        #[command(subcommand)]
        edit: RegistryCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RegistryCommand {
    /// Create a new key under PARENT
    CreateKey { parent: String },
    /// Delete key NAME under PARENT
    DeleteKey { parent: String, name: String },
    /// Create a new value in KEY
    CreateValue {
        key: String,
        #[arg(long, default_value = "string")]
        kind: ValueKind,
    },
    /// Delete value NAME in KEY
    DeleteValue { key: String, name: String },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ValueKind {
    String,
    ExpandString,
    Binary,
    Dword,
    MultiString,
    Qword,
}

impl From<ValueKind> for RegistryValueKind {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::String => RegistryValueKind::String,
            ValueKind::ExpandString => RegistryValueKind::ExpandString,
            ValueKind::Binary => RegistryValueKind::Binary,
            ValueKind::Dword => RegistryValueKind::DWord,
            ValueKind::MultiString => RegistryValueKind::MultiString,
            ValueKind::Qword => RegistryValueKind::QWord,
        }
    }
}

impl From<RegistryCommand> for RegistryEdit {
    fn from(command: RegistryCommand) -> Self {
        match command {
            RegistryCommand::CreateKey { parent } => RegistryEdit::CreateKey { parent },
            RegistryCommand::DeleteKey { parent, name } => RegistryEdit::DeleteKey { parent, name },
            RegistryCommand::CreateValue { key, kind } => RegistryEdit::CreateValue {
                key,
                kind: kind.into(),
            },
            RegistryCommand::DeleteValue { key, name } => RegistryEdit::DeleteValue { key, name },
        }
    }
}

fn load_config(args: &Args) -> tether_core::Result<ConsoleConfig> {
    let mut config = match &args.config {
        Some(path) => ConsoleConfig::from_file(path)?,
        None => ConsoleConfig::default(),
    };
    if let Some(root) = &args.download_root {
        config = config.with_download_root(root.clone());
    }
    if let Some(secs) = args.timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let json_output = matches!(args.format, OutputFormat::Json);
    let (console, notifications) = Console::new(config);

    let (local, remote) = channel_pair();
    let endpoint = SimulatedEndpoint::new(&args.name).spawn(remote);
    let connection = console.accept(
        ConnectionInfo::new(args.endpoint.clone(), args.name.clone()),
        local.transport,
        local.inbound,
    );

    tracing::info!(
        "Connected to {} ({}), downloads in {}",
        args.name,
        args.endpoint,
        connection.info().download_directory.display()
    );

    let mut operator = Operator {
        console: &console,
        connection,
        notifications,
        sink: StdoutEventSink::new(json_output),
    };

    let outcome = match args.command {
        Command::Logs { list } => operator.logs(list).await,
        Command::Audio {
            device,
            bitrate,
            frames,
        } => operator.audio(device, bitrate, frames).await,
        Command::Registry { edit } => operator.registry(edit.into()).await,
    };

    console.shutdown();
    endpoint.abort();

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
