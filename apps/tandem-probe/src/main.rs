mod logging;
mod ws_bus;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tandem_session::{
    CallEngine, CallEngineHandle, CallHost, EngineConfig, EngineError, SessionEvent,
    WebRtcRuntime,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::logging::{LogConfig, LogLevel};
use crate::ws_bus::WsBus;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(#[from] logging::InitError),
    #[error(transparent)]
    Config(#[from] tandem_session::ConfigError),
    #[error(transparent)]
    Runtime(#[from] tandem_session::RuntimeError),
    #[error(transparent)]
    Bus(#[from] tandem_signal::BusError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("stdin: {0}")]
    Stdin(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(
    name = "tandem-probe",
    about = "Drive a one-to-one call session against a signaling relay",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "TANDEM_RELAY_URL",
        default_value = "ws://127.0.0.1:8080/signal",
        help = "Relay websocket (or http) URL"
    )]
    relay: String,

    #[arg(long, env = "TANDEM_PEER_ID", help = "Relay-level id of this client")]
    peer_id: String,

    #[arg(long, global = true, env = "TANDEM_USER_ID", help = "Account id sent with SDP")]
    user_id: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "TANDEM_CONFIG",
        help = "Engine config TOML (TANDEM_* variables override it)"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "TANDEM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "TANDEM_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the random-match queue (default when no subcommand given)
    Match,
    /// Ring a friend directly
    Call {
        #[arg(value_name = "PEER")]
        peer: String,
    },
    /// Wait for friend calls
    Listen {
        #[arg(long, help = "Accept the first incoming call without prompting")]
        auto_accept: bool,

        #[arg(long = "friend", value_name = "USER", help = "Only accept calls from these users")]
        friends: Vec<String>,
    },
}

struct ProbeHost {
    peer_id: String,
    user_id: Option<String>,
    friends: HashSet<String>,
}

impl CallHost for ProbeHost {
    fn local_peer_id(&self) -> Option<String> {
        Some(self.peer_id.clone())
    }

    fn local_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn is_friend(&self, user_id: &str) -> bool {
        self.friends.is_empty() || self.friends.contains(user_id)
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;

    let command = cli.command.unwrap_or(Command::Match);
    let (friends, auto_accept) = match &command {
        Command::Listen {
            friends,
            auto_accept,
        } => (friends.iter().cloned().collect(), *auto_accept),
        _ => (HashSet::new(), false),
    };
    let host = Arc::new(ProbeHost {
        peer_id: cli.peer_id.clone(),
        user_id: cli.user_id.clone(),
        friends,
    });

    let bus = Arc::new(WsBus::connect(&cli.relay, &cli.peer_id).await?);
    let runtime = Arc::new(WebRtcRuntime::new()?);
    let (engine, handle, mut events) = CallEngine::new(config, runtime, bus.clone(), host)?;
    let engine_task = engine.spawn();
    info!(target = "tandem::probe", peer = bus.peer_id(), "engine started");

    match &command {
        Command::Match => handle.start_ephemeral()?,
        Command::Call { peer } => handle.start_persistent_call(peer.clone())?,
        Command::Listen { .. } => println!("waiting for calls"),
    }
    print_help();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let SessionEvent::IncomingCall { call_id, .. } = &event {
                    if auto_accept {
                        handle.accept_incoming(call_id.clone())?;
                    }
                }
                report(&event);
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !apply_line(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!(target = "tandem::probe", "interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    if let Err(err) = engine_task.await {
        warn!(target = "tandem::probe", error = %err, "engine task failed");
    }
    Ok(())
}

/// Returns false when the probe should exit.
async fn apply_line(handle: &CallEngineHandle, line: &str) -> Result<bool, EngineError> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => {}
        (Some("next"), _) => handle.go_next()?,
        (Some("end"), _) => handle.end()?,
        (Some("match"), _) => handle.start_ephemeral()?,
        (Some("call"), Some(peer)) => handle.start_persistent_call(peer)?,
        (Some("accept"), Some(call_id)) => handle.accept_incoming(call_id)?,
        (Some("decline"), Some(call_id)) => handle.decline(call_id)?,
        (Some("cam"), Some(state)) => handle.set_camera_enabled(state == "on")?,
        (Some("mute"), _) => handle.set_muted(true)?,
        (Some("unmute"), _) => handle.set_muted(false)?,
        (Some("pip"), Some(state)) => handle.set_pip(state == "on")?,
        (Some("bg"), Some(state)) => handle.set_backgrounded(state == "on")?,
        (Some("status"), _) => {
            let snapshot = handle.snapshot().await?;
            let presence = handle.presence().await?;
            println!("{snapshot:?}");
            println!("{presence:?}");
        }
        (Some("quit"), _) => return Ok(false),
        (Some(other), _) => {
            println!("unknown command: {other}");
            print_help();
        }
    }
    Ok(true)
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::AudioLevel(levels) => {
            debug!(target = "tandem::probe", ?levels, "audio level");
        }
        SessionEvent::IncomingCall {
            call_id, from, ..
        } => {
            println!("incoming call {call_id} from {from} (accept {call_id} / decline {call_id})");
        }
        SessionEvent::Ended { reason } => println!("ended: {}", reason.as_str()),
        other => println!("{other:?}"),
    }
}

fn print_help() {
    println!(
        "commands: match | next | end | call <peer> | accept <id> | decline <id> | \
         cam on|off | mute | unmute | pip on|off | bg on|off | status | quit"
    );
}
