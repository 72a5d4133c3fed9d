use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use signal_bus::LocalBus;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::info;
use url::Url;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::SyntheticCapture;
use crate::profile::{ProfileError, StaticProfile, UserProfile};
use crate::room::{RoomError, RoomToken};
use crate::session::{self, CallHandle, CallStatus, NegotiationController};
use crate::signaling::SignalingChannel;
use crate::telemetry::logging::{InitError, LogConfig, LogLevel};
use crate::transport::AdapterFactory;
use crate::transport::webrtc::WebRtcAdapterFactory;

#[derive(Parser, Debug)]
#[command(
    name = "talkspot",
    about = "Peer-to-peer audio/video calls negotiated over a shared room channel",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "TALKSPOT_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "TALKSPOT_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run two participants in this process and complete a real call between them
    Loopback(LoopbackArgs),
    /// Print the normalized meeting code and its share link
    Link(LinkArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackArgs {
    #[arg(long, value_name = "TOKEN", help = "Meeting code both participants join")]
    pub room: String,

    #[arg(
        long = "wait-secs",
        default_value_t = 15,
        help = "How long to wait for each phase of the call"
    )]
    pub wait_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    #[arg(value_name = "TOKEN")]
    pub token: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("{0}")]
    Room(#[from] RoomError),
    #[error("{0}")]
    Profile(#[from] ProfileError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("timed out waiting for {phase} (first: {first}, second: {second})")]
    Timeout {
        phase: &'static str,
        first: CallStatus,
        second: CallStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackSummary {
    pub room: RoomToken,
    pub remote_media: bool,
}

struct Participant {
    handle: CallHandle,
    task: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

impl Participant {
    fn start(
        label: &'static str,
        bus: &Arc<LocalBus>,
        config: &CallConfig,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Result<Self, CliError> {
        let profile = UserProfile::new(label, label)?;
        let controller = NegotiationController::new(
            config.clone(),
            SignalingChannel::new(bus.clone(), config.channel_namespace.clone()),
            Arc::new(SyntheticCapture::new()),
            adapters,
            Arc::new(StaticProfile::new(profile)),
        );
        let (handle, task) = session::spawn(controller);

        let mut status = handle.watch().status();
        let reporter = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                println!("{label}: {current}");
            }
        });
        Ok(Self {
            handle,
            task,
            reporter,
        })
    }

    async fn stop(self) {
        let _ = self.handle.shutdown().await;
        let _ = self.task.await;
        self.reporter.abort();
    }
}

/// Join two in-process participants to `room`, wait for the call to come up,
/// hang up from the first side and confirm both return to idle.
pub async fn run_loopback(
    config: CallConfig,
    args: &LoopbackArgs,
) -> Result<LoopbackSummary, CliError> {
    let room = RoomToken::parse(&args.room)?;
    let wait = Duration::from_secs(args.wait_secs.max(1));
    let bus = Arc::new(LocalBus::new());
    let adapters: Arc<dyn AdapterFactory> = Arc::new(WebRtcAdapterFactory::new(config.event_buffer));

    let first = Participant::start("ada", &bus, &config, adapters.clone())?;
    let second = Participant::start("grace", &bus, &config, adapters)?;
    let result = drive_loopback(&first.handle, &second.handle, &room, wait).await;
    first.stop().await;
    second.stop().await;
    let remote_media = result?;

    info!(target: "talkspot::controller", room = %room, remote_media, "loopback finished");
    Ok(LoopbackSummary { room, remote_media })
}

async fn drive_loopback(
    first: &CallHandle,
    second: &CallHandle,
    room: &RoomToken,
    wait: Duration,
) -> Result<bool, CliError> {
    let timed_out = |phase| CliError::Timeout {
        phase,
        first: first.status(),
        second: second.status(),
    };

    first.join(room.as_str()).await?;
    second.join(room.as_str()).await?;

    timeout(wait, async {
        first.wait_for_status(CallStatus::InCall).await?;
        second.wait_for_status(CallStatus::InCall).await
    })
    .await
    .map_err(|_| timed_out("both sides in call"))??;

    let remote_media = timeout(wait, async {
        let mut a = first.watch().remote_media();
        let mut b = second.watch().remote_media();
        let _ = a.wait_for(Option::is_some).await;
        let _ = b.wait_for(Option::is_some).await;
    })
    .await
    .is_ok();

    first.hangup().await?;
    timeout(wait, second.wait_for_status(CallStatus::Idle))
        .await
        .map_err(|_| timed_out("hangup to propagate"))??;
    Ok(remote_media)
}

pub fn share_link(config: &CallConfig, token: &str) -> Result<(RoomToken, Url), CliError> {
    let room = RoomToken::parse(token)?;
    let url = room.share_url(&config.share_base)?;
    Ok((room, url))
}
