//! The session orchestrator: one actor task owns the conversation state and
//! serializes every transition.
mod actor;
mod tasks;


use crate::TranscriptEvent;
use crate::audio::AudioIo;
use crate::error::OrchestratorError;
use crate::tools::ToolRegistry;
use crate::transport::Transport;
use crate::Command;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Recording,
    AwaitingResponse,
    Playing,
    ShuttingDown,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Idle => "idle",
            Mode::Recording => "recording",
            Mode::AwaitingResponse => "awaiting response",
            Mode::Playing => "playing",
            Mode::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// A point-in-time view of the session, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub mode: Mode,
    pub mic_muted: bool,
    pub speaker_muted: bool,
    pub turn: u64,
    pub active_tasks: usize,
    pub pending_tool_calls: usize,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            mic_muted: true,
            speaker_muted: false,
            turn: 0,
            active_tasks: 0,
            pending_tool_calls: 0,
        }
    }
}

/// Timing knobs of a session. Validated by the caller.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Commands arriving this soon after startup are dropped.
    pub startup_grace: Duration,
    /// Commands arriving this soon after the last accepted one are dropped.
    pub debounce: Duration,
    /// How long shutdown waits for background tasks before aborting them.
    pub shutdown_timeout: Duration,
    pub tool_timeout: Duration,
    /// Give up on a response that shows no sign of life for this long.
    pub response_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            debounce: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(2),
            tool_timeout: Duration::from_secs(30),
            response_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Requests that do not come from the trigger.
#[derive(Debug)]
pub(crate) enum Control {
    SendText(String),
}

/// A cloneable view onto a running session.
#[derive(Clone)]
pub struct SessionHandle {
    snapshots: watch::Receiver<SessionSnapshot>,
    shutdown: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn mode(&self) -> Mode {
        self.snapshots.borrow().mode
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    /// Returns `None` if the session is gone first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut snapshots = self.snapshots.clone();
        snapshots.wait_for(predicate).await.ok().map(|s| s.clone())
    }

    /// Asks the session to shut down. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sends a typed message as a turn of its own. Ignored unless the session is idle.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.control.send(Control::SendText(text.into())).is_ok()
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    audio: Arc<dyn AudioIo>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolRegistry>,
    shutdown: CancellationToken,
    snapshots: watch::Sender<SessionSnapshot>,
    transcripts: broadcast::Sender<TranscriptEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        audio: Arc<dyn AudioIo>,
        transport: Arc<dyn Transport>,
        tools: ToolRegistry,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let (transcripts, _) = broadcast::channel(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            audio,
            transport,
            tools: Arc::new(tools),
            shutdown: CancellationToken::new(),
            snapshots,
            transcripts,
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            snapshots: self.snapshots.subscribe(),
            shutdown: self.shutdown.clone(),
            control: self.control_tx.clone(),
        }
    }

    pub fn transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcripts.subscribe()
    }

    /// Connects the transport and runs the session until shutdown is requested
    /// (`Ok`) or the transport is lost (`Err`). Everything the session started is
    /// stopped and released before this returns.
    pub async fn run(self, commands: mpsc::Receiver<Command>) -> Result<(), OrchestratorError> {
        let inbound = match self.transport.connect().await {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::error!("failed to connect transport: {}", e);
                if let Err(e) = self.audio.release().await {
                    tracing::warn!("failed to release audio: {}", e);
                }
                self.snapshots.send_modify(|s| s.mode = Mode::ShuttingDown);
                return Err(e.into());
            }
        };
        tracing::info!("transport connected, session ready");
        actor::Actor::new(self).run(inbound, commands).await
    }
}
