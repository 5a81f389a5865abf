use super::tasks::TaskSet;
use super::{Control, Mode, Orchestrator, OrchestratorConfig, SessionSnapshot};
use crate::audio::{AudioFrame, AudioIo, StreamHandle};
use crate::error::{AudioError, OrchestratorError, TransportError};
use crate::tools::{self, ToolRegistry};
use crate::transport::{Transport, TransportEvent};
use crate::{Command, Direction, ToolCallRequest, TranscriptEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reports from the session's own background tasks.
#[derive(Debug)]
enum Internal {
    CaptureEnded { turn: u64 },
    PlaybackFinished { seq: u64 },
    PlaybackFailed { seq: u64, error: AudioError },
    ToolDone { id: String, payload: Value },
    ResponseTimeout { generation: u64 },
}

enum CaptureEnd {
    Stopped,
    Eof,
    Failed(AudioError),
}

struct CaptureOutcome {
    frames: Vec<AudioFrame>,
    end: CaptureEnd,
}

struct CaptureSlot {
    handle: StreamHandle,
    turn: u64,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<CaptureOutcome>,
}

struct PlaybackSlot {
    handle: StreamHandle,
    seq: u64,
    cancel: CancellationToken,
    /// `None` once the response finished; the loop drains and reports back.
    feed: Option<mpsc::UnboundedSender<AudioFrame>>,
    /// Resolves when the loop (and every loop it continues) has exited.
    done: oneshot::Receiver<()>,
}

struct Session {
    mode: Mode,
    mic_muted: bool,
    speaker_muted: bool,
    turn: u64,
    /// Responses the backend still owes for the current turn.
    responses_expected: u32,
    /// Call id to the turn that issued it.
    pending_tools: HashMap<String, u64>,
    capture: Option<CaptureSlot>,
    playback: Option<PlaybackSlot>,
    playback_seq: u64,
    timer: Option<(u64, CancellationToken)>,
    timer_generation: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            mode: Mode::Idle,
            mic_muted: true,
            speaker_muted: false,
            turn: 0,
            responses_expected: 0,
            pending_tools: HashMap::new(),
            capture: None,
            playback: None,
            playback_seq: 0,
            timer: None,
            timer_generation: 0,
        }
    }

    fn tools_pending_for(&self, turn: u64) -> bool {
        self.pending_tools.values().any(|t| *t == turn)
    }

    fn response_open(&self) -> bool {
        self.responses_expected > 0 || self.tools_pending_for(self.turn)
    }
}

pub(super) struct Actor {
    config: OrchestratorConfig,
    audio: Arc<dyn AudioIo>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolRegistry>,
    shutdown: CancellationToken,
    snapshots: watch::Sender<SessionSnapshot>,
    transcripts: broadcast::Sender<TranscriptEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    tasks: TaskSet,
    session: Session,
    started_at: Instant,
    last_accepted: Option<Instant>,
}

impl Actor {
    pub(super) fn new(orchestrator: Orchestrator) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config: orchestrator.config,
            audio: orchestrator.audio,
            transport: orchestrator.transport,
            tools: orchestrator.tools,
            shutdown: orchestrator.shutdown,
            snapshots: orchestrator.snapshots,
            transcripts: orchestrator.transcripts,
            control: orchestrator.control_rx,
            internal_tx,
            internal_rx,
            tasks: TaskSet::default(),
            session: Session::new(),
            started_at: Instant::now(),
            last_accepted: None,
        }
    }

    pub(super) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<(), OrchestratorError> {
        self.started_at = Instant::now();
        let mut commands_open = true;

        let result = loop {
            self.publish();
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(event) = self.internal_rx.recv() => self.on_internal(event).await,
                event = inbound.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => {
                        tracing::error!("transport disconnected");
                        break Err(TransportError::Disconnected.into());
                    }
                },
                Some(control) = self.control.recv() => self.on_control(control).await,
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command, &mut commands).await,
                    None => {
                        tracing::info!("event source closed");
                        commands_open = false;
                    }
                },
            }
        };

        self.shutdown_session().await;
        result
    }

    fn publish(&mut self) {
        self.tasks.reap();
        let snapshot = SessionSnapshot {
            mode: self.session.mode,
            mic_muted: self.session.mic_muted,
            speaker_muted: self.session.speaker_muted,
            turn: self.session.turn,
            active_tasks: self.tasks.len(),
            pending_tool_calls: self.session.pending_tools.len(),
        };
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn emit(&self, text: String, is_final: bool, direction: Direction) {
        // No subscriber is fine.
        let _ = self.transcripts.send(TranscriptEvent {
            text,
            is_final,
            direction,
        });
    }

    async fn on_command(&mut self, command: Command, commands: &mut mpsc::Receiver<Command>) {
        let now = Instant::now();
        if now.duration_since(self.started_at) < self.config.startup_grace {
            tracing::debug!("dropping {:?} during startup grace", command);
            return;
        }
        if let Some(last) = self.last_accepted {
            if now.duration_since(last) < self.config.debounce {
                tracing::debug!("dropping {:?} within debounce window", command);
                return;
            }
        }

        let mode = self.session.mode;
        match (mode, command) {
            (Mode::Idle, Command::Toggle) => self.start_turn().await,
            (Mode::Recording, _) => self.finish_turn().await,
            (Mode::AwaitingResponse | Mode::Playing, Command::Toggle) => {
                tracing::info!("barge-in during turn {}", self.session.turn);
                self.end_turn().await;
                self.start_turn().await;
            }
            _ => {
                tracing::debug!("ignoring {:?} while {}", command, mode);
                return;
            }
        }

        self.last_accepted = Some(now);
        // Presses that piled up while the transition ran are stale.
        while let Ok(stale) = commands.try_recv() {
            tracing::debug!("dropping {:?} queued during transition", stale);
        }
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::SendText(text) => {
                if self.session.mode != Mode::Idle {
                    tracing::debug!("ignoring typed message while {}", self.session.mode);
                    return;
                }
                match self.transport.send_text(&text).await {
                    Ok(()) => {
                        self.session.turn += 1;
                        self.emit(text, true, Direction::User);
                        self.session.responses_expected = 1;
                        self.session.mode = Mode::AwaitingResponse;
                        self.arm_response_timer();
                    }
                    Err(e) => tracing::error!("failed to send typed message: {}", e),
                }
            }
        }
    }

    async fn start_turn(&mut self) {
        // The speaker goes quiet before the microphone opens.
        self.discard_playback().await;
        self.disarm_response_timer();
        self.session.responses_expected = 0;
        self.session.turn += 1;
        self.session.speaker_muted = true;
        let turn = self.session.turn;

        let handle = match self.audio.start_capture().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("failed to start capture for turn {}: {}", turn, e);
                self.session.speaker_muted = false;
                self.session.mode = Mode::Idle;
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let audio = self.audio.clone();
        let internal = self.internal_tx.clone();
        let token = cancel.clone();
        self.tasks.spawn("capture", async move {
            let outcome = capture_loop(audio, handle, token, internal, turn).await;
            let _ = outcome_tx.send(outcome);
        });

        self.session.capture = Some(CaptureSlot {
            handle,
            turn,
            cancel,
            outcome: outcome_rx,
        });
        self.session.mic_muted = false;
        self.session.mode = Mode::Recording;
        tracing::info!("turn {}: recording", turn);
    }

    async fn finish_turn(&mut self) {
        let Some(slot) = self.session.capture.take() else {
            self.session.mode = Mode::Idle;
            return;
        };
        slot.cancel.cancel();
        let outcome = slot.outcome.await.unwrap_or_else(|_| CaptureOutcome {
            frames: Vec::new(),
            end: CaptureEnd::Failed(AudioError::Io("capture task ended unexpectedly".into())),
        });
        if let Err(e) = self.audio.stop_capture(slot.handle).await {
            tracing::warn!("failed to stop capture: {}", e);
        }
        self.session.mic_muted = true;
        self.session.speaker_muted = false;

        if let CaptureEnd::Failed(e) = &outcome.end {
            tracing::error!("capture failed during turn {}: {}", slot.turn, e);
            self.session.mode = Mode::Idle;
            return;
        }
        let Some(audio) = AudioFrame::concat(&outcome.frames) else {
            tracing::info!("turn {}: nothing captured", slot.turn);
            self.session.mode = Mode::Idle;
            return;
        };

        tracing::info!(
            "turn {}: sending {:?} of audio ({} frames)",
            slot.turn,
            audio.duration(),
            outcome.frames.len()
        );
        match self.transport.send_audio(audio).await {
            Ok(()) => {
                self.session.responses_expected = 1;
                self.session.mode = Mode::AwaitingResponse;
                self.arm_response_timer();
            }
            Err(e) => {
                tracing::error!("failed to send turn {}: {}", slot.turn, e);
                self.session.mode = Mode::Idle;
            }
        }
    }

    /// Drops whatever the assistant is doing for the current turn and goes idle.
    async fn end_turn(&mut self) {
        self.discard_playback().await;
        if self.session.response_open() {
            if let Err(e) = self.transport.cancel_response().await {
                tracing::warn!("failed to cancel response: {}", e);
            }
        }
        self.session.responses_expected = 0;
        self.disarm_response_timer();
        self.session.mode = Mode::Idle;
    }

    async fn discard_playback(&mut self) {
        let Some(slot) = self.session.playback.take() else {
            return;
        };
        slot.cancel.cancel();
        let _ = slot.done.await;
        if let Err(e) = self.audio.stop_playback(slot.handle).await {
            tracing::warn!("failed to stop playback: {}", e);
        }
        tracing::debug!("playback {} discarded", slot.seq);
    }

    /// Queues a frame for playback, starting or continuing the playback loop.
    async fn feed_playback(&mut self, frame: AudioFrame) -> bool {
        let reusable = matches!(&self.session.playback, Some(slot) if slot.feed.is_some());
        if !reusable {
            let (handle, cancel, prev) = match self.session.playback.take() {
                // The previous response is still draining: continue on its stream after it.
                Some(slot) => (slot.handle, slot.cancel, Some(slot.done)),
                None => match self.audio.start_playback().await {
                    Ok(handle) => (handle, self.shutdown.child_token(), None),
                    Err(e) => {
                        tracing::error!("failed to start playback: {}", e);
                        return false;
                    }
                },
            };
            self.session.playback_seq += 1;
            let seq = self.session.playback_seq;
            let (feed, frames) = mpsc::unbounded_channel();
            let (done_tx, done_rx) = oneshot::channel();
            let audio = self.audio.clone();
            let internal = self.internal_tx.clone();
            let token = cancel.clone();
            self.tasks.spawn("playback", async move {
                playback_loop(audio, handle, frames, prev, token, internal, seq).await;
                drop(done_tx);
            });
            self.session.playback = Some(PlaybackSlot {
                handle,
                seq,
                cancel,
                feed: Some(feed),
                done: done_rx,
            });
        }

        match self.session.playback.as_ref().and_then(|s| s.feed.as_ref()) {
            Some(feed) => feed.send(frame).is_ok(),
            None => false,
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AudioDelta(frame) => self.on_audio_delta(frame).await,
            TransportEvent::TextDelta(text) => {
                self.touch_response();
                self.emit(text, false, Direction::Assistant);
            }
            TransportEvent::InputTranscript { text, is_final } => {
                self.emit(text, is_final, Direction::User)
            }
            TransportEvent::OutputTranscript { text, is_final } => {
                self.touch_response();
                self.emit(text, is_final, Direction::Assistant);
            }
            TransportEvent::ToolCallRequest(request) => self.on_tool_call(request),
            TransportEvent::Interrupt => match self.session.mode {
                Mode::Playing | Mode::AwaitingResponse => {
                    tracing::info!("turn {}: interrupted", self.session.turn);
                    self.discard_playback().await;
                    self.session.responses_expected = 0;
                    self.disarm_response_timer();
                    self.session.mode = Mode::Idle;
                }
                mode => tracing::debug!("ignoring interrupt while {}", mode),
            },
            TransportEvent::ResponseDone => self.on_response_done(),
            TransportEvent::Error(message) => {
                tracing::warn!("backend reported an error: {}", message)
            }
        }
    }

    async fn on_audio_delta(&mut self, frame: AudioFrame) {
        let mode = self.session.mode;
        if self.session.speaker_muted
            || !self.session.response_open()
            || !matches!(mode, Mode::AwaitingResponse | Mode::Playing)
        {
            tracing::trace!("discarding {} bytes of assistant audio", frame.len());
            return;
        }
        if !self.feed_playback(frame).await {
            return;
        }
        if mode == Mode::AwaitingResponse {
            self.disarm_response_timer();
            self.session.mode = Mode::Playing;
            tracing::info!("turn {}: playing", self.session.turn);
        }
    }

    fn on_response_done(&mut self) {
        self.session.responses_expected = self.session.responses_expected.saturating_sub(1);
        if let Some(slot) = self.session.playback.as_mut() {
            slot.feed = None;
        }
        if self.session.mode != Mode::AwaitingResponse {
            return;
        }
        if self.session.response_open() {
            self.arm_response_timer();
        } else {
            self.disarm_response_timer();
            self.session.mode = Mode::Idle;
            tracing::info!("turn {}: finished without audio", self.session.turn);
        }
    }

    fn on_tool_call(&mut self, request: ToolCallRequest) {
        if self.session.pending_tools.contains_key(&request.id) {
            tracing::warn!("duplicate tool call {}, ignoring", request.id);
            return;
        }
        self.session
            .pending_tools
            .insert(request.id.clone(), self.session.turn);
        self.disarm_response_timer();

        let registry = self.tools.clone();
        let limit = self.config.tool_timeout;
        let internal = self.internal_tx.clone();
        let cancel = self.shutdown.child_token();
        self.tasks.spawn("tool", async move {
            let id = request.id.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                payload = tools::dispatch(registry, request, limit) => {
                    let _ = internal.send(Internal::ToolDone { id, payload });
                }
            }
        });
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::CaptureEnded { turn } => {
                let current = matches!(&self.session.capture, Some(slot) if slot.turn == turn);
                if current && self.session.mode == Mode::Recording {
                    self.finish_turn().await;
                }
            }
            Internal::PlaybackFinished { seq } => {
                if !self.take_playback(seq).await {
                    return;
                }
                if self.session.mode == Mode::Playing {
                    if self.session.response_open() {
                        self.session.mode = Mode::AwaitingResponse;
                        self.arm_response_timer();
                    } else {
                        self.session.mode = Mode::Idle;
                        tracing::info!("turn {}: finished", self.session.turn);
                    }
                }
            }
            Internal::PlaybackFailed { seq, error } => {
                if !self.take_playback(seq).await {
                    return;
                }
                tracing::error!("playback failed: {}", error);
                if self.session.mode == Mode::Playing {
                    self.end_turn().await;
                }
            }
            Internal::ToolDone { id, payload } => self.on_tool_done(id, payload).await,
            Internal::ResponseTimeout { generation } => {
                if self.session.timer.as_ref().map(|(g, _)| *g) != Some(generation) {
                    return;
                }
                self.session.timer = None;
                if self.session.mode != Mode::AwaitingResponse
                    || self.session.tools_pending_for(self.session.turn)
                {
                    return;
                }
                tracing::warn!(
                    "turn {}: no response within {:?}",
                    self.session.turn,
                    self.config.response_timeout
                );
                self.end_turn().await;
            }
        }
    }

    /// Stops and removes the playback slot if `seq` is still the current loop.
    async fn take_playback(&mut self, seq: u64) -> bool {
        if !matches!(&self.session.playback, Some(slot) if slot.seq == seq) {
            tracing::trace!("stale report from playback {}", seq);
            return false;
        }
        let Some(slot) = self.session.playback.take() else {
            return false;
        };
        let _ = slot.done.await;
        if let Err(e) = self.audio.stop_playback(slot.handle).await {
            tracing::warn!("failed to stop playback: {}", e);
        }
        true
    }

    async fn on_tool_done(&mut self, id: String, payload: Value) {
        let Some(turn) = self.session.pending_tools.remove(&id) else {
            tracing::warn!("result for unknown call {}", id);
            return;
        };
        let mode = self.session.mode;
        let current =
            turn == self.session.turn && matches!(mode, Mode::AwaitingResponse | Mode::Playing);
        // A result from an abandoned turn must not start a response of its own.
        match self.transport.send_tool_result(&id, payload, current).await {
            Ok(()) => {
                tracing::debug!("sent result of call {} (respond: {})", id, current);
                if current {
                    // The backend answers a tool result with a response of its own.
                    self.session.responses_expected += 1;
                    if mode == Mode::AwaitingResponse {
                        self.arm_response_timer();
                    }
                }
            }
            Err(e) => {
                tracing::error!("failed to send result of call {}: {}", id, e);
                if current {
                    self.end_turn().await;
                }
            }
        }
    }

    fn arm_response_timer(&mut self) {
        self.disarm_response_timer();
        let Some(limit) = self.config.response_timeout else {
            return;
        };
        self.session.timer_generation += 1;
        let generation = self.session.timer_generation;
        let cancel = self.shutdown.child_token();
        let internal = self.internal_tx.clone();
        let token = cancel.clone();
        self.tasks.spawn("response timer", async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    let _ = internal.send(Internal::ResponseTimeout { generation });
                }
            }
        });
        self.session.timer = Some((generation, cancel));
    }

    fn disarm_response_timer(&mut self) {
        if let Some((_, token)) = self.session.timer.take() {
            token.cancel();
        }
    }

    /// Pushes the response deadline out while the backend is visibly working.
    fn touch_response(&mut self) {
        if self.session.mode == Mode::AwaitingResponse && self.session.timer.is_some() {
            self.arm_response_timer();
        }
    }

    async fn shutdown_session(&mut self) {
        self.session.mode = Mode::ShuttingDown;
        self.publish();
        self.shutdown.cancel();
        self.disarm_response_timer();

        let aborted = self.tasks.join_all(self.config.shutdown_timeout).await;
        if aborted > 0 {
            tracing::warn!("aborted {} tasks that ignored cancellation", aborted);
        }
        if let Some(slot) = self.session.capture.take() {
            if let Err(e) = self.audio.stop_capture(slot.handle).await {
                tracing::warn!("failed to stop capture: {}", e);
            }
        }
        if let Some(slot) = self.session.playback.take() {
            if let Err(e) = self.audio.stop_playback(slot.handle).await {
                tracing::warn!("failed to stop playback: {}", e);
            }
        }

        // Results that completed before cancellation still go out as they are.
        while let Ok(event) = self.internal_rx.try_recv() {
            if let Internal::ToolDone { id, payload } = event {
                if self.session.pending_tools.remove(&id).is_some() {
                    self.send_final_tool_result(&id, payload).await;
                }
            }
        }
        let mut unanswered: Vec<String> = self.session.pending_tools.drain().map(|(id, _)| id).collect();
        unanswered.sort();
        for id in unanswered {
            self.send_final_tool_result(&id, tools::error_payload("session shutting down"))
                .await;
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!("failed to close transport: {}", e);
        }
        if let Err(e) = self.audio.release().await {
            tracing::warn!("failed to release audio: {}", e);
        }
        self.session.mic_muted = true;
        self.session.speaker_muted = true;
        self.publish();
        tracing::info!("session shut down after {} turns", self.session.turn);
    }

    async fn send_final_tool_result(&self, id: &str, payload: Value) {
        if let Err(e) = self.transport.send_tool_result(id, payload, false).await {
            tracing::warn!("failed to send result of call {} during shutdown: {}", id, e);
        }
    }
}

async fn capture_loop(
    audio: Arc<dyn AudioIo>,
    handle: StreamHandle,
    cancel: CancellationToken,
    internal: mpsc::UnboundedSender<Internal>,
    turn: u64,
) -> CaptureOutcome {
    let mut frames = Vec::new();
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break CaptureEnd::Stopped,
            read = audio.read(handle) => match read {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break CaptureEnd::Eof,
                Err(e) => break CaptureEnd::Failed(e),
            },
        }
    };
    if !matches!(end, CaptureEnd::Stopped) {
        let _ = internal.send(Internal::CaptureEnded { turn });
    }
    CaptureOutcome { frames, end }
}

async fn playback_loop(
    audio: Arc<dyn AudioIo>,
    handle: StreamHandle,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    prev: Option<oneshot::Receiver<()>>,
    cancel: CancellationToken,
    internal: mpsc::UnboundedSender<Internal>,
    seq: u64,
) {
    if let Some(prev) = prev {
        // The previous loop shares our token, so this ends promptly on cancel too.
        let _ = prev.await;
    }
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            written = audio.write(handle, frame) => written,
        };
        if let Err(error) = written {
            let _ = internal.send(Internal::PlaybackFailed { seq, error });
            return;
        }
    }
    let drained = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        drained = audio.drain_playback(handle) => drained,
    };
    let _ = internal.send(match drained {
        Ok(()) => Internal::PlaybackFinished { seq },
        Err(error) => Internal::PlaybackFailed { seq, error },
    });
}
