//! [`AudioIo`] on top of cpal.
//!
//! cpal streams are not `Send`, so they live on a dedicated device thread. The async
//! side talks to that thread with commands and exchanges samples through a channel
//! (microphone) and a ring buffer (speaker).

use crate::config::{INPUT_CHUNK_SIZE, OUTPUT_CHUNK_SIZE, OUTPUT_LATENCY_MS};
use crate::openai_adapter::WIRE_AUDIO_FORMAT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use walkie_core::audio::{AudioFrame, AudioIo, StreamHandle};
use walkie_core::error::AudioError;
use walkie_native_utils::audio::{self, ChunkedResampler, REALTIME_API_PCM16_SAMPLE_RATE};
use walkie_native_utils::device;

/// How often a blocked write or a drain looks at the ring again.
const RING_POLL: Duration = Duration::from_millis(10);

type InputChunk = Result<Vec<f32>, String>;

enum DeviceCommand {
    OpenInput {
        chunks: mpsc::UnboundedSender<InputChunk>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    CloseInput,
    OpenOutput {
        ring: HeapCons<f32>,
        played: Arc<AtomicUsize>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    CloseOutput,
    Release,
}

/// Stream settings negotiated on the device thread.
#[derive(Debug, Clone, Copy)]
struct DeviceInfo {
    input_rate: u32,
    output_rate: u32,
}

struct Capture {
    handle: StreamHandle,
    chunks: mpsc::UnboundedReceiver<InputChunk>,
    resampler: ChunkedResampler,
    ended: bool,
}

struct Playback {
    handle: StreamHandle,
    ring: HeapProd<f32>,
    resampler: ChunkedResampler,
    /// Samples pushed into the ring so far.
    written: usize,
    /// Samples the output callback has taken from the ring.
    played: Arc<AtomicUsize>,
}

pub struct CpalAudio {
    commands: std_mpsc::Sender<DeviceCommand>,
    info: DeviceInfo,
    next_id: AtomicU64,
    capture: Mutex<Option<Capture>>,
    playback: Mutex<Option<Playback>>,
}

impl CpalAudio {
    /// Opens the named devices (or the defaults) on a new device thread.
    pub fn open(input_device: Option<String>, output_device: Option<String>) -> Result<Self> {
        let (commands, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("walkie-audio".to_string())
            .spawn(move || {
                device_thread(input_device, output_device, command_rx, ready_tx);
            })
            .context("Failed to spawn audio device thread")?;
        let info = ready_rx
            .recv()
            .context("Audio device thread exited during setup")??;
        tracing::info!(
            "audio ready: input {} Hz, output {} Hz",
            info.input_rate,
            info.output_rate
        );
        Ok(Self {
            commands,
            info,
            next_id: AtomicU64::new(1),
            capture: Mutex::new(None),
            playback: Mutex::new(None),
        })
    }

    fn next_handle(&self) -> StreamHandle {
        StreamHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: DeviceCommand) -> Result<(), AudioError> {
        self.commands
            .send(command)
            .map_err(|_| AudioError::DeviceUnavailable("audio device released".to_string()))
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), String>>) -> DeviceCommand,
    ) -> Result<(), AudioError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await
            .map_err(|_| AudioError::DeviceUnavailable("audio device thread stopped".to_string()))?
            .map_err(AudioError::DeviceUnavailable)
    }
}

fn resampler(from: u32, to: f64) -> Result<ChunkedResampler, AudioError> {
    ChunkedResampler::new(from as f64, to, INPUT_CHUNK_SIZE)
        .map_err(|e| AudioError::DeviceUnavailable(format!("failed to create resampler: {e:#}")))
}

fn frame(samples: &[f32]) -> AudioFrame {
    AudioFrame::new(audio::f32_to_pcm16(samples), WIRE_AUDIO_FORMAT)
}

#[async_trait]
impl AudioIo for CpalAudio {
    async fn start_capture(&self) -> Result<StreamHandle, AudioError> {
        let mut capture = self.capture.lock().await;
        if capture.is_some() {
            self.send(DeviceCommand::CloseInput)?;
        }
        let resampler = resampler(self.info.input_rate, REALTIME_API_PCM16_SAMPLE_RATE)?;
        let (chunks_tx, chunks) = mpsc::unbounded_channel();
        self.request(|reply| DeviceCommand::OpenInput {
            chunks: chunks_tx,
            reply,
        })
        .await?;
        let handle = self.next_handle();
        *capture = Some(Capture {
            handle,
            chunks,
            resampler,
            ended: false,
        });
        tracing::debug!("capture {:?} started", handle);
        Ok(handle)
    }

    async fn read(&self, handle: StreamHandle) -> Result<Option<AudioFrame>, AudioError> {
        let mut capture = self.capture.lock().await;
        let capture = match capture.as_mut() {
            Some(c) if c.handle == handle => c,
            _ => return Err(AudioError::UnknownStream(handle)),
        };
        while !capture.ended {
            match capture.chunks.recv().await {
                Some(Ok(samples)) => {
                    let resampled = capture.resampler.push(&samples);
                    if !resampled.is_empty() {
                        return Ok(Some(frame(&resampled)));
                    }
                }
                Some(Err(e)) => return Err(AudioError::Io(e)),
                None => {
                    capture.ended = true;
                    let tail = capture.resampler.flush();
                    if !tail.is_empty() {
                        return Ok(Some(frame(&tail)));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn stop_capture(&self, handle: StreamHandle) -> Result<(), AudioError> {
        // Closing the stream first ends any pending read.
        self.send(DeviceCommand::CloseInput)?;
        let mut capture = self.capture.lock().await;
        if capture.as_ref().is_some_and(|c| c.handle == handle) {
            *capture = None;
            tracing::debug!("capture {:?} stopped", handle);
        }
        Ok(())
    }

    async fn start_playback(&self) -> Result<StreamHandle, AudioError> {
        let mut playback = self.playback.lock().await;
        if playback.take().is_some() {
            self.send(DeviceCommand::CloseOutput)?;
        }
        let resampler = resampler(WIRE_AUDIO_FORMAT.sample_rate, self.info.output_rate as f64)?;
        let size = self.info.output_rate as usize * OUTPUT_LATENCY_MS / 1000;
        let (producer, consumer) = audio::shared_buffer(size).split();
        let played = Arc::new(AtomicUsize::new(0));
        self.request(|reply| DeviceCommand::OpenOutput {
            ring: consumer,
            played: played.clone(),
            reply,
        })
        .await?;
        let handle = self.next_handle();
        *playback = Some(Playback {
            handle,
            ring: producer,
            resampler,
            written: 0,
            played,
        });
        tracing::debug!("playback {:?} started", handle);
        Ok(handle)
    }

    async fn write(&self, handle: StreamHandle, frame: AudioFrame) -> Result<(), AudioError> {
        let samples = {
            let mut playback = self.playback.lock().await;
            match playback.as_mut() {
                Some(p) if p.handle == handle => p.resampler.push(&audio::pcm16_to_f32(&frame.data)),
                _ => return Err(AudioError::UnknownStream(handle)),
            }
        };
        self.write_samples(handle, samples).await
    }

    async fn stop_playback(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let mut playback = self.playback.lock().await;
        if playback.as_ref().is_some_and(|p| p.handle == handle) {
            *playback = None;
            self.send(DeviceCommand::CloseOutput)?;
            tracing::debug!("playback {:?} stopped", handle);
        }
        Ok(())
    }

    async fn drain_playback(&self, handle: StreamHandle) -> Result<(), AudioError> {
        let tail = {
            let mut playback = self.playback.lock().await;
            match playback.as_mut() {
                Some(p) if p.handle == handle => p.resampler.flush(),
                _ => return Err(AudioError::UnknownStream(handle)),
            }
        };
        if !tail.is_empty() {
            self.write_samples(handle, tail).await?;
        }
        loop {
            {
                let playback = self.playback.lock().await;
                let Some(p) = playback.as_ref().filter(|p| p.handle == handle) else {
                    return Err(AudioError::UnknownStream(handle));
                };
                if p.played.load(Ordering::Relaxed) >= p.written {
                    break;
                }
            }
            tokio::time::sleep(RING_POLL).await;
        }
        // Let the device play out its last buffer.
        let last_buffer = OUTPUT_CHUNK_SIZE as f64 / self.info.output_rate as f64;
        tokio::time::sleep(Duration::from_secs_f64(last_buffer)).await;
        Ok(())
    }

    async fn release(&self) -> Result<(), AudioError> {
        self.capture.lock().await.take();
        self.playback.lock().await.take();
        self.send(DeviceCommand::Release)?;
        tracing::info!("audio device released");
        Ok(())
    }
}

impl CpalAudio {
    /// Pushes into the ring, waiting for room. The lock is released between attempts
    /// so `stop_playback` is never held up by a full ring.
    async fn write_samples(&self, handle: StreamHandle, mut pending: Vec<f32>) -> Result<(), AudioError> {
        loop {
            {
                let mut playback = self.playback.lock().await;
                let Some(p) = playback.as_mut().filter(|p| p.handle == handle) else {
                    return Err(AudioError::UnknownStream(handle));
                };
                let pushed = p.ring.push_slice(&pending);
                p.written += pushed;
                pending.drain(..pushed);
            }
            if pending.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(RING_POLL).await;
        }
    }
}

fn device_thread(
    input_device: Option<String>,
    output_device: Option<String>,
    commands: std_mpsc::Receiver<DeviceCommand>,
    ready: std_mpsc::SyncSender<Result<DeviceInfo>>,
) {
    let setup = || -> Result<_> {
        let input = device::get_or_default_input(input_device.as_deref())
            .context("Failed to get audio input device")?;
        tracing::info!("Using input device: {:?}", input.name()?);
        let input_config = input
            .default_input_config()
            .context("Failed to get default input config")?;
        // Use the default channels and sample rate, but with a fixed buffer size.
        let input_config = StreamConfig {
            channels: input_config.channels(),
            sample_rate: input_config.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
        };
        tracing::info!("Input stream config: {:?}", &input_config);

        let output = device::get_or_default_output(output_device.as_deref())
            .context("Failed to get audio output device")?;
        tracing::info!("Using output device: {:?}", output.name()?);
        let output_config = output
            .default_output_config()
            .context("Failed to get default output config")?;
        let output_config = StreamConfig {
            channels: output_config.channels(),
            sample_rate: output_config.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
        };
        tracing::info!("Output stream config: {:?}", &output_config);
        Ok((input, input_config, output, output_config))
    };

    let (input, input_config, output, output_config) = match setup() {
        Ok(devices) => devices,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let info = DeviceInfo {
        input_rate: input_config.sample_rate.0,
        output_rate: output_config.sample_rate.0,
    };
    if ready.send(Ok(info)).is_err() {
        return;
    }

    let mut input_stream: Option<cpal::Stream> = None;
    let mut output_stream: Option<cpal::Stream> = None;
    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::OpenInput { chunks, reply } => {
                input_stream = None;
                let result = build_input(&input, &input_config, chunks);
                let _ = reply.send(match result {
                    Ok(stream) => {
                        input_stream = Some(stream);
                        Ok(())
                    }
                    Err(e) => Err(format!("{e:#}")),
                });
            }
            DeviceCommand::CloseInput => input_stream = None,
            DeviceCommand::OpenOutput {
                ring,
                played,
                reply,
            } => {
                output_stream = None;
                let result = build_output(&output, &output_config, ring, played);
                let _ = reply.send(match result {
                    Ok(stream) => {
                        output_stream = Some(stream);
                        Ok(())
                    }
                    Err(e) => Err(format!("{e:#}")),
                });
            }
            DeviceCommand::CloseOutput => output_stream = None,
            DeviceCommand::Release => break,
        }
    }
    drop(input_stream);
    drop(output_stream);
    tracing::debug!("audio device thread stopped");
}

fn build_input(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: mpsc::UnboundedSender<InputChunk>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let errors = chunks.clone();
    let stream = device.build_input_stream(
        config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let _ = chunks.send(Ok(audio::downmix(data, channels)));
        },
        move |err| {
            tracing::error!("An error occurred on input stream: {}", err);
            let _ = errors.send(Err(err.to_string()));
        },
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

fn build_output(
    device: &cpal::Device,
    config: &StreamConfig,
    mut ring: HeapCons<f32>,
    played: Arc<AtomicUsize>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            // The ring holds mono samples; copy each one to every channel.
            let mut popped = 0;
            for frame in data.chunks_mut(channels) {
                let sample = match ring.try_pop() {
                    Some(sample) => {
                        popped += 1;
                        sample
                    }
                    None => 0.0,
                };
                frame.fill(sample);
            }
            played.fetch_add(popped, Ordering::Relaxed);
        },
        move |err| tracing::error!("An error occurred on output stream: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}
