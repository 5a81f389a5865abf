use anyhow::{Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::fmt::time::ChronoLocal;
use walkie_core::event_source::{EventSource, spawn_event_source};
use walkie_core::tools::ToolRegistry;
use walkie_core::{Direction, Orchestrator, TranscriptEvent};
use walkie_service::config::{Config, TriggerKind};
use walkie_service::cpal_audio::CpalAudio;
use walkie_service::openai_adapter::{OpenAiTransport, build_session};
use walkie_service::trigger::{GpioButton, KeyboardTrigger};
use walkie_service::weather::WeatherTool;

#[derive(Parser)]
#[command(version, about = "Push-to-talk voice assistant")]
struct Cli {
    /// Where commands come from. Overrides WALKIE_TRIGGER.
    #[arg(long, value_enum)]
    trigger: Option<TriggerKind>,

    /// Input device name. Defaults to the host default.
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name. Defaults to the host default.
    #[arg(long)]
    output_device: Option<String>,

    /// Print the audio devices and exit.
    #[arg(long)]
    list_devices: bool,
}

async fn print_transcripts(mut transcripts: broadcast::Receiver<TranscriptEvent>) {
    loop {
        match transcripts.recv().await {
            Ok(event) if event.is_final => match event.direction {
                Direction::User => println!("you: {}", event.text),
                Direction::Assistant => println!("assistant: {}", event.text),
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("skipped {} transcript events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("Inputs:\n{}", walkie_native_utils::device::get_available_inputs()?);
        println!("Outputs:\n{}", walkie_native_utils::device::get_available_outputs()?);
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting walkie service...");

    // --- 4. Register Tools ---
    let mut tools = ToolRegistry::new();
    match &config.weather_api_key {
        Some(api_key) => tools.register(Arc::new(WeatherTool::new(
            api_key.clone(),
            config.default_location,
            config.units,
        ))),
        None => tracing::warn!("OPENWEATHERMAP_API_KEY not set, weather tool disabled"),
    }
    tracing::info!("Registered {} tools.", tools.len());

    // --- 5. Open Audio Devices ---
    let audio = CpalAudio::open(args.input_device, args.output_device)
        .context("Failed to open audio devices")?;

    // --- 6. Connect to OpenAI Realtime API ---
    let mut realtime_config =
        openai_realtime::Config::builder().with_api_key(config.openai_api_key.expose_secret());
    if let Some(model) = &config.model {
        realtime_config = realtime_config.with_model(model);
    }
    let session = build_session(
        &config.instructions,
        config.voice.clone(),
        &tools.definitions(),
    );
    tracing::debug!("Session config: {:?}", serde_json::to_string(&session)?);
    let transport = OpenAiTransport::open(realtime_config.build(), session).await?;

    // --- 7. Start the Session ---
    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        Arc::new(audio),
        Arc::new(transport),
        tools,
    );
    let handle = orchestrator.handle();
    tokio::spawn(print_transcripts(orchestrator.transcripts()));

    let trigger = args.trigger.unwrap_or(config.trigger);
    let source: Box<dyn EventSource> = match trigger {
        TriggerKind::Gpio => Box::new(
            GpioButton::new(config.gpio_pin).context("Failed to initialize the GPIO button")?,
        ),
        TriggerKind::Keyboard => Box::new(KeyboardTrigger::stdin(handle.clone())),
    };
    let (command_tx, command_rx) = tokio::sync::mpsc::channel(32);
    let source = spawn_event_source(source, command_tx, handle.shutdown_token().child_token());

    let mut session = tokio::spawn(orchestrator.run(command_rx));
    let result = tokio::select! {
        result = &mut session => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
            handle.shutdown();
            session.await
        }
    };
    source.abort();
    tracing::info!("Shutting down...");
    result
        .context("Session task failed")?
        .context("Session ended with an error")?;
    Ok(())
}
