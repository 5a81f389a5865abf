use crate::Command;
use crate::error::HardwareError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A physical or simulated trigger.
///
/// Implementations push [`Command`]s until `cancel` fires or the receiver goes away.
/// Returning an error ends the source; the session keeps running without it.
#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &str;

    async fn run(
        self: Box<Self>,
        commands: mpsc::Sender<Command>,
        cancel: CancellationToken,
    ) -> Result<(), HardwareError>;
}

/// Runs a source on the runtime, logging how it ended.
pub fn spawn_event_source(
    source: Box<dyn EventSource>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let name = source.name().to_string();
    tokio::spawn(async move {
        tracing::info!("event source {} started", name);
        match source.run(commands, cancel).await {
            Ok(()) => tracing::info!("event source {} stopped", name),
            Err(e) => tracing::error!("event source {} failed: {}", name, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Scripted {
        steps: Vec<(Duration, Command)>,
    }

    #[async_trait]
    impl EventSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(
            self: Box<Self>,
            commands: mpsc::Sender<Command>,
            cancel: CancellationToken,
        ) -> Result<(), HardwareError> {
            for (delay, command) in self.steps {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawned_source_delivers_commands_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let source = Scripted {
            steps: vec![
                (Duration::ZERO, Command::Toggle),
                (Duration::from_millis(1), Command::Confirm),
            ],
        };
        let handle = spawn_event_source(Box::new(source), tx, CancellationToken::new());
        assert_eq!(rx.recv().await, Some(Command::Toggle));
        assert_eq!(rx.recv().await, Some(Command::Confirm));
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_stops_source() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let source = Scripted {
            steps: vec![(Duration::from_secs(60), Command::Toggle)],
        };
        let handle = spawn_event_source(Box::new(source), tx, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
