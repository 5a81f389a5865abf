//! Event sources that turn a button or the keyboard into session commands.

use crate::config::GPIO_BOUNCE;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkie_core::error::HardwareError;
use walkie_core::event_source::EventSource;
use walkie_core::{Command, SessionHandle};

const GPIO_ROOT: &str = "/sys/class/gpio";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Turns raw line levels into debounced press edges.
#[derive(Debug)]
struct Debouncer {
    bounce: Duration,
    pressed: bool,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    fn new(bounce: Duration) -> Self {
        Self {
            bounce,
            pressed: false,
            candidate: None,
        }
    }

    /// Returns true once per press, after the line has held the pressed level for `bounce`.
    fn update(&mut self, pressed: bool, now: Instant) -> bool {
        if pressed == self.pressed {
            self.candidate = None;
            return false;
        }
        let since = match self.candidate {
            Some((level, since)) if level == pressed => since,
            _ => {
                self.candidate = Some((pressed, now));
                now
            }
        };
        if now.duration_since(since) < self.bounce {
            return false;
        }
        self.pressed = pressed;
        self.candidate = None;
        pressed
    }
}

/// A push button wired active-low to a sysfs GPIO line.
pub struct GpioButton {
    value_path: PathBuf,
    bounce: Duration,
}

impl GpioButton {
    /// Exports `pin` if needed and configures it as an input.
    pub fn new(pin: u32) -> Result<Self, HardwareError> {
        let root = Path::new(GPIO_ROOT);
        let line = root.join(format!("gpio{pin}"));
        if !line.exists() {
            fs::write(root.join("export"), pin.to_string()).map_err(|e| {
                HardwareError::Unavailable(format!("cannot export gpio {pin}: {e}"))
            })?;
        }
        fs::write(line.join("direction"), "in")?;
        tracing::info!("button initialized on gpio {} (active low)", pin);
        Ok(Self::from_value_path(line.join("value"), GPIO_BOUNCE))
    }

    pub fn from_value_path(value_path: impl Into<PathBuf>, bounce: Duration) -> Self {
        Self {
            value_path: value_path.into(),
            bounce,
        }
    }
}

/// `Some(true)` while the button is held. `None` for a value that is not a level,
/// which happens when the file is read mid-write.
fn read_level(path: &Path) -> io::Result<Option<bool>> {
    Ok(match fs::read_to_string(path)?.trim() {
        "0" => Some(true),
        "1" => Some(false),
        _ => None,
    })
}

fn poll_button(
    value_path: PathBuf,
    bounce: Duration,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
) -> Result<(), HardwareError> {
    let mut debouncer = Debouncer::new(bounce);
    // A button held at startup is not a press.
    if let Some(pressed) = read_level(&value_path)? {
        debouncer.pressed = pressed;
    }
    while !cancel.is_cancelled() {
        if let Some(pressed) = read_level(&value_path)? {
            if debouncer.update(pressed, Instant::now()) {
                tracing::debug!("button pressed");
                if commands.blocking_send(Command::Toggle).is_err() {
                    break;
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

#[async_trait]
impl EventSource for GpioButton {
    fn name(&self) -> &str {
        "gpio-button"
    }

    async fn run(
        self: Box<Self>,
        commands: mpsc::Sender<Command>,
        cancel: CancellationToken,
    ) -> Result<(), HardwareError> {
        let GpioButton { value_path, bounce } = *self;
        tokio::task::spawn_blocking(move || poll_button(value_path, bounce, commands, cancel))
            .await
            .map_err(|e| HardwareError::Unavailable(format!("button poller stopped: {e}")))?
    }
}

/// Keyboard stand-in for the button: Enter toggles, `c` confirms, and any other
/// line is sent to the assistant as a typed message.
pub struct KeyboardTrigger<R = BufReader<Stdin>> {
    lines: R,
    session: Option<SessionHandle>,
}

impl KeyboardTrigger {
    pub fn stdin(session: SessionHandle) -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()), Some(session))
    }
}

impl<R> KeyboardTrigger<R> {
    pub fn from_reader(lines: R, session: Option<SessionHandle>) -> Self {
        Self { lines, session }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send + 'static> EventSource for KeyboardTrigger<R> {
    fn name(&self) -> &str {
        "keyboard"
    }

    async fn run(
        self: Box<Self>,
        commands: mpsc::Sender<Command>,
        cancel: CancellationToken,
    ) -> Result<(), HardwareError> {
        let KeyboardTrigger { lines, session } = *self;
        let mut lines = lines.lines();
        println!("Press Enter to talk, Enter again to send; \"c\" also sends.");
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                tracing::debug!("keyboard input closed");
                return Ok(());
            };
            let command = match line.trim() {
                "" => Command::Toggle,
                "c" => Command::Confirm,
                text => {
                    match &session {
                        Some(session) if session.send_text(text) => {}
                        _ => tracing::warn!("typed message dropped: no session"),
                    }
                    continue;
                }
            };
            if commands.send(command).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walkie_core::event_source::spawn_event_source;

    #[test]
    fn test_debouncer_needs_a_stable_level() {
        let start = Instant::now();
        let ms = |n| start + Duration::from_millis(n);
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        assert!(!debouncer.update(true, ms(0)));
        // Bounces back before the level settled.
        assert!(!debouncer.update(false, ms(40)));
        assert!(!debouncer.update(true, ms(50)));
        assert!(!debouncer.update(true, ms(120)));
        assert!(debouncer.update(true, ms(150)));
        // Holding the button does not repeat.
        assert!(!debouncer.update(true, ms(400)));
        // Release is not a press.
        assert!(!debouncer.update(false, ms(500)));
        assert!(!debouncer.update(false, ms(600)));
        assert!(!debouncer.update(true, ms(700)));
        assert!(debouncer.update(true, ms(800)));
    }

    #[tokio::test]
    async fn test_gpio_button_toggles_once_per_press() {
        let dir = tempfile::tempdir().unwrap();
        let value = dir.path().join("value");
        fs::write(&value, "1\n").unwrap();
        let button = GpioButton::from_value_path(&value, Duration::from_millis(20));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = spawn_event_source(Box::new(button), tx, cancel.clone());

        for _ in 0..2 {
            fs::write(&value, "0\n").unwrap();
            let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap();
            assert_eq!(command, Some(Command::Toggle));
            tokio::time::sleep(Duration::from_millis(60)).await;
            fs::write(&value, "1\n").unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_value_file_ends_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let button = GpioButton::from_value_path(dir.path().join("absent"), GPIO_BOUNCE);
        let (tx, _rx) = mpsc::channel(1);
        let err = Box::new(button)
            .run(tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::Io(_)));
    }

    #[tokio::test]
    async fn test_keyboard_lines_map_to_commands() {
        let input: &'static [u8] = b"\n  c \nhello there\n\n";
        let keyboard = KeyboardTrigger::from_reader(BufReader::new(input), None);
        let (tx, mut rx) = mpsc::channel(8);
        Box::new(keyboard)
            .run(tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Command::Toggle));
        assert_eq!(rx.recv().await, Some(Command::Confirm));
        assert_eq!(rx.recv().await, Some(Command::Toggle));
        assert_eq!(rx.recv().await, None);
    }
}
