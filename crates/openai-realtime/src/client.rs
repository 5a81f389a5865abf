use crate::client::stats::Stats;
use crate::types;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use openai_realtime_types::audio::Base64EncodedAudioBytes;
use openai_realtime_types::session::Session;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message;

pub(crate) mod config;
mod consts;
pub(crate) mod stats;
mod utils;

pub type ClientTx = tokio::sync::mpsc::Sender<types::ClientEvent>;
type ServerTx = tokio::sync::broadcast::Sender<types::ServerEvent>;
pub type ServerRx = tokio::sync::broadcast::Receiver<types::ServerEvent>;

/// The operations a realtime session needs from the socket client.
/// Implemented by [`Client`]; mocked in the service tests.
#[async_trait]
pub trait OAIClient: Send + Sync {
    async fn update_session(&self, config: Session) -> Result<()>;
    async fn append_input_audio_buffer(&self, audio: Base64EncodedAudioBytes) -> Result<()>;
    async fn commit_input_audio_buffer(&self) -> Result<()>;
    async fn clear_input_audio_buffer(&self) -> Result<()>;
    async fn create_conversation_item(&self, item: types::Item) -> Result<()>;
    async fn create_response(&self) -> Result<()>;
    async fn cancel_response(&self) -> Result<()>;
    async fn server_events(&self) -> Result<ServerRx>;
    async fn close(&self) -> Result<()>;
}

// Holds the channel capacity, the client/server transmitters once connected,
// and the usage stats guarded by a Mutex.
pub struct Client {
    capacity: usize,
    config: config::Config,
    c_tx: Mutex<Option<ClientTx>>,
    s_tx: Mutex<Option<ServerTx>>,
    stats: Arc<Mutex<Stats>>,
}

impl Client {
    pub fn new(capacity: usize, config: config::Config) -> Self {
        Self {
            capacity,
            config,
            c_tx: Mutex::new(None),
            s_tx: Mutex::new(None),
            stats: Arc::new(Mutex::new(Stats::new())),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        if self.sender().is_ok() {
            return Err(anyhow::anyhow!("already connected"));
        }

        let request = utils::build_request(&self.config)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::info!("connected to {}", self.config.base_url());

        let (mut write, mut read) = ws_stream.split();

        let (c_tx, mut c_rx) = tokio::sync::mpsc::channel::<types::ClientEvent>(self.capacity);
        // Server events are broadcast so several subscribers can follow the session.
        let (s_tx, _) = tokio::sync::broadcast::channel(self.capacity);

        // The server transmitter must exist before the reader task can emit anything.
        *self.lock_s_tx()? = Some(s_tx.clone());
        *self.lock_c_tx()? = Some(c_tx);

        // Writer: serialize outgoing events until every sender is dropped, then close the socket.
        tokio::spawn(async move {
            while let Some(event) = c_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("failed to send message: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to serialize event: {}", e);
                    }
                }
            }
            if let Err(e) = write.close().await {
                tracing::debug!("failed to close socket: {}", e);
            }
        });

        let stats = self.stats.clone();
        // Reader: parse server events, broadcast them and record usage.
        tokio::spawn(async move {
            let mut close_reason = None;
            while let Some(message) = read.next().await {
                let message = match message {
                    Err(e) => {
                        tracing::error!("failed to read message: {}", e);
                        close_reason = Some(e.to_string());
                        break;
                    }
                    Ok(message) => message,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<types::ServerEvent>(&text) {
                        Ok(event) => {
                            if let types::ServerEvent::ResponseDone(response) = &event {
                                record_usage(&stats, response.response());
                            }
                            if s_tx.send(event).is_err() {
                                tracing::debug!("no subscribers for server event");
                            }
                        }
                        Err(e) => {
                            tracing::error!("failed to deserialize event: {}, text=> {:?}", e, text);
                        }
                    },
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary message: {} bytes", bin.len());
                    }
                    Message::Close(reason) => {
                        tracing::info!("connection closed: {:?}", reason);
                        close_reason = reason.map(|v| format!("{:?}", v));
                        break;
                    }
                    _ => {}
                }
            }
            if let Err(e) = s_tx.send(types::ServerEvent::Close {
                reason: close_reason,
            }) {
                tracing::debug!("failed to send close event: {}", e);
            }
        });
        Ok(())
    }

    // Return a copy of the stats object so callers can inspect it.
    pub fn stats(&self) -> Result<Stats> {
        self.stats
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| anyhow::anyhow!("failed to get stats"))
    }

    fn lock_c_tx(&self) -> Result<std::sync::MutexGuard<'_, Option<ClientTx>>> {
        self.c_tx
            .lock()
            .map_err(|_| anyhow::anyhow!("client sender lock poisoned"))
    }

    fn lock_s_tx(&self) -> Result<std::sync::MutexGuard<'_, Option<ServerTx>>> {
        self.s_tx
            .lock()
            .map_err(|_| anyhow::anyhow!("server sender lock poisoned"))
    }

    fn sender(&self) -> Result<ClientTx> {
        self.lock_c_tx()?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected yet"))
    }

    async fn send_client_event(&self, event: types::ClientEvent) -> Result<()> {
        let tx = self.sender()?;
        tx.send(event)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

fn record_usage(stats: &Mutex<Stats>, response: &types::events::server::ResponseResource) {
    let Some(usage) = response.usage() else {
        return;
    };
    match stats.lock() {
        Ok(mut guard) => guard.update_usage(
            usage.total_tokens(),
            usage.input_tokens(),
            usage.output_tokens(),
        ),
        Err(_) => tracing::error!("failed to update stats"),
    }
    tracing::debug!(
        "total_tokens: {}, input_tokens: {}, output_tokens: {}",
        usage.total_tokens(),
        usage.input_tokens(),
        usage.output_tokens()
    );
}

#[async_trait]
impl OAIClient for Client {
    async fn update_session(&self, config: Session) -> Result<()> {
        let event = types::ClientEvent::SessionUpdate(
            types::events::client::SessionUpdateEvent::new(config),
        );
        self.send_client_event(event).await
    }

    async fn append_input_audio_buffer(&self, audio: Base64EncodedAudioBytes) -> Result<()> {
        let event = types::ClientEvent::InputAudioBufferAppend(
            types::events::client::InputAudioBufferAppendEvent::new(audio),
        );
        self.send_client_event(event).await
    }

    async fn commit_input_audio_buffer(&self) -> Result<()> {
        let event = types::ClientEvent::InputAudioBufferCommit(
            types::events::client::InputAudioBufferCommitEvent::new(),
        );
        self.send_client_event(event).await
    }

    async fn clear_input_audio_buffer(&self) -> Result<()> {
        let event = types::ClientEvent::InputAudioBufferClear(
            types::events::client::InputAudioBufferClearEvent::new(),
        );
        self.send_client_event(event).await
    }

    async fn create_conversation_item(&self, item: types::Item) -> Result<()> {
        let event = types::ClientEvent::ConversationItemCreate(
            types::events::client::ConversationItemCreateEvent::new(item),
        );
        self.send_client_event(event).await
    }

    async fn create_response(&self) -> Result<()> {
        let event =
            types::ClientEvent::ResponseCreate(types::events::client::ResponseCreateEvent::new());
        self.send_client_event(event).await
    }

    async fn cancel_response(&self) -> Result<()> {
        let event =
            types::ClientEvent::ResponseCancel(types::events::client::ResponseCancelEvent::new());
        self.send_client_event(event).await
    }

    // Get a receiver for server events.
    async fn server_events(&self) -> Result<ServerRx> {
        match self.lock_s_tx()?.as_ref() {
            Some(tx) => Ok(tx.subscribe()),
            None => Err(anyhow::anyhow!("not connected yet")),
        }
    }

    // Dropping the last client sender ends the writer task, which closes the socket.
    async fn close(&self) -> Result<()> {
        self.lock_c_tx()?.take();
        Ok(())
    }
}

// Create a client with a specific config and connect it.
pub async fn connect_with_config(capacity: usize, config: config::Config) -> Result<Client> {
    let client = Client::new(capacity, config);
    client.connect().await?;
    Ok(client)
}

// Connect with the default config.
pub async fn connect() -> Result<Client> {
    connect_with_config(consts::DEFAULT_CAPACITY, config::Config::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_before_connect_fail() {
        let client = Client::new(8, config::Config::builder().with_api_key("k").build());
        assert!(client.create_response().await.is_err());
        assert!(client.server_events().await.is_err());
        assert!(client.close().await.is_ok());
    }

    #[test]
    fn test_record_usage_updates_stats() {
        let stats = Mutex::new(Stats::new());
        let response: types::events::server::ResponseResource = serde_json::from_value(
            serde_json::json!({
                "id": "resp_1",
                "status": "completed",
                "usage": {"total_tokens": 7, "input_tokens": 3, "output_tokens": 4}
            }),
        )
        .unwrap();
        record_usage(&stats, &response);
        assert_eq!(stats.lock().unwrap().total_tokens(), 7);
    }
}
