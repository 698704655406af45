use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Message transport failure. Never fatal for the operation that triggered
/// the send: confirmations are fire-and-forget, reminders retry next pass.
#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound message transport. The real implementation lives outside the
/// core; the engine only needs this seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError>;
}

/// In-process transport: one broadcast channel per recipient ref.
/// Sending to a recipient nobody subscribed to is a successful no-op.
pub struct ChannelNotifier {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to messages for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(recipient.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn remove(&self, recipient: &str) {
        self.channels.remove(recipient);
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        if let Some(sender) = self.channels.get(recipient) {
            let _ = sender.send(text.to_string());
        }
        Ok(())
    }
}
