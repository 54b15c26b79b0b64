//! Live-reload channel shared by the builds, the watch loop and the dev server.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Messages pushed to connected browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ReloadMessage {
    /// Reload the whole page.
    Reload,
    /// Re-fetch the style sheets at `paths` (relative to the served root)
    /// without reloading the page. Pages linking none of them reload.
    Css { paths: Vec<String> },
}

/// Fan-out point for [`ReloadMessage`]s. Cloning yields another handle to
/// the same channel. Sends with no connected browser are dropped.
#[derive(Debug, Clone)]
pub struct ReloadHub {
    sender: broadcast::Sender<ReloadMessage>,
}

impl Default for ReloadHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadMessage> {
        self.sender.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn reload(&self) {
        self.send(ReloadMessage::Reload);
    }

    pub fn inject_css(&self, paths: Vec<String>) {
        self.send(ReloadMessage::Css { paths });
    }

    fn send(&self, message: ReloadMessage) {
        match self.sender.send(message) {
            Ok(clients) => debug!("Pushed live-reload message to {} client(s)", clients),
            Err(broadcast::error::SendError(message)) => {
                debug!("No clients connected, dropped {:?}", message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_with_type_tag() {
        assert_eq!(
            serde_json::to_string(&ReloadMessage::Reload).unwrap(),
            r#"{"type":"reload"}"#
        );
        assert_eq!(
            serde_json::to_string(&ReloadMessage::Css {
                paths: vec!["css/app.css".to_string(), "css/app.min.css".to_string()]
            })
            .unwrap(),
            r#"{"type":"css","data":{"paths":["css/app.css","css/app.min.css"]}}"#
        );
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_message() {
        let hub = ReloadHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.clone().subscribe();
        assert_eq!(hub.client_count(), 2);

        hub.reload();
        hub.inject_css(vec!["css/app.css".to_string()]);

        for receiver in [&mut first, &mut second] {
            assert_eq!(receiver.recv().await.unwrap(), ReloadMessage::Reload);
            assert!(matches!(receiver.recv().await.unwrap(), ReloadMessage::Css { .. }));
        }
    }

    #[test]
    fn sending_without_clients_is_harmless() {
        let hub = ReloadHub::new();
        hub.reload();
        assert_eq!(hub.client_count(), 0);
    }
}
