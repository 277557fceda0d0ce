use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, wrappers::BroadcastStream};
use tracing::trace;

use surge_api_core::ServerFrame;

/// User-scoped fan-out of push frames. Frames published with an empty
/// user id are delivered to every subscriber.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(String, ServerFrame)>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn send_to_user(&self, user_id: &str, frame: ServerFrame) {
        trace!(?user_id, ?frame, "Push frame");

        self.tx.send((user_id.to_string(), frame)).ok();
    }

    pub fn send_broadcast(&self, frame: ServerFrame) {
        trace!(?frame, "Broadcast frame");

        self.tx.send((String::new(), frame)).ok();
    }

    pub fn subscribe(
        &self,
        user_id: String,
    ) -> impl Stream<Item = Result<ServerFrame, String>> + Send + 'static + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |r| filter(user_id.clone(), r))
    }
}

async fn filter<T>(
    user_id: String,
    result: Result<(String, T), BroadcastStreamRecvError>,
) -> Option<Result<T, String>> {
    match result {
        Ok((event_user_id, event)) => {
            if event_user_id == user_id || event_user_id.is_empty() {
                Some(Ok(event))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e.to_string())),
    }
}
