//! Server-Sent Events bridge
//!
//! One full `state` event on connection, then one `state` event per tracker
//! broadcast. The subscription is dropped when the client disconnects.

use crate::daemon::MasterDaemon;
use crate::tracker::{ActivityTracker, UpdateFilters};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

struct Unsubscriber {
    tracker: Arc<ActivityTracker>,
    id: String,
}

impl Drop for Unsubscriber {
    fn drop(&mut self) {
        self.tracker.unsubscribe(&self.id);
    }
}

/// GET /events
pub async fn stream_events(
    State(daemon): State<Arc<MasterDaemon>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Refresh the snapshot so the initial full state is current
    let _ = daemon.get_dashboard_state().await;

    let tracker = daemon.get_tracker();
    let subscription = tracker.subscribe(
        &format!("sse-{}", Uuid::new_v4()),
        UpdateFilters::default(),
    );
    let guard = Unsubscriber {
        tracker,
        id: subscription.id.clone(),
    };

    let stream = UnboundedReceiverStream::new(subscription.rx).map(move |update| {
        let _held = &guard;
        let data = serde_json::to_string(&update).unwrap_or_else(|_| "null".to_string());
        Ok(Event::default().event("state").data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
