//! Per-request streaming of cumulative snapshots.
//!
//! An [`UpdateChannel`] owns the request's [`StreamSnapshot`]. Every mutation takes
//! the snapshot lock, applies the change, serializes the whole snapshot and pushes
//! it to the receiver before releasing the lock, so the client sees snapshots in
//! mutation order. Delivery is best effort: a disconnected receiver is not an
//! error. [`UpdateChannel::finish`] emits the terminal [`StreamEvent::Done`]
//! marker, at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::trio::models::{AgentResponse, Reflection};

/// What the transport forwards to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Full JSON snapshot.
    Snapshot(String),
    /// Terminal marker; nothing follows it.
    Done,
}

/// Cumulative request state. `body` is flattened into the JSON object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSnapshot<B> {
    #[serde(flatten)]
    pub body: B,
    pub status: Vec<String>,
    pub error: Option<String>,
}

/// Snapshot body of a basic chat turn.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicBody {
    pub agent_responses: Vec<AgentResponse>,
}

/// Snapshot body of a reflection exchange.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReflectionBody {
    pub reflection: Option<Reflection>,
}

pub struct UpdateChannel<B> {
    snapshot: Mutex<StreamSnapshot<B>>,
    sender: mpsc::UnboundedSender<StreamEvent>,
    finished: AtomicBool,
}

impl<B: Serialize + Default> UpdateChannel<B> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            snapshot: Mutex::new(StreamSnapshot::default()),
            sender,
            finished: AtomicBool::new(false),
        });
        (channel, receiver)
    }

    /// Apply `mutate` under the snapshot lock and push the result.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut StreamSnapshot<B>),
    {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mutate(&mut snapshot);

        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        match serde_json::to_string(&*snapshot) {
            Ok(json) => {
                if self.sender.send(StreamEvent::Snapshot(json)).is_err() {
                    log::debug!("trio::stream: client went away, snapshot dropped");
                }
            }
            Err(err) => log::error!("trio::stream: cannot serialize snapshot: {}", err),
        }
    }

    /// Append a progress line.
    pub fn report_status(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|snapshot| snapshot.status.push(text));
    }

    /// Set the terminal error. The stream stays open until [`finish`](Self::finish).
    pub fn report_error(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|snapshot| snapshot.error = Some(text));
    }

    /// Emit the terminal marker. Later calls do nothing.
    pub fn finish(&self) {
        // Hold the lock so no snapshot can slip in after the marker.
        let _guard = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(StreamEvent::Done);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

impl<B: Clone> UpdateChannel<B> {
    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> StreamSnapshot<B> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl UpdateChannel<BasicBody> {
    /// Upsert an agent's response by agent name.
    pub fn report_agent_result(&self, response: AgentResponse) {
        self.update(|snapshot| {
            let responses = &mut snapshot.body.agent_responses;
            match responses
                .iter_mut()
                .find(|existing| existing.agent_name == response.agent_name)
            {
                Some(existing) => *existing = response,
                None => responses.push(response),
            }
        });
    }
}

impl UpdateChannel<ReflectionBody> {
    /// Replace the streamed reflection record.
    pub fn report_reflection(&self, reflection: Reflection) {
        self.update(|snapshot| snapshot.body.reflection = Some(reflection));
    }
}
