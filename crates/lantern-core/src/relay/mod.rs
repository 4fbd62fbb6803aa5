//! Event relay
//!
//! Pumps exactly one session's raw event stream into the typed channels.
//! Each subscription is a task that owns the session's receiver; stopping it
//! hands the receiver back, so events the runtime emits while a session is
//! inactive stay queued and are delivered once it is subscribed again.

pub mod classify;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{
    CoreChannels, ErrorKind, OutputChunk, ReasoningChunk, StatusEvent, UsageUpdate,
};
use crate::events::{RawEnvelope, RawEvent};
use crate::plan::PlanPolicy;
use crate::runtime::RawEventReceiver;
use crate::tracker::ToolExecutionTracker;
pub use classify::classify;

/// A session's raw stream plus what is needed to attribute its events.
pub struct SessionFeed {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub receiver: RawEventReceiver,
    /// Set for plan sessions; tool starts outside it are reported
    pub policy: Option<Arc<PlanPolicy>>,
}

impl SessionFeed {
    pub fn new(
        session_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        receiver: RawEventReceiver,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir: working_dir.into(),
            receiver,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<PlanPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }
}

struct Pump {
    session_id: String,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<SessionFeed>,
}

/// Routes classified events to channels and the tracker.
pub struct Dispatcher {
    channels: Arc<CoreChannels>,
    tracker: Arc<ToolExecutionTracker>,
}

impl Dispatcher {
    pub fn new(channels: Arc<CoreChannels>, tracker: Arc<ToolExecutionTracker>) -> Self {
        Self { channels, tracker }
    }

    pub async fn dispatch(&self, feed: &SessionFeed, envelope: RawEnvelope) {
        let session_id = feed.session_id.as_str();
        let channels = &self.channels;

        match classify(envelope) {
            RawEvent::MessageDelta(delta) => channels.output.emit(OutputChunk {
                session_id: session_id.to_string(),
                message_id: delta.message_id,
                text: delta.delta_content,
                is_final: false,
            }),
            RawEvent::Message(message) => {
                for request in &message.tool_requests {
                    self.tracker
                        .on_requested(session_id, &feed.working_dir, request)
                        .await;
                }
                if !message.content.is_empty() {
                    channels.output.emit(OutputChunk {
                        session_id: session_id.to_string(),
                        message_id: message.message_id,
                        text: message.content,
                        is_final: true,
                    });
                }
            }
            RawEvent::ReasoningDelta(delta) => channels.reasoning.emit(ReasoningChunk {
                session_id: session_id.to_string(),
                reasoning_id: delta.reasoning_id,
                text: delta.delta_content,
                is_final: false,
            }),
            RawEvent::Reasoning(reasoning) => channels.reasoning.emit(ReasoningChunk {
                session_id: session_id.to_string(),
                reasoning_id: reasoning.reasoning_id,
                text: reasoning.content,
                is_final: true,
            }),
            RawEvent::TurnStart(_) => channels.status.emit(StatusEvent::Thinking {
                session_id: session_id.to_string(),
            }),
            RawEvent::TurnEnd(marker) => {
                debug!(session = session_id, turn = ?marker.turn_id, "Turn ended");
            }
            RawEvent::Usage(usage) => channels.usage.emit(UsageUpdate::Turn {
                session_id: session_id.to_string(),
                model: usage.model,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_tokens: usage.cache_read_tokens,
            }),
            RawEvent::UsageInfo(usage) => channels.usage.emit(UsageUpdate::Context {
                session_id: session_id.to_string(),
                current_tokens: usage.current_tokens,
                token_limit: usage.token_limit,
            }),
            RawEvent::SessionIdle => channels.status.emit(StatusEvent::Ready {
                session_id: session_id.to_string(),
            }),
            RawEvent::SessionError(err) if err.is_authentication() => {
                warn!(session = session_id, "Runtime requires authentication");
                channels.status.emit(StatusEvent::AuthenticationRequired {
                    message: err.message,
                });
            }
            RawEvent::SessionError(err) => {
                channels.report(ErrorKind::Session, Some(session_id), err.message);
            }
            RawEvent::ToolStart(start) => {
                if let Some(policy) = &feed.policy {
                    if !policy.allows_tool(&start.tool_name) {
                        channels.report(
                            ErrorKind::PlanWorkflow,
                            Some(session_id),
                            format!(
                                "Tool '{}' ran outside the plan-mode policy",
                                start.tool_name
                            ),
                        );
                    }
                }
                self.tracker
                    .on_start(session_id, &feed.working_dir, start)
                    .await;
            }
            RawEvent::ToolProgress(progress) => self.tracker.on_progress(progress),
            RawEvent::ToolComplete(complete) => {
                self.tracker.on_complete(session_id, complete).await;
            }
            RawEvent::FileChanged(change) => {
                self.tracker.on_file_changed(&feed.working_dir, change);
            }
            RawEvent::Unclassified { kind } => {
                warn!(session = session_id, kind = %kind, "Unclassified runtime event dropped");
            }
            RawEvent::Malformed { kind, reason } => {
                channels.report(
                    ErrorKind::MalformedEvent,
                    Some(session_id),
                    format!("Malformed '{}' event: {}", kind, reason),
                );
            }
        }
    }
}

/// Owns the single live subscription.
pub struct EventRelay {
    dispatcher: Arc<Dispatcher>,
    current: Mutex<Option<Pump>>,
}

impl EventRelay {
    pub fn new(channels: Arc<CoreChannels>, tracker: Arc<ToolExecutionTracker>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(channels, tracker)),
            current: Mutex::new(None),
        }
    }

    /// Session currently subscribed to, if any.
    pub fn subscribed_session(&self) -> Option<String> {
        self.current.lock().as_ref().map(|p| p.session_id.clone())
    }

    /// Start pumping `feed`. Any previous subscription must have been
    /// stopped with `unsubscribe` first; a leftover one is stopped here and
    /// its feed dropped.
    pub fn subscribe(&self, feed: SessionFeed) {
        let (stop, stop_rx) = oneshot::channel();
        let session_id = feed.session_id.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(pump(feed, stop_rx, dispatcher));

        let previous = self.current.lock().replace(Pump {
            session_id: session_id.clone(),
            stop,
            handle,
        });
        if let Some(previous) = previous {
            error!(
                session = %previous.session_id,
                "Replacing a live subscription without unsubscribing"
            );
            let _ = previous.stop.send(());
        }
        info!(session = %session_id, "Relay subscribed");
    }

    /// Stop the live subscription and take back its feed. Returns once the
    /// event being dispatched (if any) has been fully routed.
    pub async fn unsubscribe(&self) -> Option<SessionFeed> {
        let pump = self.current.lock().take()?;
        let _ = pump.stop.send(());
        match pump.handle.await {
            Ok(feed) => {
                info!(session = %feed.session_id, "Relay unsubscribed");
                Some(feed)
            }
            Err(e) => {
                error!(session = %pump.session_id, "Relay task failed: {}", e);
                None
            }
        }
    }
}

async fn pump(
    mut feed: SessionFeed,
    mut stop: oneshot::Receiver<()>,
    dispatcher: Arc<Dispatcher>,
) -> SessionFeed {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = feed.receiver.recv() => match next {
                Some(envelope) => dispatcher.dispatch(&feed, envelope).await,
                None => {
                    debug!(session = %feed.session_id, "Raw event stream closed");
                    // Stay parked so unsubscribe still gets the feed back
                    let _ = (&mut stop).await;
                    break;
                }
            },
        }
    }
    feed
}
