//! Live event broadcaster
//!
//! Per-run publish/subscribe fan-out. Publishing never blocks: each
//! subscriber has a bounded queue and a slot whose queue is full is
//! disconnected rather than holding up the publisher. A subscriber may
//! reconnect with the last `execution_order` it saw; the subscription then
//! replays events from the store and switches to live delivery with no gap
//! and no duplicates.
//!
//! Replay correctness: a subscribing slot starts in a staging state that
//! buffers concurrently published frames while the store query runs; the
//! buffered frames and the replayed history are then merged in execution
//! order through a per-slot monotonic gate before the slot goes live.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventFrame, ExecutionEvent};
use agentflow_store::{EventFilter, EventStore};

enum SlotState {
    /// Buffering live frames while the replay query runs
    Staging(Vec<EventFrame>),
    Live,
}

struct SubscriberSlot {
    id: String,
    sender: mpsc::Sender<EventFrame>,
    state: SlotState,
    /// Highest execution order delivered; frames at or below are dropped
    last_order: i64,
}

impl SubscriberSlot {
    /// Deliver one frame, honoring the order gate. Returns false when the
    /// slot must be disconnected (lagged or closed).
    fn deliver(&mut self, frame: &EventFrame) -> bool {
        if frame.execution_order > 0 && frame.execution_order <= self.last_order {
            return true;
        }
        match self.sender.try_send(frame.clone()) {
            Ok(()) => {
                if frame.execution_order > 0 {
                    self.last_order = frame.execution_order;
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscription = %self.id, "subscriber lagged, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
struct RunHub {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    /// Session of the run, learned from the first published event; used for
    /// heartbeat frames.
    session_id: Mutex<String>,
}

/// Handle to one subscriber's ordered frame stream.
pub struct Subscription {
    pub id: String,
    pub run_id: String,
    receiver: mpsc::Receiver<EventFrame>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventFrame> {
        self.receiver.try_recv().ok()
    }

    /// Adapt the subscription into a `Stream` of frames.
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<EventFrame> {
        tokio_stream::wrappers::ReceiverStream::new(self.receiver)
    }
}

/// Fan-out hub for all runs; cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    hubs: Arc<DashMap<String, Arc<RunHub>>>,
    store: EventStore,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(store: EventStore, queue_capacity: usize) -> Self {
        Self {
            hubs: Arc::new(DashMap::new()),
            store,
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn hub(&self, run_id: &str) -> Arc<RunHub> {
        self.hubs
            .entry(run_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Publish a persisted event to this run's subscribers. Best-effort and
    /// non-blocking; lagged or closed subscribers are dropped.
    pub fn publish(&self, event: &ExecutionEvent) -> Result<()> {
        let Some(hub) = self.hubs.get(&event.run_id).map(|h| h.value().clone()) else {
            return Ok(());
        };
        {
            let mut session = hub.session_id.lock();
            if session.is_empty() {
                *session = event.session_id.clone();
            }
        }
        let frame = EventFrame::from(event);
        let mut subscribers = hub.subscribers.lock();
        subscribers.retain_mut(|slot| match &mut slot.state {
            SlotState::Staging(buffer) => {
                buffer.push(frame.clone());
                true
            }
            SlotState::Live => slot.deliver(&frame),
        });
        Ok(())
    }

    /// Publish a transient frame (heartbeat, degraded notice) that bypasses
    /// the order gate and is never persisted. Staging slots skip it.
    pub fn publish_frame(&self, run_id: &str, frame: EventFrame) {
        let Some(hub) = self.hubs.get(run_id).map(|h| h.value().clone()) else {
            return;
        };
        let mut subscribers = hub.subscribers.lock();
        subscribers.retain_mut(|slot| match slot.state {
            SlotState::Staging(_) => true,
            SlotState::Live => slot.deliver(&frame),
        });
    }

    /// Subscribe to a run's event stream.
    ///
    /// With `since = Some(k)` the stream begins with a replay of persisted
    /// events whose `execution_order > k`, then continues live; replay and
    /// live delivery share one ordering. With `since = None` only live
    /// events are delivered.
    pub async fn subscribe(&self, run_id: &str, since: Option<i64>) -> Result<Subscription> {
        let hub = self.hub(run_id);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = Uuid::new_v4().to_string();

        let subscription = Subscription {
            id: id.clone(),
            run_id: run_id.to_string(),
            receiver,
        };

        let Some(since) = since else {
            hub.subscribers.lock().push(SubscriberSlot {
                id,
                sender,
                state: SlotState::Live,
                last_order: 0,
            });
            return Ok(subscription);
        };

        // Register in staging mode first so nothing published during the
        // replay query is lost.
        hub.subscribers.lock().push(SubscriberSlot {
            id: id.clone(),
            sender,
            state: SlotState::Staging(Vec::new()),
            last_order: since.max(0),
        });

        let replay = self
            .store
            .events_for_run(run_id, &EventFilter::raw().since(since))
            .await;
        let replay = match replay {
            Ok(events) => events,
            Err(e) => {
                self.unsubscribe(run_id, &id);
                return Err(e);
            }
        };

        let mut subscribers = hub.subscribers.lock();
        let Some(position) = subscribers.iter().position(|slot| slot.id == id) else {
            // Disconnected while we were querying.
            return Err(FlowError::SubscriberLagged);
        };

        let mut frames: Vec<EventFrame> = replay.iter().map(EventFrame::from).collect();
        let delivered = {
            let slot = &mut subscribers[position];
            if let SlotState::Staging(buffered) =
                std::mem::replace(&mut slot.state, SlotState::Live)
            {
                frames.extend(buffered);
            }
            frames.sort_by_key(|frame| frame.execution_order);
            frames.iter().all(|frame| slot.deliver(frame))
        };
        if !delivered {
            subscribers.remove(position);
            return Err(FlowError::SubscriberLagged);
        }
        debug!(run_id, subscription = %id, replayed = frames.len(), "subscription live");
        Ok(subscription)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, run_id: &str, subscription_id: &str) {
        if let Some(hub) = self.hubs.get(run_id).map(|h| h.value().clone()) {
            hub.subscribers
                .lock()
                .retain(|slot| slot.id != subscription_id);
        }
    }

    /// Drop a run's hub entirely (after terminal state, on engine teardown).
    pub fn close_run(&self, run_id: &str) {
        self.hubs.remove(run_id);
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.hubs
            .get(run_id)
            .map(|hub| hub.subscribers.lock().len())
            .unwrap_or(0)
    }

    /// Emit one heartbeat frame to every hub with live subscribers.
    pub fn emit_heartbeats(&self) {
        Self::emit_heartbeats_on(&self.hubs);
    }

    fn emit_heartbeats_on(hubs: &DashMap<String, Arc<RunHub>>) {
        for entry in hubs.iter() {
            let frame = EventFrame {
                event_type: "heartbeat".to_string(),
                timestamp: Utc::now(),
                run_id: entry.key().clone(),
                session_id: entry.value().session_id.lock().clone(),
                execution_order: 0,
                data: serde_json::Value::Null,
            };
            let mut subscribers = entry.value().subscribers.lock();
            subscribers.retain_mut(|slot| match slot.state {
                SlotState::Staging(_) => true,
                SlotState::Live => slot.deliver(&frame),
            });
        }
    }

    /// Spawn the periodic heartbeat task. The task holds only a weak
    /// reference and ends when the broadcaster is dropped by all owners.
    pub fn spawn_heartbeat(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.hubs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(hubs) = weak.upgrade() else { break };
                Self::emit_heartbeats_on(&hubs);
            }
        })
    }
}
