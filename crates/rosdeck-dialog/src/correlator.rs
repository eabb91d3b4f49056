//! [`DialogCorrelator`] – holds operator questions until they are answered,
//! cancelled or expire, and relays answers back to the robot.
//!
//! ```text
//! Pending ──answer──▶ Answered   upstream: reply published, entry removed
//!    │                           local:    kept with its answer
//!    ├──cancel──▶ removed        upstream: {accepted:false} published
//!    ├──withdraw──▶ removed      robot cancelled; nothing published
//!    └──sweep──▶ removed         older than the TTL
//! ```
//!
//! Every terminal transition goes through the single entry lock, so exactly
//! one of them wins for a given id. Each change re-broadcasts the pending
//! list to viewers as `dialogUpdate`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use rosdeck_middleware::{BroadcastHub, Publisher};
use rosdeck_types::{
    DeckError, DialogQuestion, DialogStatus, FieldOption, PendingDialogRequest, channels, kinds,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decode::{DecodedQuestion, RawQuestionEvent, apply_overrides, decode_question, value_text};
use crate::templates::template_for;

/// How long a question may stay unanswered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Period of the background sweeper started by
/// [`DialogCorrelator::spawn_sweeper`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A question created through the REST surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalQuestion {
    /// Correlation id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    pub message: String,
    /// Template tag; when absent `message` runs through the decode pipeline.
    #[serde(default)]
    pub field_type: Option<String>,
    /// `default`, `min`, `max` and `step` overrides.
    #[serde(default)]
    pub field_config: Option<Map<String, Value>>,
    /// Replacement choice list: plain strings or `{label|text, value}`.
    #[serde(default)]
    pub options: Option<Vec<Value>>,
}

/// Reply published on the dialog response channel, serialized into the
/// `data` field of a `std_msgs/String`.
#[derive(Debug, Serialize)]
struct DialogReply<'a> {
    id: &'a str,
    accepted: bool,
    value: &'a Value,
}

type Entries = HashMap<String, PendingDialogRequest>;

pub struct DialogCorrelator {
    publisher: Arc<dyn Publisher>,
    hub: Arc<BroadcastHub>,
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl DialogCorrelator {
    pub fn new(publisher: Arc<dyn Publisher>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            publisher,
            hub,
            ttl: DEFAULT_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Override the expiry age (builder-style).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a question pushed by the robot.
    ///
    /// Sweeps expired entries first. An event without a correlation id is
    /// logged and dropped, as is one whose id belongs to a local question;
    /// every other payload is stored, falling back to a free-text field when
    /// no decode strategy matched.
    pub fn receive_question(&self, event: RawQuestionEvent) -> Option<PendingDialogRequest> {
        self.sweep();

        let Some(id) = event.id.filter(|id| !id.trim().is_empty()) else {
            warn!("dialog question without correlation id dropped");
            return None;
        };

        let decoded = decode_question(&event.message);
        if let Some(reason) = &decoded.malformed {
            let err = DeckError::MalformedPayload(reason.clone());
            warn!(id, error = %err, "dialog question stored as free text");
        }

        let request = PendingDialogRequest::upstream(question(id.clone(), event.message, decoded));
        {
            let mut entries = self.entries.lock();
            match entries.get(&id) {
                Some(existing) if !existing.is_upstream() => {
                    warn!(id, "robot question collides with a local question; dropped");
                    return None;
                }
                Some(_) => debug!(id, "dialog question re-sent; replaced"),
                None => {}
            }
            entries.insert(id.clone(), request.clone());
            self.publish_update(&entries);
        }
        info!(id, field_type = ?request.question().descriptor.field_type, "dialog question received");
        Some(request)
    }

    /// Create a question on behalf of a local caller, who polls
    /// [`get`](Self::get) for the answer.
    ///
    /// # Errors
    ///
    /// [`DeckError::MalformedPayload`] for an unknown explicit `field_type` or
    /// an id that is already tracked.
    pub fn create_local(&self, local: LocalQuestion) -> Result<PendingDialogRequest, DeckError> {
        let id = local
            .request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut decoded = match local.field_type.as_deref() {
            Some(tag) => template_for(tag, &local.message)
                .map(|descriptor| DecodedQuestion {
                    descriptor,
                    malformed: None,
                })
                .ok_or_else(|| DeckError::MalformedPayload(format!("unknown field type '{tag}'")))?,
            None => decode_question(&local.message),
        };
        if let Some(config) = &local.field_config {
            apply_overrides(&mut decoded.descriptor, config);
        }
        if let Some(options) = &local.options {
            decoded.descriptor.options = options.iter().filter_map(option_from_value).collect();
        }

        let request = PendingDialogRequest::local(question(id.clone(), local.message, decoded));
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&id) {
                return Err(DeckError::MalformedPayload(format!(
                    "dialog request '{id}' already exists"
                )));
            }
            entries.insert(id.clone(), request.clone());
            self.publish_update(&entries);
        }
        info!(id, "local dialog question created");
        Ok(request)
    }

    /// Every pending entry, oldest first.
    pub fn list_pending(&self) -> Vec<PendingDialogRequest> {
        pending_of(&self.entries.lock())
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().values().filter(|r| r.is_pending()).count()
    }

    /// Any tracked entry, pending or answered.
    pub fn get(&self, id: &str) -> Option<PendingDialogRequest> {
        self.entries.lock().get(id).cloned()
    }

    /// Answer a pending question.
    ///
    /// Upstream questions get `{id, accepted: true, value}` published and are
    /// removed; local questions are marked answered and kept.
    ///
    /// # Errors
    ///
    /// * [`DeckError::NotFound`] – no pending entry has this id.
    /// * [`DeckError::TransportUnavailable`] – the reply could not be
    ///   published; the entry stays pending.
    pub fn answer(&self, id: &str, value: Value) -> Result<PendingDialogRequest, DeckError> {
        let answered = {
            let mut entries = self.entries.lock();
            let upstream = match entries.get(id) {
                Some(entry) if entry.is_pending() => entry.is_upstream(),
                _ => return Err(DeckError::NotFound(id.to_string())),
            };

            let answered = if upstream {
                self.reply(id, true, &value)?;
                entries.remove(id)
            } else {
                if let Some(PendingDialogRequest::Local { status, answer, .. }) = entries.get_mut(id) {
                    *status = DialogStatus::Answered;
                    *answer = Some(value);
                }
                entries.get(id).cloned()
            };
            self.publish_update(&entries);
            answered
        }
        .ok_or_else(|| DeckError::NotFound(id.to_string()))?;

        info!(id, upstream = answered.is_upstream(), "dialog question answered");
        Ok(answered)
    }

    /// Cancel a question. Upstream questions get `{accepted: false}`
    /// published; local ones are simply removed.
    ///
    /// # Errors
    ///
    /// [`DeckError::NotFound`] for an unknown id, or
    /// [`DeckError::TransportUnavailable`] when the upstream rejection could
    /// not be published (the entry is kept).
    pub fn cancel(&self, id: &str) -> Result<(), DeckError> {
        {
            let mut entries = self.entries.lock();
            let upstream = entries
                .get(id)
                .map(PendingDialogRequest::is_upstream)
                .ok_or_else(|| DeckError::NotFound(id.to_string()))?;
            if upstream {
                self.reply(id, false, &Value::Null)?;
            }
            entries.remove(id);
            self.publish_update(&entries);
        }
        info!(id, "dialog question cancelled");
        Ok(())
    }

    /// Drop an upstream question the robot itself cancelled. Nothing is
    /// published. Returns `false` if no such question was tracked.
    pub fn withdraw(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = match entries.get(id) {
                Some(entry) if entry.is_upstream() => entries.remove(id).is_some(),
                _ => false,
            };
            if removed {
                self.publish_update(&entries);
            }
            removed
        };
        if removed {
            info!(id, "dialog question withdrawn by robot");
        }
        removed
    }

    /// Remove every entry older than the TTL, answered local entries
    /// included. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let Some(cutoff) = TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, request| request.created_at() >= cutoff);
            let removed = before - entries.len();
            if removed > 0 {
                self.publish_update(&entries);
            }
            removed
        };
        if removed > 0 {
            info!(removed, "expired dialog questions swept");
        }
        removed
    }

    /// Sweep every `every` until the correlator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(correlator) = weak.upgrade() else {
                    break;
                };
                correlator.sweep();
            }
        })
    }

    fn reply(&self, id: &str, accepted: bool, value: &Value) -> Result<(), DeckError> {
        let body = serde_json::to_string(&DialogReply {
            id,
            accepted,
            value,
        })
        .map_err(|e| DeckError::Serialization(e.to_string()))?;
        self.publisher
            .publish(channels::DIALOG_RESPONSE, &json!({ "data": body }))
            .inspect_err(|e| {
                warn!(id, error = %e, "dialog reply not published");
            })
    }

    /// Broadcast the pending list. Called with the entry lock held so
    /// retained updates are emitted in mutation order.
    fn publish_update(&self, entries: &Entries) {
        if let Err(e) = self.hub.broadcast_retained(kinds::DIALOG_UPDATE, &pending_of(entries)) {
            warn!(error = %e, "dialog update broadcast failed");
        }
    }
}

fn pending_of(entries: &Entries) -> Vec<PendingDialogRequest> {
    let mut pending: Vec<PendingDialogRequest> =
        entries.values().filter(|r| r.is_pending()).cloned().collect();
    pending.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
    pending
}

fn question(id: String, raw_question: String, decoded: DecodedQuestion) -> DialogQuestion {
    DialogQuestion {
        id,
        raw_question,
        descriptor: decoded.descriptor,
        created_at: Utc::now(),
        malformed: decoded.malformed,
    }
}

fn option_from_value(value: &Value) -> Option<FieldOption> {
    match value {
        Value::String(s) => Some(FieldOption::new(s.clone(), s.clone())),
        Value::Object(fields) => {
            let label = fields.get("label").or_else(|| fields.get("text"))?;
            let value = fields.get("value").unwrap_or(label);
            Some(FieldOption::new(value_text(label), value_text(value)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosdeck_types::FieldType;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Value)>>,
        offline: AtomicBool,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &str, msg: &Value) -> Result<(), DeckError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(DeckError::TransportUnavailable);
            }
            self.sent.lock().push((topic.to_string(), msg.clone()));
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingPublisher>, Arc<BroadcastHub>, DialogCorrelator) {
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = Arc::new(BroadcastHub::new());
        let correlator = DialogCorrelator::new(publisher.clone(), Arc::clone(&hub));
        (publisher, hub, correlator)
    }

    /// Unwrap a published `std_msgs/String`, failing on any other shape.
    fn reply_body(msg: &Value) -> Value {
        let fields = msg.as_object().unwrap();
        assert_eq!(fields.len(), 1, "std_msgs/String carries only `data`: {msg}");
        serde_json::from_str(fields["data"].as_str().unwrap()).unwrap()
    }

    fn ask(correlator: &DialogCorrelator, id: &str) {
        correlator
            .receive_question(RawQuestionEvent::new(id, r#"{"type":"int","message":"Enter X"}"#))
            .unwrap();
    }

    #[test]
    fn question_without_id_is_never_stored() {
        let (_, _, correlator) = setup();
        let event = RawQuestionEvent {
            id: None,
            message: "INT:n".to_string(),
        };
        assert!(correlator.receive_question(event).is_none());
        assert!(correlator.list_pending().is_empty());
    }

    #[test]
    fn received_question_is_decoded_and_listed() {
        let (_, _, correlator) = setup();
        ask(&correlator, "q1");

        let pending = correlator.list_pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_upstream());
        assert_eq!(pending[0].question().descriptor.field_type, FieldType::Int);
        assert_eq!(pending[0].question().descriptor.label, "Enter X");
    }

    #[test]
    fn malformed_question_is_stored_as_text() {
        let (_, _, correlator) = setup();
        let stored = correlator
            .receive_question(RawQuestionEvent::new("q1", "Is the aisle clear?"))
            .unwrap();
        assert_eq!(stored.question().descriptor.field_type, FieldType::Text);
        assert!(stored.question().malformed.is_some());
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn answering_unknown_id_is_not_found_and_changes_nothing() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");

        let err = correlator.answer("nope", json!(3)).unwrap_err();
        assert!(matches!(err, DeckError::NotFound(_)));
        assert_eq!(correlator.pending_count(), 1);
        assert!(publisher.sent.lock().is_empty());
    }

    #[test]
    fn upstream_answer_publishes_reply_and_removes_entry() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");

        correlator.answer("q1", json!("42")).unwrap();
        assert!(correlator.get("q1").is_none());

        let sent = publisher.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, channels::DIALOG_RESPONSE);
        assert_eq!(reply_body(&sent[0].1), json!({"id": "q1", "accepted": true, "value": "42"}));
    }

    #[test]
    fn only_one_terminal_transition_wins() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");

        correlator.answer("q1", json!(1)).unwrap();
        assert!(matches!(correlator.answer("q1", json!(2)), Err(DeckError::NotFound(_))));
        assert!(matches!(correlator.cancel("q1"), Err(DeckError::NotFound(_))));
        assert_eq!(publisher.sent.lock().len(), 1);
    }

    #[test]
    fn failed_reply_keeps_entry_pending() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");
        publisher.offline.store(true, Ordering::SeqCst);

        let err = correlator.answer("q1", json!(1)).unwrap_err();
        assert!(matches!(err, DeckError::TransportUnavailable));
        assert!(correlator.get("q1").unwrap().is_pending());

        publisher.offline.store(false, Ordering::SeqCst);
        correlator.answer("q1", json!(1)).unwrap();
    }

    #[test]
    fn local_answer_is_retained_for_the_caller() {
        let (publisher, _, correlator) = setup();
        let created = correlator
            .create_local(LocalQuestion {
                request_id: Some("local-1".to_string()),
                message: "How many boxes?".to_string(),
                field_type: Some("int".to_string()),
                ..LocalQuestion::default()
            })
            .unwrap();
        assert!(!created.is_upstream());

        correlator.answer("local-1", json!(12)).unwrap();
        let fetched = correlator.get("local-1").unwrap();
        assert_eq!(fetched.status(), DialogStatus::Answered);
        match fetched {
            PendingDialogRequest::Local { answer, .. } => assert_eq!(answer, Some(json!(12))),
            other => panic!("expected local request, got {other:?}"),
        }
        assert!(correlator.list_pending().is_empty());
        assert!(publisher.sent.lock().is_empty());
    }

    #[test]
    fn upstream_cancel_publishes_rejection() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");

        correlator.cancel("q1").unwrap();
        assert!(correlator.get("q1").is_none());
        assert_eq!(
            reply_body(&publisher.sent.lock()[0].1),
            json!({"id": "q1", "accepted": false, "value": null})
        );
    }

    #[test]
    fn local_cancel_just_deletes() {
        let (publisher, _, correlator) = setup();
        correlator
            .create_local(LocalQuestion {
                request_id: Some("l1".to_string()),
                message: "Continue?".to_string(),
                ..LocalQuestion::default()
            })
            .unwrap();

        correlator.cancel("l1").unwrap();
        assert!(correlator.get("l1").is_none());
        assert!(publisher.sent.lock().is_empty());
    }

    #[test]
    fn withdraw_removes_without_reply() {
        let (publisher, _, correlator) = setup();
        ask(&correlator, "q1");

        assert!(correlator.withdraw("q1"));
        assert!(!correlator.withdraw("q1"));
        assert!(publisher.sent.lock().is_empty());
    }

    #[test]
    fn create_local_applies_config_and_options() {
        let (_, _, correlator) = setup();
        let created = correlator
            .create_local(LocalQuestion {
                request_id: None,
                message: "Speed".to_string(),
                field_type: Some("float".to_string()),
                field_config: Some(
                    json!({"min": 0.0, "max": 2.0, "default": 1.0})
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                options: Some(vec![json!("slow"), json!({"label": "Fast", "value": "fast"})]),
            })
            .unwrap();

        let descriptor = &created.question().descriptor;
        assert!(!created.id().is_empty());
        assert_eq!(descriptor.max, Some(2.0));
        assert_eq!(descriptor.default.as_deref(), Some("1.0"));
        assert_eq!(descriptor.options[1], FieldOption::new("Fast", "fast"));
    }

    #[test]
    fn create_local_rejects_unknown_type_and_duplicate_id() {
        let (_, _, correlator) = setup();
        let bad = correlator.create_local(LocalQuestion {
            message: "x".to_string(),
            field_type: Some("colour".to_string()),
            ..LocalQuestion::default()
        });
        assert!(matches!(bad, Err(DeckError::MalformedPayload(_))));

        ask(&correlator, "dup");
        let dup = correlator.create_local(LocalQuestion {
            request_id: Some("dup".to_string()),
            message: "x".to_string(),
            ..LocalQuestion::default()
        });
        assert!(matches!(dup, Err(DeckError::MalformedPayload(_))));
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_next_question() {
        let (_, _, correlator) = setup();
        let correlator = correlator.with_ttl(Duration::from_millis(50));
        ask(&correlator, "old");

        tokio::time::sleep(Duration::from_millis(80)).await;
        ask(&correlator, "new");

        let ids: Vec<String> = correlator.list_pending().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn background_sweeper_expires_idle_entries() {
        let (_, _, correlator) = setup();
        let correlator = Arc::new(correlator.with_ttl(Duration::from_millis(30)));
        ask(&correlator, "idle");

        let sweeper = correlator.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(correlator.list_pending().is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn changes_are_broadcast_to_viewers() {
        let (_, hub, correlator) = setup();
        let (_viewer, mut rx) = hub.join();

        ask(&correlator, "q1");
        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "dialogUpdate");
        assert_eq!(envelope["data"][0]["id"], "q1");

        correlator.answer("q1", json!(5)).unwrap();
        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["data"], json!([]));
    }

    #[test]
    fn robot_question_cannot_replace_local_one() {
        let (_, _, correlator) = setup();
        correlator
            .create_local(LocalQuestion {
                request_id: Some("shared".to_string()),
                message: "How many boxes?".to_string(),
                field_type: Some("int".to_string()),
                ..LocalQuestion::default()
            })
            .unwrap();
        correlator.answer("shared", json!(3)).unwrap();

        assert!(
            correlator
                .receive_question(RawQuestionEvent::new("shared", "BOOL: Proceed?"))
                .is_none()
        );
        let kept = correlator.get("shared").unwrap();
        assert!(!kept.is_upstream());
        assert_eq!(kept.status(), DialogStatus::Answered);
    }

    #[test]
    fn retained_update_matches_final_state_under_contention() {
        let (_, hub, correlator) = setup();
        let correlator = Arc::new(correlator);

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let correlator = Arc::clone(&correlator);
                std::thread::spawn(move || {
                    for n in 0..25 {
                        let id = format!("w{worker}-{n}");
                        ask(&correlator, &id);
                        if n % 2 == 0 {
                            correlator.answer(&id, json!(n)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let (viewer, mut rx) = hub.join();
        hub.replay_last_known(&viewer);
        let envelope: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope["type"], "dialogUpdate");
        assert_eq!(
            envelope["data"].as_array().unwrap().len(),
            correlator.pending_count()
        );
        assert_eq!(correlator.pending_count(), 8 * 12);
    }
}
