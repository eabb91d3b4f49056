//! Collapsed live views over event streams that may arrive out of order or
//! more than once.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::{Value, json};

/// Latest transform per child frame, merged from `/tf` messages.
///
/// A transform stamped earlier than the one already held for its child
/// frame is discarded, so a late frame can never roll the view back.
#[derive(Debug, Default)]
pub struct TfView {
    frames: BTreeMap<String, StampedTransform>,
}

#[derive(Debug)]
struct StampedTransform {
    stamp_ns: i128,
    transform: Value,
}

impl TfView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `tf2_msgs/TFMessage`. Returns `true` when the view changed.
    pub fn merge(&mut self, msg: &Value) -> bool {
        let Some(transforms) = msg.get("transforms").and_then(Value::as_array) else {
            return false;
        };

        let mut changed = false;
        for transform in transforms {
            let Some(child) = transform.get("child_frame_id").and_then(Value::as_str) else {
                continue;
            };
            let stamp_ns = stamp_nanos(transform);
            match self.frames.get(child) {
                Some(held) if stamp_ns < held.stamp_ns || held.transform == *transform => {}
                _ => {
                    self.frames.insert(
                        child.to_string(),
                        StampedTransform {
                            stamp_ns,
                            transform: transform.clone(),
                        },
                    );
                    changed = true;
                }
            }
        }
        changed
    }

    /// The merged view as a `TFMessage`, ordered by child frame.
    pub fn snapshot(&self) -> Value {
        let transforms: Vec<&Value> = self.frames.values().map(|f| &f.transform).collect();
        json!({ "transforms": transforms })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Forget every frame, e.g. after the robot restarted and its clock
    /// may have gone backwards.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Header stamp in nanoseconds. Accepts ROS 2 (`sec`/`nanosec`) and ROS 1
/// (`secs`/`nsecs`) field names; a missing stamp counts as zero.
fn stamp_nanos(transform: &Value) -> i128 {
    let stamp = &transform["header"]["stamp"];
    let secs = stamp
        .get("sec")
        .or_else(|| stamp.get("secs"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let nanos = stamp
        .get("nanosec")
        .or_else(|| stamp.get("nsecs"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    i128::from(secs) * 1_000_000_000 + i128::from(nanos)
}

/// How many missions [`MissionQueueView`] remembers before evicting the
/// oldest.
pub const MISSION_HISTORY: usize = 512;

/// Last known status per mission, used to drop duplicate queue events.
///
/// Two events are duplicates when they name the same mission with the same
/// status; other fields (stamps, progress) are ignored. Only the most
/// recently seen [`MISSION_HISTORY`] missions are remembered.
#[derive(Debug)]
pub struct MissionQueueView {
    capacity: usize,
    statuses: HashMap<String, String>,
    order: VecDeque<String>,
}

impl Default for MissionQueueView {
    fn default() -> Self {
        Self::with_capacity(MISSION_HISTORY)
    }
}

impl MissionQueueView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            statuses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a mission event. Returns `false` when the event repeats the
    /// status already known for that mission and should not be relayed.
    ///
    /// Events without a recognisable mission id are always relayed.
    pub fn apply(&mut self, msg: &Value) -> bool {
        let body = unwrap_string_body(msg);
        let Some(id) = mission_id(&body) else {
            return true;
        };
        let status = mission_status(&body);
        if self.statuses.get(&id) == Some(&status) {
            return false;
        }

        if self.statuses.insert(id.clone(), status).is_none() {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.statuses.remove(&oldest);
                }
            }
        }
        true
    }

    /// Last known status of `id`.
    pub fn status(&self, id: &str) -> Option<&str> {
        self.statuses.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.order.clear();
    }
}

/// `std_msgs/String` events carry their JSON body in `data`; unwrap it when
/// it holds an object.
fn unwrap_string_body(msg: &Value) -> Cow<'_, Value> {
    if let Some(Value::String(data)) = msg.get("data")
        && let Ok(inner @ Value::Object(_)) = serde_json::from_str::<Value>(data)
    {
        return Cow::Owned(inner);
    }
    Cow::Borrowed(msg)
}

fn mission_id(body: &Value) -> Option<String> {
    let raw = ["mission_id", "missionId", "id"]
        .iter()
        .find_map(|key| body.get(*key))?;
    match raw {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `status` (or `state`) field as text. Events without one compare by
/// their whole body.
fn mission_status(body: &Value) -> String {
    match body.get("status").or_else(|| body.get("state")) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf(child: &str, sec: i64, x: f64) -> Value {
        json!({
            "header": {"frame_id": "map", "stamp": {"sec": sec, "nanosec": 0}},
            "child_frame_id": child,
            "transform": {"translation": {"x": x, "y": 0.0, "z": 0.0}}
        })
    }

    #[test]
    fn newer_transform_replaces_older() {
        let mut view = TfView::new();
        assert!(view.merge(&json!({"transforms": [tf("base_link", 10, 1.0)]})));
        assert!(view.merge(&json!({"transforms": [tf("base_link", 11, 2.0)]})));
        assert_eq!(view.snapshot()["transforms"][0]["transform"]["translation"]["x"], 2.0);
    }

    #[test]
    fn out_of_order_transform_is_discarded() {
        let mut view = TfView::new();
        view.merge(&json!({"transforms": [tf("base_link", 11, 2.0)]}));
        assert!(!view.merge(&json!({"transforms": [tf("base_link", 10, 1.0)]})));
        assert_eq!(view.snapshot()["transforms"][0]["transform"]["translation"]["x"], 2.0);
    }

    #[test]
    fn duplicate_transform_is_not_a_change() {
        let mut view = TfView::new();
        view.merge(&json!({"transforms": [tf("base_link", 10, 1.0)]}));
        assert!(!view.merge(&json!({"transforms": [tf("base_link", 10, 1.0)]})));
    }

    #[test]
    fn frames_merge_independently() {
        let mut view = TfView::new();
        view.merge(&json!({"transforms": [tf("odom", 5, 0.0), tf("base_link", 5, 1.0)]}));
        view.merge(&json!({"transforms": [tf("laser", 6, 0.2)]}));
        assert_eq!(view.len(), 3);
        let snapshot = view.snapshot();
        let children: Vec<&str> = snapshot["transforms"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["child_frame_id"].as_str().unwrap())
            .collect();
        assert_eq!(children, vec!["base_link", "laser", "odom"]);
    }

    #[test]
    fn message_without_transforms_is_ignored() {
        let mut view = TfView::new();
        assert!(!view.merge(&json!({"data": 1})));
        assert!(view.is_empty());
    }

    #[test]
    fn duplicate_mission_status_collapses() {
        let mut view = MissionQueueView::new();
        let running = json!({"mission_id": "m1", "status": "running"});
        assert!(view.apply(&running));
        assert!(!view.apply(&running));
        assert!(view.apply(&json!({"mission_id": "m1", "status": "done"})));
        assert_eq!(view.status("m1"), Some("done"));
    }

    #[test]
    fn numeric_mission_ids_are_tracked() {
        let mut view = MissionQueueView::new();
        assert!(view.apply(&json!({"id": 7, "status": "queued"})));
        assert!(!view.apply(&json!({"id": 7, "status": "queued"})));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn string_wrapped_events_are_unwrapped() {
        let mut view = MissionQueueView::new();
        let event = json!({"data": "{\"mission_id\":\"m9\",\"status\":\"queued\"}"});
        assert!(view.apply(&event));
        assert!(!view.apply(&event));
        assert_eq!(view.status("m9"), Some("queued"));
    }

    #[test]
    fn events_without_id_always_pass() {
        let mut view = MissionQueueView::new();
        let anonymous = json!({"status": "queued"});
        assert!(view.apply(&anonymous));
        assert!(view.apply(&anonymous));
        assert!(view.is_empty());
    }

    #[test]
    fn same_status_with_new_stamp_is_a_duplicate() {
        let mut view = MissionQueueView::new();
        assert!(view.apply(&json!({"mission_id": "m1", "status": "running", "stamp": 1})));
        assert!(!view.apply(&json!({"mission_id": "m1", "status": "running", "stamp": 2})));
        assert!(view.apply(&json!({"mission_id": "m1", "status": "done", "stamp": 3})));
    }

    #[test]
    fn oldest_missions_are_evicted_past_capacity() {
        let mut view = MissionQueueView::with_capacity(2);
        view.apply(&json!({"id": "a", "status": "done"}));
        view.apply(&json!({"id": "b", "status": "done"}));
        view.apply(&json!({"id": "c", "status": "done"}));
        assert_eq!(view.len(), 2);
        assert_eq!(view.status("a"), None);
        assert_eq!(view.status("c"), Some("done"));
    }

    #[test]
    fn cleared_tf_view_accepts_older_stamps() {
        let mut view = TfView::new();
        view.merge(&json!({"transforms": [tf("base_link", 1000, 1.0)]}));
        view.clear();
        assert!(view.merge(&json!({"transforms": [tf("base_link", 5, 2.0)]})));
        assert_eq!(view.snapshot()["transforms"][0]["transform"]["translation"]["x"], 2.0);
    }
}
