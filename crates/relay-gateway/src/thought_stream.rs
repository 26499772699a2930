use std::collections::HashSet;

use serde_json::{Map, Value};

use relay_types::thought::{CheckpointEvent, CheckpointStatus, ThoughtEvent};

/// Registry of tasks that currently accept thought-stream events, plus
/// structural validation of the events themselves.
///
/// Validation does not consult the registry; callers that only want events
/// for live tasks check [`ThoughtStreamHandler::is_task_active`] themselves.
#[derive(Debug, Default)]
pub struct ThoughtStreamHandler {
    active_tasks: HashSet<String>,
}

impl ThoughtStreamHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&mut self, task_id: &str) {
        self.active_tasks.insert(task_id.to_string());
    }

    pub fn unregister_task(&mut self, task_id: &str) {
        self.active_tasks.remove(task_id);
    }

    pub fn is_task_active(&self, task_id: &str) -> bool {
        self.active_tasks.contains(task_id)
    }

    /// Active task ids, sorted.
    pub fn active_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_tasks.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear_all_tasks(&mut self) {
        self.active_tasks.clear();
    }

    /// Returns `None` unless `data` is a well-formed thought event.
    pub fn validate_thought_event(&self, data: &Value) -> Option<ThoughtEvent> {
        let obj = data.as_object()?;
        Some(ThoughtEvent {
            task_id: required_string(obj, "taskId")?,
            content: required_string(obj, "content")?,
            category: required_string(obj, "category")?.parse().ok()?,
            agent_name: required_string(obj, "agentName")?,
            timestamp: timestamp(obj)?,
        })
    }

    /// Returns `None` unless `data` is a well-formed checkpoint event.
    pub fn validate_checkpoint_event(&self, data: &Value) -> Option<CheckpointEvent> {
        let obj = data.as_object()?;
        let status: CheckpointStatus = required_string(obj, "status")?.parse().ok()?;
        Some(CheckpointEvent {
            task_id: required_string(obj, "taskId")?,
            status,
            summary: required_string(obj, "summary")?,
            next_planned: optional_string(obj, "nextPlanned")?,
            blocker: optional_string(obj, "blocker")?,
            agent_name: required_string(obj, "agentName")?,
            timestamp: timestamp(obj)?,
        })
    }
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `Some(None)` when absent, `None` when present with the wrong type.
fn optional_string(obj: &Map<String, Value>, key: &str) -> Option<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(s.clone())),
        Some(_) => None,
    }
}

fn timestamp(obj: &Map<String, Value>) -> Option<i64> {
    let value = obj.get("timestamp")?;
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::thought::ThoughtCategory;
    use serde_json::json;

    fn thought() -> Value {
        json!({
            "taskId": "t1",
            "content": "x",
            "category": "observation",
            "agentName": "a",
            "timestamp": 123
        })
    }

    #[test]
    fn task_registry_is_idempotent() {
        let mut handler = ThoughtStreamHandler::new();
        handler.register_task("t2");
        handler.register_task("t1");
        handler.register_task("t1");
        assert!(handler.is_task_active("t1"));
        assert_eq!(handler.active_task_ids(), vec!["t1", "t2"]);

        handler.unregister_task("t1");
        handler.unregister_task("t1");
        assert!(!handler.is_task_active("t1"));

        handler.clear_all_tasks();
        assert!(handler.active_task_ids().is_empty());
    }

    #[test]
    fn valid_thought_event() {
        let handler = ThoughtStreamHandler::new();
        let event = handler.validate_thought_event(&thought()).unwrap();
        assert_eq!(
            event,
            ThoughtEvent {
                task_id: "t1".into(),
                content: "x".into(),
                category: ThoughtCategory::Observation,
                agent_name: "a".into(),
                timestamp: 123,
            }
        );
    }

    #[test]
    fn validation_does_not_require_registration() {
        let handler = ThoughtStreamHandler::new();
        assert!(!handler.is_task_active("t1"));
        assert!(handler.validate_thought_event(&thought()).is_some());
    }

    #[test]
    fn invalid_thought_events() {
        let handler = ThoughtStreamHandler::new();

        let mut bogus = thought();
        bogus["category"] = json!("bogus");
        assert!(handler.validate_thought_event(&bogus).is_none());

        let mut empty_task = thought();
        empty_task["taskId"] = json!("");
        assert!(handler.validate_thought_event(&empty_task).is_none());

        let mut string_ts = thought();
        string_ts["timestamp"] = json!("123");
        assert!(handler.validate_thought_event(&string_ts).is_none());

        let mut no_agent = thought();
        no_agent.as_object_mut().unwrap().remove("agentName");
        assert!(handler.validate_thought_event(&no_agent).is_none());

        assert!(handler.validate_thought_event(&json!(null)).is_none());
        assert!(handler.validate_thought_event(&json!("thought")).is_none());
    }

    #[test]
    fn checkpoint_events() {
        let handler = ThoughtStreamHandler::new();
        let data = json!({
            "taskId": "t1",
            "status": "stuck",
            "summary": "waiting on credentials",
            "blocker": "missing API key",
            "agentName": "coder",
            "timestamp": 1_700_000_000_000i64
        });
        let event = handler.validate_checkpoint_event(&data).unwrap();
        assert_eq!(event.status, CheckpointStatus::Stuck);
        assert_eq!(event.blocker.as_deref(), Some("missing API key"));
        assert!(event.next_planned.is_none());

        let mut bad_status = data.clone();
        bad_status["status"] = json!("done");
        assert!(handler.validate_checkpoint_event(&bad_status).is_none());

        let mut bad_next = data.clone();
        bad_next["nextPlanned"] = json!(42);
        assert!(handler.validate_checkpoint_event(&bad_next).is_none());

        let mut float_ts = data;
        float_ts["timestamp"] = json!(1.5e12);
        assert_eq!(
            handler.validate_checkpoint_event(&float_ts).unwrap().timestamp,
            1_500_000_000_000
        );
    }
}
