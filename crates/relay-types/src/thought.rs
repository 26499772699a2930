use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtCategory {
    Observation,
    Reasoning,
    Decision,
    Action,
}

impl std::str::FromStr for ThoughtCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(Self::Observation),
            "reasoning" => Ok(Self::Reasoning),
            "decision" => Ok(Self::Decision),
            "action" => Ok(Self::Action),
            _ => Err(format!("unknown thought category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Progress,
    Complete,
    Stuck,
}

impl std::str::FromStr for CheckpointStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "complete" => Ok(Self::Complete),
            "stuck" => Ok(Self::Stuck),
            _ => Err(format!("unknown checkpoint status: {s}")),
        }
    }
}

/// A single "thought" the agent reports while working on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtEvent {
    pub task_id: String,
    pub content: String,
    pub category: ThoughtCategory,
    pub agent_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A progress checkpoint reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEvent {
    pub task_id: String,
    pub status: CheckpointStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_planned: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<String>,
    pub agent_name: String,
    pub timestamp: i64,
}
