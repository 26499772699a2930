use serde::{Deserialize, Serialize};

/// Which kind of human decision a pending interaction waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Permission,
    Question,
}

/// Discriminant of a request record as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    File,
    Question,
}

/// File operations the agent may ask permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Delete,
    Rename,
    Move,
    Modify,
    Overwrite,
}

impl FileOperation {
    pub const ALL: [FileOperation; 6] = [
        Self::Create,
        Self::Delete,
        Self::Rename,
        Self::Move,
        Self::Modify,
        Self::Overwrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Move => "move",
            Self::Modify => "modify",
            Self::Overwrite => "overwrite",
        }
    }
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileOperation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown file operation: {s}"))
    }
}

/// A file-operation permission request, built from validated agent input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub file_operation: FileOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A multiple-choice or free-text question, built from validated agent input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    pub multi_select: bool,
    pub created_at: String,
}

/// The UI's answer to a question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
    #[serde(default)]
    pub denied: bool,
}

impl QuestionResponse {
    /// The response delivered when a question times out or is dismissed.
    pub fn declined() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    pub fn selected(options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            selected_options: Some(options.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            custom_text: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Outcome of validating an untrusted request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { valid: true, error: None }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_operation_roundtrip() {
        for op in FileOperation::ALL {
            let parsed: FileOperation = op.to_string().parse().unwrap();
            assert_eq!(op, parsed);
        }
        assert!("chmod".parse::<FileOperation>().is_err());
    }

    #[test]
    fn declined_response_serializes_as_denied() {
        let json = serde_json::to_value(QuestionResponse::declined()).unwrap();
        assert_eq!(json, serde_json::json!({ "denied": true }));
    }

    #[test]
    fn question_response_accepts_camel_case() {
        let resp: QuestionResponse =
            serde_json::from_str(r#"{"selectedOptions":["Yes"],"customText":"ok"}"#).unwrap();
        assert_eq!(resp.selected_options, Some(vec!["Yes".to_string()]));
        assert_eq!(resp.custom_text.as_deref(), Some("ok"));
        assert!(!resp.denied);
    }
}
