//! Permission and question requests that pause the agent until a human
//! answers.
//!
//! Each request gets an id and a [`PendingReply`] future. The UI answers
//! through `resolve_*`; if nobody answers before the timeout, permissions are
//! denied and questions are declined. Exactly one of {resolve, timeout}
//! settles a request: both remove the registry entry under the same lock and
//! only the one that actually removed it delivers a value.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use relay_types::config::InteractionConfig;
use relay_types::interaction::{
    FileOperation, InteractionKind, PermissionRequest, QuestionOption, QuestionRequest,
    QuestionResponse, RequestType, ValidationResult,
};

/// Default time a request waits for an answer (5 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Content previews longer than this are truncated when building records.
const CONTENT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InteractionError {
    #[error("interaction was cancelled before it was answered")]
    Cancelled,
}

/// Resolves once the request is answered or times out.
///
/// Yields [`InteractionError::Cancelled`] if the request was dropped by
/// [`PermissionRequestHandler::clear_all`].
#[derive(Debug)]
pub struct PendingReply<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T, InteractionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| InteractionError::Cancelled)
    }
}

struct PendingInteraction<T> {
    reply: oneshot::Sender<T>,
    timer: JoinHandle<()>,
    created_at: Instant,
}

impl<T> PendingInteraction<T> {
    fn settle(self, id: &str, kind: InteractionKind, value: T) {
        self.timer.abort();
        debug!(
            request_id = id,
            ?kind,
            waited_ms = self.created_at.elapsed().as_millis() as u64,
            "Interaction settled"
        );
        let _ = self.reply.send(value);
    }
}

#[derive(Default)]
struct Registry {
    permissions: HashMap<String, PendingInteraction<bool>>,
    questions: HashMap<String, PendingInteraction<QuestionResponse>>,
}

/// Tracks outstanding permission and question requests.
///
/// Must be used from within a tokio runtime; timeouts run as spawned tasks.
#[derive(Clone)]
pub struct PermissionRequestHandler {
    registry: Arc<Mutex<Registry>>,
    permission_timeout: Duration,
    question_timeout: Duration,
}

impl PermissionRequestHandler {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }

    pub fn with_timeouts(permission_timeout: Duration, question_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            permission_timeout,
            question_timeout,
        }
    }

    pub fn from_config(config: &InteractionConfig) -> Self {
        Self::with_timeouts(
            Duration::from_millis(config.permission_timeout_ms),
            Duration::from_millis(config.question_timeout_ms),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // The registry holds no invariants a panicking holder could break
        // halfway, so a poisoned lock is still usable.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a file permission request. The reply is `false` if the
    /// request times out.
    pub fn create_permission_request(&self, timeout: Option<Duration>) -> (String, PendingReply<bool>) {
        self.register(
            InteractionKind::Permission,
            "filereq",
            timeout.unwrap_or(self.permission_timeout),
            |registry| &mut registry.permissions,
            || false,
        )
    }

    /// Register a question. The reply is [`QuestionResponse::declined`] if
    /// the question times out.
    pub fn create_question_request(
        &self,
        timeout: Option<Duration>,
    ) -> (String, PendingReply<QuestionResponse>) {
        self.register(
            InteractionKind::Question,
            "questionreq",
            timeout.unwrap_or(self.question_timeout),
            |registry| &mut registry.questions,
            QuestionResponse::declined,
        )
    }

    fn register<T: Send + 'static>(
        &self,
        kind: InteractionKind,
        prefix: &str,
        timeout: Duration,
        entries: fn(&mut Registry) -> &mut HashMap<String, PendingInteraction<T>>,
        on_timeout: fn() -> T,
    ) -> (String, PendingReply<T>) {
        let id = new_request_id(prefix);
        let (reply, rx) = oneshot::channel();

        // Hold the lock until the entry is in, so a short timer cannot
        // fire before there is anything to expire.
        let mut registry = self.lock();
        let shared = Arc::clone(&self.registry);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = entries(&mut shared.lock().unwrap_or_else(|e| e.into_inner())).remove(&timer_id);
            if let Some(pending) = expired {
                info!(request_id = %timer_id, ?kind, "Interaction timed out");
                let _ = pending.reply.send(on_timeout());
            }
        });

        entries(&mut registry).insert(
            id.clone(),
            PendingInteraction {
                reply,
                timer,
                created_at: Instant::now(),
            },
        );
        (id, PendingReply { rx })
    }

    /// Answer a permission request. Returns `false` if the id is unknown,
    /// already answered, or timed out.
    pub fn resolve_permission_request(&self, request_id: &str, allowed: bool) -> bool {
        let pending = self.lock().permissions.remove(request_id);
        match pending {
            Some(pending) => {
                pending.settle(request_id, InteractionKind::Permission, allowed);
                true
            }
            None => {
                debug!(request_id, "No pending permission request to resolve");
                false
            }
        }
    }

    /// Answer a question. Returns `false` if the id is unknown, already
    /// answered, or timed out.
    pub fn resolve_question_request(&self, request_id: &str, response: QuestionResponse) -> bool {
        let pending = self.lock().questions.remove(request_id);
        match pending {
            Some(pending) => {
                pending.settle(request_id, InteractionKind::Question, response);
                true
            }
            None => {
                debug!(request_id, "No pending question to resolve");
                false
            }
        }
    }

    pub fn has_pending_permissions(&self) -> bool {
        !self.lock().permissions.is_empty()
    }

    pub fn has_pending_questions(&self) -> bool {
        !self.lock().questions.is_empty()
    }

    pub fn pending_permission_count(&self) -> usize {
        self.lock().permissions.len()
    }

    pub fn pending_question_count(&self) -> usize {
        self.lock().questions.len()
    }

    /// Drop every pending request and cancel its timer. No reply is
    /// delivered; waiting futures observe [`InteractionError::Cancelled`].
    pub fn clear_all(&self) {
        let (permissions, questions) = {
            let mut registry = self.lock();
            (
                std::mem::take(&mut registry.permissions),
                std::mem::take(&mut registry.questions),
            )
        };
        let cleared = permissions.len() + questions.len();
        for pending in permissions.into_values() {
            pending.timer.abort();
        }
        for pending in questions.into_values() {
            pending.timer.abort();
        }
        if cleared > 0 {
            info!("Cleared {cleared} pending interactions");
        }
    }
}

impl Default for PermissionRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn new_request_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

// ─── Validation ───────────────────────────────────────────────────────────────

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("{key} must be a string")),
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Check an untrusted file permission payload from the agent.
pub fn validate_file_permission_request(data: &Value) -> ValidationResult {
    match parse_file_permission(data) {
        Ok(_) => ValidationResult::ok(),
        Err(error) => ValidationResult::invalid(error),
    }
}

/// Check an untrusted question payload from the agent.
pub fn validate_question_request(data: &Value) -> ValidationResult {
    match parse_question(data) {
        Ok(_) => ValidationResult::ok(),
        Err(error) => ValidationResult::invalid(error),
    }
}

struct FilePermissionFields {
    operation: FileOperation,
    file_path: Option<String>,
    file_paths: Option<Vec<String>>,
    target_path: Option<String>,
    content_preview: Option<String>,
}

fn parse_file_permission(data: &Value) -> Result<FilePermissionFields, String> {
    let obj = data.as_object().ok_or("Invalid request data")?;

    let operation = match obj.get("operation") {
        Some(Value::String(op)) if !op.is_empty() => op,
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err("operation and either filePath or filePaths are required".into())
        }
        Some(_) => return Err("operation must be a string".into()),
    };

    let file_path = optional_string(obj, "filePath")?.filter(|p| !p.is_empty());
    let file_paths = match obj.get("filePaths") {
        None | Some(Value::Null) => None,
        Some(value) => Some(string_list(value).ok_or("filePaths must be an array of strings")?),
    }
    .filter(|paths| !paths.is_empty());

    if file_path.is_none() && file_paths.is_none() {
        return Err("operation and either filePath or filePaths are required".into());
    }

    let operation: FileOperation = operation.parse().map_err(|_| {
        let valid: Vec<&str> = FileOperation::ALL.iter().map(|op| op.as_str()).collect();
        format!("Invalid operation. Must be one of: {}", valid.join(", "))
    })?;

    Ok(FilePermissionFields {
        operation,
        file_path,
        file_paths,
        target_path: optional_string(obj, "targetPath")?,
        content_preview: optional_string(obj, "contentPreview")?,
    })
}

struct QuestionFields {
    question: String,
    header: Option<String>,
    options: Vec<QuestionOption>,
    multi_select: bool,
}

fn parse_question(data: &Value) -> Result<QuestionFields, String> {
    let obj = data.as_object().ok_or("Invalid request data")?;

    let question = match obj.get("question") {
        Some(Value::String(q)) if !q.trim().is_empty() => q.clone(),
        Some(Value::String(_)) | None | Some(Value::Null) => return Err("question is required".into()),
        Some(_) => return Err("question must be a string".into()),
    };

    let options = match obj.get("options") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_option)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err("options must be an array".into()),
    };

    let multi_select = match obj.get("multiSelect") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err("multiSelect must be a boolean".into()),
    };

    Ok(QuestionFields {
        question,
        header: optional_string(obj, "header")?,
        options,
        multi_select,
    })
}

fn parse_option(value: &Value) -> Result<QuestionOption, String> {
    let obj = value.as_object().ok_or("each option must be an object")?;
    let label = match obj.get("label") {
        Some(Value::String(label)) => label.clone(),
        _ => return Err("each option requires a string label".into()),
    };
    let description = optional_string(obj, "description")
        .map_err(|_| "option description must be a string".to_string())?;
    Ok(QuestionOption { label, description })
}

// ─── Record builders ──────────────────────────────────────────────────────────

/// Build the UI-facing permission record. Returns `None` if `data` does not
/// pass [`validate_file_permission_request`].
pub fn build_file_permission_request(
    request_id: &str,
    task_id: &str,
    data: &Value,
) -> Option<PermissionRequest> {
    let fields = parse_file_permission(data).ok()?;
    Some(PermissionRequest {
        id: request_id.to_string(),
        task_id: task_id.to_string(),
        request_type: RequestType::File,
        file_operation: fields.operation,
        file_path: fields.file_path,
        file_paths: fields.file_paths,
        target_path: fields.target_path,
        content_preview: fields
            .content_preview
            .map(|preview| preview.chars().take(CONTENT_PREVIEW_CHARS).collect()),
        created_at: Utc::now().to_rfc3339(),
    })
}

/// Build the UI-facing question record. Returns `None` if `data` does not
/// pass [`validate_question_request`].
pub fn build_question_request(request_id: &str, task_id: &str, data: &Value) -> Option<QuestionRequest> {
    let fields = parse_question(data).ok()?;
    Some(QuestionRequest {
        id: request_id.to_string(),
        task_id: task_id.to_string(),
        request_type: RequestType::Question,
        question: fields.question,
        header: fields.header,
        options: fields.options,
        multi_select: fields.multi_select,
        created_at: Utc::now().to_rfc3339(),
    })
}
