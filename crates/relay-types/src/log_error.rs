use serde::{Deserialize, Serialize};

/// Classification of an error line found in the agent's own log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogErrorKind {
    #[serde(rename = "OAuthExpiredError")]
    OAuthExpired,
    #[serde(rename = "AuthenticationError")]
    Authentication,
    #[serde(rename = "ThrottlingError")]
    Throttling,
    #[serde(rename = "APICallError")]
    ApiCall,
    #[serde(rename = "ModelNotFoundError")]
    ModelNotFound,
    #[serde(rename = "ValidationError")]
    Validation,
}

impl LogErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OAuthExpired => "OAuthExpiredError",
            Self::Authentication => "AuthenticationError",
            Self::Throttling => "ThrottlingError",
            Self::ApiCall => "APICallError",
            Self::ModelNotFound => "ModelNotFoundError",
            Self::Validation => "ValidationError",
        }
    }
}

impl std::fmt::Display for LogErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error extracted from one log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedError {
    pub timestamp: String,
    pub service: String,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "errorName")]
    pub kind: LogErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub raw: String,
    #[serde(default)]
    pub is_auth_error: bool,
}

impl DetectedError {
    /// Key used to report a given error condition once per watch session.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.status_code.map(|c| c.to_string()).unwrap_or_default(),
            self.session_id.as_deref().unwrap_or_default()
        )
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        let provider = self.provider_id.as_deref().unwrap_or("your provider");
        match self.kind {
            LogErrorKind::OAuthExpired => {
                format!("Your {provider} session has expired. Please re-authenticate.")
            }
            LogErrorKind::Authentication => format!(
                "Authentication with {provider} failed. Please check your credentials and re-authenticate."
            ),
            LogErrorKind::Throttling => format!(
                "Rate limit exceeded: {}",
                self.message
                    .as_deref()
                    .unwrap_or("Please wait a moment before trying again.")
            ),
            LogErrorKind::ModelNotFound => format!(
                "Model not available: {}. Please select a different model.",
                self.model_id.as_deref().unwrap_or("unknown")
            ),
            LogErrorKind::Validation => format!(
                "Request validation error: {}",
                self.message.as_deref().unwrap_or("the request was rejected")
            ),
            LogErrorKind::ApiCall => {
                let detail = self.message.as_deref().unwrap_or("unknown error");
                match self.status_code {
                    Some(401) => format!("Authentication failed: {detail}. Please re-authenticate."),
                    Some(403) => format!("Access denied: {detail}"),
                    Some(404) => format!("Not found: {detail}. Please check the selected model."),
                    Some(429) => {
                        format!("Rate limit exceeded: {detail}. Please wait before trying again.")
                    }
                    Some(code) if code >= 500 => {
                        format!("The {provider} service is having problems ({code}): {detail}")
                    }
                    Some(code) => format!("API error ({code}): {detail}"),
                    None => format!("API error: {detail}"),
                }
            }
        }
    }
}
