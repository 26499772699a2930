//! Classification of error lines from the agent's log files.
//!
//! Lines look roughly like
//!
//! ```text
//! ERROR 2025-06-01T10:00:00 +12ms service=session.processor providerID=openai modelID=gpt-5 sessionID=ses_1 error={...}
//! ```
//!
//! The `key=value` tokens give the context; an ordered rule table decides
//! what kind of error it is. The first rule that matches wins.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use relay_types::log_error::{DetectedError, LogErrorKind};

/// Only lines carrying this marker are considered.
pub const ERROR_MARKER: &str = "ERROR";

struct Classification {
    kind: LogErrorKind,
    status_code: Option<u16>,
    message: Option<String>,
    is_auth_error: bool,
}

struct ErrorRule {
    pattern: Regex,
    classify: fn(&Captures<'_>, &str) -> Classification,
}

fn rule(pattern: &str, classify: fn(&Captures<'_>, &str) -> Classification) -> ErrorRule {
    ErrorRule {
        // Patterns are fixed at compile time and covered by tests.
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid log rule {pattern}: {e}")),
        classify,
    }
}

fn rules() -> &'static [ErrorRule] {
    static RULES: OnceLock<Vec<ErrorRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            rule(
                r#"(?i)openai.*(?:invalid_api_key|invalid_token|incorrect api key|token[^"]*expired|oauth[^"]*(?:invalid|expired)|"status(?:code)?":\s*401)"#,
                |_, _| Classification {
                    kind: LogErrorKind::OAuthExpired,
                    status_code: Some(401),
                    message: Some("OpenAI credentials are invalid or have expired".into()),
                    is_auth_error: true,
                },
            ),
            rule(
                r"(?i)authentication failed|invalid[_ ]api[_ ]key|(?:access|refresh)[_ ]token[^ ]* (?:has )?expired",
                |_, line| Classification {
                    kind: LogErrorKind::Authentication,
                    status_code: Some(401),
                    message: json_message(line),
                    is_auth_error: true,
                },
            ),
            rule(r#"ThrottlingException.*?"message":"([^"]+)""#, |caps, _| Classification {
                kind: LogErrorKind::Throttling,
                status_code: Some(429),
                message: Some(caps[1].to_string()),
                is_auth_error: false,
            }),
            rule(
                r#"AI_APICallError.*?"statusCode":(\d+).*?"message":"([^"]+)""#,
                |caps, _| {
                    let status_code = caps[1].parse().ok();
                    Classification {
                        kind: LogErrorKind::ApiCall,
                        status_code,
                        message: Some(caps[2].to_string()),
                        is_auth_error: matches!(status_code, Some(401 | 403)),
                    }
                },
            ),
            rule(
                r"AccessDeniedException|UnauthorizedException|InvalidSignatureException|ExpiredTokenException|UnrecognizedClientException",
                |caps, line| Classification {
                    kind: LogErrorKind::Authentication,
                    status_code: Some(403),
                    message: json_message(line).or_else(|| Some(caps[0].to_string())),
                    is_auth_error: true,
                },
            ),
            rule(r#"ValidationException.*?"message":"([^"]+)""#, |caps, _| Classification {
                kind: LogErrorKind::Validation,
                status_code: Some(400),
                message: Some(caps[1].to_string()),
                is_auth_error: false,
            }),
            rule(r"(?i)ModelNotFoundError|\bmodel\b[^=\n]{0,80}?\bnot[ _]found", |_, line| Classification {
                kind: LogErrorKind::ModelNotFound,
                status_code: Some(404),
                message: json_message(line),
                is_auth_error: false,
            }),
        ]
    })
}

fn json_message(line: &str) -> Option<String> {
    static MESSAGE: OnceLock<Regex> = OnceLock::new();
    MESSAGE
        .get_or_init(|| Regex::new(r#""message":"([^"]+)""#).unwrap_or_else(|e| panic!("{e}")))
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// Value of the first `key=value` token in the line.
fn token<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix(key)?.strip_prefix('='))
        .filter(|value| !value.is_empty())
}

/// The leading timestamp token, skipping a leading level word.
fn timestamp(line: &str) -> String {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some(level) if level.chars().all(|c| c.is_ascii_uppercase()) => {
            tokens.next().unwrap_or_default().to_string()
        }
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

pub fn is_error_line(line: &str) -> bool {
    line.contains(ERROR_MARKER)
}

/// Classify one log line. Returns `None` for lines without the error marker
/// or that no rule recognises.
pub fn parse_line(line: &str) -> Option<DetectedError> {
    if !is_error_line(line) {
        return None;
    }

    rules().iter().find_map(|rule| {
        let caps = rule.pattern.captures(line)?;
        let class = (rule.classify)(&caps, line);
        Some(DetectedError {
            timestamp: timestamp(line),
            service: token(line, "service").unwrap_or("unknown").to_string(),
            provider_id: token(line, "providerID").map(str::to_string),
            model_id: token(line, "modelID").map(str::to_string),
            session_id: token(line, "sessionID").map(str::to_string),
            kind: class.kind,
            status_code: class.status_code,
            message: class.message,
            raw: line.to_string(),
            is_auth_error: class.is_auth_error,
        })
    })
}
