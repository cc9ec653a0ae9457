use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job id is empty")]
    EmptyJobId,
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
    #[error("username is empty")]
    EmptyUsername,
    #[error("invalid username: {0}")]
    InvalidUsername(String),
    #[error("node name is empty")]
    EmptyNodeName,
    #[error("invalid node name: {0}")]
    InvalidNodeName(String),
}

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9]+(_([0-9]+|\[[0-9,:%-]+\]))?$").expect("valid regex")
    })
}

fn node_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid regex"))
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid regex"))
}

/// Accepts `12345`, array elements like `12345_7` and the pending array
/// rows squeue prints, like `12345_[0-99%5]`; returns the trimmed id.
pub fn validate_job_id(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyJobId);
    }
    if !job_id_pattern().is_match(trimmed) {
        return Err(ValidationError::InvalidJobId(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn validate_username(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    if !username_pattern().is_match(trimmed) {
        return Err(ValidationError::InvalidUsername(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// A single node name such as `gpu-01` or `cn12.cluster`; host lists are
/// rejected.
pub fn validate_node_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyNodeName);
    }
    if !node_name_pattern().is_match(trimmed) {
        return Err(ValidationError::InvalidNodeName(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Job id with any array suffix removed, `12345_[0-9]` becomes `12345`.
pub fn base_job_id(job_id: &str) -> &str {
    job_id.split_once('_').map_or(job_id, |(base, _)| base)
}
