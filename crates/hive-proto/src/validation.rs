//! Admission validation.
//!
//! Validation runs once, before a record is created. Every check names the
//! field it rejects so callers can point at the offending input.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::agent::{AgentRegistration, MAX_REPUTATION};
use crate::job::{JobPayload, JobSubmission};
use crate::market::{BidSpec, OfferSpec};
use crate::resources::ResourceVector;

/// Maximum memory in MiB (1 TiB).
pub const MAX_MEMORY_MB: u64 = 1_048_576;

/// Maximum CPU cores.
pub const MAX_CPU_CORES: u32 = 1024;

/// Maximum GPU count.
pub const MAX_GPU_COUNT: u32 = 64;

/// Highest job priority.
pub const MAX_PRIORITY: u8 = 10;

/// Largest inline script, in bytes.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Longest runtime a job may ask for (7 days).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

static IMAGE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9][a-z0-9._-]*(?::[0-9]+)?(?:/[a-z0-9][a-z0-9._-]*)*(?::[A-Za-z0-9._-]+)?(?:@sha(?:256|512):[a-f0-9]{32,128})?$",
    )
    .unwrap_or_else(|_| unreachable!())
});

static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!()));

static SCRIPT_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").unwrap_or_else(|_| unreachable!())
});

/// Validation error with detailed information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Accumulates every problem found in one input.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Add an error with field and message.
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(field, message));
    }

    /// Record the outcome of a single check.
    pub fn check(&mut self, result: Result<(), ValidationError>) {
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    /// Check if validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Get all errors.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Convert to Result, returning the first error if there are any.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if validation failed.
    pub fn into_result(self) -> Result<(), ValidationError> {
        self.errors.into_iter().next().map_or(Ok(()), Err)
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }
}

/// Validate a container image reference such as `registry:5000/team/app:v1`.
///
/// # Errors
///
/// Returns an error if the reference is empty or malformed.
pub fn validate_image(field: &str, image: &str) -> Result<(), ValidationError> {
    if image.is_empty() {
        return Err(ValidationError::new(field, "image cannot be empty"));
    }
    if !IMAGE_REGEX.is_match(image) {
        return Err(ValidationError::new(
            field,
            format!("'{image}' is not a valid image reference"),
        ));
    }
    Ok(())
}

/// Validate an environment variable key.
///
/// # Errors
///
/// Returns an error if the key is not `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_env_key(field: &str, key: &str) -> Result<(), ValidationError> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(ValidationError::new(
            field,
            format!("environment variable key '{key}' is invalid"),
        ));
    }
    Ok(())
}

/// Validate a resource vector used as a requirement or an advertisement.
///
/// `prefix` is prepended to field names, e.g. `requirements.cpu_cores`.
#[must_use]
pub fn validate_resources(prefix: &str, resources: &ResourceVector) -> ValidationResult {
    let mut result = ValidationResult::new();

    if resources.cpu_cores == 0 {
        result.error(format!("{prefix}.cpu_cores"), "must be greater than 0");
    } else if resources.cpu_cores > MAX_CPU_CORES {
        result.error(
            format!("{prefix}.cpu_cores"),
            format!("cannot exceed {MAX_CPU_CORES}"),
        );
    }

    if resources.memory_mb == 0 {
        result.error(format!("{prefix}.memory_mb"), "must be greater than 0");
    } else if resources.memory_mb > MAX_MEMORY_MB {
        result.error(
            format!("{prefix}.memory_mb"),
            format!("cannot exceed {MAX_MEMORY_MB}"),
        );
    }

    if resources.gpu_count > MAX_GPU_COUNT {
        result.error(
            format!("{prefix}.gpu_count"),
            format!("cannot exceed {MAX_GPU_COUNT}"),
        );
    }

    if let Some(model) = &resources.gpu_model {
        if model.trim().is_empty() {
            result.error(format!("{prefix}.gpu_model"), "cannot be blank");
        } else if resources.gpu_count == 0 {
            result.error(
                format!("{prefix}.gpu_model"),
                "requires gpu_count greater than 0",
            );
        }
    }

    result
}

/// Validate a job payload.
#[must_use]
pub fn validate_payload(prefix: &str, payload: &JobPayload) -> ValidationResult {
    let mut result = ValidationResult::new();

    match payload {
        JobPayload::Docker { image, .. } => {
            result.check(validate_image(&format!("{prefix}.image"), image));
        }
        JobPayload::Script { name, source, .. } => {
            if !SCRIPT_NAME_REGEX.is_match(name) {
                result.error(format!("{prefix}.name"), "must be a plain file name");
            }
            if source.trim().is_empty() {
                result.error(format!("{prefix}.source"), "cannot be empty");
            } else if source.len() > MAX_SCRIPT_BYTES {
                result.error(
                    format!("{prefix}.source"),
                    format!("cannot exceed {MAX_SCRIPT_BYTES} bytes"),
                );
            }
        }
    }

    for key in payload.env().keys() {
        result.check(validate_env_key(&format!("{prefix}.env"), key));
    }

    result
}

/// Validate a direct job submission.
#[must_use]
pub fn validate_submission(submission: &JobSubmission, max_retries_cap: u32) -> ValidationResult {
    let mut result = ValidationResult::new();

    if submission.requester_id.is_blank() {
        result.error("requester_id", "cannot be blank");
    }
    result.merge(validate_resources("requirements", &submission.requirements));
    if submission.priority > MAX_PRIORITY {
        result.error("priority", format!("must be between 0 and {MAX_PRIORITY}"));
    }
    result.merge(validate_payload("payload", &submission.payload));

    match submission.timeout_secs {
        Some(0) => result.error("timeout_secs", "must be greater than 0"),
        Some(t) if t > MAX_TIMEOUT_SECS => {
            result.error("timeout_secs", format!("cannot exceed {MAX_TIMEOUT_SECS}"));
        }
        _ => {}
    }

    if submission.max_retries.is_some_and(|r| r > max_retries_cap) {
        result.error("max_retries", format!("cannot exceed {max_retries_cap}"));
    }

    result
}

/// Validate an agent registration.
#[must_use]
pub fn validate_registration(registration: &AgentRegistration) -> ValidationResult {
    let mut result = ValidationResult::new();
    if registration.owner_id.is_blank() {
        result.error("owner_id", "cannot be blank");
    }
    result.merge(validate_resources("capability", &registration.capability));
    if registration.reputation > MAX_REPUTATION {
        result.error("reputation", format!("cannot exceed {MAX_REPUTATION}"));
    }
    result
}

/// Validate an offer before it is published.
#[must_use]
pub fn validate_offer(spec: &OfferSpec, now: DateTime<Utc>) -> ValidationResult {
    let mut result = ValidationResult::new();

    if spec.provider_id.is_blank() {
        result.error("provider_id", "cannot be blank");
    }
    result.merge(validate_resources("resources", &spec.resources));
    if spec.rates.is_free() {
        result.error("rates", "at least one rate must be greater than 0");
    }
    if !spec.window.is_well_formed() {
        result.error("window", "start must be before end");
    } else if spec.window.end <= now {
        result.error("window", "ends in the past");
    }
    if spec.provider_reputation > MAX_REPUTATION {
        result.error(
            "provider_reputation",
            format!("cannot exceed {MAX_REPUTATION}"),
        );
    }
    if spec.expires_at.is_some_and(|t| t <= now) {
        result.error("expires_at", "must be in the future");
    }

    result
}

/// Validate a bid before it is placed.
#[must_use]
pub fn validate_bid(spec: &BidSpec, now: DateTime<Utc>) -> ValidationResult {
    let mut result = ValidationResult::new();

    if spec.consumer_id.is_blank() {
        result.error("consumer_id", "cannot be blank");
    }
    result.merge(validate_resources("resources", &spec.resources));
    if spec.max_price_per_hour.is_zero() {
        result.error("max_price_per_hour", "must be greater than 0");
    }
    if spec.duration_secs == 0 {
        result.error("duration_secs", "must be greater than 0");
    } else if spec.duration_secs > MAX_TIMEOUT_SECS {
        result.error(
            "duration_secs",
            format!("cannot exceed {MAX_TIMEOUT_SECS}"),
        );
    }
    if spec.flexibility_secs > MAX_TIMEOUT_SECS {
        result.error(
            "flexibility_secs",
            format!("cannot exceed {MAX_TIMEOUT_SECS}"),
        );
    }
    if spec.priority > MAX_PRIORITY {
        result.error("priority", format!("must be between 0 and {MAX_PRIORITY}"));
    }
    result.merge(validate_payload("payload", &spec.payload));
    if spec.expires_at.is_some_and(|t| t <= now) {
        result.error("expires_at", "must be in the future");
    }

    result
}
