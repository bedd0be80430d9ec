use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Free-form JSON object carried through to the device
pub type DataMap = serde_json::Map<String, serde_json::Value>;

/// Priority class for a push notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority, should be delivered promptly
    High,
}

/// Structural problems that make a job undeliverable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid notification ID")]
    MissingId,

    #[error("invalid user ID")]
    MissingUserId,

    #[error("no device tokens provided")]
    NoDeviceTokens,

    #[error("notification content cannot be empty")]
    EmptyContent,
}

/// One push request as it arrives on the primary queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    /// Caller-assigned unique identifier
    pub id: String,
    pub user_id: String,
    pub device_tokens: Vec<String>,
    /// "ios", "android" or "web"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_code: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub data: DataMap,
    /// Values substituted into `{{name}}` placeholders
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub variables: DataMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Send attempts already spent on this job
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NotificationJob {
    /// Minimal job addressed to `device_tokens`; mostly useful to producers and tests.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        device_tokens: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            device_tokens,
            platform: None,
            template_code: None,
            title: String::new(),
            body: String::new(),
            image_url: None,
            link: None,
            data: DataMap::new(),
            variables: DataMap::new(),
            language: None,
            priority: Priority::Normal,
            attempt_count: 0,
            correlation_id: None,
            request_id: None,
            scheduled_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_content(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.title = title.into();
        self.body = body.into();
        self
    }

    pub fn with_template(mut self, code: impl Into<String>, variables: DataMap) -> Self {
        self.template_code = Some(code.into());
        self.variables = variables;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Template code, ignoring an empty string
    pub fn template(&self) -> Option<&str> {
        self.template_code.as_deref().filter(|c| !c.is_empty())
    }

    /// Trimmed device tokens with blank entries removed, in original order
    pub fn valid_tokens(&self) -> Vec<String> {
        self.device_tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUserId);
        }
        if self.device_tokens.iter().all(|t| t.trim().is_empty()) {
            return Err(ValidationError::NoDeviceTokens);
        }
        if self.title.is_empty() && self.body.is_empty() && self.template().is_none() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }
}

/// Rendered, provider-agnostic content handed to the push gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushContent {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub data: DataMap,
    #[serde(default)]
    pub priority: Priority,
}

impl PushContent {
    /// Content taken verbatim from the job
    pub fn from_job(job: &NotificationJob) -> Self {
        Self {
            title: job.title.clone(),
            body: job.body.clone(),
            image_url: job.image_url.clone().filter(|u| !u.is_empty()),
            link: job.link.clone().filter(|l| !l.is_empty()),
            data: job.data.clone(),
            priority: job.priority,
        }
    }
}

/// Result of sending to one device token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub device_token: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider-assigned message id on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(device_token: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            device_token: device_token.into(),
            success: true,
            error: None,
            message_id: Some(message_id.into()),
            sent_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn failed(device_token: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            device_token: device_token.into(),
            success: false,
            error: Some(error.into()),
            message_id: None,
            sent_at: Utc::now(),
            correlation_id: None,
        }
    }
}

/// Final status of a job as reported downstream.
///
/// Status consumers only know `delivered`, `pending` and `failed`, so a
/// partial delivery goes on the wire as `delivered`; the report's message
/// and counts carry the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Delivered,
    #[serde(rename = "delivered", skip_deserializing)]
    PartiallyDelivered,
    Pending,
    Failed,
}

impl NotificationStatus {
    /// Status for a set of per-device counts
    pub fn from_counts(sent: usize, failed: usize) -> Self {
        match (sent, failed) {
            (0, _) => NotificationStatus::Failed,
            (_, 0) => NotificationStatus::Delivered,
            _ => NotificationStatus::PartiallyDelivered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::PartiallyDelivered => "partially_delivered",
            NotificationStatus::Pending => "pending",
            NotificationStatus::Failed => "failed",
        }
    }
}

/// Published to the status queue once per terminal, non-duplicate job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub notification_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub user_id: String,
    pub status: NotificationStatus,
    pub message: String,
    pub sent_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub results: Vec<DeliveryOutcome>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Published to the dead-letter queue when a job cannot be completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_message: NotificationJob,
    pub reason: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub last_error: String,
}
