//! Push templates.
//!
//! Templates live in the remote template service; this module fetches them
//! ([`TemplateSource`]) and renders them locally against a job's variables.
//!
//! # Example
//!
//! ```ignore
//! let template = source.fetch_push_template("order-shipped").await?;
//! // title: "Order {{order_id}} shipped", variables: {"order_id": "ORD-123"}
//! let content = render(&template, &job);
//! assert_eq!(content.title, "Order ORD-123 shipped");
//! ```

mod client;
mod substitution;

pub use client::HttpTemplateClient;
pub use substitution::{substitute_data, substitute_string, substitute_value};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notification::{DataMap, NotificationJob, PushContent};

/// Template-specific error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid template: {0}")]
    Invalid(String),
}

/// A push template as served by the template service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTemplate {
    pub code: String,
    #[serde(default)]
    pub name: String,
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
}

#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_push_template(&self, code: &str) -> Result<PushTemplate, TemplateError>;
}

/// Render `template` for `job`.
///
/// Title, body and template data are substituted with the job's variables.
/// Template image and link replace the job's when present. Job data is
/// merged over the template data, so job keys win.
pub fn render(template: &PushTemplate, job: &NotificationJob) -> PushContent {
    let mut content = PushContent::from_job(job);

    content.title = substitute_string(&template.title, &job.variables);
    content.body = substitute_string(&template.body, &job.variables);

    if let Some(image) = template.image_url.as_ref().filter(|u| !u.is_empty()) {
        content.image_url = Some(substitute_string(image, &job.variables));
    }
    if let Some(link) = template.link.as_ref().filter(|l| !l.is_empty()) {
        content.link = Some(substitute_string(link, &job.variables));
    }

    let mut data = substitute_data(&template.data, &job.variables);
    for (key, value) in &job.data {
        data.insert(key.clone(), value.clone());
    }
    content.data = data;

    content
}
