//! HTTP client for the template service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::TemplateConfig;

use super::{PushTemplate, TemplateError, TemplateSource};

pub struct HttpTemplateClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTemplateClient {
    pub fn new(config: &TemplateConfig) -> Result<Self, TemplateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TemplateError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.service_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateClient {
    async fn fetch_push_template(&self, code: &str) -> Result<PushTemplate, TemplateError> {
        let url = format!("{}/templates/push/{}", self.base_url, code);
        tracing::debug!(template_code = %code, url = %url, "Fetching push template");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TemplateError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                tracing::warn!(template_code = %code, "Template not found in template service");
                return Err(TemplateError::NotFound(code.to_string()));
            }
            status => {
                tracing::error!(
                    template_code = %code,
                    status_code = status.as_u16(),
                    "Template service returned error"
                );
                return Err(TemplateError::Unavailable(format!(
                    "template service returned status {}",
                    status.as_u16()
                )));
            }
        }

        response
            .json::<PushTemplate>()
            .await
            .map_err(|e| TemplateError::Invalid(e.to_string()))
    }
}
