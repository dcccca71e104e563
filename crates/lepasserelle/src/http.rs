// HTTP Fetcher
//
// Blocking HTTP transport behind the workflow's `Fetcher` seam

use anyhow::{Context, Result};
use lephase::{FetchError, Fetcher};
use lestockage::{DataKind, WorkItemId};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::config::SourceConfig;

/// Fetches one work item per GET against a URL template.
///
/// Placeholders `{kind}`, `{facility}`, `{date}` (`YYYY-MM-DD`) and
/// `{sequence}` are substituted per item. The response body is returned
/// verbatim as the item's payload.
pub struct HttpFetcher {
    client: Client,
    url_template: String,
}

impl HttpFetcher {
    /// Build a fetcher from `[source]` settings.
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let timeout = Duration::from_secs(source.request_timeout_secs.max(1));
        let client = Client::builder()
            .user_agent(source.user_agent.clone())
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url_template: source.url_template.clone(),
        })
    }

    /// URL of `id` for `kind`.
    pub fn url_for(&self, kind: DataKind, id: &WorkItemId) -> String {
        render_url(&self.url_template, kind, id)
    }
}

/// Substitute a work item into `template`.
pub fn render_url(template: &str, kind: DataKind, id: &WorkItemId) -> String {
    template
        .replace("{kind}", kind.as_str())
        .replace("{facility}", &id.facility)
        .replace("{date}", &id.date.format("%Y-%m-%d").to_string())
        .replace("{sequence}", &id.sequence.to_string())
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_connect() {
        FetchError::Unreachable(err.to_string())
    } else {
        FetchError::Failed(err.to_string())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, kind: DataKind, id: &WorkItemId) -> std::result::Result<String, FetchError> {
        let url = self.url_for(kind, id);
        debug!(%kind, item = %id, %url, "fetching");

        let response = self.client.get(&url).send().map_err(classify)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status if status.is_success() => response.text().map_err(classify),
            status => Err(FetchError::Failed(format!("HTTP {} from {}", status.as_u16(), url))),
        }
    }
}
