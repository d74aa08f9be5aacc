use std::time::Duration;

use insight_config::Config;
use insight_contracts::CustomerRecord;
use insight_kernel::{accounts_since_query, CONTACTS_QUERY};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("{0}")]
    InvalidWatermark(String),
}

/// Access token and the instance base URL returned by the password grant.
#[derive(Debug, Clone, Deserialize)]
pub struct CrmSession {
    pub access_token: String,
    pub instance_url: String,
}

#[derive(Deserialize)]
struct QueryPage {
    #[serde(default)]
    records: Vec<CustomerRecord>,
    #[serde(default = "default_done")]
    done: bool,
}

fn default_done() -> bool {
    true
}

pub struct CrmClient {
    client: Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
    api_version: String,
}

impl CrmClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.crm.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            auth_url: cfg.crm_auth_url(),
            client_id: cfg.crm.client_id.clone(),
            client_secret: cfg.crm.client_secret.clone(),
            username: cfg.crm.username.clone(),
            password: cfg.crm.password.clone(),
            api_version: cfg.crm.api_version.clone(),
        })
    }

    pub async fn authenticate(&self) -> Result<CrmSession, CrmError> {
        let form = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let resp = self.client.post(&self.auth_url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Http { status, body });
        }
        Ok(resp.json().await?)
    }

    /// Every contact with id, name and email.
    pub async fn list_contacts(&self) -> Result<Vec<CustomerRecord>, CrmError> {
        self.query(CONTACTS_QUERY).await
    }

    /// Accounts modified strictly after `watermark` (RFC3339).
    pub async fn list_accounts_since(
        &self,
        watermark: &str,
    ) -> Result<Vec<CustomerRecord>, CrmError> {
        let soql = accounts_since_query(watermark).map_err(CrmError::InvalidWatermark)?;
        self.query(&soql).await
    }

    async fn query(&self, soql: &str) -> Result<Vec<CustomerRecord>, CrmError> {
        let session = self.authenticate().await?;
        let url = format!(
            "{}/services/data/{}/query",
            session.instance_url.trim_end_matches('/'),
            self.api_version
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&session.access_token)
            .query(&[("q", soql)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Http { status, body });
        }

        let page: QueryPage = resp.json().await?;
        if !page.done {
            // Only the first page is read.
            tracing::warn!(
                returned = page.records.len(),
                "crm query has further pages that were not fetched"
            );
        }
        Ok(page.records)
    }
}
