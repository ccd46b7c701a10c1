//! Backend that delegates to an external provisioner over HTTP.
//!
//! - `POST {base}/v1/resources` creates a machine and returns its details
//! - `DELETE {base}/v1/resources/{id}` removes it; `404` counts as success

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};
use vmlease_id::{ResourceId, UserId};

use super::{BackendError, ProvisioningBackend, ResourceDetails};

/// Cloud creates routinely take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct CreateResourceRequest<'a> {
    resource_id: ResourceId,
    user_id: &'a UserId,
    tags: BTreeMap<&'static str, &'a str>,
}

/// HTTP provisioner client.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn rejected(response: reqwest::Response) -> BackendError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        BackendError::Rejected { status, body }
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Other(e.to_string())
    }
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn create(
        &self,
        resource_id: ResourceId,
        user_id: &UserId,
    ) -> Result<ResourceDetails, BackendError> {
        let url = format!("{}/v1/resources", self.base_url);
        debug!(url = %url, resource_id = %resource_id, "Requesting resource creation");

        let request = CreateResourceRequest {
            resource_id,
            user_id,
            tags: BTreeMap::from([("user_id", user_id.as_str())]),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let err = Self::rejected(response).await;
            warn!(resource_id = %resource_id, error = %err, "Provisioner rejected create");
            return Err(err);
        }

        response
            .json::<ResourceDetails>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn delete(&self, resource_id: ResourceId) -> Result<(), BackendError> {
        let url = format!("{}/v1/resources/{}", self.base_url, resource_id);
        debug!(url = %url, "Requesting resource deletion");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(resource_id = %resource_id, "Resource already gone");
                Ok(())
            }
            _ => Err(Self::rejected(response).await),
        }
    }
}
