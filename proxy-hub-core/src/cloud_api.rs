use async_trait::async_trait;
use proxy_hub_error::{HubError, HubResult};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// The three cloud device-API calls the link flow depends on.
#[async_trait]
pub trait CloudDeviceApi: Send + Sync {
    /// Create a cloud device for the user and return its id.
    async fn create_device(
        &self,
        user_token: &str,
        uid: &str,
        dtid: &str,
        name: &str,
    ) -> HubResult<String>;

    /// Display name of an existing cloud device.
    async fn get_device_name(&self, user_token: &str, device_id: &str) -> HubResult<String>;

    /// Device token, minting one if none exists yet.
    async fn get_device_token(&self, user_token: &str, device_id: &str) -> HubResult<String>;
}

#[derive(Debug, Deserialize)]
struct DeviceEnvelope {
    data: DeviceData,
}

#[derive(Debug, Deserialize)]
struct DeviceData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    data: TokenData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    access_token: String,
}

/// REST client against the cloud device API.
pub struct RestCloudApi {
    base_url: String,
    client: reqwest::Client,
}

impl RestCloudApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> HubResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::CloudApi(format!(
                "device api returned {status}: {body}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| HubError::CloudApi(format!("malformed device api response: {e}")))
    }
}

#[async_trait]
impl CloudDeviceApi for RestCloudApi {
    async fn create_device(
        &self,
        user_token: &str,
        uid: &str,
        dtid: &str,
        name: &str,
    ) -> HubResult<String> {
        let response = self
            .client
            .post(format!("{}/devices", self.base_url))
            .bearer_auth(user_token)
            .json(&json!({ "uid": uid, "dtid": dtid, "name": name }))
            .send()
            .await
            .map_err(|e| HubError::CloudApi(format!("create device request failed: {e}")))?;
        let envelope: DeviceEnvelope = Self::read_json(response).await?;
        envelope
            .data
            .id
            .ok_or_else(|| HubError::CloudApi("create device response missing id".to_string()))
    }

    async fn get_device_name(&self, user_token: &str, device_id: &str) -> HubResult<String> {
        let response = self
            .client
            .get(format!("{}/devices/{device_id}", self.base_url))
            .bearer_auth(user_token)
            .send()
            .await
            .map_err(|e| HubError::CloudApi(format!("get device request failed: {e}")))?;
        let envelope: DeviceEnvelope = Self::read_json(response).await?;
        envelope
            .data
            .name
            .ok_or_else(|| HubError::CloudApi("device response missing name".to_string()))
    }

    async fn get_device_token(&self, user_token: &str, device_id: &str) -> HubResult<String> {
        let response = self
            .client
            .get(format!("{}/devices/{device_id}/tokens", self.base_url))
            .bearer_auth(user_token)
            .send()
            .await
            .map_err(|e| HubError::CloudApi(format!("get token request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(device = device_id, "no device token yet, minting one");
            let response = self
                .client
                .put(format!("{}/devices/{device_id}/tokens", self.base_url))
                .bearer_auth(user_token)
                .json(&json!({}))
                .send()
                .await
                .map_err(|e| HubError::CloudApi(format!("mint token request failed: {e}")))?;
            let envelope: TokenEnvelope = Self::read_json(response).await?;
            return Ok(envelope.data.access_token);
        }

        let envelope: TokenEnvelope = Self::read_json(response).await?;
        Ok(envelope.data.access_token)
    }
}
