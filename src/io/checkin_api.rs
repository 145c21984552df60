//! Check-in validation and undo operations
//!
//! The backend re-validates the geofence and enforces its own cooldown, so
//! the client only reports what it saw. `CheckinApi` is the seam the engine
//! depends on; `HttpCheckinApi` calls the hosted edge functions.

use crate::infra::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Response code the server uses for an active per-venue cooldown
pub const COOLDOWN_ACTIVE: &str = "COOLDOWN_ACTIVE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRequest {
    pub venue_id: String,
    pub venue_name: String,
    pub venue_lat: f64,
    pub venue_lng: f64,
    pub user_lat: f64,
    pub user_lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_accuracy: Option<f64>,
    pub is_automatic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server-measured distance, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRequest {
    pub checkin_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UndoResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Backend operations the engine calls
#[async_trait]
pub trait CheckinApi: Send + Sync {
    async fn validate_checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError>;

    async fn undo_checkin(&self, request: &UndoRequest) -> Result<UndoResponse, ApiError>;
}

/// Edge-function client over HTTPS
pub struct HttpCheckinApi {
    client: reqwest::Client,
    validate_url: String,
    undo_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl HttpCheckinApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.api_timeout_ms()))
            .build()?;

        Ok(Self {
            client,
            validate_url: config.api_validate_url(),
            undo_url: config.api_undo_url(),
            api_key: config.api_key().map(str::to_string),
            access_token: config.access_token().map(str::to_string),
        })
    }

    /// POST a JSON body and decode the JSON reply.
    ///
    /// Functions answer rejections (cooldown, out of range) with a non-2xx
    /// status and a regular body, so the body is decoded before the status
    /// is considered.
    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let request_id = Uuid::now_v7().to_string();
        let mut request = self.client.post(url).header("x-request-id", &request_id).json(body);

        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!(url = %url, request_id = %request_id, status = %status.as_u16(), "checkin_api_response");

        match serde_json::from_str::<R>(&text) {
            Ok(decoded) => Ok(decoded),
            Err(_) if !status.is_success() => {
                Err(ApiError::Status { status: status.as_u16(), body: truncate(&text, 256) })
            }
            Err(e) => Err(ApiError::Decode(e)),
        }
    }
}

#[async_trait]
impl CheckinApi for HttpCheckinApi {
    async fn validate_checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError> {
        self.post_json(&self.validate_url, request).await
    }

    async fn undo_checkin(&self, request: &UndoRequest) -> Result<UndoResponse, ApiError> {
        self.post_json(&self.undo_url, request).await
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = CheckinRequest {
            venue_id: "v1".to_string(),
            venue_name: "Cafe".to_string(),
            venue_lat: 1.0,
            venue_lng: 2.0,
            user_lat: 1.00001,
            user_lng: 2.00001,
            location_accuracy: None,
            is_automatic: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["venueId"], "v1");
        assert_eq!(json["userLng"], 2.00001);
        assert_eq!(json["isAutomatic"], true);
        assert!(json.get("locationAccuracy").is_none());
    }

    #[test]
    fn test_cooldown_response_decodes() {
        let body = r#"{"success":false,"code":"COOLDOWN_ACTIVE","error":"Already checked in"}"#;
        let response: CheckinResponse = serde_json::from_str(body).unwrap();
        assert!(!response.success);
        assert_eq!(response.code.as_deref(), Some(COOLDOWN_ACTIVE));
        assert!(response.checkin_id.is_none());
    }

    #[test]
    fn test_success_response_decodes() {
        let body = r#"{"success":true,"checkinId":"c-123","distance":4.2}"#;
        let response: CheckinResponse = serde_json::from_str(body).unwrap();
        assert!(response.success);
        assert_eq!(response.checkin_id.as_deref(), Some("c-123"));
    }

    #[test]
    fn test_undo_request_wire_format() {
        let json = serde_json::to_string(&UndoRequest { checkin_id: "c-1".to_string() }).unwrap();
        assert_eq!(json, r#"{"checkinId":"c-1"}"#);
    }

    #[test]
    fn test_client_builds_from_default_config() {
        assert!(HttpCheckinApi::new(&Config::default()).is_ok());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
