//! Managed-room provisioning for the room-based transport.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

const ROOM_LIFETIME_MINUTES: i64 = 60;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("room provider returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Room {
    pub url: String,
    pub name: String,
}

/// Creates meeting rooms and the tokens used to join them.
#[async_trait]
pub trait RoomProvisioner: Send + Sync {
    async fn create_room(&self) -> Result<Room, RoomError>;
    async fn issue_token(&self, room: &Room) -> Result<String, RoomError>;
}

/// `RoomProvisioner` backed by the Daily REST API.
pub struct DailyRoomProvisioner {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

impl DailyRoomProvisioner {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, RoomError> {
        let response = self
            .client
            .post(format!("{}/{}", self.api_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RoomError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

fn expiry() -> i64 {
    (Utc::now() + Duration::minutes(ROOM_LIFETIME_MINUTES)).timestamp()
}

#[async_trait]
impl RoomProvisioner for DailyRoomProvisioner {
    async fn create_room(&self) -> Result<Room, RoomError> {
        let room: Room = self
            .post(
                "rooms",
                json!({ "properties": { "exp": expiry(), "eject_at_room_exp": true } }),
            )
            .await?;
        info!(room = %room.name, "room created");
        Ok(room)
    }

    async fn issue_token(&self, room: &Room) -> Result<String, RoomError> {
        let response: TokenResponse = self
            .post(
                "meeting-tokens",
                json!({ "properties": { "room_name": room.name, "is_owner": true, "exp": expiry() } }),
            )
            .await?;
        debug!(room = %room.name, "meeting token issued");
        Ok(response.token)
    }
}
