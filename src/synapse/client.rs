#![forbid(unsafe_code)]

// Client-server API wrappers for the calling bridge bot and impersonated users.

use crate::ids::{RoomId, UserId};
use crate::synapse::{build_url, expect_json, expect_ok, parse_base, ApiError};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<RoomId>,
}

/// Content of the `m.room.power_levels` state event, reduced to the fields
/// the permission engine needs.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: HashMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
}

impl PowerLevels {
    pub fn user_level(&self, user: &UserId) -> i64 {
        self.users
            .get(user.as_str())
            .copied()
            .unwrap_or(self.users_default)
    }
}

/// Client acting with a caller-supplied access token (a bridge's appservice
/// token in practice).
#[derive(Clone)]
pub struct CallerClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl CallerClient {
    pub fn new(http: reqwest::Client, synapse_url: &str, token: String) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            base: parse_base(synapse_url)?,
            token,
        })
    }

    /// Resolve the token to the identity it authenticates.
    pub async fn whoami(&self) -> Result<UserId, ApiError> {
        let url = build_url(&self.base, &["_matrix", "client", "v3", "account", "whoami"]);
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        let whoami: WhoamiResponse = expect_json(resp).await?;
        Ok(whoami.user_id)
    }

    pub async fn joined_rooms(&self) -> Result<Vec<RoomId>, ApiError> {
        let url = build_url(&self.base, &["_matrix", "client", "v3", "joined_rooms"]);
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        let rooms: JoinedRoomsResponse = expect_json(resp).await?;
        Ok(rooms.joined_rooms)
    }

    /// Read the room's power-level state. When `as_user` is set, the request
    /// asserts that identity via the appservice `user_id` query parameter —
    /// the state read must come from a member actually present in the room.
    pub async fn power_levels(
        &self,
        room: &RoomId,
        as_user: Option<&UserId>,
    ) -> Result<PowerLevels, ApiError> {
        let mut url = build_url(
            &self.base,
            &[
                "_matrix",
                "client",
                "v3",
                "rooms",
                room.as_str(),
                "state",
                "m.room.power_levels",
            ],
        );
        if let Some(user) = as_user {
            url.query_pairs_mut().append_pair("user_id", user.as_str());
        }
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        expect_json(resp).await
    }
}

/// Client acting as a specific user through a session minted by the admin API.
#[derive(Clone)]
pub struct UserClient {
    http: reqwest::Client,
    base: Url,
    pub user_id: UserId,
    token: String,
}

impl UserClient {
    pub fn new(http: reqwest::Client, base: Url, user_id: UserId, token: String) -> Self {
        Self {
            http,
            base,
            user_id,
            token,
        }
    }

    pub async fn leave_room(&self, room: &RoomId) -> Result<(), ApiError> {
        let url = build_url(
            &self.base,
            &["_matrix", "client", "v3", "rooms", room.as_str(), "leave"],
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        expect_ok(resp).await
    }
}
