#![forbid(unsafe_code)]

// Synapse admin API client — the privileged side of the service.
// https://matrix-org.github.io/synapse/latest/admin_api/rooms.html

use crate::ids::{RoomAlias, RoomId, UserId};
use crate::synapse::{build_url, expect_json, expect_ok, parse_base, ApiError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct DeleteRoomRequest {
    purge: bool,
}

/// Response of the delete-room admin API.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DeleteRoomResponse {
    #[serde(default)]
    pub kicked_users: Vec<UserId>,
    #[serde(default)]
    pub failed_to_kick_users: Vec<UserId>,
    #[serde(default)]
    pub local_aliases: Vec<RoomAlias>,
    #[serde(default)]
    pub new_room_id: Option<RoomId>,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    members: Vec<UserId>,
    #[serde(default)]
    #[allow(dead_code)]
    total: u64,
}

#[derive(Debug, Serialize)]
struct LoginAsUserRequest {
    valid_until_ms: i64,
}

#[derive(Debug, Deserialize)]
struct LoginAsUserResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AliasesResponse {
    aliases: Vec<RoomAlias>,
}

#[derive(Debug, Deserialize)]
struct PasswordLoginResponse {
    access_token: String,
    user_id: UserId,
}

/// Client for the Synapse admin API, holding a server-admin access token.
///
/// No request timeouts are configured: admin operations on large rooms can
/// legitimately take a long time, and shutdown cancellation bounds them.
pub struct AdminClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    dry_run: bool,
}

impl AdminClient {
    pub fn new(
        http: reqwest::Client,
        synapse_url: &str,
        token: String,
        dry_run: bool,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            base: parse_base(synapse_url)?,
            token,
            dry_run,
        })
    }

    /// Obtain an admin token with username+password when none is configured.
    pub async fn login_with_password(
        http: reqwest::Client,
        synapse_url: &str,
        username: &str,
        password: &str,
        dry_run: bool,
    ) -> Result<Self, ApiError> {
        let base = parse_base(synapse_url)?;
        let url = build_url(&base, &["_matrix", "client", "v3", "login"]);
        let body = serde_json::json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password,
            "device_id": "sweepserv",
            "initial_device_display_name": "sweepserv",
        });
        let resp = http.post(url).json(&body).send().await?;
        let login: PasswordLoginResponse = expect_json(resp).await?;
        info!(
            "Obtained an admin access token (for {}) using provided credentials",
            login.user_id
        );
        Ok(Self {
            http,
            base,
            token: login.access_token,
            dry_run,
        })
    }

    /// Delete (and optionally purge) a room from the server.
    pub async fn delete_room(
        &self,
        room: &RoomId,
        purge: bool,
    ) -> Result<DeleteRoomResponse, ApiError> {
        if self.dry_run {
            debug!("Not requesting deletion of {} (dry run)", room);
            tokio::time::sleep(Duration::from_millis(500)).await;
            return Ok(DeleteRoomResponse::default());
        }
        let url = build_url(&self.base, &["_synapse", "admin", "v1", "rooms", room.as_str()]);
        let resp = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .json(&DeleteRoomRequest { purge })
            .send()
            .await?;
        expect_json(resp).await
    }

    /// List every member of a room, regardless of our own membership.
    pub async fn list_members(&self, room: &RoomId) -> Result<Vec<UserId>, ApiError> {
        let url = build_url(
            &self.base,
            &["_synapse", "admin", "v1", "rooms", room.as_str(), "members"],
        );
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        let members: MembersResponse = expect_json(resp).await?;
        Ok(members.members)
    }

    /// Mint an access token for an arbitrary user, valid until the given
    /// wall-clock time (milliseconds since epoch).
    pub async fn login_as_user(
        &self,
        user: &UserId,
        valid_until_ms: i64,
    ) -> Result<String, ApiError> {
        let url = build_url(
            &self.base,
            &["_synapse", "admin", "v1", "users", user.as_str(), "login"],
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&LoginAsUserRequest { valid_until_ms })
            .send()
            .await?;
        let login: LoginAsUserResponse = expect_json(resp).await?;
        Ok(login.access_token)
    }

    /// List the local aliases of a room.
    pub async fn room_aliases(&self, room: &RoomId) -> Result<Vec<RoomAlias>, ApiError> {
        let url = build_url(
            &self.base,
            &["_matrix", "client", "v3", "rooms", room.as_str(), "aliases"],
        );
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        let aliases: AliasesResponse = expect_json(resp).await?;
        Ok(aliases.aliases)
    }

    /// Remove a room alias from the directory.
    pub async fn delete_alias(&self, alias: &RoomAlias) -> Result<(), ApiError> {
        if self.dry_run {
            debug!("Not removing alias {} (dry run)", alias);
            return Ok(());
        }
        let url = build_url(
            &self.base,
            &["_matrix", "client", "v3", "directory", "room", alias.as_str()],
        );
        let resp = self.http.delete(url).bearer_auth(&self.token).send().await?;
        expect_ok(resp).await
    }
}
