#![forbid(unsafe_code)]

// Forget API of the external room router. Best-effort: failures are logged
// by the callers, never retried.

use crate::config::Config;
use crate::ids::RoomId;
use crate::synapse::{build_url, expect_ok, parse_base, ApiError};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

pub struct RouterClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    dry_run: bool,
}

impl RouterClient {
    /// Build a client when both the router URL and token are configured.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Option<Self>, ApiError> {
        let (Some(url), Some(token)) = (&config.router_url, &config.router_access_token) else {
            return Ok(None);
        };
        Ok(Some(Self {
            http,
            base: parse_base(url)?,
            token: token.clone(),
            dry_run: config.dry_run,
        }))
    }

    /// Tell the router to forget its routing entry for the room.
    pub async fn forget_room(&self, room: &RoomId) -> Result<(), ApiError> {
        if self.dry_run {
            debug!("Not asking the router to forget {} (dry run)", room);
            tokio::time::sleep(Duration::from_millis(200)).await;
            return Ok(());
        }
        let url = build_url(&self.base, &["_matrix", "asmux", "room", room.as_str()]);
        let resp = self.http.delete(url).bearer_auth(&self.token).send().await?;
        expect_ok(resp).await
    }
}
