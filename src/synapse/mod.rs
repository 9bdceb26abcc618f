#![forbid(unsafe_code)]

// Synapse bindings - thin reqwest wrappers over the client-server and admin APIs

pub mod admin;
pub mod client;

pub use admin::{AdminClient, DeleteRoomResponse};
pub use client::{CallerClient, PowerLevels, UserClient};

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Errors talking to the homeserver.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid homeserver URL: {0}")]
    BadUrl(String),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{errcode}: {message} (HTTP {status})")]
    Matrix {
        status: u16,
        errcode: String,
        message: String,
    },
    /// The surrounding operation was cancelled before the request finished.
    #[error("operation cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn is_unknown_token(&self) -> bool {
        matches!(self, Self::Matrix { errcode, .. } if errcode == "M_UNKNOWN_TOKEN")
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    errcode: Option<String>,
    error: Option<String>,
}

pub(crate) fn parse_base(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw).map_err(|e| ApiError::BadUrl(format!("{raw}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(ApiError::BadUrl(raw.to_string()));
    }
    Ok(url)
}

/// Append percent-encoded path segments to a validated base URL.
pub(crate) fn build_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .expect("base URL validated at construction");
        path.pop_if_empty();
        path.extend(segments);
    }
    url
}

/// Decode a JSON response, converting Matrix error bodies into `ApiError::Matrix`.
pub(crate) async fn expect_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: MatrixErrorBody = resp.json().await.unwrap_or_default();
    Err(ApiError::Matrix {
        status: status.as_u16(),
        errcode: body.errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
        message: body.error.unwrap_or_else(|| "unknown error".to_string()),
    })
}

/// Like `expect_json` for endpoints whose success body we discard.
pub(crate) async fn expect_ok(resp: reqwest::Response) -> Result<(), ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body: MatrixErrorBody = resp.json().await.unwrap_or_default();
    Err(ApiError::Matrix {
        status: status.as_u16(),
        errcode: body.errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
        message: body.error.unwrap_or_else(|| "unknown error".to_string()),
    })
}
