#![forbid(unsafe_code)]

// Room enumeration — which rooms does the calling bridge want cleaned?

use crate::ids::RoomId;
use crate::rules::Caller;
use crate::synapse::ApiError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RoomListError {
    #[error("failed to get joined rooms: {0}")]
    Api(#[from] ApiError),
    #[error("failed to query rooms in router database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Connect to the router database when configured.
pub async fn connect_router_db(url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = url else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await?;
    info!("Connected to the router database");
    Ok(Some(pool))
}

/// List the rooms the caller owns: from the router database when available,
/// otherwise from the /joined_rooms API.
pub async fn owned_rooms(
    caller: &Caller,
    db: Option<&PgPool>,
) -> Result<Vec<RoomId>, RoomListError> {
    match db {
        Some(pool) => {
            let rows = sqlx::query_as::<_, (String,)>(
                "SELECT id FROM room WHERE owner = \
                 (SELECT id FROM appservice WHERE owner = $1 AND prefix = $2 AND deleted = false)",
            )
            .bind(&caller.bot.owner_localpart)
            .bind(&caller.bot.bridge_name)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(|(id,)| RoomId::new(id)).collect())
        }
        None => Ok(caller.client.joined_rooms().await?),
    }
}
