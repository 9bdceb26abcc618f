#![forbid(unsafe_code)]

// Impersonation session cache — short-lived user tokens minted via the admin API.

use crate::ids::UserId;
use crate::synapse::{AdminClient, ApiError, UserClient};
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// How long minted user access tokens remain valid.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Minimum remaining validity below which a cached token is renewed instead
/// of reused.
pub const SESSION_MIN_REMAINING: Duration = Duration::from_secs(10 * 60);

/// Seam for minting user tokens, so tests can count mint requests.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, user: &UserId, valid_until_ms: i64) -> Result<String, ApiError>;
}

#[async_trait]
impl TokenMinter for AdminClient {
    async fn mint(&self, user: &UserId, valid_until_ms: i64) -> Result<String, ApiError> {
        self.login_as_user(user, valid_until_ms).await
    }
}

struct Slot {
    client: Option<UserClient>,
    /// Monotonic expiry of the cached token
    valid_until: Instant,
}

/// Caches one authenticated handle per impersonated user.
///
/// Lock discipline: the outer mutex only guards creation of per-user entries;
/// each entry's async mutex serializes mint requests for that user, so at
/// most one mint is in flight per user even under concurrent callers.
pub struct SessionCache {
    minter: Arc<dyn TokenMinter>,
    http: reqwest::Client,
    base: Url,
    slots: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl SessionCache {
    pub fn new(
        minter: Arc<dyn TokenMinter>,
        http: reqwest::Client,
        synapse_url: &str,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            minter,
            http,
            base: crate::synapse::parse_base(synapse_url)?,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slot(&self, user: &UserId) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(user.clone())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Slot {
                    client: None,
                    valid_until: Instant::now(),
                }))
            })
            .clone()
    }

    /// Return a cached authenticated handle for the user, minting a fresh
    /// token when none exists or the cached one is close to expiry. A failed
    /// mint caches nothing; the next caller retries from scratch.
    pub async fn get(&self, user: &UserId) -> Result<UserClient, ApiError> {
        let slot = self.slot(user);
        let mut slot = slot.lock().await;

        let now = Instant::now();
        if let Some(client) = &slot.client {
            if slot.valid_until > now + SESSION_MIN_REMAINING {
                debug!("Using existing access token for {}", user);
                return Ok(client.clone());
            }
        }

        let valid_until_ms = wall_clock_ms(SystemTime::now() + SESSION_LIFETIME);
        debug!("Requesting a new access token for {}", user);
        let token = self.minter.mint(user, valid_until_ms).await?;
        let client = UserClient::new(self.http.clone(), self.base.clone(), user.clone(), token);
        slot.client = Some(client.clone());
        slot.valid_until = now + SESSION_LIFETIME;
        Ok(client)
    }

    #[cfg(test)]
    async fn force_expiry(&self, user: &UserId, remaining: Duration) {
        let slot = self.slot(user);
        slot.lock().await.valid_until = Instant::now() + remaining;
    }
}

fn wall_clock_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMinter {
        mints: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TokenMinter for CountingMinter {
        async fn mint(&self, user: &UserId, _valid_until_ms: i64) -> Result<String, ApiError> {
            tokio::time::sleep(self.delay).await;
            let n = self.mints.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{}-{n}", user))
        }
    }

    fn cache(delay: Duration) -> (Arc<SessionCache>, Arc<CountingMinter>) {
        let minter = Arc::new(CountingMinter {
            mints: AtomicUsize::new(0),
            delay,
        });
        let cache = SessionCache::new(
            minter.clone(),
            reqwest::Client::new(),
            "http://localhost:8008",
        )
        .unwrap();
        (Arc::new(cache), minter)
    }

    #[tokio::test]
    async fn test_concurrent_gets_mint_once() {
        let (cache, minter) = cache(Duration::from_millis(50));
        let user = UserId::new("@_alice_tg_1:hs");
        let a = tokio::spawn({
            let cache = cache.clone();
            let user = user.clone();
            async move { cache.get(&user).await }
        });
        let b = tokio::spawn({
            let cache = cache.clone();
            let user = user.clone();
            async move { cache.get(&user).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(minter.mints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_users_mint_independently() {
        let (cache, minter) = cache(Duration::ZERO);
        cache.get(&UserId::new("@_a_tg_1:hs")).await.unwrap();
        cache.get(&UserId::new("@_a_tg_2:hs")).await.unwrap();
        assert_eq!(minter.mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_near_expiry_triggers_single_renewal() {
        let (cache, minter) = cache(Duration::ZERO);
        let user = UserId::new("@_alice_tg_1:hs");
        cache.get(&user).await.unwrap();
        assert_eq!(minter.mints.load(Ordering::SeqCst), 1);

        // Still comfortably valid — no renewal.
        cache.get(&user).await.unwrap();
        assert_eq!(minter.mints.load(Ordering::SeqCst), 1);

        // Below the minimum remaining lifetime — exactly one renewal.
        cache
            .force_expiry(&user, SESSION_MIN_REMAINING / 2)
            .await;
        cache.get(&user).await.unwrap();
        cache.get(&user).await.unwrap();
        assert_eq!(minter.mints.load(Ordering::SeqCst), 2);
    }
}
