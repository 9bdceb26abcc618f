#![forbid(unsafe_code)]

// Permission engine — decides which callers may use the service and which
// rooms are provably under a bridge's exclusive control.

use crate::ids::{MalformedUserId, RoomId, UserId};
use crate::synapse::{AdminClient, ApiError, CallerClient, PowerLevels};
use regex::Regex;
use std::sync::LazyLock;

/// Localparts of users allowed to use the cleanup service. Matches bridge
/// bot accounts of the form `_<bridgeUser>_<bridgeName>_bot`.
static BRIDGE_BOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^_([a-z0-9-]+)_([a-z0-9-]+)_bot$").expect("static pattern"));

/// Power level required to count as an admin-capable identity.
const ADMIN_LEVEL: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to parse user ID: {0}")]
    BadUserId(#[from] MalformedUserId),
    #[error("only bridge bots can clean up rooms")]
    NotBridgeBot,
    #[error("room contains member '{member}' from other homeserver '{found}' (expected '{expected}')")]
    ForeignMember {
        member: UserId,
        found: String,
        expected: String,
    },
    #[error("room contains member '{member}' that is not the bridge user nor a bridge ghost (expected '{owner}' or prefix '{prefix}')")]
    UnrelatedMember {
        member: UserId,
        owner: String,
        prefix: String,
    },
    #[error("room doesn't have any bridge user with admin power level")]
    NoAdmin,
    #[error("failed to get members of {room}: {source}")]
    Members { room: RoomId, source: ApiError },
    #[error("failed to get power levels of {room}: {source}")]
    PowerLevels { room: RoomId, source: ApiError },
}

impl RuleError {
    /// Whether the error came from talking to the homeserver (recoverable)
    /// rather than from the eligibility rules themselves.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Members { .. } | Self::PowerLevels { .. })
    }
}

/// Identity of an authorized bridge bot, derived from its user ID.
#[derive(Debug, Clone)]
pub struct BridgeBot {
    pub user_id: UserId,
    /// Localpart of the human user owning the bridge
    pub owner_localpart: String,
    /// Name of the bridged network
    pub bridge_name: String,
    pub homeserver: String,
}

impl BridgeBot {
    /// Authorize-caller rule: accept only identities whose localpart matches
    /// the bridge-bot naming convention.
    pub fn parse(user_id: &UserId) -> Result<Self, RuleError> {
        let (localpart, homeserver) = user_id.parse()?;
        let captures = BRIDGE_BOT_RE
            .captures(localpart)
            .ok_or(RuleError::NotBridgeBot)?;
        Ok(Self {
            user_id: user_id.clone(),
            owner_localpart: captures[1].to_string(),
            bridge_name: captures[2].to_string(),
            homeserver: homeserver.to_string(),
        })
    }

    /// Localpart prefix shared by every ghost account this bridge controls.
    pub fn ghost_prefix(&self) -> String {
        format!("_{}_{}_", self.owner_localpart, self.bridge_name)
    }
}

/// A caller whose token has been resolved and whose identity passed the
/// authorize-caller rule.
#[derive(Clone)]
pub struct Caller {
    pub client: CallerClient,
    pub bot: BridgeBot,
}

/// Outcome of the pure membership check.
#[derive(Debug, PartialEq)]
pub struct RoomGhosts {
    /// Members to evict before deletion (everyone but the owning user)
    pub kick: Vec<UserId>,
    /// A ghost present in the room, usable for state reads
    pub state_reader: Option<UserId>,
}

/// Verify the room contains nobody except the bridge's owning user, its bot
/// and its ghosts, all on the caller's homeserver.
pub fn check_members(bot: &BridgeBot, members: &[UserId]) -> Result<RoomGhosts, RuleError> {
    let prefix = bot.ghost_prefix();
    let mut ghosts = RoomGhosts {
        kick: Vec::new(),
        state_reader: None,
    };
    for member in members {
        let (localpart, homeserver) = member.parse()?;
        if homeserver != bot.homeserver {
            return Err(RuleError::ForeignMember {
                member: member.clone(),
                found: homeserver.to_string(),
                expected: bot.homeserver.clone(),
            });
        }
        if localpart == bot.owner_localpart {
            continue;
        }
        if !localpart.starts_with(&prefix) {
            return Err(RuleError::UnrelatedMember {
                member: member.clone(),
                owner: bot.owner_localpart.clone(),
                prefix,
            });
        }
        ghosts.state_reader = Some(member.clone());
        ghosts.kick.push(member.clone());
    }
    Ok(ghosts)
}

/// Whether the bot itself or at least one ghost holds admin power.
pub fn has_bridge_admin(bot: &BridgeBot, power_levels: &PowerLevels) -> bool {
    if power_levels.user_level(&bot.user_id) >= ADMIN_LEVEL {
        return true;
    }
    let prefix = format!("@{}", bot.ghost_prefix());
    power_levels
        .users
        .iter()
        .any(|(user, &level)| level >= ADMIN_LEVEL && user.starts_with(&prefix))
}

/// Authorize-room rule: fail unless the room is exclusively administrable by
/// the calling bridge. Returns the members to evict before deletion.
pub async fn authorize_room(
    bot: &BridgeBot,
    caller: &CallerClient,
    admin: &AdminClient,
    room: &RoomId,
) -> Result<Vec<UserId>, RuleError> {
    let members = admin
        .list_members(room)
        .await
        .map_err(|source| RuleError::Members {
            room: room.clone(),
            source,
        })?;
    let ghosts = check_members(bot, &members)?;

    // The calling bot may not be in the room, so the state read is asserted
    // as one of the ghosts whenever we found one.
    let power_levels = caller
        .power_levels(room, ghosts.state_reader.as_ref())
        .await
        .map_err(|source| RuleError::PowerLevels {
            room: room.clone(),
            source,
        })?;
    if !has_bridge_admin(bot, &power_levels) {
        return Err(RuleError::NoAdmin);
    }

    Ok(ghosts.kick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn bot() -> BridgeBot {
        BridgeBot::parse(&UserId::new("@_alice_tg_bot:hs")).unwrap()
    }

    #[test]
    fn test_bridge_bot_pattern_accepts_bots() {
        let bot = bot();
        assert_eq!(bot.owner_localpart, "alice");
        assert_eq!(bot.bridge_name, "tg");
        assert_eq!(bot.homeserver, "hs");
        assert_eq!(bot.ghost_prefix(), "_alice_tg_");
    }

    #[test]
    fn test_bridge_bot_pattern_rejects_everyone_else() {
        for raw in [
            "@alice:hs",
            "@_alice_tg_:hs",
            "@_alice_tg_bot_extra:hs",
            "@_Alice_tg_bot:hs",
            "@_alice__bot:hs",
        ] {
            assert!(
                matches!(
                    BridgeBot::parse(&UserId::new(raw)),
                    Err(RuleError::NotBridgeBot)
                ),
                "{raw} should be rejected"
            );
        }
        assert!(matches!(
            BridgeBot::parse(&UserId::new("no-at-sign")),
            Err(RuleError::BadUserId(_))
        ));
    }

    #[test]
    fn test_check_members_returns_ghosts_only() {
        let members = vec![
            UserId::new("@alice:hs"),
            UserId::new("@_alice_tg_12345:hs"),
            UserId::new("@_alice_tg_67890:hs"),
        ];
        let ghosts = check_members(&bot(), &members).unwrap();
        assert_eq!(
            ghosts.kick,
            vec![
                UserId::new("@_alice_tg_12345:hs"),
                UserId::new("@_alice_tg_67890:hs"),
            ]
        );
        assert!(ghosts.state_reader.is_some());
    }

    #[test]
    fn test_check_members_rejects_foreign_homeserver() {
        let members = vec![UserId::new("@alice:hs"), UserId::new("@_alice_tg_1:other")];
        assert!(matches!(
            check_members(&bot(), &members),
            Err(RuleError::ForeignMember { .. })
        ));
    }

    #[test]
    fn test_check_members_rejects_unrelated_member() {
        let members = vec![UserId::new("@alice:hs"), UserId::new("@bob:hs")];
        assert!(matches!(
            check_members(&bot(), &members),
            Err(RuleError::UnrelatedMember { .. })
        ));
    }

    #[test]
    fn test_check_members_counts_bot_as_ghost() {
        // The bot's own localpart carries the ghost prefix; it must leave too.
        let members = vec![UserId::new("@alice:hs"), UserId::new("@_alice_tg_bot:hs")];
        let ghosts = check_members(&bot(), &members).unwrap();
        assert_eq!(ghosts.kick, vec![UserId::new("@_alice_tg_bot:hs")]);
    }

    fn levels(pairs: &[(&str, i64)]) -> PowerLevels {
        PowerLevels {
            users: pairs
                .iter()
                .map(|(u, l)| (u.to_string(), *l))
                .collect::<HashMap<_, _>>(),
            users_default: 0,
        }
    }

    #[test]
    fn test_has_bridge_admin_accepts_bot_or_ghost() {
        assert!(has_bridge_admin(&bot(), &levels(&[("@_alice_tg_bot:hs", 100)])));
        assert!(has_bridge_admin(&bot(), &levels(&[("@_alice_tg_1:hs", 100)])));
    }

    #[test]
    fn test_has_bridge_admin_rejects_low_or_unrelated_levels() {
        assert!(!has_bridge_admin(&bot(), &levels(&[("@_alice_tg_1:hs", 50)])));
        assert!(!has_bridge_admin(&bot(), &levels(&[("@alice:hs", 100)])));
        assert!(!has_bridge_admin(&bot(), &levels(&[])));
    }
}
