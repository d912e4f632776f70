//! Internal permission levels and platform channel permissions.
//!
//! Two distinct notions live here. [`PermLevel`] is the bot-internal
//! privilege ladder, resolved per caller by a [`PermissionResolver`]
//! collaborator. [`Permission`]/[`PermissionSet`] model the platform's
//! channel-scoped permission bits, which the host resolves onto the event
//! before dispatch.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::event::{Event, Id};

/// Bot-internal permission ladder, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PermLevel {
    #[default]
    User = 0,
    Moderator = 1,
    Administrator = 2,
    ServerOwner = 3,
    BotAdministrator = 4,
    Developer = 5,
    BotOwner = 6,
}

impl fmt::Display for PermLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermLevel::User => "User",
            PermLevel::Moderator => "Moderator",
            PermLevel::Administrator => "Administrator",
            PermLevel::ServerOwner => "Server Owner",
            PermLevel::BotAdministrator => "Bot Administrator",
            PermLevel::Developer => "Developer",
            PermLevel::BotOwner => "Bot Owner",
        };
        f.write_str(name)
    }
}

/// Platform channel permission bits the gate can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Permission {
    ViewChannel = 0,
    SendMessages = 1,
    EmbedLinks = 2,
    AttachFiles = 3,
    AddReactions = 4,
    UseExternalEmojis = 5,
    MentionEveryone = 6,
    ManageMessages = 7,
    ManageThreads = 8,
    ManageChannels = 9,
    ManageRoles = 10,
    ManageGuild = 11,
    ModerateMembers = 12,
    Connect = 13,
    Speak = 14,
    Administrator = 15,
}

impl Permission {
    const ALL: [Permission; 16] = [
        Permission::ViewChannel,
        Permission::SendMessages,
        Permission::EmbedLinks,
        Permission::AttachFiles,
        Permission::AddReactions,
        Permission::UseExternalEmojis,
        Permission::MentionEveryone,
        Permission::ManageMessages,
        Permission::ManageThreads,
        Permission::ManageChannels,
        Permission::ManageRoles,
        Permission::ManageGuild,
        Permission::ModerateMembers,
        Permission::Connect,
        Permission::Speak,
        Permission::Administrator,
    ];

    fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::ViewChannel => "View Channel",
            Permission::SendMessages => "Send Messages",
            Permission::EmbedLinks => "Embed Links",
            Permission::AttachFiles => "Attach Files",
            Permission::AddReactions => "Add Reactions",
            Permission::UseExternalEmojis => "Use External Emojis",
            Permission::MentionEveryone => "Mention Everyone",
            Permission::ManageMessages => "Manage Messages",
            Permission::ManageThreads => "Manage Threads",
            Permission::ManageChannels => "Manage Channels",
            Permission::ManageRoles => "Manage Roles",
            Permission::ManageGuild => "Manage Guild",
            Permission::ModerateMembers => "Moderate Members",
            Permission::Connect => "Connect",
            Permission::Speak => "Speak",
            Permission::Administrator => "Administrator",
        };
        f.write_str(name)
    }
}

/// Set of platform permissions, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionSet(u64);

impl PermissionSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every permission this crate models.
    pub fn all() -> Self {
        Permission::ALL.iter().copied().collect()
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission.bit();
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn contains_all(&self, required: PermissionSet) -> bool {
        self.0 & required.0 == required.0
    }

    /// Permissions in `required` that are absent from this set.
    pub fn missing(&self, required: PermissionSet) -> Vec<Permission> {
        Permission::ALL
            .iter()
            .copied()
            .filter(|p| required.contains(*p) && !self.contains(*p))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = PermissionSet::empty();
        for permission in iter {
            set.insert(permission);
        }
        set
    }
}

/// Resolves a caller's internal permission level.
///
/// Resolution may suspend (database lookups, member fetches); it is the only
/// asynchronous admission check besides the throttle.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn resolve(&self, event: &Event) -> PermLevel;
}

/// Table-driven resolver configured from host settings.
///
/// Mirrors the usual bot configuration: one owner, a developer list, a bot
/// administrator list, plus explicit per-user overrides. Everyone else gets
/// the default level.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    owner_id: Option<Id>,
    developers: Vec<Id>,
    administrators: Vec<Id>,
    overrides: HashMap<Id, PermLevel>,
    default: PermLevel,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, id: impl Into<Id>) -> Self {
        self.owner_id = Some(id.into());
        self
    }

    pub fn with_developers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.developers = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_administrators<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.administrators = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_level(mut self, id: impl Into<Id>, level: PermLevel) -> Self {
        self.overrides.insert(id.into(), level);
        self
    }

    pub fn with_default(mut self, level: PermLevel) -> Self {
        self.default = level;
        self
    }
}

#[async_trait]
impl PermissionResolver for StaticResolver {
    async fn resolve(&self, event: &Event) -> PermLevel {
        let user_id = event.user_id();
        if self.owner_id.as_ref() == Some(user_id) {
            return PermLevel::BotOwner;
        }
        if self.developers.contains(user_id) {
            return PermLevel::Developer;
        }
        if self.administrators.contains(user_id) {
            return PermLevel::BotAdministrator;
        }
        self.overrides.get(user_id).copied().unwrap_or(self.default)
    }
}
