//! Resource allow-lists.
//!
//! Restricts a handler to specific guilds, channels, roles, users, or channel
//! categories. Each non-empty list is a one-of match; every non-empty list
//! must match for the check to pass. Useful for private functionality that
//! the broader permission system should not have to model.

use crate::event::{Event, Id};

/// Which allow-list a caller failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Guild,
    Channel,
    Role,
    User,
    Category,
}

/// Allow-lists applied after all other admission checks except the throttle.
#[derive(Debug, Clone, Default)]
pub struct ResourceAllowList {
    guilds: Vec<Id>,
    channels: Vec<Id>,
    roles: Vec<Id>,
    users: Vec<Id>,
    categories: Vec<Id>,
}

impl ResourceAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guilds<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.guilds = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channels<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.channels = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.roles = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_users<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.users = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_categories<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.categories = ids.into_iter().map(Into::into).collect();
        self
    }

    /// True when no restriction is configured.
    pub fn is_empty(&self) -> bool {
        self.guilds.is_empty()
            && self.channels.is_empty()
            && self.roles.is_empty()
            && self.users.is_empty()
            && self.categories.is_empty()
    }

    /// Evaluate every configured list against the event. Returns the first
    /// list the caller failed to match, in a fixed order: guilds, channels,
    /// roles, users, categories.
    pub fn check(&self, event: &Event) -> Result<(), ResourceKind> {
        if !self.guilds.is_empty() {
            let matched = event.guild_id().is_some_and(|id| self.guilds.contains(id));
            if !matched {
                return Err(ResourceKind::Guild);
            }
        }

        if !self.channels.is_empty() {
            let matched = event.channel_id().is_some_and(|id| self.channels.contains(id));
            if !matched {
                return Err(ResourceKind::Channel);
            }
        }

        if !self.roles.is_empty() {
            // Required roles can never match in a DM.
            if !event.in_guild() {
                return Err(ResourceKind::Role);
            }
            let matched = self.roles.iter().any(|id| event.caller.roles.contains(id));
            if !matched {
                return Err(ResourceKind::Role);
            }
        }

        if !self.users.is_empty() && !self.users.contains(event.user_id()) {
            return Err(ResourceKind::User);
        }

        if !self.categories.is_empty() && event.in_guild() {
            let matched = event
                .channel()
                .and_then(|c| c.parent_id.as_ref())
                .is_some_and(|parent| self.categories.contains(parent));
            if !matched {
                return Err(ResourceKind::Category);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Caller, Channel, EventKind};

    fn guild_event(user: &str, guild: &str, channel: Channel, roles: &[&str]) -> Event {
        let mut caller = Caller::new(user);
        caller.guild_id = Some(guild.into());
        caller.channel = Some(channel);
        caller.roles = roles.iter().map(|r| r.to_string()).collect();
        Event::new(EventKind::ChatInput { command: "ping".into() }, caller)
    }

    fn dm_event(user: &str) -> Event {
        let mut caller = Caller::new(user);
        caller.channel = Some(Channel::dm("d1"));
        Event::new(EventKind::ChatInput { command: "ping".into() }, caller)
    }

    #[test]
    fn empty_list_admits_everyone() {
        let list = ResourceAllowList::new();
        assert!(list.is_empty());
        assert_eq!(list.check(&dm_event("u1")), Ok(()));
    }

    #[test]
    fn guild_list_is_one_of() {
        let list = ResourceAllowList::new().with_guilds(["g1", "g2"]);
        let event = guild_event("u1", "g2", Channel::text("c1"), &[]);
        assert_eq!(list.check(&event), Ok(()));

        let other = guild_event("u1", "g3", Channel::text("c1"), &[]);
        assert_eq!(other.guild_id().map(String::as_str), Some("g3"));
        assert_eq!(list.check(&other), Err(ResourceKind::Guild));

        // DMs have no guild to match.
        assert_eq!(list.check(&dm_event("u1")), Err(ResourceKind::Guild));
    }

    #[test]
    fn required_roles_fail_in_dms() {
        let list = ResourceAllowList::new().with_roles(["r1"]);
        assert_eq!(list.check(&dm_event("u1")), Err(ResourceKind::Role));

        let with_role = guild_event("u1", "g1", Channel::text("c1"), &["r1", "r9"]);
        assert_eq!(list.check(&with_role), Ok(()));

        let without = guild_event("u1", "g1", Channel::text("c1"), &["r2"]);
        assert_eq!(list.check(&without), Err(ResourceKind::Role));
    }

    #[test]
    fn user_list_matches_the_caller() {
        let list = ResourceAllowList::new().with_users(["u1"]);
        assert_eq!(list.check(&dm_event("u1")), Ok(()));
        assert_eq!(list.check(&dm_event("u2")), Err(ResourceKind::User));
    }

    #[test]
    fn category_check_passes_outside_guilds() {
        let list = ResourceAllowList::new().with_categories(["cat1"]);
        assert_eq!(list.check(&dm_event("u1")), Ok(()));

        let mut channel = Channel::text("c1");
        channel.parent_id = Some("cat1".into());
        assert_eq!(list.check(&guild_event("u1", "g1", channel, &[])), Ok(()));

        let uncategorized = guild_event("u1", "g1", Channel::text("c2"), &[]);
        assert_eq!(list.check(&uncategorized), Err(ResourceKind::Category));
    }

    #[test]
    fn all_configured_lists_must_match() {
        let list = ResourceAllowList::new().with_guilds(["g1"]).with_users(["u1"]);
        let ok = guild_event("u1", "g1", Channel::text("c1"), &[]);
        assert_eq!(list.check(&ok), Ok(()));

        let wrong_user = guild_event("u2", "g1", Channel::text("c1"), &[]);
        assert_eq!(list.check(&wrong_user), Err(ResourceKind::User));
    }
}
