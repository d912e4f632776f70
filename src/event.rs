//! Inbound event model.
//!
//! An [`Event`] is the gate's view of one platform interaction: the resolved
//! caller/scoping context plus a tagged union over the event kinds the
//! dispatcher routes. Kind-specific behavior is selected by pattern matching
//! on [`EventKind`], never by downcasting.

use crate::permissions::PermissionSet;

/// Opaque platform identifier (user, guild, channel, role, ...).
pub type Id = String;

/// Kind of channel an event originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelKind {
    Text,
    Dm,
    Thread,
}

/// Channel context for an event, as resolved by the host.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel {
    pub id: Id,
    pub kind: ChannelKind,
    /// Whether the channel carries the platform's NSFW flag.
    pub nsfw: bool,
    /// Parent category, when the platform nests channels.
    pub parent_id: Option<Id>,
}

impl Channel {
    pub fn text(id: impl Into<Id>) -> Self {
        Self { id: id.into(), kind: ChannelKind::Text, nsfw: false, parent_id: None }
    }

    pub fn dm(id: impl Into<Id>) -> Self {
        Self { id: id.into(), kind: ChannelKind::Dm, nsfw: false, parent_id: None }
    }

    pub fn is_dm(&self) -> bool {
        self.kind == ChannelKind::Dm
    }

    pub fn is_thread(&self) -> bool {
        self.kind == ChannelKind::Thread
    }
}

/// Resolved caller identity and scoping context.
///
/// The host resolves platform state (member roles, effective channel
/// permissions) before dispatch; the gate never talks to the platform.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Id,
    /// Guild the event was raised in; `None` for DMs.
    pub guild_id: Option<Id>,
    /// Roles held by the calling member; empty outside guilds.
    pub roles: Vec<Id>,
    /// Channel the event was raised in, when the host could resolve it.
    pub channel: Option<Channel>,
    /// The caller's effective permissions in that channel.
    pub permissions: PermissionSet,
    /// The bot's own effective permissions in that channel; `None` when the
    /// bot member could not be resolved.
    pub bot_permissions: Option<PermissionSet>,
}

impl Caller {
    /// Minimal caller for a given user, usable as a starting point in tests
    /// and simple hosts.
    pub fn new(user_id: impl Into<Id>) -> Self {
        Self {
            user_id: user_id.into(),
            guild_id: None,
            roles: Vec::new(),
            channel: None,
            permissions: PermissionSet::empty(),
            bot_permissions: None,
        }
    }
}

/// The event kinds the dispatcher routes, each with its narrowed payload.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A slash-command invocation.
    ChatInput { command: String },
    /// A context-menu action on a user.
    UserContext { target_user_id: Id },
    /// A context-menu action on a message.
    MessageContext { target_message_id: Id },
    /// A component interaction (button press, select menu, ...).
    Component {
        custom_id: String,
        /// User whose interaction created the component; `None` when the
        /// component was created outside an interaction and is open to all.
        origin_user_id: Option<Id>,
    },
    /// A modal submit.
    Modal { custom_id: String },
    /// An autocomplete query, tied to a chat-input command.
    Autocomplete { command: String, query: String },
}

impl EventKind {
    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ChatInput { .. } => "chat_input",
            EventKind::UserContext { .. } => "user_context",
            EventKind::MessageContext { .. } => "message_context",
            EventKind::Component { .. } => "component",
            EventKind::Modal { .. } => "modal",
            EventKind::Autocomplete { .. } => "autocomplete",
        }
    }
}

/// One inbound platform interaction.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub caller: Caller,
}

impl Event {
    pub fn new(kind: EventKind, caller: Caller) -> Self {
        Self { kind, caller }
    }

    pub fn user_id(&self) -> &Id {
        &self.caller.user_id
    }

    pub fn guild_id(&self) -> Option<&Id> {
        self.caller.guild_id.as_ref()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.caller.channel.as_ref()
    }

    pub fn channel_id(&self) -> Option<&Id> {
        self.caller.channel.as_ref().map(|c| &c.id)
    }

    /// Whether the event was raised inside a guild.
    pub fn in_guild(&self) -> bool {
        self.caller.guild_id.is_some()
    }

    pub fn is_autocomplete(&self) -> bool {
        matches!(self.kind, EventKind::Autocomplete { .. })
    }

    pub fn is_component(&self) -> bool {
        matches!(self.kind, EventKind::Component { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_accessors_reflect_caller() {
        let mut caller = Caller::new("u1");
        caller.guild_id = Some("g1".into());
        caller.channel = Some(Channel::text("c1"));
        let event = Event::new(EventKind::ChatInput { command: "ping".into() }, caller);

        assert_eq!(event.user_id(), "u1");
        assert_eq!(event.guild_id().map(String::as_str), Some("g1"));
        assert_eq!(event.channel_id().map(String::as_str), Some("c1"));
        assert!(event.in_guild());
        assert!(!event.is_autocomplete());
        assert_eq!(event.kind.name(), "chat_input");
    }

    #[test]
    fn dm_event_has_no_guild_scope() {
        let mut caller = Caller::new("u1");
        caller.channel = Some(Channel::dm("d1"));
        let event = Event::new(EventKind::Modal { custom_id: "feedback".into() }, caller);

        assert!(!event.in_guild());
        assert!(event.channel().is_some_and(Channel::is_dm));
    }
}
