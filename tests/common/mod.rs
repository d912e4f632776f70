//! Shared builders and doubles for the integration suites.
#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;

use tollgate::{Caller, Channel, Event, EventKind, Notifier, Rejection};

/// Notifier double that records every rejection it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    rejections: Mutex<Vec<Rejection>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejections(&self) -> Vec<Rejection> {
        self.rejections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _event: &Event, rejection: &Rejection) {
        self.rejections.lock().unwrap().push(rejection.clone());
    }
}

/// A chat-input event raised in a DM.
pub fn dm_chat_event(user: &str) -> Event {
    let mut caller = Caller::new(user);
    caller.channel = Some(Channel::dm("dm-1"));
    Event::new(EventKind::ChatInput { command: "probe".into() }, caller)
}

/// A chat-input event raised in a guild text channel.
pub fn guild_chat_event(user: &str, guild: &str, channel: Channel) -> Event {
    let mut caller = Caller::new(user);
    caller.guild_id = Some(guild.into());
    caller.channel = Some(channel);
    Event::new(EventKind::ChatInput { command: "probe".into() }, caller)
}
