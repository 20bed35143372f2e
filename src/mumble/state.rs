use std::collections::HashMap;

use crate::transport::types::{Channel, ServerInfo, User};

/// Channel and user registry for one Mumble session. The control client is
/// the only writer; everything else sees snapshots or merged clones carried
/// on events.
#[derive(Debug, Default)]
pub struct Registry {
    channels: HashMap<u32, Channel>,
    users: HashMap<u32, User>,
    info: ServerInfo,
}

/// Partial channel state as decoded from one `ChannelState` message. `links`
/// is a full replacement when present; otherwise the add/remove deltas apply.
#[derive(Debug, Default)]
pub struct ChannelUpdate {
    pub id: u32,
    pub name: Option<String>,
    pub parent_id: Option<u32>,
    pub position: Option<i32>,
    pub description: Option<String>,
    pub links: Option<Vec<u32>>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
}

/// Partial user state as decoded from one `UserState` message.
#[derive(Debug, Default)]
pub struct UserUpdate {
    pub id: u32,
    pub name: Option<String>,
    pub channel_id: Option<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn user(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut ServerInfo {
        &mut self.info
    }

    /// Merges one channel update and returns the resulting state.
    pub fn apply_channel_update(&mut self, update: ChannelUpdate) -> Channel {
        let entry = self.channels.entry(update.id).or_insert_with(|| Channel {
            id: update.id,
            name: String::new(),
            parent_id: None,
            position: None,
            description: None,
            links: Default::default(),
        });

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(parent_id) = update.parent_id {
            entry.parent_id = Some(parent_id);
        }
        if let Some(position) = update.position {
            entry.position = Some(position);
        }
        if let Some(description) = update.description {
            entry.description = Some(description);
        }

        if let Some(links) = update.links {
            entry.links = links.into_iter().collect();
        } else if !update.links_add.is_empty() || !update.links_remove.is_empty() {
            for link in update.links_add {
                entry.links.insert(link);
            }
            for link in &update.links_remove {
                entry.links.remove(link);
            }
        }

        entry.clone()
    }

    pub fn apply_channel_remove(&mut self, id: u32) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Merges one user update. A user first seen without a channel lands in
    /// root (0); later updates without the field keep the previous channel.
    pub fn apply_user_update(&mut self, update: UserUpdate) -> User {
        let entry = self.users.entry(update.id).or_insert_with(|| User {
            id: update.id,
            name: String::new(),
            channel_id: 0,
            mute: false,
            deaf: false,
            suppress: false,
            self_mute: false,
            self_deaf: false,
        });

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(channel_id) = update.channel_id {
            entry.channel_id = channel_id;
        }
        if let Some(mute) = update.mute {
            entry.mute = mute;
        }
        if let Some(deaf) = update.deaf {
            entry.deaf = deaf;
        }
        if let Some(suppress) = update.suppress {
            entry.suppress = suppress;
        }
        if let Some(self_mute) = update.self_mute {
            entry.self_mute = self_mute;
        }
        if let Some(self_deaf) = update.self_deaf {
            entry.self_deaf = self_deaf;
        }

        entry.clone()
    }

    pub fn apply_user_remove(&mut self, id: u32) -> bool {
        self.users.remove(&id).is_some()
    }

    pub fn channels_snapshot(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.channels.values().cloned().collect();
        channels.sort_by_key(|channel| channel.id);
        channels
    }

    pub fn users_snapshot(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by_key(|user| user.id);
        users
    }
}
