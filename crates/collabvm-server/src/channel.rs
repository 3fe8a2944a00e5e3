//! Chat rooms and the user channels built on them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use collabvm_proto::constants::CHAT_HISTORY_LEN;
use collabvm_proto::messages::{AdminUserListEntry, ChatMessageRecord, UserListEntry};
use collabvm_proto::{IpBytes, ServerMessage, UserType};

use crate::session::{shared_frame, Connection, ConnectionId};

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Ring buffer of the most recent messages in one channel.
pub struct ChatRoom {
    id: u32,
    history: VecDeque<ChatMessageRecord>,
}

impl ChatRoom {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            history: VecDeque::with_capacity(CHAT_HISTORY_LEN),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stamp, append, and return the record; the caller broadcasts it.
    pub fn add_user_message(
        &mut self,
        sender: &str,
        user_type: UserType,
        text: &str,
    ) -> ChatMessageRecord {
        let record = ChatMessageRecord {
            sender: sender.to_string(),
            user_type,
            text: text.to_string(),
            timestamp: now_millis(),
        };
        if self.history.len() == CHAT_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        record
    }

    /// History in arrival order, replayed to joining users.
    pub fn history(&self) -> Vec<ChatMessageRecord> {
        self.history.iter().cloned().collect()
    }
}

/// Metadata tracked for each member of a channel.
pub struct ChannelUser {
    pub conn: Arc<Connection>,
    pub username: String,
    pub user_type: UserType,
    pub ip: IpBytes,
    pub vote: Option<bool>,
}

/// A chat room plus its member set. One global instance (id 0) and one per
/// VM.
pub struct UserChannel {
    chat_room: ChatRoom,
    users: HashMap<ConnectionId, ChannelUser>,
    admins_count: u32,
}

impl UserChannel {
    pub fn new(id: u32) -> Self {
        Self {
            chat_room: ChatRoom::new(id),
            users: HashMap::new(),
            admins_count: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.chat_room.id()
    }

    pub fn chat_room(&self) -> &ChatRoom {
        &self.chat_room
    }

    pub fn chat_room_mut(&mut self) -> &mut ChatRoom {
        &mut self.chat_room
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.users.contains_key(&id)
    }

    pub fn get_user(&self, id: ConnectionId) -> Option<&ChannelUser> {
        self.users.get(&id)
    }

    pub fn get_user_mut(&mut self, id: ConnectionId) -> Option<&mut ChannelUser> {
        self.users.get_mut(&id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&ChannelUser> {
        self.users.values().find(|u| u.username == username)
    }

    pub fn users(&self) -> impl Iterator<Item = &ChannelUser> {
        self.users.values()
    }

    /// Add a member: the joiner receives the current user list (the admin
    /// variant when they are an admin) and everyone else receives a delta.
    pub fn add_user(&mut self, user: ChannelUser) {
        let joiner = user.conn.clone();
        let entry = UserListEntry {
            username: user.username.clone(),
            user_type: user.user_type,
        };
        let admin_entry = AdminUserListEntry {
            username: user.username.clone(),
            user_type: user.user_type,
            ip_address: user.ip,
        };
        let joiner_is_admin = user.user_type.is_admin();

        if user.user_type.is_admin() {
            self.admins_count += 1;
        }
        self.users.insert(user.conn.id, user);

        joiner.queue_message(&if joiner_is_admin {
            ServerMessage::AdminUserList {
                channel: self.id(),
                users: self.admin_user_list(),
            }
        } else {
            ServerMessage::UserList {
                channel: self.id(),
                users: self.user_list(),
            }
        });

        if self.users.len() <= 1 {
            return;
        }
        let add = shared_frame(&ServerMessage::UserListAdd {
            channel: self.id(),
            user: entry,
        });
        let admin_add = shared_frame(&ServerMessage::AdminUserListAdd {
            channel: self.id(),
            user: admin_entry,
        });
        for member in self.users.values() {
            if member.conn.id == joiner.id {
                continue;
            }
            let frame = if member.user_type.is_admin() {
                admin_add.clone()
            } else {
                add.clone()
            };
            if let Some(frame) = frame {
                member.conn.queue_frame(frame);
            }
        }
    }

    /// Remove a member and tell the rest. Idempotent.
    pub fn remove_user(&mut self, id: ConnectionId) -> Option<ChannelUser> {
        let user = self.users.remove(&id)?;
        if user.user_type.is_admin() {
            self.admins_count -= 1;
        }
        self.broadcast_message(&ServerMessage::UserListRemove {
            channel: self.id(),
            username: user.username.clone(),
        });
        Some(user)
    }

    /// Fan one shared frame out to every member's send queue.
    pub fn broadcast(&self, frame: Bytes) {
        for user in self.users.values() {
            user.conn.queue_frame(frame.clone());
        }
    }

    pub fn broadcast_message(&self, message: &ServerMessage) {
        if let Some(frame) = shared_frame(message) {
            self.broadcast(frame);
        }
    }

    /// Kick every member. Used when a VM is deleted.
    pub fn clear(&mut self) {
        self.users.clear();
        self.admins_count = 0;
    }

    pub fn user_list(&self) -> Vec<UserListEntry> {
        self.users
            .values()
            .map(|u| UserListEntry {
                username: u.username.clone(),
                user_type: u.user_type,
            })
            .collect()
    }

    pub fn admin_user_list(&self) -> Vec<AdminUserListEntry> {
        self.users
            .values()
            .map(|u| AdminUserListEntry {
                username: u.username.clone(),
                user_type: u.user_type,
                ip_address: u.ip,
            })
            .collect()
    }

    /// Current vote tally as (yes, no).
    pub fn vote_tally(&self) -> (u32, u32) {
        let mut yes = 0;
        let mut no = 0;
        for user in self.users.values() {
            match user.vote {
                Some(true) => yes += 1,
                Some(false) => no += 1,
                None => {}
            }
        }
        (yes, no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: ConnectionId, username: &str, user_type: UserType) -> ChannelUser {
        let (conn, rx) = Connection::new(id, "127.0.0.1".parse().unwrap(), false);
        // Keep the receiver alive for the duration of the test.
        std::mem::forget(rx);
        ChannelUser {
            conn,
            username: username.to_string(),
            user_type,
            ip: [0u8; 16],
            vote: None,
        }
    }

    #[test]
    fn chat_history_is_a_ring() {
        let mut room = ChatRoom::new(0);
        for i in 0..(CHAT_HISTORY_LEN + 5) {
            room.add_user_message("alice", UserType::Regular, &format!("msg {i}"));
        }
        let history = room.history();
        assert_eq!(history.len(), CHAT_HISTORY_LEN);
        assert_eq!(history[0].text, "msg 5");
        assert_eq!(history.last().unwrap().text, format!("msg {}", CHAT_HISTORY_LEN + 4));
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut room = ChatRoom::new(0);
        let a = room.add_user_message("a", UserType::Guest, "one");
        let b = room.add_user_message("b", UserType::Guest, "two");
        assert!(b.timestamp >= a.timestamp);
    }

    #[test]
    fn add_and_remove_users() {
        let mut channel = UserChannel::new(1);
        channel.add_user(member(1, "alice", UserType::Admin));
        channel.add_user(member(2, "bob", UserType::Guest));
        assert_eq!(channel.user_count(), 2);
        assert!(channel.contains(1));

        let removed = channel.remove_user(1).unwrap();
        assert_eq!(removed.username, "alice");
        assert_eq!(channel.user_count(), 1);
        // Idempotent.
        assert!(channel.remove_user(1).is_none());
    }

    #[test]
    fn vote_tally_counts_ballots() {
        let mut channel = UserChannel::new(1);
        channel.add_user(member(1, "a", UserType::Guest));
        channel.add_user(member(2, "b", UserType::Guest));
        channel.add_user(member(3, "c", UserType::Guest));
        channel.get_user_mut(1).unwrap().vote = Some(true);
        channel.get_user_mut(2).unwrap().vote = Some(false);
        assert_eq!(channel.vote_tally(), (1, 1));
    }
}
