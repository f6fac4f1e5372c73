#![forbid(unsafe_code)]

use std::collections::HashMap;

use huddle_domain::{Membership, Message, MessageId, Role, Room, RoomId, User, UserId};
use tokio::sync::RwLock;

use super::ChatStore;
use crate::error::StoreError;
use crate::util::time::unix_ms_now;

#[derive(Debug, Default)]
struct MemoryState {
	users: HashMap<UserId, User>,
	rooms: HashMap<RoomId, Room>,
	memberships: HashMap<(RoomId, UserId), Membership>,
	messages: HashMap<MessageId, Message>,
}

impl MemoryState {
	fn require_room(&self, room_id: RoomId) -> Result<(), StoreError> {
		if self.rooms.contains_key(&room_id) {
			Ok(())
		} else {
			Err(StoreError::NotFound("room"))
		}
	}
}

/// Process-local store used when no `database_url` is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: RwLock<MemoryState>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl ChatStore for MemoryStore {
	async fn create_user(&self, user: &User) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		if guard.users.contains_key(&user.id) {
			return Err(StoreError::Conflict(format!("user {} already exists", user.id)));
		}
		if guard.users.values().any(|u| u.username == user.username) {
			return Err(StoreError::Conflict(format!("username {} is taken", user.username)));
		}
		guard.users.insert(user.id, user.clone());
		Ok(())
	}

	async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		Ok(self.inner.read().await.users.get(&id).cloned())
	}

	async fn update_user_profile(&self, user: &User) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		let existing = guard.users.get_mut(&user.id).ok_or(StoreError::NotFound("user"))?;
		existing.nickname = user.nickname.clone();
		existing.avatar_url = user.avatar_url.clone();
		Ok(())
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		if guard.rooms.contains_key(&room.id) {
			return Err(StoreError::Conflict(format!("room {} already exists", room.id)));
		}
		guard.rooms.insert(room.id, room.clone());
		guard.memberships.insert(
			(room.id, room.creator_id),
			Membership {
				user_id: room.creator_id,
				room_id: room.id,
				role: Role::Creator,
				joined_at: room.created_at,
			},
		);
		Ok(())
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		Ok(self.inner.read().await.rooms.get(&id).cloned())
	}

	async fn rename_room(&self, id: RoomId, name: &str) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		let room = guard.rooms.get_mut(&id).ok_or(StoreError::NotFound("room"))?;
		room.name = name.to_string();
		Ok(())
	}

	async fn delete_room(&self, id: RoomId) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		if guard.rooms.remove(&id).is_none() {
			return Err(StoreError::NotFound("room"));
		}
		guard.memberships.retain(|(room_id, _), _| *room_id != id);
		guard.messages.retain(|_, m| m.room_id != id);
		Ok(())
	}

	async fn add_membership(&self, user_id: UserId, room_id: RoomId, role: Role) -> Result<(), StoreError> {
		if role == Role::Creator {
			return Err(StoreError::Conflict("a room has exactly one creator".to_string()));
		}

		let mut guard = self.inner.write().await;
		guard.require_room(room_id)?;
		if guard.memberships.contains_key(&(room_id, user_id)) {
			return Err(StoreError::Conflict(format!("user {user_id} is already a member")));
		}
		guard.memberships.insert(
			(room_id, user_id),
			Membership {
				user_id,
				room_id,
				role,
				joined_at: unix_ms_now(),
			},
		);
		Ok(())
	}

	async fn remove_membership(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		match guard.memberships.get(&(room_id, user_id)) {
			None => Err(StoreError::NotFound("membership")),
			Some(m) if m.role == Role::Creator => Err(StoreError::Conflict("the creator membership is permanent".to_string())),
			Some(_) => {
				guard.memberships.remove(&(room_id, user_id));
				Ok(())
			}
		}
	}

	async fn get_membership(&self, user_id: UserId, room_id: RoomId) -> Result<Option<Role>, StoreError> {
		Ok(self.inner.read().await.memberships.get(&(room_id, user_id)).map(|m| m.role))
	}

	async fn list_room_ids_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
		let guard = self.inner.read().await;
		let mut rows = guard
			.memberships
			.values()
			.filter(|m| m.user_id == user_id)
			.map(|m| (m.joined_at, m.room_id))
			.collect::<Vec<_>>();
		rows.sort();
		Ok(rows.into_iter().map(|(_, id)| id).collect())
	}

	async fn list_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
		let guard = self.inner.read().await;
		let mut rows = guard
			.memberships
			.values()
			.filter(|m| m.room_id == room_id)
			.map(|m| (m.joined_at, m.user_id))
			.collect::<Vec<_>>();
		rows.sort();
		Ok(rows.into_iter().map(|(_, id)| id).collect())
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		let mut guard = self.inner.write().await;
		guard.require_room(message.room_id)?;
		if guard.messages.contains_key(&message.id) {
			return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
		}
		guard.messages.insert(message.id, message.clone());
		Ok(())
	}

	async fn get_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
		let guard = self.inner.read().await;
		Ok(ids.iter().filter_map(|id| guard.messages.get(id).cloned()).collect())
	}

	async fn list_message_ids(&self, room_id: RoomId, limit: usize, before: i64) -> Result<Vec<MessageId>, StoreError> {
		let guard = self.inner.read().await;
		let mut rows = guard
			.messages
			.values()
			.filter(|m| m.room_id == room_id && m.timestamp < before)
			.map(|m| (m.timestamp, m.id))
			.collect::<Vec<_>>();
		rows.sort_by(|a, b| b.cmp(a));
		rows.truncate(limit);
		Ok(rows.into_iter().map(|(_, id)| id).collect())
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		match self.inner.write().await.messages.remove(&id) {
			Some(_) => Ok(()),
			None => Err(StoreError::NotFound("message")),
		}
	}
}
