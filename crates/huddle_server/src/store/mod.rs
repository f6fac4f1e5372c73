#![forbid(unsafe_code)]

pub mod cache;
pub mod cached;
pub mod memory;
pub mod sql;


use huddle_domain::{Message, MessageId, Role, Room, RoomId, User, UserId};

use crate::error::StoreError;

pub use cache::{CacheBackend, CacheTtls, MemoryCache, NoopCache};
pub use cached::CachedStore;
pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Source of truth for users, rooms, memberships and messages.
///
/// Implementations must be safe for concurrent use. The cache layer
/// (`CachedStore`) implements this trait too, so callers never know whether a
/// read was served from cache.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	async fn create_user(&self, user: &User) -> Result<(), StoreError>;

	async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

	/// Updates nickname and avatar only.
	async fn update_user_profile(&self, user: &User) -> Result<(), StoreError>;

	/// Inserts the room together with its single creator membership.
	async fn create_room(&self, room: &Room) -> Result<(), StoreError>;

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

	async fn rename_room(&self, id: RoomId, name: &str) -> Result<(), StoreError>;

	/// Removes the room with all of its memberships and messages.
	async fn delete_room(&self, id: RoomId) -> Result<(), StoreError>;

	/// Adds a membership. Only `create_room` may create the creator membership,
	/// so `Role::Creator` is a conflict here.
	async fn add_membership(&self, user_id: UserId, room_id: RoomId, role: Role) -> Result<(), StoreError>;

	/// Removes a non-creator membership.
	async fn remove_membership(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError>;

	async fn get_membership(&self, user_id: UserId, room_id: RoomId) -> Result<Option<Role>, StoreError>;

	async fn list_room_ids_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError>;

	async fn list_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

	async fn create_message(&self, message: &Message) -> Result<(), StoreError>;

	/// Unknown ids are omitted; order is unspecified.
	async fn get_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError>;

	/// Ids of messages in `room_id` strictly older than `before` (Unix ms),
	/// newest first.
	async fn list_message_ids(&self, room_id: RoomId, limit: usize, before: i64) -> Result<Vec<MessageId>, StoreError>;

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError>;
}
