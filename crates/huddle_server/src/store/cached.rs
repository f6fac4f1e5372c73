#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use huddle_domain::{Message, MessageId, Role, Room, RoomId, User, UserId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::cache::{CacheBackend, CacheTtls, keys};
use super::ChatStore;
use crate::error::StoreError;

/// Cache-aside decorator over a durable `ChatStore`.
///
/// The store is authoritative. Every write goes to the store first and then
/// refreshes or deletes the affected keys; a cache failure is logged and
/// treated as a miss, never surfaced to the caller. Negative membership
/// lookups are not cached, so a freshly added member is visible immediately.
///
/// A read that raced an invalidation does not write its value back: every
/// invalidation bumps a generation counter, and read-through fills are dropped
/// when the counter moved while the store was being read.
pub struct CachedStore {
	store: Arc<dyn ChatStore>,
	cache: Arc<dyn CacheBackend>,
	ttls: CacheTtls,
	generation: AtomicU64,
}

impl CachedStore {
	pub fn new(store: Arc<dyn ChatStore>, cache: Arc<dyn CacheBackend>, ttls: CacheTtls) -> Self {
		Self {
			store,
			cache,
			ttls,
			generation: AtomicU64::new(0),
		}
	}

	fn generation(&self) -> u64 {
		self.generation.load(Ordering::SeqCst)
	}

	/// Read-through fill of a value read from the store after `seen` was taken.
	async fn cache_fill<T: Serialize + ?Sized>(&self, key: String, value: &T, ttl: Duration, seen: u64) {
		if self.generation() != seen {
			metrics::counter!("huddle_server_cache_fills_skipped_total").increment(1);
			return;
		}
		self.cache_set(key.clone(), value, ttl).await;
		if self.generation() != seen {
			// An invalidation may have run between the check and the set.
			metrics::counter!("huddle_server_cache_fills_skipped_total").increment(1);
			if let Err(e) = self.cache.delete(std::slice::from_ref(&key)).await {
				warn!(key = %key, error = %e, "failed to drop raced cache fill; entry expires by ttl");
			}
		}
	}

	async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
		match self.cache.get(key).await {
			Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
				Ok(value) => {
					metrics::counter!("huddle_server_cache_hits_total").increment(1);
					Some(value)
				}
				Err(e) => {
					warn!(key = %key, error = %e, "dropping undecodable cache entry");
					metrics::counter!("huddle_server_cache_errors_total", "op" => "decode").increment(1);
					self.invalidate(vec![key.to_string()]).await;
					None
				}
			},
			Ok(None) => {
				metrics::counter!("huddle_server_cache_misses_total").increment(1);
				None
			}
			Err(e) => {
				warn!(key = %key, error = %e, "cache get failed; reading through");
				metrics::counter!("huddle_server_cache_errors_total", "op" => "get").increment(1);
				None
			}
		}
	}

	async fn cache_set<T: Serialize + ?Sized>(&self, key: String, value: &T, ttl: Duration) {
		let bytes = match serde_json::to_vec(value) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(key = %key, error = %e, "cache encode failed");
				metrics::counter!("huddle_server_cache_errors_total", "op" => "encode").increment(1);
				return;
			}
		};
		if let Err(e) = self.cache.set(&key, bytes, ttl).await {
			warn!(key = %key, error = %e, "cache set failed");
			metrics::counter!("huddle_server_cache_errors_total", "op" => "set").increment(1);
		}
	}

	async fn invalidate(&self, keys: Vec<String>) {
		if keys.is_empty() {
			return;
		}
		self.generation.fetch_add(1, Ordering::SeqCst);
		debug!(count = keys.len(), "invalidating cache keys");
		if let Err(e) = self.cache.delete(&keys).await {
			warn!(?keys, error = %e, "cache invalidation failed; entries expire by ttl");
			metrics::counter!("huddle_server_cache_errors_total", "op" => "delete").increment(1);
		}
	}
}

#[async_trait::async_trait]
impl ChatStore for CachedStore {
	async fn create_user(&self, user: &User) -> Result<(), StoreError> {
		self.store.create_user(user).await?;
		self.cache_set(keys::user(user.id), user, self.ttls.profile).await;
		Ok(())
	}

	async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		let key = keys::user(id);
		if let Some(user) = self.cache_get::<User>(&key).await {
			return Ok(Some(user));
		}
		let seen = self.generation();
		let user = self.store.get_user(id).await?;
		if let Some(user) = &user {
			self.cache_fill(key, user, self.ttls.profile, seen).await;
		}
		Ok(user)
	}

	async fn update_user_profile(&self, user: &User) -> Result<(), StoreError> {
		self.store.update_user_profile(user).await?;
		// Drop rather than overwrite: the caller's copy may carry a stale username.
		self.invalidate(vec![keys::user(user.id)]).await;
		Ok(())
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		self.store.create_room(room).await?;
		self.cache_set(keys::room(room.id), room, self.ttls.room).await;
		self.invalidate(keys::relationship(room.creator_id, room.id)).await;
		Ok(())
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		let key = keys::room(id);
		if let Some(room) = self.cache_get::<Room>(&key).await {
			return Ok(Some(room));
		}
		let seen = self.generation();
		let room = self.store.get_room(id).await?;
		if let Some(room) = &room {
			self.cache_fill(key, room, self.ttls.room, seen).await;
		}
		Ok(room)
	}

	async fn rename_room(&self, id: RoomId, name: &str) -> Result<(), StoreError> {
		self.store.rename_room(id, name).await?;
		self.invalidate(vec![keys::room(id)]).await;
		Ok(())
	}

	async fn delete_room(&self, id: RoomId) -> Result<(), StoreError> {
		// Read members from the store, not the cache: the list drives invalidation.
		let members = self.store.list_member_ids(id).await?;
		let messages = self.store.list_message_ids(id, usize::MAX, i64::MAX).await?;
		self.store.delete_room(id).await?;

		let mut stale = vec![keys::room(id), keys::room_members(id)];
		for user_id in members {
			stale.push(keys::user_rooms(user_id));
			stale.push(keys::membership(id, user_id));
		}
		stale.extend(messages.into_iter().map(keys::message));
		self.invalidate(stale).await;
		Ok(())
	}

	async fn add_membership(&self, user_id: UserId, room_id: RoomId, role: Role) -> Result<(), StoreError> {
		self.store.add_membership(user_id, room_id, role).await?;
		self.invalidate(keys::relationship(user_id, room_id)).await;
		Ok(())
	}

	async fn remove_membership(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError> {
		self.store.remove_membership(user_id, room_id).await?;
		self.invalidate(keys::relationship(user_id, room_id)).await;
		Ok(())
	}

	async fn get_membership(&self, user_id: UserId, room_id: RoomId) -> Result<Option<Role>, StoreError> {
		let key = keys::membership(room_id, user_id);
		if let Some(role) = self.cache_get::<Role>(&key).await {
			return Ok(Some(role));
		}
		let seen = self.generation();
		let role = self.store.get_membership(user_id, room_id).await?;
		if let Some(role) = role {
			self.cache_fill(key, &role, self.ttls.authz, seen).await;
		}
		Ok(role)
	}

	async fn list_room_ids_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
		let key = keys::user_rooms(user_id);
		if let Some(ids) = self.cache_get::<Vec<RoomId>>(&key).await {
			return Ok(ids);
		}
		let seen = self.generation();
		let ids = self.store.list_room_ids_for_user(user_id).await?;
		self.cache_fill(key, &ids, self.ttls.authz, seen).await;
		Ok(ids)
	}

	async fn list_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
		let key = keys::room_members(room_id);
		if let Some(ids) = self.cache_get::<Vec<UserId>>(&key).await {
			return Ok(ids);
		}
		let seen = self.generation();
		let ids = self.store.list_member_ids(room_id).await?;
		self.cache_fill(key, &ids, self.ttls.authz, seen).await;
		Ok(ids)
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		self.store.create_message(message).await?;
		self.cache_set(keys::message(message.id), message, self.ttls.message).await;
		Ok(())
	}

	async fn get_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
		let mut found: HashMap<MessageId, Message> = HashMap::with_capacity(ids.len());
		let mut missing = Vec::new();
		for id in ids {
			match self.cache_get::<Message>(&keys::message(*id)).await {
				Some(m) => {
					found.insert(*id, m);
				}
				None => missing.push(*id),
			}
		}

		if !missing.is_empty() {
			let seen = self.generation();
			for m in self.store.get_messages(&missing).await? {
				self.cache_fill(keys::message(m.id), &m, self.ttls.message, seen).await;
				found.insert(m.id, m);
			}
		}

		Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
	}

	async fn list_message_ids(&self, room_id: RoomId, limit: usize, before: i64) -> Result<Vec<MessageId>, StoreError> {
		self.store.list_message_ids(room_id, limit, before).await
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		self.store.delete_message(id).await?;
		self.invalidate(vec![keys::message(id)]).await;
		Ok(())
	}
}
