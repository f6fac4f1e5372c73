#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use huddle_domain::{MessageId, RoomId, UserId};
use parking_lot::Mutex;

use crate::error::CacheError;

/// Key/value cache with per-entry TTL. Values are opaque bytes.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

	async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Expiry per cached entity kind.
///
/// Authorization-relevant entries (memberships, relationship lists) stay short
/// so that a missed invalidation heals quickly. Profiles and messages rarely
/// change and are invalidated on every write, so they may live longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
	pub authz: Duration,
	pub room: Duration,
	pub profile: Duration,
	pub message: Duration,
}

impl Default for CacheTtls {
	fn default() -> Self {
		Self {
			authz: Duration::from_secs(10),
			room: Duration::from_secs(10),
			profile: Duration::from_secs(30 * 60),
			message: Duration::from_secs(60 * 60),
		}
	}
}

pub mod keys {
	use super::*;

	pub fn user(id: UserId) -> String {
		format!("user:{id}")
	}

	pub fn room(id: RoomId) -> String {
		format!("room:{id}")
	}

	pub fn message(id: MessageId) -> String {
		format!("msg:{id}")
	}

	pub fn user_rooms(id: UserId) -> String {
		format!("user:{id}:rooms")
	}

	pub fn room_members(id: RoomId) -> String {
		format!("room:{id}:members")
	}

	pub fn membership(room_id: RoomId, user_id: UserId) -> String {
		format!("membership:{room_id}:{user_id}")
	}

	/// Every key whose value depends on the `(user, room)` relationship.
	pub fn relationship(user_id: UserId, room_id: RoomId) -> Vec<String> {
		vec![room_members(room_id), user_rooms(user_id), membership(room_id, user_id)]
	}
}

#[derive(Debug)]
struct CacheSlot {
	value: Vec<u8>,
	expires_at: Instant,
}

/// Process-local cache bounded by entry count.
#[derive(Debug)]
pub struct MemoryCache {
	entries: Mutex<HashMap<String, CacheSlot>>,
	max_entries: usize,
}

impl MemoryCache {
	pub fn new(max_entries: usize) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			max_entries: max_entries.max(1),
		}
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
		let mut entries = self.entries.lock();
		let now = Instant::now();
		match entries.get(key) {
			Some(slot) if slot.expires_at > now => Ok(Some(slot.value.clone())),
			Some(_) => {
				entries.remove(key);
				Ok(None)
			}
			None => Ok(None),
		}
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
		let mut entries = self.entries.lock();
		let now = Instant::now();

		if entries.len() >= self.max_entries && !entries.contains_key(key) {
			entries.retain(|_, slot| slot.expires_at > now);
			if entries.len() >= self.max_entries {
				let victim = entries
					.iter()
					.min_by_key(|(_, slot)| slot.expires_at)
					.map(|(k, _)| k.clone());
				if let Some(victim) = victim {
					entries.remove(&victim);
				}
			}
		}

		entries.insert(
			key.to_string(),
			CacheSlot {
				value,
				expires_at: now + ttl,
			},
		);
		Ok(())
	}

	async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
		let mut entries = self.entries.lock();
		for key in keys {
			entries.remove(key);
		}
		Ok(())
	}
}

/// Cache that never stores anything. Used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait::async_trait]
impl CacheBackend for NoopCache {
	async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
		Ok(None)
	}

	async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
		Ok(())
	}

	async fn delete(&self, _keys: &[String]) -> Result<(), CacheError> {
		Ok(())
	}
}
