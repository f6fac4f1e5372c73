#![forbid(unsafe_code)]

//! Fixtures shared by the unit test modules.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use huddle_domain::{Message, MessageId, Role, Room, RoomId, User, UserId};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CacheError, StoreError};
use crate::server::access::{AccessService, TokenTtls};
use crate::server::hub::{ConnectionSink, Hub, HubConfig, SinkError};
use crate::server::realtime::{RealtimeService, RealtimeSession, RealtimeSettings};
use crate::server::token::TokenAuthority;
use crate::store::{CacheBackend, CacheTtls, CachedStore, ChatStore, MemoryCache, MemoryStore, NoopCache};
use crate::util::time::unix_ms_now;

pub(crate) const TEST_SECRET: &str = "huddle-test-secret";

/// Opt into log output with `HUDDLE_TEST_LOG=1`.
pub(crate) fn init_test_logging() {
	if std::env::var_os("HUDDLE_TEST_LOG").is_some() {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
			.with_test_writer()
			.try_init();
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheMode {
	Memory,
	AlwaysMiss,
}

pub(crate) const CACHE_MODES: [CacheMode; 2] = [CacheMode::Memory, CacheMode::AlwaysMiss];

/// Sink that records frames in memory.
#[derive(Default)]
pub(crate) struct RecordingSink {
	frames: Mutex<Vec<Bytes>>,
	closed: AtomicBool,
	fail_with: Mutex<Option<SinkError>>,
}

impl RecordingSink {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// A sink whose every send fails with `err`.
	pub(crate) fn failing(err: SinkError) -> Arc<Self> {
		let sink = Self::default();
		*sink.fail_with.lock() = Some(err);
		Arc::new(sink)
	}

	pub(crate) fn messages(&self) -> Vec<Message> {
		self.frames
			.lock()
			.iter()
			.filter_map(|f| serde_json::from_slice::<Message>(f).ok())
			.collect()
	}

	pub(crate) fn errors(&self) -> Vec<String> {
		self.frames
			.lock()
			.iter()
			.filter_map(|f| serde_json::from_slice::<serde_json::Value>(f).ok())
			.filter_map(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
			.collect()
	}

	/// Messages of every `history` frame received, in order.
	pub(crate) fn history(&self) -> Vec<Vec<Message>> {
		self.frames
			.lock()
			.iter()
			.filter_map(|f| serde_json::from_slice::<serde_json::Value>(f).ok())
			.filter(|v| v.get("type").and_then(|t| t.as_str()) == Some("history"))
			.filter_map(|v| serde_json::from_value::<Vec<Message>>(v.get("messages")?.clone()).ok())
			.collect()
	}

	pub(crate) fn frame_count(&self) -> usize {
		self.frames.lock().len()
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

impl ConnectionSink for RecordingSink {
	fn send(&self, frame: Bytes) -> Result<(), SinkError> {
		if self.is_closed() {
			return Err(SinkError::Closed);
		}
		if let Some(err) = *self.fail_with.lock() {
			return Err(err);
		}
		self.frames.lock().push(frame);
		Ok(())
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Cache whose backend is always down.
pub(crate) struct FailingCache;

#[async_trait::async_trait]
impl CacheBackend for FailingCache {
	async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
		Err(CacheError::Backend("cache unavailable".to_string()))
	}

	async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
		Err(CacheError::Backend("cache unavailable".to_string()))
	}

	async fn delete(&self, _keys: &[String]) -> Result<(), CacheError> {
		Err(CacheError::Backend("cache unavailable".to_string()))
	}
}

type MembershipGate = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// Memory store whose message writes can be made to fail and whose next
/// membership read can be held open.
#[derive(Default)]
pub(crate) struct FlakyStore {
	inner: MemoryStore,
	fail_message_writes: AtomicBool,
	membership_gate: Mutex<Option<MembershipGate>>,
}

impl FlakyStore {
	/// Hold the next `get_membership` after it has read the row. Returns a
	/// receiver that fires once the read is held and a sender that lets it
	/// finish with the value it read.
	pub(crate) fn hold_next_membership_read(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
		let (held_tx, held_rx) = oneshot::channel();
		let (release_tx, release_rx) = oneshot::channel();
		*self.membership_gate.lock() = Some((held_tx, release_rx));
		(held_rx, release_tx)
	}

	pub(crate) fn fail_message_writes(&self, fail: bool) {
		self.fail_message_writes.store(fail, Ordering::SeqCst);
	}

	pub(crate) async fn message_count(&self, room: RoomId) -> usize {
		self.inner
			.list_message_ids(room, usize::MAX, i64::MAX)
			.await
			.map(|ids| ids.len())
			.unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl ChatStore for FlakyStore {
	async fn create_user(&self, user: &User) -> Result<(), StoreError> {
		self.inner.create_user(user).await
	}

	async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		self.inner.get_user(id).await
	}

	async fn update_user_profile(&self, user: &User) -> Result<(), StoreError> {
		self.inner.update_user_profile(user).await
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		self.inner.create_room(room).await
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		self.inner.get_room(id).await
	}

	async fn rename_room(&self, id: RoomId, name: &str) -> Result<(), StoreError> {
		self.inner.rename_room(id, name).await
	}

	async fn delete_room(&self, id: RoomId) -> Result<(), StoreError> {
		self.inner.delete_room(id).await
	}

	async fn add_membership(&self, user_id: UserId, room_id: RoomId, role: Role) -> Result<(), StoreError> {
		self.inner.add_membership(user_id, room_id, role).await
	}

	async fn remove_membership(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError> {
		self.inner.remove_membership(user_id, room_id).await
	}

	async fn get_membership(&self, user_id: UserId, room_id: RoomId) -> Result<Option<Role>, StoreError> {
		let role = self.inner.get_membership(user_id, room_id).await;
		let gate = self.membership_gate.lock().take();
		if let Some((held, release)) = gate {
			let _ = held.send(());
			let _ = release.await;
		}
		role
	}

	async fn list_room_ids_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
		self.inner.list_room_ids_for_user(user_id).await
	}

	async fn list_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
		self.inner.list_member_ids(room_id).await
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		if self.fail_message_writes.load(Ordering::SeqCst) {
			return Err(StoreError::Backend(anyhow::anyhow!("disk full")));
		}
		self.inner.create_message(message).await
	}

	async fn get_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
		self.inner.get_messages(ids).await
	}

	async fn list_message_ids(&self, room_id: RoomId, limit: usize, before: i64) -> Result<Vec<MessageId>, StoreError> {
		self.inner.list_message_ids(room_id, limit, before).await
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		self.inner.delete_message(id).await
	}
}

/// Fully wired services over a `FlakyStore` and the chosen cache.
pub(crate) struct Fixture {
	pub durable: Arc<FlakyStore>,
	pub store: Arc<dyn ChatStore>,
	pub tokens: Arc<TokenAuthority>,
	pub hub: Hub,
	pub realtime: RealtimeService,
	pub access: AccessService,
}

impl Fixture {
	pub(crate) fn new(mode: CacheMode) -> Self {
		init_test_logging();

		let durable = Arc::new(FlakyStore::default());
		let cache: Arc<dyn CacheBackend> = match mode {
			CacheMode::Memory => Arc::new(MemoryCache::new(1024)),
			CacheMode::AlwaysMiss => Arc::new(NoopCache),
		};
		let store: Arc<dyn ChatStore> = Arc::new(CachedStore::new(durable.clone(), cache, CacheTtls::default()));
		let tokens = Arc::new(TokenAuthority::new(TEST_SECRET));
		let hub = Hub::new(store.clone(), HubConfig { debug_logs: true });
		let realtime = RealtimeService::new(tokens.clone(), store.clone(), hub.clone(), RealtimeSettings::default());
		let access = AccessService::new(tokens.clone(), store.clone(), hub.clone(), TokenTtls::default());

		Self {
			durable,
			store,
			tokens,
			hub,
			realtime,
			access,
		}
	}

	/// A room with a creator and `members` additional members.
	pub(crate) async fn room_with_members(&self, members: usize) -> (Room, UserId, Vec<UserId>) {
		let creator = UserId::new_v4();
		let room = Room::new("general", creator, unix_ms_now());
		self.store.create_room(&room).await.expect("create room");

		let mut ids = Vec::with_capacity(members);
		for _ in 0..members {
			let user = UserId::new_v4();
			self.store
				.add_membership(user, room.id, Role::Member)
				.await
				.expect("add member");
			ids.push(user);
		}
		(room, creator, ids)
	}

	pub(crate) fn connection_token(&self, user: UserId, room: RoomId) -> String {
		self.tokens.issue_connection_token(user, room, 300).expect("issue token")
	}

	pub(crate) fn room_token(&self, room: RoomId, role: Role) -> String {
		self.tokens.issue_room_token(room, role, 3600).expect("issue token")
	}

	/// Open a realtime session for `user` in `room` with a recording sink.
	pub(crate) async fn connect(&self, user: UserId, room: RoomId) -> (RealtimeSession, Arc<RecordingSink>) {
		let sink = RecordingSink::new();
		let session = self
			.realtime
			.open(&self.connection_token(user, room), sink.clone())
			.await
			.expect("open session");
		(session, sink)
	}
}
