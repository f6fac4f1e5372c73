#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use huddle_domain::{Message, RoomId, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::server::token::ConnectionClaims;
use crate::store::ChatStore;

pub type ConnectionId = u64;

/// Why a frame could not be queued on a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
	#[error("outbound queue is full")]
	Full,

	#[error("connection is closed")]
	Closed,
}

/// Outbound side of one realtime connection.
///
/// `send` must not block: slow consumers report `Full` and get dropped by the
/// hub rather than holding up the rest of the room.
pub trait ConnectionSink: Send + Sync + 'static {
	fn send(&self, frame: Bytes) -> Result<(), SinkError>;

	/// Stop accepting frames and close the transport after queued frames drain.
	fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
	pub conn_id: ConnectionId,
	pub room_id: RoomId,
	pub user_id: UserId,
}

/// A registered connection. Cheap to clone; clones share the sink.
#[derive(Clone)]
pub struct Connection {
	identity: ConnectionIdentity,
	sink: Arc<dyn ConnectionSink>,
	/// False while `join` confirms membership; broadcasts skip it until then.
	admitted: Arc<AtomicBool>,
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection").field("identity", &self.identity).finish_non_exhaustive()
	}
}

impl Connection {
	pub fn identity(&self) -> ConnectionIdentity {
		self.identity
	}

	pub fn send(&self, frame: Bytes) -> Result<(), SinkError> {
		self.sink.send(frame)
	}

	pub fn close(&self) {
		self.sink.close();
	}

	fn is_admitted(&self) -> bool {
		self.admitted.load(Ordering::Acquire)
	}
}

/// Configuration for `Hub`.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub debug_logs: bool,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub failed: usize,
}

/// Per-room registry of live connections, keyed by user.
///
/// A user may hold several connections (devices) in the same room. Rooms are
/// created lazily on first join and dropped when their last connection leaves.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

struct HubInner {
	rooms: RwLock<HashMap<RoomId, Arc<RoomRegistry>>>,
	next_conn_id: AtomicU64,
	store: Arc<dyn ChatStore>,
	cfg: HubConfig,
}

#[derive(Default)]
struct RoomRegistry {
	state: RwLock<RoomState>,
}

#[derive(Default)]
struct RoomState {
	members: HashMap<UserId, Vec<Connection>>,

	/// Set once the room emptied and is being unlinked from the hub. A joiner
	/// that observes it must fetch a fresh registry.
	retired: bool,
}

impl RoomState {
	fn connection_count(&self) -> usize {
		self.members.values().map(Vec::len).sum()
	}

	fn remove(&mut self, identity: &ConnectionIdentity) -> bool {
		let Some(conns) = self.members.get_mut(&identity.user_id) else {
			return false;
		};
		let before = conns.len();
		conns.retain(|c| c.identity.conn_id != identity.conn_id);
		let removed = conns.len() != before;
		if conns.is_empty() {
			self.members.remove(&identity.user_id);
		}
		removed
	}
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
	error: &'a str,
}

/// Serialized `{"error": reason}` frame.
pub fn error_frame(reason: &str) -> Bytes {
	// Serializing a single string field cannot fail.
	Bytes::from(serde_json::to_vec(&ErrorFrame { error: reason }).unwrap_or_default())
}

impl Hub {
	pub fn new(store: Arc<dyn ChatStore>, cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(HubInner {
				rooms: RwLock::new(HashMap::new()),
				next_conn_id: AtomicU64::new(1),
				store,
				cfg,
			}),
		}
	}

	/// Register a connection for `(room_id, user_id)`.
	///
	/// The claims must name the same room and user. Membership is re-checked
	/// against the store, so a user removed after the token was issued cannot
	/// join. Membership is read again after the insert and the connection only
	/// receives broadcasts once that second read succeeds; a removal racing
	/// the join therefore never leaves the user registered. On error the
	/// connection is not registered.
	pub async fn join(
		&self,
		claims: &ConnectionClaims,
		room_id: RoomId,
		user_id: UserId,
		sink: Arc<dyn ConnectionSink>,
	) -> Result<Connection, ChatError> {
		if claims.room_id != room_id || claims.user_id != user_id {
			metrics::counter!("huddle_server_hub_join_rejected_total", "reason" => "claims").increment(1);
			return Err(ChatError::InvalidToken);
		}

		if self.inner.store.get_membership(user_id, room_id).await?.is_none() {
			metrics::counter!("huddle_server_hub_join_rejected_total", "reason" => "not_member").increment(1);
			return Err(ChatError::NotAMember);
		}

		let conn = Connection {
			identity: ConnectionIdentity {
				conn_id: self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed),
				room_id,
				user_id,
			},
			sink,
			admitted: Arc::new(AtomicBool::new(false)),
		};

		loop {
			let registry = self.registry_for_join(room_id).await;
			let mut state = registry.state.write().await;
			if state.retired {
				continue;
			}
			state.members.entry(user_id).or_default().push(conn.clone());
			break;
		}

		// A kick that landed between the first check and the insert found
		// nothing to disconnect; look again now that the connection is visible.
		let still_member = match self.inner.store.get_membership(user_id, room_id).await {
			Ok(role) => role.is_some(),
			Err(e) => {
				self.leave(&conn.identity).await;
				return Err(e.into());
			}
		};
		if !still_member {
			self.leave(&conn.identity).await;
			metrics::counter!("huddle_server_hub_join_rejected_total", "reason" => "removed_during_join").increment(1);
			return Err(ChatError::NotAMember);
		}
		conn.admitted.store(true, Ordering::Release);

		if self.inner.cfg.debug_logs {
			debug!(
				room = %room_id,
				user = %user_id,
				conn_id = conn.identity.conn_id,
				"hub: joined"
			);
		}

		metrics::counter!("huddle_server_hub_joins_total").increment(1);
		Ok(conn)
	}

	async fn registry_for_join(&self, room_id: RoomId) -> Arc<RoomRegistry> {
		if let Some(registry) = self.inner.rooms.read().await.get(&room_id) {
			return registry.clone();
		}
		let mut rooms = self.inner.rooms.write().await;
		rooms.entry(room_id).or_default().clone()
	}

	/// Unregister exactly this connection. Returns whether it was registered.
	/// Idempotent.
	pub async fn leave(&self, identity: &ConnectionIdentity) -> bool {
		let Some(registry) = self.inner.rooms.read().await.get(&identity.room_id).cloned() else {
			return false;
		};

		let (removed, emptied) = {
			let mut state = registry.state.write().await;
			let removed = state.remove(identity);
			let emptied = state.members.is_empty() && !state.retired;
			if emptied {
				state.retired = true;
			}
			(removed, emptied)
		};

		if emptied {
			self.unlink(identity.room_id, &registry).await;
		}

		if removed {
			metrics::counter!("huddle_server_hub_leaves_total").increment(1);
			if self.inner.cfg.debug_logs {
				debug!(room = %identity.room_id, user = %identity.user_id, conn_id = identity.conn_id, "hub: left");
			}
		}
		removed
	}

	async fn unlink(&self, room_id: RoomId, registry: &Arc<RoomRegistry>) {
		let mut rooms = self.inner.rooms.write().await;
		if rooms.get(&room_id).is_some_and(|r| Arc::ptr_eq(r, registry)) {
			rooms.remove(&room_id);
			if self.inner.cfg.debug_logs {
				debug!(room = %room_id, "hub: room dropped");
			}
		}
	}

	/// Deliver `message` to every connection registered in `message.room_id`,
	/// the author's own connections included.
	///
	/// Connections whose queue is full or closed are unregistered and closed.
	/// Delivery to the rest is unaffected.
	pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
		let frame = match serde_json::to_vec(message) {
			Ok(v) => Bytes::from(v),
			Err(e) => {
				warn!(error = %e, message_id = %message.id, "hub: failed to encode message");
				return BroadcastReport::default();
			}
		};
		self.broadcast_frame(message.room_id, frame).await
	}

	/// Deliver a pre-encoded frame to every connection in `room_id`.
	pub async fn broadcast_frame(&self, room_id: RoomId, frame: Bytes) -> BroadcastReport {
		let Some(registry) = self.inner.rooms.read().await.get(&room_id).cloned() else {
			return BroadcastReport::default();
		};

		let mut report = BroadcastReport::default();
		let mut failed = Vec::new();
		{
			let state = registry.state.read().await;
			for conn in state.members.values().flatten().filter(|c| c.is_admitted()) {
				match conn.send(frame.clone()) {
					Ok(()) => report.delivered += 1,
					Err(e) => {
						report.failed += 1;
						failed.push((conn.clone(), e));
					}
				}
			}
		}

		metrics::counter!("huddle_server_hub_frames_delivered_total").increment(report.delivered as u64);
		if !failed.is_empty() {
			metrics::counter!("huddle_server_hub_frames_failed_total").increment(report.failed as u64);
		}

		for (conn, err) in failed {
			let identity = conn.identity;
			warn!(room = %room_id, user = %identity.user_id, conn_id = identity.conn_id, error = %err, "hub: dropping connection");
			let hub = self.clone();
			tokio::spawn(async move {
				hub.leave(&identity).await;
				conn.close();
			});
		}

		report
	}

	/// Unregister and close every connection of `user_id` in `room_id`, sending
	/// `{"error": reason}` first. Returns the number of connections closed.
	pub async fn disconnect_user(&self, room_id: RoomId, user_id: UserId, reason: &str) -> usize {
		let Some(registry) = self.inner.rooms.read().await.get(&room_id).cloned() else {
			return 0;
		};

		let (conns, emptied) = {
			let mut state = registry.state.write().await;
			let conns = state.members.remove(&user_id).unwrap_or_default();
			let emptied = state.members.is_empty() && !state.retired;
			if emptied {
				state.retired = true;
			}
			(conns, emptied)
		};

		if emptied {
			self.unlink(room_id, &registry).await;
		}

		let frame = error_frame(reason);
		for conn in &conns {
			let _ = conn.send(frame.clone());
			conn.close();
		}

		if !conns.is_empty() {
			info!(room = %room_id, user = %user_id, conns = conns.len(), reason, "hub: disconnected user");
			metrics::counter!("huddle_server_hub_forced_disconnects_total").increment(conns.len() as u64);
		}
		conns.len()
	}

	/// Number of rooms with at least one registered connection.
	pub async fn room_count(&self) -> usize {
		self.inner.rooms.read().await.len()
	}

	pub async fn connection_count(&self, room_id: RoomId) -> usize {
		let Some(registry) = self.inner.rooms.read().await.get(&room_id).cloned() else {
			return 0;
		};
		registry.state.read().await.connection_count()
	}

	pub async fn is_registered(&self, identity: &ConnectionIdentity) -> bool {
		let Some(registry) = self.inner.rooms.read().await.get(&identity.room_id).cloned() else {
			return false;
		};
		let state = registry.state.read().await;
		state
			.members
			.get(&identity.user_id)
			.is_some_and(|conns| conns.iter().any(|c| c.identity.conn_id == identity.conn_id))
	}

	/// Snapshot of connection counts per room.
	pub async fn room_connection_counts(&self) -> HashMap<RoomId, usize> {
		let registries = self
			.inner
			.rooms
			.read()
			.await
			.iter()
			.map(|(id, r)| (*id, r.clone()))
			.collect::<Vec<_>>();

		let mut out = HashMap::with_capacity(registries.len());
		for (id, registry) in registries {
			out.insert(id, registry.state.read().await.connection_count());
		}
		out
	}
}
