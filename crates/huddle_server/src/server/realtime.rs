#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use huddle_domain::{Message, MessageKind, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ChatError, StoreError, TokenError};
use crate::server::hub::{BroadcastReport, Connection, ConnectionIdentity, ConnectionSink, Hub, error_frame};
use crate::server::token::TokenAuthority;
use crate::store::ChatStore;
use crate::util::time::unix_ms_now;

/// Lifecycle of one realtime connection.
///
/// `Connecting -> Authenticated -> Registered -> Closed`; any state may move
/// straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Authenticated,
	Registered,
	Closed,
}

impl ConnectionState {
	pub fn can_transition_to(self, next: ConnectionState) -> bool {
		matches!(
			(self, next),
			(ConnectionState::Connecting, ConnectionState::Authenticated)
				| (ConnectionState::Authenticated, ConnectionState::Registered)
				| (ConnectionState::Connecting, ConnectionState::Closed)
				| (ConnectionState::Authenticated, ConnectionState::Closed)
				| (ConnectionState::Registered, ConnectionState::Closed)
		)
	}
}

/// Limits applied to inbound frames.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
	/// Maximum message length in characters.
	pub max_message_chars: usize,

	/// Latest messages sent as a `history` frame once a connection registers.
	/// 0 disables the frame.
	pub history_on_join: usize,
}

impl Default for RealtimeSettings {
	fn default() -> Self {
		Self {
			max_message_chars: 4000,
			history_on_join: 50,
		}
	}
}

/// `{"type": "history", "messages": [...]}`, oldest first.
#[derive(Serialize)]
struct HistoryFrame<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	messages: &'a [Message],
}

/// Inbound client frame: `{"content": "...", "type": "text"}`.
#[derive(Debug, Deserialize)]
struct InboundFrame {
	content: String,
	#[serde(rename = "type")]
	kind: String,
}

/// Authenticates realtime connections and turns inbound frames into persisted,
/// broadcast messages.
#[derive(Clone)]
pub struct RealtimeService {
	tokens: Arc<TokenAuthority>,
	store: Arc<dyn ChatStore>,
	hub: Hub,
	settings: RealtimeSettings,
}

impl RealtimeService {
	pub fn new(tokens: Arc<TokenAuthority>, store: Arc<dyn ChatStore>, hub: Hub, settings: RealtimeSettings) -> Self {
		Self {
			tokens,
			store,
			hub,
			settings,
		}
	}

	pub fn hub(&self) -> &Hub {
		&self.hub
	}

	/// Verify a connection token and register `sink` in the hub.
	///
	/// On error nothing is registered; the caller reports the error and closes
	/// the transport.
	pub async fn open(&self, token: &str, sink: Arc<dyn ConnectionSink>) -> Result<RealtimeSession, ChatError> {
		let mut state = ConnectionState::Connecting;

		let claims = match self.tokens.verify_connection_token(token) {
			Ok(c) => c,
			Err(e) => {
				let reason = match e {
					TokenError::Invalid => "invalid",
					TokenError::Expired => "expired",
				};
				metrics::counter!("huddle_server_realtime_auth_failed_total", "reason" => reason).increment(1);
				return Err(e.into());
			}
		};
		advance(&mut state, ConnectionState::Authenticated);

		let conn = self.hub.join(&claims, claims.room_id, claims.user_id, sink).await?;
		advance(&mut state, ConnectionState::Registered);

		info!(
			room = %claims.room_id,
			user = %claims.user_id,
			conn_id = conn.identity().conn_id,
			"realtime connection registered"
		);
		metrics::counter!("huddle_server_realtime_connections_total").increment(1);

		// Sent after registering: a message racing the join may show up twice
		// (clients dedupe by id) but never goes missing.
		self.send_history(&conn).await;

		Ok(RealtimeSession {
			service: self.clone(),
			conn,
			state,
		})
	}

	/// Persist a text message from `author` and broadcast it to the room.
	pub async fn post_text(
		&self,
		author: UserId,
		room_id: RoomId,
		content: String,
	) -> Result<(Message, BroadcastReport), ChatError> {
		self.validate_content(&content)?;
		self.publish(author, room_id, MessageKind::Text, content).await
	}

	/// Persist an image message whose bytes were uploaded out of band, then
	/// broadcast it. `url` is the stored object's address.
	pub async fn publish_image(
		&self,
		author: UserId,
		room_id: RoomId,
		url: String,
	) -> Result<(Message, BroadcastReport), ChatError> {
		if url.trim().is_empty() {
			return Err(ChatError::MalformedMessage("image url is empty".to_string()));
		}
		self.publish(author, room_id, MessageKind::Image, url).await
	}

	async fn send_history(&self, conn: &Connection) {
		let limit = self.settings.history_on_join;
		if limit == 0 {
			return;
		}

		let room_id = conn.identity().room_id;
		let messages = match self.latest_messages(room_id, limit).await {
			Ok(m) if m.is_empty() => return,
			Ok(m) => m,
			Err(e) => {
				warn!(room = %room_id, error = %e, "failed to load history for new connection");
				return;
			}
		};

		let frame = match serde_json::to_vec(&HistoryFrame {
			kind: "history",
			messages: &messages,
		}) {
			Ok(v) => Bytes::from(v),
			Err(e) => {
				warn!(room = %room_id, error = %e, "failed to encode history frame");
				return;
			}
		};
		if let Err(e) = conn.send(frame) {
			debug!(room = %room_id, conn_id = conn.identity().conn_id, error = %e, "history frame not queued");
		}
	}

	async fn latest_messages(&self, room_id: RoomId, limit: usize) -> Result<Vec<Message>, StoreError> {
		let ids = self.store.list_message_ids(room_id, limit, i64::MAX).await?;
		let mut messages = self.store.get_messages(&ids).await?;
		messages.sort_by_key(|m| m.timestamp);
		Ok(messages)
	}

	fn validate_content(&self, content: &str) -> Result<(), ChatError> {
		if content.trim().is_empty() {
			return Err(ChatError::MalformedMessage("content is empty".to_string()));
		}
		let chars = content.chars().count();
		if chars > self.settings.max_message_chars {
			return Err(ChatError::MalformedMessage(format!(
				"content is {chars} characters, limit is {}",
				self.settings.max_message_chars
			)));
		}
		Ok(())
	}

	async fn publish(
		&self,
		author: UserId,
		room_id: RoomId,
		kind: MessageKind,
		content: String,
	) -> Result<(Message, BroadcastReport), ChatError> {
		if self.store.get_membership(author, room_id).await?.is_none() {
			return Err(ChatError::NotAMember);
		}

		let message = Message::new(room_id, author, kind, content, unix_ms_now());
		if let Err(e) = self.store.create_message(&message).await {
			warn!(room = %room_id, user = %author, error = %e, "failed to persist message");
			metrics::counter!("huddle_server_messages_failed_total").increment(1);
			return Err(ChatError::Persist(e));
		}

		let report = self.hub.broadcast(&message).await;
		metrics::counter!("huddle_server_messages_total", "type" => kind.as_str()).increment(1);
		debug!(
			room = %room_id,
			message_id = %message.id,
			delivered = report.delivered,
			failed = report.failed,
			"message broadcast"
		);
		Ok((message, report))
	}
}

fn advance(state: &mut ConnectionState, next: ConnectionState) {
	debug_assert!(state.can_transition_to(next), "illegal transition {state:?} -> {next:?}");
	*state = next;
}

/// One registered realtime connection.
pub struct RealtimeSession {
	service: RealtimeService,
	conn: Connection,
	state: ConnectionState,
}

impl RealtimeSession {
	pub fn identity(&self) -> ConnectionIdentity {
		self.conn.identity()
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// Handle one inbound frame: validate, persist, broadcast.
	///
	/// The author is always the connection's user; a frame cannot speak for
	/// anyone else. On error nothing is persisted or broadcast.
	pub async fn handle_frame(&self, raw: &[u8]) -> Result<Message, ChatError> {
		let frame: InboundFrame = serde_json::from_slice(raw)
			.map_err(|e| ChatError::MalformedMessage(format!("expected {{\"content\", \"type\"}}: {e}")))?;

		match frame.kind.parse::<MessageKind>() {
			Ok(MessageKind::Text) => {}
			_ => {
				return Err(ChatError::MalformedMessage(format!(
					"unsupported message type {:?}",
					frame.kind
				)));
			}
		}

		let identity = self.conn.identity();
		let (message, _) = self
			.service
			.post_text(identity.user_id, identity.room_id, frame.content)
			.await?;
		Ok(message)
	}

	/// Queue `{"error": ...}` for this connection. Best effort.
	pub fn reject(&self, err: &ChatError) {
		let _ = self.conn.send(error_frame(&err.client_message()));
	}

	/// Unregister from the hub. Always safe to call, also after the hub already
	/// dropped the connection.
	pub async fn close(mut self) {
		let identity = self.conn.identity();
		self.service.hub.leave(&identity).await;
		advance(&mut self.state, ConnectionState::Closed);
		debug!(room = %identity.room_id, user = %identity.user_id, conn_id = identity.conn_id, "realtime connection closed");
	}
}
