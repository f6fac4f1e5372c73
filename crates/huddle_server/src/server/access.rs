#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::{Message, MessageId, Role, Room, RoomId, User, UserId};
use tracing::info;

use crate::error::{ChatError, StoreError};
use crate::server::hub::Hub;
use crate::server::token::TokenAuthority;
use crate::store::ChatStore;
use crate::util::time::unix_ms_now;

/// Reason sent to live connections of a user who left or was kicked.
pub const REMOVED_FROM_ROOM: &str = "removed from room";

/// Largest history page `recent_messages` returns.
pub const MAX_HISTORY_PAGE: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
	pub room_secs: i64,
	pub connection_secs: i64,
}

impl Default for TokenTtls {
	fn default() -> Self {
		Self {
			room_secs: 24 * 60 * 60,
			connection_secs: 5 * 60,
		}
	}
}

/// Privileged room operations.
///
/// Tokens are stateless, so every operation re-reads the caller's role from
/// the store (through the cache) instead of trusting the role in the token.
#[derive(Clone)]
pub struct AccessService {
	tokens: Arc<TokenAuthority>,
	store: Arc<dyn ChatStore>,
	hub: Hub,
	ttls: TokenTtls,
}

impl AccessService {
	pub fn new(tokens: Arc<TokenAuthority>, store: Arc<dyn ChatStore>, hub: Hub, ttls: TokenTtls) -> Self {
		Self {
			tokens,
			store,
			hub,
			ttls,
		}
	}

	async fn current_role(&self, user: UserId, room: RoomId) -> Result<Role, ChatError> {
		self.store.get_membership(user, room).await?.ok_or(ChatError::NotAMember)
	}

	/// Issue a room token carrying `user`'s current role in `room`.
	pub async fn issue_room_token(&self, user: UserId, room: RoomId) -> Result<String, ChatError> {
		let role = self.current_role(user, room).await?;
		Ok(self.tokens.issue_room_token(room, role, self.ttls.room_secs)?)
	}

	/// Issue a short-lived token that authorizes opening one realtime connection.
	pub async fn issue_connection_token(&self, user: UserId, room: RoomId) -> Result<String, ChatError> {
		self.current_role(user, room).await?;
		Ok(self.tokens.issue_connection_token(user, room, self.ttls.connection_secs)?)
	}

	/// Trade a room token for a connection token. Membership is re-read, so a
	/// token outliving a kick buys nothing.
	pub async fn exchange_connection_token(
		&self,
		room_token: &str,
		user: UserId,
		room: RoomId,
	) -> Result<String, ChatError> {
		self.authorize(room_token, user, room, Role::Member).await?;
		Ok(self.tokens.issue_connection_token(user, room, self.ttls.connection_secs)?)
	}

	/// Verify `room_token` for `room` and check that `user` currently holds at
	/// least `required`. Returns the user's current role.
	pub async fn authorize(
		&self,
		room_token: &str,
		user: UserId,
		room: RoomId,
		required: Role,
	) -> Result<Role, ChatError> {
		let claims = self.tokens.verify_room_token(room_token)?;
		if claims.room_id != room {
			return Err(ChatError::InvalidToken);
		}

		let role = self.current_role(user, room).await?;
		if !role.satisfies(required) {
			return Err(ChatError::InsufficientRole);
		}
		Ok(role)
	}

	pub async fn create_room(&self, creator: UserId, name: &str) -> Result<Room, ChatError> {
		let name = validate_room_name(name)?;
		let room = Room::new(name, creator, unix_ms_now());
		self.store.create_room(&room).await?;
		info!(room = %room.id, user = %creator, "room created");
		Ok(room)
	}

	pub async fn rename_room(&self, room_token: &str, user: UserId, room: RoomId, name: &str) -> Result<(), ChatError> {
		self.authorize(room_token, user, room, Role::Creator).await?;
		let name = validate_room_name(name)?;
		self.store.rename_room(room, name).await?;
		Ok(())
	}

	/// Add `user` to `room` as a member.
	pub async fn join_room(&self, user: UserId, room: RoomId) -> Result<Room, ChatError> {
		let room = self.store.get_room(room).await?.ok_or(StoreError::NotFound("room"))?;
		self.store.add_membership(user, room.id, Role::Member).await?;
		info!(room = %room.id, user = %user, "member joined");
		Ok(room)
	}

	/// Remove `user`'s own membership and close their live connections.
	pub async fn leave_room(&self, room_token: &str, user: UserId, room: RoomId) -> Result<(), ChatError> {
		let role = self.authorize(room_token, user, room, Role::Member).await?;
		if role == Role::Creator {
			return Err(ChatError::CreatorImmutable);
		}

		self.store.remove_membership(user, room).await?;
		let closed = self.hub.disconnect_user(room, user, REMOVED_FROM_ROOM).await;
		info!(room = %room, user = %user, closed, "member left");
		Ok(())
	}

	/// Remove `target` from `room`. Creator only; the creator cannot be kicked.
	pub async fn kick_member(
		&self,
		room_token: &str,
		actor: UserId,
		room: RoomId,
		target: UserId,
	) -> Result<(), ChatError> {
		self.authorize(room_token, actor, room, Role::Creator).await?;
		match self.store.get_membership(target, room).await? {
			None => return Err(ChatError::NotAMember),
			Some(Role::Creator) => return Err(ChatError::CreatorImmutable),
			Some(Role::Member) => {}
		}

		match self.store.remove_membership(target, room).await {
			Ok(()) => {}
			Err(StoreError::NotFound(_)) => return Err(ChatError::NotAMember),
			Err(e) => return Err(e.into()),
		}
		let closed = self.hub.disconnect_user(room, target, REMOVED_FROM_ROOM).await;
		info!(room = %room, actor = %actor, target = %target, closed, "member kicked");
		Ok(())
	}

	/// Administrative delete of a message in `room`. Creator only.
	pub async fn delete_message(
		&self,
		room_token: &str,
		actor: UserId,
		room: RoomId,
		message: MessageId,
	) -> Result<(), ChatError> {
		self.authorize(room_token, actor, room, Role::Creator).await?;
		let found = self.store.get_messages(&[message]).await?;
		if !found.iter().any(|m| m.room_id == room) {
			return Err(StoreError::NotFound("message").into());
		}
		self.store.delete_message(message).await?;
		info!(room = %room, actor = %actor, message = %message, "message deleted");
		Ok(())
	}

	/// Newest-first page of messages older than `before` (Unix ms), or the
	/// latest messages when `before` is `None`.
	pub async fn recent_messages(
		&self,
		room_token: &str,
		user: UserId,
		room: RoomId,
		limit: usize,
		before: Option<i64>,
	) -> Result<Vec<Message>, ChatError> {
		self.authorize(room_token, user, room, Role::Member).await?;

		let limit = limit.clamp(1, MAX_HISTORY_PAGE);
		let ids = self
			.store
			.list_message_ids(room, limit, before.unwrap_or(i64::MAX))
			.await?;
		let mut by_id = self
			.store
			.get_messages(&ids)
			.await?
			.into_iter()
			.map(|m| (m.id, m))
			.collect::<HashMap<_, _>>();
		Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
	}

	/// Update the caller's nickname and avatar.
	pub async fn update_profile(&self, user: &User) -> Result<(), ChatError> {
		if user.nickname.trim().is_empty() {
			return Err(ChatError::MalformedMessage("nickname is empty".to_string()));
		}
		self.store.update_user_profile(user).await?;
		Ok(())
	}
}

fn validate_room_name(name: &str) -> Result<&str, ChatError> {
	let name = name.trim();
	if name.is_empty() {
		return Err(ChatError::MalformedMessage("room name is empty".to_string()));
	}
	Ok(name)
}
