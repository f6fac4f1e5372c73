#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers and enumerations from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown message type: {0}")]
	UnknownMessageKind(String),
}

macro_rules! uuid_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl $name {
			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(Uuid::new_v4())
			}

			pub const fn from_uuid(id: Uuid) -> Self {
				Self(id)
			}

			pub const fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				Uuid::parse_str(s)
					.map(Self)
					.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
			}
		}

		impl From<Uuid> for $name {
			fn from(id: Uuid) -> Self {
				Self(id)
			}
		}
	};
}

uuid_id!(
	/// User identifier.
	UserId
);

uuid_id!(
	/// Room identifier (a chat group, called "session" in older clients).
	RoomId
);

uuid_id!(
	/// Server-assigned message identifier.
	MessageId
);

/// Role of a user inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Creator,
	Member,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Creator => "creator",
			Role::Member => "member",
		}
	}

	/// Whether this role may perform actions that require `required`.
	///
	/// `Creator` covers everything a `Member` can do.
	pub const fn satisfies(self, required: Role) -> bool {
		match (self, required) {
			(Role::Creator, _) => true,
			(Role::Member, Role::Member) => true,
			(Role::Member, Role::Creator) => false,
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"creator" => Ok(Role::Creator),
			"member" => Ok(Role::Member),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Content type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	/// Authored live over the realtime channel.
	Text,
	/// Uploaded out of band; `content` holds the object URL.
	Image,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::Image => "image",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"text" => Ok(MessageKind::Text),
			"image" => Ok(MessageKind::Image),
			other => Err(ParseIdError::UnknownMessageKind(other.to_string())),
		}
	}
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub creator_id: UserId,
	pub created_at: i64,
}

impl Room {
	pub fn new(name: impl Into<String>, creator_id: UserId, created_at: i64) -> Self {
		Self {
			id: RoomId::new_v4(),
			name: name.into(),
			creator_id,
			created_at,
		}
	}
}

/// Display profile of a user. Credentials live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub id: UserId,
	pub username: String,
	pub nickname: String,
	#[serde(default)]
	pub avatar_url: Option<String>,
}

/// `(user, room, role)` relationship record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
	pub user_id: UserId,
	pub room_id: RoomId,
	pub role: Role,
	pub joined_at: i64,
}

/// A persisted chat message. This is also the outbound realtime frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub room_id: RoomId,
	pub user_id: UserId,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageKind,
	/// Unix time in milliseconds.
	pub timestamp: i64,
}

impl Message {
	pub fn new(room_id: RoomId, user_id: UserId, kind: MessageKind, content: impl Into<String>, timestamp: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			room_id,
			user_id,
			content: content.into(),
			kind,
			timestamp,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn role_parse_and_display() {
		assert_eq!("creator".parse::<Role>().unwrap(), Role::Creator);
		assert_eq!(" Member ".parse::<Role>().unwrap(), Role::Member);
		assert_eq!(Role::Creator.to_string(), "creator");
		assert!(matches!("admin".parse::<Role>(), Err(ParseIdError::UnknownRole(_))));
	}

	#[test]
	fn creator_satisfies_member_but_not_the_reverse() {
		assert!(Role::Creator.satisfies(Role::Member));
		assert!(Role::Creator.satisfies(Role::Creator));
		assert!(Role::Member.satisfies(Role::Member));
		assert!(!Role::Member.satisfies(Role::Creator));
	}

	#[test]
	fn ids_parse_roundtrip() {
		let id = RoomId::new_v4();
		assert_eq!(id.to_string().parse::<RoomId>().unwrap(), id);
		assert_eq!("".parse::<UserId>(), Err(ParseIdError::Empty));
		assert!("not-a-uuid".parse::<MessageId>().is_err());
	}

	#[test]
	fn message_serializes_with_wire_field_names() {
		let msg = Message::new(RoomId::new_v4(), UserId::new_v4(), MessageKind::Text, "hi", 1_700_000_000_000);
		let v = serde_json::to_value(&msg).unwrap();

		assert_eq!(v["id"], msg.id.to_string());
		assert_eq!(v["roomId"], msg.room_id.to_string());
		assert_eq!(v["userId"], msg.user_id.to_string());
		assert_eq!(v["content"], "hi");
		assert_eq!(v["type"], "text");
		assert_eq!(v["timestamp"], 1_700_000_000_000i64);
	}

	#[test]
	fn message_kind_rejects_unknown_values() {
		assert_eq!("image".parse::<MessageKind>().unwrap(), MessageKind::Image);
		assert!(matches!(
			"video".parse::<MessageKind>(),
			Err(ParseIdError::UnknownMessageKind(_))
		));
	}
}
