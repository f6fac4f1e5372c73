#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use huddle_domain::{Message, MessageId, ParseIdError, Role, Room, RoomId, User, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::ChatStore;
use crate::error::StoreError;
use crate::util::time::unix_ms_now;

type UserRow = (String, String, String, Option<String>);
type RoomRow = (String, String, String, i64);
type MessageRow = (String, String, String, String, String, i64);

/// Durable store over SQLite or Postgres, picked by `database_url` scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// An in-memory database lives and dies with its single connection.
			let pool = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect_with(opts)
					.await
			} else {
				SqlitePoolOptions::new().connect_with(opts).await
			}
			.context("connect sqlite")?;

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;

			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (expected sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
		}
	}
}

fn parse_col<T>(raw: &str, column: &'static str) -> Result<T, StoreError>
where
	T: FromStr<Err = ParseIdError>,
{
	raw.parse()
		.map_err(|e: ParseIdError| StoreError::Backend(anyhow!("decode column {column}: {e}")))
}

fn map_write_err(err: sqlx::Error, context: &'static str) -> StoreError {
	if let sqlx::Error::Database(db) = &err {
		if db.is_unique_violation() {
			return StoreError::Conflict(format!("{context}: duplicate row"));
		}
		if db.is_foreign_key_violation() {
			return StoreError::NotFound("room");
		}
	}
	StoreError::Backend(anyhow::Error::new(err).context(context))
}

fn user_from_row((id, username, nickname, avatar_url): UserRow) -> Result<User, StoreError> {
	Ok(User {
		id: parse_col(&id, "users.id")?,
		username,
		nickname,
		avatar_url,
	})
}

fn room_from_row((id, name, creator_id, created_at): RoomRow) -> Result<Room, StoreError> {
	Ok(Room {
		id: parse_col(&id, "rooms.id")?,
		name,
		creator_id: parse_col(&creator_id, "rooms.creator_id")?,
		created_at,
	})
}

fn message_from_row((id, room_id, user_id, kind, content, created_at): MessageRow) -> Result<Message, StoreError> {
	Ok(Message {
		id: parse_col(&id, "messages.id")?,
		room_id: parse_col(&room_id, "messages.room_id")?,
		user_id: parse_col(&user_id, "messages.user_id")?,
		kind: parse_col(&kind, "messages.kind")?,
		content,
		timestamp: created_at,
	})
}

#[async_trait::async_trait]
impl ChatStore for SqlStore {
	async fn create_user(&self, user: &User) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO users (id, username, nickname, avatar_url) VALUES (?, ?, ?, ?)")
					.bind(user.id.to_string())
					.bind(&user.username)
					.bind(&user.nickname)
					.bind(user.avatar_url.as_deref())
					.execute(pool)
					.await
					.map_err(|e| map_write_err(e, "insert user (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (id, username, nickname, avatar_url) VALUES ($1, $2, $3, $4)")
					.bind(user.id.to_string())
					.bind(&user.username)
					.bind(&user.nickname)
					.bind(user.avatar_url.as_deref())
					.execute(pool)
					.await
					.map_err(|e| map_write_err(e, "insert user (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, username, nickname, avatar_url FROM users WHERE id = ?")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select user (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, username, nickname, avatar_url FROM users WHERE id = $1")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("select user (postgres)")?
			}
		};
		row.map(user_from_row).transpose()
	}

	async fn update_user_profile(&self, user: &User) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE users SET nickname = ?, avatar_url = ? WHERE id = ?")
				.bind(&user.nickname)
				.bind(user.avatar_url.as_deref())
				.bind(user.id.to_string())
				.execute(pool)
				.await
				.context("update user (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE users SET nickname = $1, avatar_url = $2 WHERE id = $3")
				.bind(&user.nickname)
				.bind(user.avatar_url.as_deref())
				.bind(user.id.to_string())
				.execute(pool)
				.await
				.context("update user (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("user"));
		}
		Ok(())
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin (sqlite)")?;
				sqlx::query("INSERT INTO rooms (id, name, creator_id, created_at) VALUES (?, ?, ?, ?)")
					.bind(room.id.to_string())
					.bind(&room.name)
					.bind(room.creator_id.to_string())
					.bind(room.created_at)
					.execute(&mut *tx)
					.await
					.map_err(|e| map_write_err(e, "insert room (sqlite)"))?;
				sqlx::query("INSERT INTO memberships (room_id, user_id, role, joined_at) VALUES (?, ?, 'creator', ?)")
					.bind(room.id.to_string())
					.bind(room.creator_id.to_string())
					.bind(room.created_at)
					.execute(&mut *tx)
					.await
					.map_err(|e| map_write_err(e, "insert creator membership (sqlite)"))?;
				tx.commit().await.context("commit (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin (postgres)")?;
				sqlx::query("INSERT INTO rooms (id, name, creator_id, created_at) VALUES ($1, $2, $3, $4)")
					.bind(room.id.to_string())
					.bind(&room.name)
					.bind(room.creator_id.to_string())
					.bind(room.created_at)
					.execute(&mut *tx)
					.await
					.map_err(|e| map_write_err(e, "insert room (postgres)"))?;
				sqlx::query("INSERT INTO memberships (room_id, user_id, role, joined_at) VALUES ($1, $2, 'creator', $3)")
					.bind(room.id.to_string())
					.bind(room.creator_id.to_string())
					.bind(room.created_at)
					.execute(&mut *tx)
					.await
					.map_err(|e| map_write_err(e, "insert creator membership (postgres)"))?;
				tx.commit().await.context("commit (postgres)")?;
			}
		}
		Ok(())
	}

	async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, name, creator_id, created_at FROM rooms WHERE id = ?")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, name, creator_id, created_at FROM rooms WHERE id = $1")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?,
		};
		row.map(room_from_row).transpose()
	}

	async fn rename_room(&self, id: RoomId, name: &str) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE rooms SET name = ? WHERE id = ?")
				.bind(name)
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("rename room (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE rooms SET name = $1 WHERE id = $2")
				.bind(name)
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("rename room (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("room"));
		}
		Ok(())
	}

	async fn delete_room(&self, id: RoomId) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin (sqlite)")?;
				sqlx::query("DELETE FROM messages WHERE room_id = ?")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room messages (sqlite)")?;
				sqlx::query("DELETE FROM memberships WHERE room_id = ?")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room memberships (sqlite)")?;
				let affected = sqlx::query("DELETE FROM rooms WHERE id = ?")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room (sqlite)")?
					.rows_affected();
				tx.commit().await.context("commit (sqlite)")?;
				affected
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin (postgres)")?;
				sqlx::query("DELETE FROM messages WHERE room_id = $1")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room messages (postgres)")?;
				sqlx::query("DELETE FROM memberships WHERE room_id = $1")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room memberships (postgres)")?;
				let affected = sqlx::query("DELETE FROM rooms WHERE id = $1")
					.bind(id.to_string())
					.execute(&mut *tx)
					.await
					.context("delete room (postgres)")?
					.rows_affected();
				tx.commit().await.context("commit (postgres)")?;
				affected
			}
		};
		if affected == 0 {
			return Err(StoreError::NotFound("room"));
		}
		Ok(())
	}

	async fn add_membership(&self, user_id: UserId, room_id: RoomId, role: Role) -> Result<(), StoreError> {
		if role == Role::Creator {
			return Err(StoreError::Conflict("a room has exactly one creator".to_string()));
		}

		let joined_at = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO memberships (room_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
					.bind(room_id.to_string())
					.bind(user_id.to_string())
					.bind(role.as_str())
					.bind(joined_at)
					.execute(pool)
					.await
					.map_err(|e| map_write_err(e, "insert membership (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO memberships (room_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)")
					.bind(room_id.to_string())
					.bind(user_id.to_string())
					.bind(role.as_str())
					.bind(joined_at)
					.execute(pool)
					.await
					.map_err(|e| map_write_err(e, "insert membership (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn remove_membership(&self, user_id: UserId, room_id: RoomId) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM memberships WHERE room_id = ? AND user_id = ? AND role <> 'creator'")
					.bind(room_id.to_string())
					.bind(user_id.to_string())
					.execute(pool)
					.await
					.context("delete membership (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM memberships WHERE room_id = $1 AND user_id = $2 AND role <> 'creator'")
					.bind(room_id.to_string())
					.bind(user_id.to_string())
					.execute(pool)
					.await
					.context("delete membership (postgres)")?
					.rows_affected()
			}
		};
		if affected > 0 {
			return Ok(());
		}

		match self.get_membership(user_id, room_id).await? {
			Some(Role::Creator) => Err(StoreError::Conflict("the creator membership is permanent".to_string())),
			_ => Err(StoreError::NotFound("membership")),
		}
	}

	async fn get_membership(&self, user_id: UserId, room_id: RoomId) -> Result<Option<Role>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT role FROM memberships WHERE room_id = ? AND user_id = ?")
				.bind(room_id.to_string())
				.bind(user_id.to_string())
				.fetch_optional(pool)
				.await
				.context("select membership (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT role FROM memberships WHERE room_id = $1 AND user_id = $2")
					.bind(room_id.to_string())
					.bind(user_id.to_string())
					.fetch_optional(pool)
					.await
					.context("select membership (postgres)")?
			}
		};
		row.map(|(role,)| parse_col(&role, "memberships.role")).transpose()
	}

	async fn list_room_ids_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT room_id FROM memberships WHERE user_id = ? ORDER BY joined_at, room_id")
					.bind(user_id.to_string())
					.fetch_all(pool)
					.await
					.context("list rooms for user (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT room_id FROM memberships WHERE user_id = $1 ORDER BY joined_at, room_id")
					.bind(user_id.to_string())
					.fetch_all(pool)
					.await
					.context("list rooms for user (postgres)")?
			}
		};
		rows.iter().map(|(id,)| parse_col(id, "memberships.room_id")).collect()
	}

	async fn list_member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM memberships WHERE room_id = ? ORDER BY joined_at, user_id")
					.bind(room_id.to_string())
					.fetch_all(pool)
					.await
					.context("list members (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM memberships WHERE room_id = $1 ORDER BY joined_at, user_id")
					.bind(room_id.to_string())
					.fetch_all(pool)
					.await
					.context("list members (postgres)")?
			}
		};
		rows.iter().map(|(id,)| parse_col(id, "memberships.user_id")).collect()
	}

	async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, user_id, kind, content, created_at) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.room_id.to_string())
				.bind(message.user_id.to_string())
				.bind(message.kind.as_str())
				.bind(&message.content)
				.bind(message.timestamp)
				.execute(pool)
				.await
				.map_err(|e| map_write_err(e, "insert message (sqlite)"))?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, user_id, kind, content, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(message.id.to_string())
				.bind(message.room_id.to_string())
				.bind(message.user_id.to_string())
				.bind(message.kind.as_str())
				.bind(&message.content)
				.bind(message.timestamp)
				.execute(pool)
				.await
				.map_err(|e| map_write_err(e, "insert message (postgres)"))?;
			}
		}
		Ok(())
	}

	async fn get_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}
		let ids = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();

		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
					"SELECT id, room_id, user_id, kind, content, created_at FROM messages WHERE id IN (",
				);
				let mut list = qb.separated(", ");
				for id in ids {
					list.push_bind(id);
				}
				list.push_unseparated(")");
				qb.build_query_as()
					.fetch_all(pool)
					.await
					.context("select messages (sqlite)")?
			}
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, user_id, kind, content, created_at FROM messages WHERE id = ANY($1)",
			)
			.bind(ids)
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};
		rows.into_iter().map(message_from_row).collect()
	}

	async fn list_message_ids(&self, room_id: RoomId, limit: usize, before: i64) -> Result<Vec<MessageId>, StoreError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id FROM messages WHERE room_id = ? AND created_at < ? \
					ORDER BY created_at DESC, id DESC LIMIT ?",
			)
			.bind(room_id.to_string())
			.bind(before)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("list message ids (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id FROM messages WHERE room_id = $1 AND created_at < $2 \
					ORDER BY created_at DESC, id DESC LIMIT $3",
			)
			.bind(room_id.to_string())
			.bind(before)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("list message ids (postgres)")?,
		};
		rows.iter().map(|(id,)| parse_col(id, "messages.id")).collect()
	}

	async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM messages WHERE id = ?")
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("delete message (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM messages WHERE id = $1")
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("delete message (postgres)")?
				.rows_affected(),
		};
		if affected == 0 {
			return Err(StoreError::NotFound("message"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use huddle_domain::MessageKind;

	use super::*;

	async fn sqlite() -> SqlStore {
		SqlStore::connect("sqlite::memory:").await.expect("connect sqlite")
	}

	#[tokio::test]
	async fn rejects_unknown_schemes() {
		assert!(SqlStore::connect("mysql://localhost/chat").await.is_err());
	}

	#[tokio::test]
	async fn users_roundtrip_and_profile_updates() {
		let store = sqlite().await;
		assert_eq!(store.backend_name(), "sqlite");

		let mut user = User {
			id: UserId::new_v4(),
			username: "ada".into(),
			nickname: "Ada".into(),
			avatar_url: None,
		};
		store.create_user(&user).await.unwrap();
		assert_eq!(store.get_user(user.id).await.unwrap(), Some(user.clone()));

		user.nickname = "Countess".into();
		user.avatar_url = Some("https://cdn.example/ada.png".into());
		store.update_user_profile(&user).await.unwrap();
		assert_eq!(store.get_user(user.id).await.unwrap(), Some(user.clone()));

		let dup = User {
			id: UserId::new_v4(),
			..user
		};
		assert!(matches!(store.create_user(&dup).await, Err(StoreError::Conflict(_))));
	}

	#[tokio::test]
	async fn membership_rules_are_enforced() {
		let store = sqlite().await;
		let creator = UserId::new_v4();
		let member = UserId::new_v4();
		let room = Room::new("general", creator, unix_ms_now());
		store.create_room(&room).await.unwrap();

		assert_eq!(store.get_room(room.id).await.unwrap(), Some(room.clone()));
		assert_eq!(store.get_membership(creator, room.id).await.unwrap(), Some(Role::Creator));

		assert!(matches!(
			store.add_membership(member, room.id, Role::Creator).await,
			Err(StoreError::Conflict(_))
		));
		store.add_membership(member, room.id, Role::Member).await.unwrap();
		assert!(matches!(
			store.add_membership(member, room.id, Role::Member).await,
			Err(StoreError::Conflict(_))
		));
		assert!(matches!(
			store.add_membership(member, RoomId::new_v4(), Role::Member).await,
			Err(StoreError::NotFound("room"))
		));

		let mut members = store.list_member_ids(room.id).await.unwrap();
		members.sort();
		let mut expected = vec![creator, member];
		expected.sort();
		assert_eq!(members, expected);

		assert!(matches!(
			store.remove_membership(creator, room.id).await,
			Err(StoreError::Conflict(_))
		));
		store.remove_membership(member, room.id).await.unwrap();
		assert!(matches!(
			store.remove_membership(member, room.id).await,
			Err(StoreError::NotFound("membership"))
		));
	}

	#[tokio::test]
	async fn messages_are_paged_and_fetched_by_id() {
		let store = sqlite().await;
		let creator = UserId::new_v4();
		let room = Room::new("general", creator, unix_ms_now());
		store.create_room(&room).await.unwrap();

		let mut sent = Vec::new();
		for ts in 1..=4 {
			let m = Message::new(room.id, creator, MessageKind::Text, format!("m{ts}"), ts);
			store.create_message(&m).await.unwrap();
			sent.push(m);
		}

		let ids = store.list_message_ids(room.id, 3, i64::MAX).await.unwrap();
		assert_eq!(ids, vec![sent[3].id, sent[2].id, sent[1].id]);

		let mut fetched = store.get_messages(&[sent[0].id, MessageId::new_v4()]).await.unwrap();
		assert_eq!(fetched.len(), 1);
		assert_eq!(fetched.remove(0), sent[0]);

		store.delete_message(sent[0].id).await.unwrap();
		assert!(matches!(
			store.delete_message(sent[0].id).await,
			Err(StoreError::NotFound("message"))
		));

		store.rename_room(room.id, "renamed").await.unwrap();
		store.delete_room(room.id).await.unwrap();
		assert!(store.get_messages(&[sent[1].id]).await.unwrap().is_empty());
		assert_eq!(store.list_room_ids_for_user(creator).await.unwrap(), Vec::<RoomId>::new());
	}

	#[tokio::test]
	async fn messages_require_an_existing_room() {
		let store = sqlite().await;
		let m = Message::new(RoomId::new_v4(), UserId::new_v4(), MessageKind::Image, "https://x/y.png", 1);
		assert!(matches!(store.create_message(&m).await, Err(StoreError::NotFound("room"))));
	}
}
