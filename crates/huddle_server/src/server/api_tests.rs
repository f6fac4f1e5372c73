#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use huddle_domain::{Role, RoomId, UserId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::server::api::{USER_HEADER, spawn_api_server};
use crate::server::realtime::ConnectionState;
use crate::store::ChatStore;
use crate::testing::{CACHE_MODES, Fixture, RecordingSink};

struct Reply {
	status: u16,
	body: serde_json::Value,
}

async fn post(addr: SocketAddr, path: &str, user: Option<UserId>, bearer: Option<&str>) -> Reply {
	let mut req = format!("POST {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n");
	if let Some(user) = user {
		req.push_str(&format!("{USER_HEADER}: {user}\r\n"));
	}
	if let Some(token) = bearer {
		req.push_str(&format!("Authorization: Bearer {token}\r\n"));
	}
	req.push_str("\r\n");

	let mut stream = TcpStream::connect(addr).await.expect("connect");
	stream.write_all(req.as_bytes()).await.expect("write");
	let mut out = String::new();
	timeout(Duration::from_secs(2), stream.read_to_string(&mut out))
		.await
		.expect("response within timeout")
		.expect("read");

	let status = out
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.expect("status line");
	let body = out
		.split_once("\r\n\r\n")
		.map(|(_, b)| b)
		.unwrap_or_default();
	Reply {
		status,
		body: serde_json::from_str(body).unwrap_or(serde_json::Value::Null),
	}
}

async fn start(fx: &Fixture) -> SocketAddr {
	spawn_api_server("127.0.0.1:0".parse().unwrap(), fx.access.clone())
		.await
		.expect("spawn api")
}

fn room_token_path(room: RoomId) -> String {
	format!("/v1/rooms/{room}/room-token")
}

fn connection_token_path(room: RoomId) -> String {
	format!("/v1/rooms/{room}/connection-token")
}

#[tokio::test]
async fn member_trades_room_token_for_a_working_connection_token() {
	for mode in CACHE_MODES {
		let fx = Fixture::new(mode);
		let addr = start(&fx).await;
		let (room, _, members) = fx.room_with_members(1).await;
		let bob = members[0];

		let reply = post(addr, &room_token_path(room.id), Some(bob), None).await;
		assert_eq!(reply.status, 200, "mode {mode:?}: {}", reply.body);
		let room_token = reply.body["token"].as_str().expect("room token").to_string();
		assert_eq!(fx.tokens.verify_room_token(&room_token).unwrap().role, Role::Member);

		let reply = post(addr, &connection_token_path(room.id), Some(bob), Some(&room_token)).await;
		assert_eq!(reply.status, 200, "mode {mode:?}: {}", reply.body);
		let conn_token = reply.body["token"].as_str().expect("connection token");

		let session = fx.realtime.open(conn_token, RecordingSink::new()).await.unwrap();
		assert_eq!(session.state(), ConnectionState::Registered);
		assert_eq!(session.identity().user_id, bob);
	}
}

#[tokio::test]
async fn exchange_rechecks_membership_after_a_kick() {
	for mode in CACHE_MODES {
		let fx = Fixture::new(mode);
		let addr = start(&fx).await;
		let (room, _, members) = fx.room_with_members(1).await;
		let bob = members[0];

		let reply = post(addr, &room_token_path(room.id), Some(bob), None).await;
		let room_token = reply.body["token"].as_str().expect("room token").to_string();

		fx.store.remove_membership(bob, room.id).await.unwrap();

		let reply = post(addr, &connection_token_path(room.id), Some(bob), Some(&room_token)).await;
		assert_eq!(reply.status, 403, "mode {mode:?}");
		assert_eq!(reply.body["error"], "not a member of this room");

		let reply = post(addr, &room_token_path(room.id), Some(bob), None).await;
		assert_eq!(reply.status, 403, "mode {mode:?}");
	}
}

#[tokio::test]
async fn bad_requests_map_to_client_errors() {
	let fx = Fixture::new(CACHE_MODES[0]);
	let addr = start(&fx).await;
	let (room, alice, _) = fx.room_with_members(0).await;
	let (other_room, _, _) = fx.room_with_members(0).await;

	let reply = post(addr, &room_token_path(room.id), None, None).await;
	assert_eq!(reply.status, 401);

	let reply = post(addr, &connection_token_path(room.id), Some(alice), None).await;
	assert_eq!(reply.status, 401);
	assert_eq!(reply.body["error"], "missing room token");

	let reply = post(addr, &connection_token_path(room.id), Some(alice), Some("garbage")).await;
	assert_eq!(reply.status, 401);
	assert_eq!(reply.body["error"], "invalid token");

	let expired = fx.tokens.issue_room_token(room.id, Role::Creator, -5).unwrap();
	let reply = post(addr, &connection_token_path(room.id), Some(alice), Some(&expired)).await;
	assert_eq!(reply.status, 401);
	assert_eq!(reply.body["error"], "token has expired");

	// A token for another room does not open this one.
	let foreign = fx.room_token(other_room.id, Role::Creator);
	let reply = post(addr, &connection_token_path(room.id), Some(alice), Some(&foreign)).await;
	assert_eq!(reply.status, 401);

	let reply = post(addr, "/v1/rooms/not-a-room/room-token", Some(alice), None).await;
	assert_eq!(reply.status, 404);
	let reply = post(addr, &format!("/v1/rooms/{}/nope", room.id), Some(alice), None).await;
	assert_eq!(reply.status, 404);
}
