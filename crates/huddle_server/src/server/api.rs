#![forbid(unsafe_code)]

//! Token exchange for the authenticating gateway.
//!
//! The gateway authenticates end users and forwards their id in
//! `X-Huddle-User`; this listener must not be reachable from clients.
//!
//! - `POST /v1/rooms/{room}/room-token` issues a room token for a member.
//! - `POST /v1/rooms/{room}/connection-token` trades `Authorization: Bearer <room token>`
//!   for a short-lived connection token.
//!
//! Both answer `{"token": "..."}` or `{"error": "..."}`.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use huddle_domain::{RoomId, UserId};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{ChatError, StoreError};
use crate::server::access::AccessService;

pub const USER_HEADER: &str = "x-huddle-user";

enum Route {
	RoomToken(RoomId),
	ConnectionToken(RoomId),
}

pub async fn spawn_api_server(bind: SocketAddr, access: AccessService) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await.context("bind api listener")?;
	let local = listener.local_addr().context("api listener local_addr")?;
	tokio::spawn(async move {
		if let Err(err) = serve_api(listener, access).await {
			warn!(error = %err, "api server stopped");
		}
	});
	Ok(local)
}

async fn serve_api(listener: TcpListener, access: AccessService) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let access = access.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_api(req, access.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn error_response(status: StatusCode, reason: &str) -> Response<Full<Bytes>> {
	respond(status, json!({ "error": reason }))
}

fn status_for(err: &ChatError) -> StatusCode {
	match err {
		ChatError::InvalidToken | ChatError::ExpiredToken => StatusCode::UNAUTHORIZED,
		ChatError::NotAMember | ChatError::InsufficientRole | ChatError::CreatorImmutable => StatusCode::FORBIDDEN,
		ChatError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
		ChatError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
		ChatError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
		ChatError::Persist(_) | ChatError::Store(StoreError::Backend(_)) | ChatError::Internal(_) => {
			StatusCode::INTERNAL_SERVER_ERROR
		}
	}
}

fn parse_route(path: &str) -> Option<Route> {
	let rest = path.strip_prefix("/v1/rooms/")?;
	let (room, action) = rest.split_once('/')?;
	let room = room.parse::<RoomId>().ok()?;
	match action {
		"room-token" => Some(Route::RoomToken(room)),
		"connection-token" => Some(Route::ConnectionToken(room)),
		_ => None,
	}
}

fn user_from(headers: &HeaderMap) -> Option<UserId> {
	headers.get(USER_HEADER)?.to_str().ok()?.trim().parse().ok()
}

fn bearer_from(headers: &HeaderMap) -> Option<&str> {
	let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
	let token = value.strip_prefix("Bearer ")?.trim();
	(!token.is_empty()).then_some(token)
}

async fn handle_api(req: Request<Incoming>, access: AccessService) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let Some(route) = parse_route(req.uri().path()) else {
		return Ok(error_response(StatusCode::NOT_FOUND, "not found"));
	};
	if req.method() != Method::POST {
		return Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
	}
	let Some(user) = user_from(req.headers()) else {
		return Ok(error_response(StatusCode::UNAUTHORIZED, "missing or invalid user"));
	};

	let (kind, result) = match route {
		Route::RoomToken(room) => ("room", access.issue_room_token(user, room).await),
		Route::ConnectionToken(room) => {
			let Some(room_token) = bearer_from(req.headers()) else {
				return Ok(error_response(StatusCode::UNAUTHORIZED, "missing room token"));
			};
			("connection", access.exchange_connection_token(room_token, user, room).await)
		}
	};

	Ok(match result {
		Ok(token) => {
			metrics::counter!("huddle_server_api_tokens_issued_total", "kind" => kind).increment(1);
			respond(StatusCode::OK, json!({ "token": token }))
		}
		Err(err) => {
			let status = status_for(&err);
			if status.is_server_error() {
				warn!(user = %user, kind, error = %err, "token request failed");
			} else {
				debug!(user = %user, kind, error = %err, "token request refused");
			}
			metrics::counter!("huddle_server_api_tokens_refused_total", "kind" => kind).increment(1);
			error_response(status, &err.client_message())
		}
	})
}
