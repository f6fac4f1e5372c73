#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::hub::{ConnectionSink, SinkError, error_frame};
use crate::server::realtime::RealtimeService;

/// Transport limits for websocket connections.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
	/// Frames queued per connection before it counts as too slow.
	pub outbound_queue_capacity: usize,

	/// Largest inbound websocket frame/message accepted.
	pub max_frame_bytes: usize,
}

impl Default for ListenerSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			max_frame_bytes: 64 * 1024,
		}
	}
}

/// `ConnectionSink` backed by a bounded queue drained by a writer task.
pub struct ChannelSink {
	tx: mpsc::Sender<Bytes>,
	closed: watch::Sender<bool>,
}

impl ChannelSink {
	pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let (closed, _) = watch::channel(false);
		(Arc::new(Self { tx, closed }), rx)
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	/// Resolves once `close` has been called.
	pub async fn closed(&self) {
		let mut rx = self.closed.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}
}

impl ConnectionSink for ChannelSink {
	fn send(&self, frame: Bytes) -> Result<(), SinkError> {
		if self.is_closed() {
			return Err(SinkError::Closed);
		}
		self.tx.try_send(frame).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => SinkError::Full,
			mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
		})
	}

	fn close(&self) {
		self.closed.send_replace(true);
	}
}

/// Accept websocket connections until the listener fails.
pub async fn serve(listener: TcpListener, service: RealtimeService, settings: ListenerSettings) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local_addr")?;
	info!(bind = %local, "websocket listener ready");

	loop {
		let (stream, peer) = listener.accept().await.context("accept websocket connection")?;
		metrics::counter!("huddle_server_connections_accepted_total").increment(1);

		let service = service.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(err) = handle_socket(stream, peer, service, settings).await {
				debug!(%peer, error = %err, "websocket connection ended with error");
			}
		});
	}
}

fn token_from_query(query: Option<&str>) -> Option<String> {
	query?
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == "token")
		.map(|(_, v)| v.to_string())
		.filter(|v| !v.is_empty())
}

async fn handle_socket(
	stream: TcpStream,
	peer: SocketAddr,
	service: RealtimeService,
	settings: ListenerSettings,
) -> anyhow::Result<()> {
	let mut token = None;
	let ws_config = WebSocketConfig::default()
		.max_frame_size(Some(settings.max_frame_bytes))
		.max_message_size(Some(settings.max_frame_bytes));

	let ws = tokio_tungstenite::accept_hdr_async_with_config(
		stream,
		|req: &Request, resp: Response| {
			token = token_from_query(req.uri().query());
			Ok(resp)
		},
		Some(ws_config),
	)
	.await
	.context("websocket handshake")?;

	let Some(token) = token else {
		reject(ws, peer, "missing token").await;
		return Ok(());
	};

	let (sink, outbound) = ChannelSink::new(settings.outbound_queue_capacity);
	let session = match service.open(&token, sink.clone()).await {
		Ok(s) => s,
		Err(e) => {
			reject(ws, peer, &e.client_message()).await;
			return Ok(());
		}
	};

	let (ws_tx, mut ws_rx) = ws.split();
	let writer = tokio::spawn(write_loop(ws_tx, outbound, sink.clone()));

	loop {
		let frame = tokio::select! {
			_ = sink.closed() => break,
			frame = ws_rx.next() => frame,
		};

		let payload = match frame {
			Some(Ok(WsMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
			Some(Ok(WsMessage::Binary(bin))) => bin,
			Some(Ok(WsMessage::Close(_))) | None => break,
			Some(Ok(_)) => continue,
			Some(Err(e)) => {
				debug!(%peer, error = %e, "websocket read failed");
				break;
			}
		};

		if let Err(e) = session.handle_frame(&payload).await {
			session.reject(&e);
			if e.is_terminal() {
				warn!(%peer, conn_id = session.identity().conn_id, error = %e, "closing connection");
				break;
			}
		}
	}

	session.close().await;
	sink.close();
	let _ = writer.await;
	Ok(())
}

async fn write_loop(
	mut ws_tx: futures::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
	mut outbound: mpsc::Receiver<Bytes>,
	sink: Arc<ChannelSink>,
) {
	loop {
		tokio::select! {
			biased;
			frame = outbound.recv() => {
				let Some(frame) = frame else { break };
				if ws_tx.send(text_frame(&frame)).await.is_err() {
					sink.close();
					return;
				}
			}
			_ = sink.closed() => break,
		}
	}

	// Flush what was queued before close, error frames included.
	while let Ok(frame) = outbound.try_recv() {
		if ws_tx.send(text_frame(&frame)).await.is_err() {
			return;
		}
	}
	let _ = ws_tx.close().await;
}

fn text_frame(frame: &Bytes) -> WsMessage {
	WsMessage::text(String::from_utf8_lossy(frame).into_owned())
}

async fn reject(mut ws: WebSocketStream<TcpStream>, peer: SocketAddr, reason: &str) {
	debug!(%peer, reason, "rejecting websocket connection");
	metrics::counter!("huddle_server_connections_rejected_total").increment(1);
	let _ = ws.send(text_frame(&error_frame(reason))).await;
	let _ = ws.close(None).await;
}
