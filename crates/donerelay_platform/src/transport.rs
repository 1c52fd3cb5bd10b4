#![forbid(unsafe_code)]

//! Websocket transport seam. Sessions only see a boxed sink/stream pair so the
//! network can be replaced by in-memory channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsError = tokio_tungstenite::tungstenite::Error;
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Opens a transport for a connect request.
pub type WsConnector = Arc<dyn Fn(ConnectRequest) -> BoxFuture<'static, anyhow::Result<Transport>> + Send + Sync>;

/// Where to connect and which subprotocol to ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
	pub url: String,
	pub subprotocol: Option<String>,
}

impl ConnectRequest {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			subprotocol: None,
		}
	}

	pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
		self.subprotocol = Some(protocol.into());
		self
	}
}

/// An open, split websocket.
pub struct Transport {
	pub sink: WsSink,
	pub source: WsSource,
}

async fn connect_websocket(req: ConnectRequest) -> anyhow::Result<Transport> {
	let mut request = req
		.url
		.as_str()
		.into_client_request()
		.with_context(|| format!("build websocket request for {}", req.url))?;

	if let Some(protocol) = &req.subprotocol {
		request
			.headers_mut()
			.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(protocol)?);
	}

	let (ws, _resp) = tokio_tungstenite::connect_async(request)
		.await
		.with_context(|| format!("connect_async to {}", req.url))?;
	let (sink, source) = ws.split();

	Ok(Transport {
		sink: Box::pin(sink),
		source: Box::pin(source),
	})
}

/// Connector backed by `tokio-tungstenite` (rustls, webpki roots).
pub fn websocket_connector() -> WsConnector {
	Arc::new(|req: ConnectRequest| {
		Box::pin(async move { connect_websocket(req).await }) as BoxFuture<'static, anyhow::Result<Transport>>
	})
}

/// In-process transports for tests and local tooling.
pub mod memory {
	use futures::channel::mpsc;
	use futures_util::SinkExt;

	use super::*;

	/// The far end of an in-memory transport.
	pub struct Peer {
		/// Frames the session wrote.
		pub from_session: mpsc::UnboundedReceiver<Message>,
		/// Frames (or errors) to deliver to the session.
		pub to_session: mpsc::UnboundedSender<Result<Message, WsError>>,
	}

	impl Peer {
		pub fn push(&self, msg: Message) -> bool {
			self.to_session.unbounded_send(Ok(msg)).is_ok()
		}

		/// Simulate the remote closing the socket.
		pub fn hang_up(&self) {
			self.to_session.close_channel();
		}
	}

	pub fn pair() -> (Transport, Peer) {
		let (out_tx, out_rx) = mpsc::unbounded::<Message>();
		let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, WsError>>();

		let transport = Transport {
			sink: Box::pin(out_tx.sink_map_err(|_| WsError::ConnectionClosed)),
			source: Box::pin(in_rx),
		};
		let peer = Peer {
			from_session: out_rx,
			to_session: in_tx,
		};
		(transport, peer)
	}

	/// Like [`pair`], but no write ever completes. `from_session` stays empty.
	pub fn stalled() -> (Transport, Peer) {
		let (_out_tx, out_rx) = mpsc::unbounded::<Message>();
		let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, WsError>>();

		let sink = futures::sink::unfold((), |(), _msg: Message| futures::future::pending::<Result<(), WsError>>());
		let transport = Transport {
			sink: Box::pin(sink),
			source: Box::pin(in_rx),
		};
		let peer = Peer {
			from_session: out_rx,
			to_session: in_tx,
		};
		(transport, peer)
	}
}
