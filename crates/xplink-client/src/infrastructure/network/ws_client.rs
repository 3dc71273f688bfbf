//! WebSocket transport for the simulator's streaming API.
//!
//! One long-lived connection per session. The stream is split once after
//! connecting: the sink half goes into a [`StreamSender`] (clonable, shared
//! by everything that issues requests), the source half stays with the
//! receive loop. All frames are JSON text carrying the envelope types from
//! [`xplink_core::protocol::messages`].
//!
//! Receiving is always bounded: [`next_reply`] wraps the read in a timeout
//! so the caller can re-check its stop flag and count quiet windows. The
//! window starts short (the simulator answers the initial subscribe almost
//! immediately) and widens once the first frame has arrived.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use xplink_core::protocol::messages::{StreamReply, StreamRequest};

/// Receive window before the first inbound frame. The simulator acknowledges
/// the initial subscribe quickly, so silence here is meaningful sooner.
pub const INITIAL_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive window once the stream is known to be alive.
pub const STEADY_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// The receive half of a streaming connection.
pub type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Error type for the streaming transport.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The WebSocket handshake failed.
    #[error("WebSocket connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: WsError,
    },

    /// A frame could not be written to the connection.
    #[error("streaming send failed: {0}")]
    Send(#[source] WsError),

    /// An outbound request could not be encoded to JSON.
    #[error("failed to encode outbound request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Clonable handle for writing requests to the streaming connection.
///
/// The sink lives behind an async mutex so the receive loop (scheduler
/// actions), the supervisor (initial subscriptions), and consumer calls
/// (writes, commands) can all send without interleaving partial frames.
#[derive(Clone)]
pub struct StreamSender {
    sink: Arc<Mutex<WsSink>>,
}

impl StreamSender {
    fn new(sink: WsSink) -> StreamSender {
        StreamSender {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Serializes `request` and writes it as one text frame.
    ///
    /// # Errors
    ///
    /// [`StreamError::Encode`] if serialization fails, [`StreamError::Send`]
    /// if the connection rejects the write.
    pub async fn send(&self, request: &StreamRequest) -> Result<(), StreamError> {
        let text = serde_json::to_string(request)?;
        debug!("sending {} (req {})", request.type_name(), request.req_id());
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(StreamError::Send)
    }
}

/// Opens the streaming connection and splits it into send/receive halves.
///
/// # Errors
///
/// Returns [`StreamError::Connect`] when the handshake fails.
pub async fn connect(url: &str) -> Result<(StreamSender, WsSource), StreamError> {
    let (ws_stream, _response) =
        connect_async(url)
            .await
            .map_err(|source| StreamError::Connect {
                url: url.to_string(),
                source,
            })?;
    info!("streaming connection established to {url}");

    let (sink, source) = ws_stream.split();
    Ok((StreamSender::new(sink), source))
}

/// What one bounded receive attempt produced.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded streaming reply.
    Reply(StreamReply),
    /// A frame arrived but carried nothing for the application (control
    /// frame, or undecodable text). Counts as traffic for liveness purposes.
    Skipped,
    /// Nothing arrived within the window.
    TimedOut,
    /// The connection is gone.
    Closed,
}

/// Waits up to `wait` for the next application-level reply.
///
/// Decoding failures and control frames are logged here and reported as
/// [`Inbound::Skipped`] so the caller's timeout accounting still sees them
/// as signs of life.
pub async fn next_reply(source: &mut WsSource, wait: Duration) -> Inbound {
    let frame = match timeout(wait, source.next()).await {
        Err(_elapsed) => return Inbound::TimedOut,
        Ok(None) => return Inbound::Closed,
        Ok(Some(Err(e))) => {
            warn!("streaming receive failed: {e}");
            return Inbound::Closed;
        }
        Ok(Some(Ok(frame))) => frame,
    };

    match frame {
        WsMessage::Text(text) => match serde_json::from_str::<StreamReply>(&text) {
            Ok(reply) => Inbound::Reply(reply),
            Err(e) => {
                warn!("undecodable streaming frame: {e}");
                debug!("frame body: {text}");
                Inbound::Skipped
            }
        },
        WsMessage::Binary(payload) => {
            warn!("unexpected binary frame ({} bytes) ignored", payload.len());
            Inbound::Skipped
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) => {
            // The pong reply is queued automatically on the next sink write.
            debug!("WebSocket keepalive frame");
            Inbound::Skipped
        }
        WsMessage::Close(_) => {
            debug!("WebSocket close frame received");
            Inbound::Closed
        }
        WsMessage::Frame(_) => Inbound::Skipped,
    }
}
