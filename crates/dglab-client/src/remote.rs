//! Outward WebSocket link to a DG-Lab relay server.
//!
//! Registration is the relay's first `bind` frame whose body is `targetId`;
//! its `clientId` becomes this terminal's id. After that a dispatch task
//! feeds every text frame into the shared [`ClientState`].

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use dglab_core::codec::{check_message_len, decode_envelope, encode_envelope};
use dglab_core::messages::{Envelope, MsgType, REGISTER_MARKER};
use dglab_core::pulse::PulseOperation;
use dglab_core::strength::{Channel, StrengthOperation};
use dglab_core::{DeviceLink, DgLabError, DgLabResult, LinkEvent};

use crate::state::ClientState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Check that a relay address uses a WebSocket scheme.
pub fn validate_relay_uri(uri: &str) -> DgLabResult<()> {
    let lower = uri.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(())
    } else {
        Err(DgLabError::Transport(format!(
            "unsupported relay URI: {uri} (expected ws:// or wss://)"
        )))
    }
}

/// A terminal connected outward to a relay.
pub struct RemoteLink {
    state: Arc<ClientState>,
    sink: Arc<Mutex<WsSink>>,
    dispatch_handle: tokio::task::JoinHandle<()>,
}

impl RemoteLink {
    /// Connect to `uri` and wait for the relay to assign a client id.
    ///
    /// Does not time out on its own; callers bound it with their
    /// registration timeout.
    pub async fn connect(uri: &str) -> DgLabResult<Self> {
        validate_relay_uri(uri)?;
        let (ws_stream, _response) = connect_async(uri)
            .await
            .map_err(|e| DgLabError::Transport(format!("WebSocket connect error: {e}")))?;
        debug!(uri, "WebSocket connected to relay");

        let (sink, mut read) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let client_id = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = decode_envelope(&text)?;
                    if envelope.msg_type == MsgType::Bind && envelope.message == REGISTER_MARKER {
                        break envelope.client_id;
                    }
                    debug!(?envelope, "frame before registration ignored");
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.lock().await.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return Err(DgLabError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(DgLabError::Transport(format!("WS recv failed: {e}")));
                }
            }
        };
        info!(client_id = %client_id, uri, "terminal registered with relay");

        let state = Arc::new(ClientState::new(client_id));
        let dispatch_handle = {
            let state = state.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                Self::dispatch_loop(read, state, sink).await;
            })
        };

        Ok(Self {
            state,
            sink,
            dispatch_handle,
        })
    }

    /// Route incoming relay frames into the terminal state until the socket ends.
    async fn dispatch_loop(
        mut read: SplitStream<WsStream>,
        state: Arc<ClientState>,
        sink: Arc<Mutex<WsSink>>,
    ) {
        while let Some(msg) = read.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    debug!(client_id = %state.client_id(), "relay sent close frame");
                    break;
                }
                Ok(Message::Ping(payload)) => {
                    let _ = sink.lock().await.send(Message::Pong(payload)).await;
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(client_id = %state.client_id(), error = %e, "WebSocket read error");
                    break;
                }
            };
            match decode_envelope(&text) {
                Ok(envelope) => state.handle(&envelope),
                Err(e) => warn!(client_id = %state.client_id(), error = %e, "invalid relay frame"),
            }
        }
        state.close();
        debug!(client_id = %state.client_id(), "relay dispatch loop ended");
    }

    async fn send(&self, envelope: Envelope) -> DgLabResult<()> {
        check_message_len(&envelope)?;
        let text = encode_envelope(&envelope)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| DgLabError::Transport(format!("WS send failed: {e}")))
    }
}

impl DeviceLink for RemoteLink {
    fn client_id(&self) -> &str {
        self.state.client_id()
    }

    fn target_id(&self) -> Option<String> {
        self.state.target_id()
    }

    fn bind(&self) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(self.state.wait_bound())
    }

    fn rebind(&self) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(self.state.wait_bound())
    }

    fn events(&self) -> Option<BoxStream<'static, LinkEvent>> {
        self.state.take_events()
    }

    fn clear_queue(&self, channel: Channel) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            let frame = self.state.clear_frame(channel)?;
            self.send(frame).await
        })
    }

    fn add_segments<'a>(
        &'a self,
        channel: Channel,
        segments: &'a [PulseOperation],
    ) -> BoxFuture<'a, DgLabResult<()>> {
        Box::pin(async move {
            let frame = self.state.pulse_frame(channel, segments)?;
            self.send(frame).await
        })
    }

    fn set_strength(
        &self,
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    ) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            let frame = self.state.strength_frame(channel, operation, value)?;
            self.send(frame).await
        })
    }

    fn close(&self) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            if self.state.is_closed() {
                return Ok(());
            }
            self.state.close();
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            self.dispatch_handle.abort();
            Ok(())
        })
    }
}

impl Drop for RemoteLink {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}
