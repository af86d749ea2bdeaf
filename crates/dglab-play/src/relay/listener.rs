//! WebSocket listener for Apps connecting to the local relay.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use dglab_core::codec::encode_envelope;
use dglab_core::{DgLabError, DgLabResult};

use super::hub::RelayHub;
use crate::config::{LocalRelaySettings, TlsFiles};

/// Accepts App connections and feeds them into a [`RelayHub`].
pub struct RelayListener {
    hub: Arc<RelayHub>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    heartbeat_interval: Option<Duration>,
}

impl RelayListener {
    /// Bind the listen socket and load TLS material if configured.
    pub async fn bind(hub: Arc<RelayHub>, settings: &LocalRelaySettings) -> DgLabResult<Self> {
        let tls = match &settings.tls {
            Some(files) => Some(TlsAcceptor::from(Arc::new(load_tls_config(files)?))),
            None => None,
        };
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DgLabError::Transport(format!("relay bind {addr} failed: {e}")))?;
        Ok(Self {
            hub,
            listener,
            tls,
            heartbeat_interval: settings.heartbeat_interval,
        })
    }

    pub fn local_addr(&self) -> DgLabResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, scheme, "local relay listening"),
            Err(e) => warn!(error = %e, "local relay listening on unknown address"),
        }

        if let Some(period) = self.heartbeat_interval {
            tokio::spawn(heartbeat_loop(self.hub.clone(), period));
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = self.hub.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_app(hub, stream).await,
                                Err(e) => Err(DgLabError::Transport(format!("TLS handshake failed: {e}"))),
                            },
                            None => serve_app(hub, stream).await,
                        };
                        if let Err(e) = result {
                            warn!(remote = %addr, error = %e, "app connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }
}

/// Relay one App connection until it closes.
async fn serve_app<S>(hub: Arc<RelayHub>, stream: S) -> DgLabResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| DgLabError::Transport(format!("WebSocket handshake failed: {e}")))?;
    let (mut sink, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let app_id = hub.register_app(tx).await;

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match encode_envelope(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(error = %e, "app socket closed while writing");
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.app_frame(&app_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(app_id = %app_id, error = %e, "app read error");
                break;
            }
        }
    }

    hub.app_disconnected(&app_id).await;
    writer.abort();
    Ok(())
}

async fn heartbeat_loop(hub: Arc<RelayHub>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        hub.heartbeat().await;
    }
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
pub fn load_tls_config(files: &TlsFiles) -> DgLabResult<rustls::ServerConfig> {
    let certs = {
        let pem = read_pem(&files.cert)?;
        rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DgLabError::Config(format!("bad certificate PEM: {e}")))?
    };
    let key = {
        let pem = read_pem(&files.key)?;
        rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| DgLabError::Config(format!("bad key PEM: {e}")))?
            .ok_or_else(|| DgLabError::Config("no private key found in PEM".into()))?
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| DgLabError::Config(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DgLabError::Config(format!("TLS setup failed: {e}")))
}

fn read_pem(path: &Path) -> DgLabResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| DgLabError::Config(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dglab_core::messages::{BIND_MARKER, REGISTER_MARKER};
    use dglab_core::{decode_envelope, DeviceLink, Envelope, MsgType, RetCode};

    fn settings() -> LocalRelaySettings {
        LocalRelaySettings {
            host: "127.0.0.1".into(),
            port: 0,
            publish_uri: "ws://127.0.0.1:0".into(),
            heartbeat_interval: None,
            tls: None,
        }
    }

    async fn next_envelope<S>(read: &mut S) -> Envelope
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            if let Message::Text(text) = read.next().await.unwrap().unwrap() {
                return decode_envelope(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn app_binds_over_websocket() {
        let hub = RelayHub::new();
        let listener = RelayListener::bind(hub.clone(), &settings()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());

        let link = hub.new_local_link().await;
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (mut sink, mut read) = ws.split();

        let hello = next_envelope(&mut read).await;
        assert_eq!(hello.msg_type, MsgType::Bind);
        assert_eq!(hello.message, REGISTER_MARKER);
        let app_id = hello.client_id;

        let request = Envelope::new(MsgType::Bind, link.client_id(), app_id.as_str(), BIND_MARKER);
        sink.send(Message::Text(encode_envelope(&request).unwrap()))
            .await
            .unwrap();
        let reply = next_envelope(&mut read).await;
        assert_eq!(reply.ret_code(), Some(RetCode::Success));
        link.bind().await.unwrap();

        sink.send(Message::Close(None)).await.unwrap();
        drop(sink);
        let mut events = link.events().unwrap();
        assert_eq!(
            events.next().await,
            Some(dglab_core::LinkEvent::Disconnected(RetCode::ClientDisconnected))
        );
    }

    #[test]
    fn missing_tls_files_are_config_errors() {
        let files = TlsFiles {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(
            load_tls_config(&files),
            Err(DgLabError::Config(_))
        ));
    }
}
