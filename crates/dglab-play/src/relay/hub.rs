//! In-process relay between local terminals and connected Apps.
//!
//! Terminals live inside this process as [`LocalLink`]s; Apps connect over
//! WebSocket and are represented by an outbound frame channel. The hub owns
//! the terminal/App binding table and applies the relay's return codes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dglab_client::ClientState;
use dglab_core::codec::{check_message_len, decode_envelope};
use dglab_core::messages::{BIND_MARKER, REGISTER_MARKER};
use dglab_core::{DgLabError, DgLabResult, Envelope, MsgType, RetCode};

use super::local::LocalLink;

/// Outbound frame queue of one connected App.
pub type AppSender = mpsc::UnboundedSender<Envelope>;

#[derive(Default)]
struct Tables {
    terminals: HashMap<String, Arc<ClientState>>,
    apps: HashMap<String, AppSender>,
    /// terminal id -> app id
    bindings: HashMap<String, String>,
}

impl Tables {
    fn terminal_of(&self, app_id: &str) -> Option<String> {
        self.bindings
            .iter()
            .find(|(_, app)| app.as_str() == app_id)
            .map(|(terminal, _)| terminal.clone())
    }

    fn send_app(&self, app_id: &str, envelope: Envelope) -> bool {
        match self.apps.get(app_id) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }
}

/// Routing table of the local relay.
#[derive(Default)]
pub struct RelayHub {
    tables: RwLock<Tables>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a terminal hosted by this relay. It is registered at once.
    pub async fn new_local_link(self: &Arc<Self>) -> Arc<LocalLink> {
        let terminal_id = Uuid::new_v4().to_string();
        let state = Arc::new(ClientState::new(terminal_id.clone()));
        self.tables
            .write()
            .await
            .terminals
            .insert(terminal_id.clone(), state.clone());
        debug!(terminal_id = %terminal_id, "local terminal allocated");
        Arc::new(LocalLink::new(state, Arc::downgrade(self)))
    }

    /// Register a newly connected App and send it its id.
    pub async fn register_app(&self, tx: AppSender) -> String {
        let app_id = Uuid::new_v4().to_string();
        let hello = Envelope::new(MsgType::Bind, app_id.clone(), "", REGISTER_MARKER);
        if tx.send(hello).is_err() {
            warn!(app_id = %app_id, "app went away before registration");
        }
        self.tables.write().await.apps.insert(app_id.clone(), tx);
        info!(app_id = %app_id, "app connected");
        app_id
    }

    /// Handle one text frame from an App.
    pub async fn app_frame(&self, app_id: &str, text: &str) {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(app_id, error = %e, "non-JSON frame from app");
                let tables = self.tables.read().await;
                tables.send_app(
                    app_id,
                    Envelope::with_code(MsgType::Error, "", app_id, RetCode::NonJsonContent),
                );
                return;
            }
        };

        match envelope.msg_type {
            MsgType::Bind if envelope.message == BIND_MARKER => {
                self.bind(app_id, &envelope.client_id).await;
            }
            MsgType::Msg => self.app_message(app_id, envelope).await,
            MsgType::Heartbeat => debug!(app_id, "app heartbeat"),
            _ => debug!(app_id, ?envelope, "unexpected frame from app"),
        }
    }

    async fn bind(&self, app_id: &str, terminal_id: &str) {
        let mut tables = self.tables.write().await;
        let Some(terminal) = tables.terminals.get(terminal_id).cloned() else {
            tables.send_app(
                app_id,
                Envelope::with_code(
                    MsgType::Bind,
                    terminal_id,
                    app_id,
                    RetCode::TargetClientNotFound,
                ),
            );
            return;
        };
        if tables.bindings.contains_key(terminal_id) || tables.terminal_of(app_id).is_some() {
            tables.send_app(
                app_id,
                Envelope::with_code(MsgType::Bind, terminal_id, app_id, RetCode::IdAlreadyBound),
            );
            return;
        }
        tables
            .bindings
            .insert(terminal_id.to_string(), app_id.to_string());
        let bound = Envelope::with_code(MsgType::Bind, terminal_id, app_id, RetCode::Success);
        tables.send_app(app_id, bound.clone());
        drop(tables);
        terminal.handle(&bound);
        info!(app_id, terminal_id, "app bound to terminal");
    }

    async fn app_message(&self, app_id: &str, envelope: Envelope) {
        let tables = self.tables.read().await;
        let terminal = tables
            .bindings
            .get(&envelope.client_id)
            .filter(|bound| bound.as_str() == app_id && envelope.target_id == app_id)
            .and_then(|_| tables.terminals.get(&envelope.client_id))
            .cloned();
        let Some(terminal) = terminal else {
            tables.send_app(
                app_id,
                Envelope::with_code(
                    MsgType::Msg,
                    envelope.client_id.as_str(),
                    app_id,
                    RetCode::IncompatibleRelationship,
                ),
            );
            return;
        };
        if check_message_len(&envelope).is_err() {
            tables.send_app(
                app_id,
                Envelope::with_code(
                    MsgType::Msg,
                    envelope.client_id.as_str(),
                    app_id,
                    RetCode::MessageTooLong,
                ),
            );
            return;
        }
        drop(tables);
        terminal.handle(&envelope);
    }

    /// Forget a disconnected App and tell its terminal.
    pub async fn app_disconnected(&self, app_id: &str) {
        let mut tables = self.tables.write().await;
        tables.apps.remove(app_id);
        let terminal = tables.terminal_of(app_id).and_then(|terminal_id| {
            tables.bindings.remove(&terminal_id);
            tables.terminals.get(&terminal_id).cloned()
        });
        drop(tables);
        if let Some(terminal) = terminal {
            terminal.handle(&Envelope::with_code(
                MsgType::Break,
                terminal.client_id(),
                app_id,
                RetCode::ClientDisconnected,
            ));
        }
        info!(app_id, "app disconnected");
    }

    /// Deliver a frame from a local terminal to its bound App.
    pub async fn terminal_send(&self, envelope: Envelope) -> DgLabResult<()> {
        check_message_len(&envelope)?;
        let tables = self.tables.read().await;
        match tables.bindings.get(&envelope.client_id) {
            Some(app_id) if *app_id == envelope.target_id => {
                if tables.send_app(app_id, envelope) {
                    Ok(())
                } else {
                    Err(DgLabError::Protocol(RetCode::RecipientNotFound))
                }
            }
            Some(_) => Err(DgLabError::Protocol(RetCode::IncompatibleRelationship)),
            None => Err(DgLabError::NotBound),
        }
    }

    /// Forget a closed local terminal and tell its App.
    pub async fn terminal_closed(&self, terminal_id: &str) {
        let mut tables = self.tables.write().await;
        tables.terminals.remove(terminal_id);
        if let Some(app_id) = tables.bindings.remove(terminal_id) {
            tables.send_app(
                &app_id,
                Envelope::with_code(
                    MsgType::Break,
                    terminal_id,
                    app_id.as_str(),
                    RetCode::ClientDisconnected,
                ),
            );
        }
        debug!(terminal_id, "local terminal closed");
    }

    /// Send a heartbeat to every connected App.
    pub async fn heartbeat(&self) {
        let tables = self.tables.read().await;
        for app_id in tables.apps.keys() {
            let terminal_id = tables.terminal_of(app_id).unwrap_or_default();
            tables.send_app(
                app_id,
                Envelope::with_code(MsgType::Heartbeat, terminal_id, app_id.as_str(), RetCode::Success),
            );
        }
        debug!(apps = tables.apps.len(), "heartbeat sent");
    }

    pub async fn terminal_count(&self) -> usize {
        self.tables.read().await.terminals.len()
    }

    pub async fn app_count(&self) -> usize {
        self.tables.read().await.apps.len()
    }

    /// App bound to `terminal_id`, if any.
    pub async fn bound_app(&self, terminal_id: &str) -> Option<String> {
        self.tables.read().await.bindings.get(terminal_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dglab_client::BindPhase;
    use dglab_core::DeviceLink;

    async fn app(hub: &RelayHub) -> (String, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app_id = hub.register_app(tx).await;
        let hello = rx.recv().await.unwrap();
        assert_eq!(hello.message, REGISTER_MARKER);
        assert_eq!(hello.client_id, app_id);
        (app_id, rx)
    }

    fn bind_request(terminal_id: &str, app_id: &str) -> String {
        serde_json::to_string(&Envelope::new(MsgType::Bind, terminal_id, app_id, BIND_MARKER))
            .unwrap()
    }

    #[tokio::test]
    async fn app_binds_to_local_terminal() {
        let hub = RelayHub::new();
        let link = hub.new_local_link().await;
        let (app_id, mut rx) = app(&hub).await;

        hub.app_frame(&app_id, &bind_request(link.client_id(), &app_id))
            .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ret_code(), Some(RetCode::Success));
        link.bind().await.unwrap();
        assert_eq!(link.target_id(), Some(app_id.clone()));
        assert_eq!(hub.bound_app(link.client_id()).await, Some(app_id));
    }

    #[tokio::test]
    async fn bind_to_unknown_terminal_is_401() {
        let hub = RelayHub::new();
        let (app_id, mut rx) = app(&hub).await;
        hub.app_frame(&app_id, &bind_request("nobody", &app_id)).await;
        assert_eq!(
            rx.recv().await.unwrap().ret_code(),
            Some(RetCode::TargetClientNotFound)
        );
    }

    #[tokio::test]
    async fn second_app_gets_400() {
        let hub = RelayHub::new();
        let link = hub.new_local_link().await;
        let (first, _rx1) = app(&hub).await;
        let (second, mut rx2) = app(&hub).await;
        hub.app_frame(&first, &bind_request(link.client_id(), &first))
            .await;
        hub.app_frame(&second, &bind_request(link.client_id(), &second))
            .await;
        assert_eq!(
            rx2.recv().await.unwrap().ret_code(),
            Some(RetCode::IdAlreadyBound)
        );
    }

    #[tokio::test]
    async fn non_json_is_403() {
        let hub = RelayHub::new();
        let (app_id, mut rx) = app(&hub).await;
        hub.app_frame(&app_id, "not json").await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::Error);
        assert_eq!(reply.ret_code(), Some(RetCode::NonJsonContent));
    }

    #[tokio::test]
    async fn unbound_msg_is_402() {
        let hub = RelayHub::new();
        let link = hub.new_local_link().await;
        let (app_id, mut rx) = app(&hub).await;
        let msg = Envelope::new(MsgType::Msg, link.client_id(), app_id.as_str(), "feedback-1");
        hub.app_frame(&app_id, &serde_json::to_string(&msg).unwrap())
            .await;
        assert_eq!(
            rx.recv().await.unwrap().ret_code(),
            Some(RetCode::IncompatibleRelationship)
        );
    }

    #[tokio::test]
    async fn status_and_disconnect_reach_terminal() {
        let hub = RelayHub::new();
        let link = hub.new_local_link().await;
        let mut events = link.events().unwrap();
        let (app_id, mut rx) = app(&hub).await;
        hub.app_frame(&app_id, &bind_request(link.client_id(), &app_id))
            .await;
        rx.recv().await.unwrap();

        let msg = Envelope::new(
            MsgType::Msg,
            link.client_id(),
            app_id.as_str(),
            "strength-5+6+70+80",
        );
        hub.app_frame(&app_id, &serde_json::to_string(&msg).unwrap())
            .await;
        use futures_util::StreamExt;
        assert!(matches!(
            events.next().await,
            Some(dglab_core::LinkEvent::Strength(_))
        ));

        hub.app_disconnected(&app_id).await;
        assert_eq!(
            events.next().await,
            Some(dglab_core::LinkEvent::Disconnected(RetCode::ClientDisconnected))
        );
        assert_eq!(link.state().phase(), BindPhase::Unbound);
        assert_eq!(hub.app_count().await, 0);
    }

    #[tokio::test]
    async fn terminal_commands_reach_app_and_close_breaks() {
        let hub = RelayHub::new();
        let link = hub.new_local_link().await;
        let (app_id, mut rx) = app(&hub).await;
        hub.app_frame(&app_id, &bind_request(link.client_id(), &app_id))
            .await;
        rx.recv().await.unwrap();
        link.bind().await.unwrap();

        link.clear_queue(dglab_core::Channel::B).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, MsgType::Msg);
        assert_eq!(frame.message, "clear-2");

        link.close().await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.msg_type, MsgType::Break);
        assert_eq!(frame.ret_code(), Some(RetCode::ClientDisconnected));
        assert_eq!(hub.terminal_count().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_reaches_every_app() {
        let hub = RelayHub::new();
        let (_a, mut rx_a) = app(&hub).await;
        let (_b, mut rx_b) = app(&hub).await;
        hub.heartbeat().await;
        assert_eq!(rx_a.recv().await.unwrap().msg_type, MsgType::Heartbeat);
        assert_eq!(rx_b.recv().await.unwrap().msg_type, MsgType::Heartbeat);
    }
}
