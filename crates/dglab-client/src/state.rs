//! Per-terminal protocol state.
//!
//! Owns the bind phase (watched by `bind`/`rebind` callers) and the status
//! event channel. Frames from the relay are fed in through [`ClientState::handle`]
//! by whichever transport carries them.

use std::sync::Mutex;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use dglab_core::messages::{DataMessage, Envelope, MsgType, RetCode};
use dglab_core::pulse::{PulseOperation, MAX_PULSES_PER_MESSAGE};
use dglab_core::strength::{Channel, StrengthOperation};
use dglab_core::{DgLabError, DgLabResult, LinkEvent};

/// Binding state of a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindPhase {
    Unbound,
    /// Bound to the App with this id.
    Bound(String),
    Closed,
}

/// Protocol state for one terminal.
pub struct ClientState {
    client_id: String,
    phase: watch::Sender<BindPhase>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl ClientState {
    pub fn new(client_id: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client_id: client_id.into(),
            phase: watch::Sender::new(BindPhase::Unbound),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn phase(&self) -> BindPhase {
        self.phase.borrow().clone()
    }

    pub fn target_id(&self) -> Option<String> {
        match &*self.phase.borrow() {
            BindPhase::Bound(target) => Some(target.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.phase.borrow(), BindPhase::Closed)
    }

    /// Wait until the terminal is bound. Fails with `Closed` if the link
    /// closes first.
    pub async fn wait_bound(&self) -> DgLabResult<()> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|p| !matches!(p, BindPhase::Unbound))
            .await
            .map_err(|_| DgLabError::Closed)?;
        match &*phase {
            BindPhase::Bound(_) => Ok(()),
            _ => Err(DgLabError::Closed),
        }
    }

    /// Take the status event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<BoxStream<'static, LinkEvent>> {
        let rx = self.events_rx.lock().ok()?.take()?;
        Some(
            stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
        )
    }

    /// Apply one frame received from the relay.
    pub fn handle(&self, envelope: &Envelope) {
        match envelope.msg_type {
            MsgType::Bind => match envelope.ret_code() {
                Some(RetCode::Success) => {
                    info!(
                        client_id = %self.client_id,
                        target_id = %envelope.target_id,
                        "terminal bound to app"
                    );
                    let target = envelope.target_id.clone();
                    self.phase.send_if_modified(|phase| {
                        if matches!(phase, BindPhase::Closed) {
                            return false;
                        }
                        *phase = BindPhase::Bound(target);
                        true
                    });
                }
                Some(code) => {
                    warn!(client_id = %self.client_id, code = code.code(), "bind rejected by relay");
                }
                None => {
                    debug!(client_id = %self.client_id, body = %envelope.message, "ignoring bind frame");
                }
            },
            MsgType::Msg => match DataMessage::parse(&envelope.message) {
                Ok(DataMessage::Strength(data)) => self.emit(LinkEvent::Strength(data)),
                Ok(DataMessage::Feedback(button)) => self.emit(LinkEvent::Feedback(button)),
                Ok(other) => {
                    debug!(client_id = %self.client_id, ?other, "ignoring app-bound payload");
                }
                Err(e) => {
                    warn!(client_id = %self.client_id, error = %e, "unparseable msg body");
                }
            },
            MsgType::Break => {
                let code = envelope.ret_code().unwrap_or(RetCode::ClientDisconnected);
                self.phase.send_if_modified(|phase| {
                    if matches!(phase, BindPhase::Bound(_)) {
                        *phase = BindPhase::Unbound;
                        true
                    } else {
                        false
                    }
                });
                self.emit(LinkEvent::Disconnected(code));
            }
            MsgType::Heartbeat => {
                debug!(client_id = %self.client_id, "heartbeat");
            }
            MsgType::Error => {
                warn!(client_id = %self.client_id, body = %envelope.message, "relay reported error");
            }
        }
    }

    /// Mark the link closed: pending binds fail and the event stream ends.
    pub fn close(&self) {
        self.phase.send_replace(BindPhase::Closed);
        if let Ok(mut tx) = self.events_tx.lock() {
            tx.take();
        }
    }

    /// Wrap a payload in a `msg` frame addressed to the bound App.
    pub fn outbound(&self, data: &DataMessage) -> DgLabResult<Envelope> {
        let target = match &*self.phase.borrow() {
            BindPhase::Bound(target) => target.clone(),
            BindPhase::Unbound => return Err(DgLabError::NotBound),
            BindPhase::Closed => return Err(DgLabError::Closed),
        };
        Ok(Envelope::new(
            MsgType::Msg,
            self.client_id.clone(),
            target,
            data.to_body(),
        ))
    }

    pub fn pulse_frame(&self, channel: Channel, segments: &[PulseOperation]) -> DgLabResult<Envelope> {
        if segments.len() > MAX_PULSES_PER_MESSAGE {
            return Err(DgLabError::PulseTooLong {
                count: segments.len(),
                max: MAX_PULSES_PER_MESSAGE,
            });
        }
        self.outbound(&DataMessage::Pulse {
            channel,
            operations: segments.to_vec(),
        })
    }

    pub fn clear_frame(&self, channel: Channel) -> DgLabResult<Envelope> {
        self.outbound(&DataMessage::Clear(channel))
    }

    pub fn strength_frame(
        &self,
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    ) -> DgLabResult<Envelope> {
        self.outbound(&DataMessage::SetStrength {
            channel,
            operation,
            value,
        })
    }

    fn emit(&self, event: LinkEvent) {
        let sent = self
            .events_tx
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(event).is_ok()))
            .unwrap_or(false);
        if !sent {
            debug!(client_id = %self.client_id, ?event, "event dropped, stream closed");
        }
    }
}
