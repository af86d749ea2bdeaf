//! In-memory device link for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::time::Instant;

use dglab_client::ClientState;
use dglab_core::{
    Channel, DataMessage, DeviceLink, DgLabResult, Envelope, LinkEvent, MsgType, PulseOperation, RetCode,
    StrengthData, StrengthOperation,
};

use super::connector::LinkConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    Clear(Channel),
    Pulse { channel: Channel, len: usize },
    Strength {
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    },
}

#[derive(Debug, Clone)]
pub struct Sent {
    /// Time since the link was created.
    pub at: Duration,
    pub command: MockCommand,
}

/// A link whose App side is driven by the test.
pub struct MockLink {
    state: ClientState,
    created: Instant,
    sent: Mutex<Vec<Sent>>,
    /// Bind and rebind never complete, even after close.
    unresponsive: bool,
}

impl MockLink {
    pub fn new(client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            state: ClientState::new(client_id),
            created: Instant::now(),
            sent: Mutex::new(Vec::new()),
            unresponsive: false,
        })
    }

    pub fn unresponsive(client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            state: ClientState::new(client_id),
            created: Instant::now(),
            sent: Mutex::new(Vec::new()),
            unresponsive: true,
        })
    }

    pub fn bound(client_id: &str, app_id: &str) -> Arc<Self> {
        let link = Self::new(client_id);
        link.bind_app(app_id);
        link
    }

    pub fn bind_app(&self, app_id: &str) {
        self.state.handle(&Envelope::with_code(
            MsgType::Bind,
            self.state.client_id(),
            app_id,
            RetCode::Success,
        ));
    }

    pub fn report_strength(&self, data: StrengthData) {
        let body = DataMessage::Strength(data).to_body();
        self.state.handle(&Envelope::new(
            MsgType::Msg,
            self.state.client_id(),
            self.target_id().unwrap_or_default(),
            body,
        ));
    }

    /// Send a `feedback-N` frame from the App.
    pub fn press_feedback(&self, index: u8) {
        self.state.handle(&Envelope::new(
            MsgType::Msg,
            self.state.client_id(),
            self.target_id().unwrap_or_default(),
            format!("feedback-{index}"),
        ));
    }

    pub fn app_disconnected(&self) {
        self.state.handle(&Envelope::with_code(
            MsgType::Break,
            self.state.client_id(),
            "",
            RetCode::ClientDisconnected,
        ));
    }

    /// Simulate the transport dropping.
    pub fn drop_transport(&self) {
        self.state.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, command: MockCommand) {
        self.sent.lock().unwrap().push(Sent {
            at: self.created.elapsed(),
            command,
        });
    }
}

impl DeviceLink for MockLink {
    fn client_id(&self) -> &str {
        self.state.client_id()
    }

    fn target_id(&self) -> Option<String> {
        self.state.target_id()
    }

    fn bind(&self) -> BoxFuture<'_, DgLabResult<()>> {
        if self.unresponsive {
            return Box::pin(std::future::pending());
        }
        Box::pin(self.state.wait_bound())
    }

    fn rebind(&self) -> BoxFuture<'_, DgLabResult<()>> {
        self.bind()
    }

    fn events(&self) -> Option<BoxStream<'static, LinkEvent>> {
        self.state.take_events()
    }

    fn clear_queue(&self, channel: Channel) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            self.state.clear_frame(channel)?;
            self.record(MockCommand::Clear(channel));
            Ok(())
        })
    }

    fn add_segments<'a>(
        &'a self,
        channel: Channel,
        segments: &'a [PulseOperation],
    ) -> BoxFuture<'a, DgLabResult<()>> {
        Box::pin(async move {
            self.state.pulse_frame(channel, segments)?;
            self.record(MockCommand::Pulse {
                channel,
                len: segments.len(),
            });
            Ok(())
        })
    }

    fn set_strength(
        &self,
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    ) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            self.state.strength_frame(channel, operation, value)?;
            self.record(MockCommand::Strength {
                channel,
                operation,
                value,
            });
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, DgLabResult<()>> {
        Box::pin(async move {
            self.state.close();
            Ok(())
        })
    }
}

/// Hands out fresh [`MockLink`]s, or never completes when `stalled`.
pub struct MockConnector {
    stalled: bool,
    counter: AtomicUsize,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stalled: false,
            counter: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            stalled: true,
            counter: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    /// Links handed out so far, oldest first.
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().unwrap().clone()
    }
}

impl LinkConnector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, DgLabResult<Arc<dyn DeviceLink>>> {
        Box::pin(async move {
            if self.stalled {
                std::future::pending::<()>().await;
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let link = MockLink::new(&format!("terminal-{n}"));
            self.links.lock().unwrap().push(link.clone());
            let link: Arc<dyn DeviceLink> = link;
            Ok(link)
        })
    }
}
