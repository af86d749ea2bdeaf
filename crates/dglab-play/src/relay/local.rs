//! Terminal hosted inside the local relay.

use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use dglab_client::ClientState;
use dglab_core::{
    Channel, DeviceLink, DgLabError, DgLabResult, Envelope, LinkEvent, PulseOperation,
    StrengthOperation,
};

use super::hub::RelayHub;

/// A terminal whose frames go straight through the [`RelayHub`].
pub struct LocalLink {
    state: Arc<ClientState>,
    hub: Weak<RelayHub>,
}

impl LocalLink {
    pub(super) fn new(state: Arc<ClientState>, hub: Weak<RelayHub>) -> Self {
        Self { state, hub }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    async fn send(&self, envelope: Envelope) -> DgLabResult<()> {
        let hub = self.hub.upgrade().ok_or(DgLabError::Closed)?;
        hub.terminal_send(envelope).await
    }
}

impl DeviceLink for LocalLink {
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
            if let Some(hub) = self.hub.upgrade() {
                hub.terminal_closed(self.state.client_id()).await;
            }
            Ok(())
        })
    }
}
