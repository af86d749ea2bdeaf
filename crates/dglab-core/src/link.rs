//! Abstract device link for DG-Lab terminals.
//!
//! Both the outward WebSocket link and the in-process link hosted by a local
//! relay satisfy this trait. Methods return boxed futures so that sessions
//! can hold an `Arc<dyn DeviceLink>` regardless of which side created it.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::DgLabResult;
use crate::messages::RetCode;
use crate::pulse::PulseOperation;
use crate::strength::{Channel, FeedbackButton, StrengthData, StrengthOperation};

/// Base of the QR code payload the DG-Lab App understands.
const PAIRING_PREFIX: &str = "https://www.dungeon-lab.com/app-download.php#DGLAB-SOCKET#";

/// A status update pushed by the App through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Strength(StrengthData),
    Feedback(FeedbackButton),
    /// The App side of the binding is gone; the terminal must rebind.
    Disconnected(RetCode),
}

/// Transport-level handle to one terminal connection.
pub trait DeviceLink: Send + Sync {
    /// Terminal id assigned by the relay at registration.
    fn client_id(&self) -> &str;

    /// App id of the current binding, if bound.
    fn target_id(&self) -> Option<String>;

    /// Wait until an App binds to this terminal.
    fn bind(&self) -> BoxFuture<'_, DgLabResult<()>>;

    /// Wait until an App binds again after a disconnect notice.
    fn rebind(&self) -> BoxFuture<'_, DgLabResult<()>>;

    /// Take the status update stream. Yields `Some` exactly once; the stream
    /// ends when the link closes.
    fn events(&self) -> Option<BoxStream<'static, LinkEvent>>;

    /// Empty the App's pulse queue for one channel.
    fn clear_queue(&self, channel: Channel) -> BoxFuture<'_, DgLabResult<()>>;

    /// Append pulse operations to one channel's queue.
    ///
    /// Fails with `PulseTooLong` when more than
    /// [`MAX_PULSES_PER_MESSAGE`](crate::pulse::MAX_PULSES_PER_MESSAGE)
    /// operations are submitted at once.
    fn add_segments<'a>(
        &'a self,
        channel: Channel,
        segments: &'a [PulseOperation],
    ) -> BoxFuture<'a, DgLabResult<()>>;

    fn set_strength(
        &self,
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    ) -> BoxFuture<'_, DgLabResult<()>>;

    /// Close the underlying transport. Safe to call more than once.
    fn close(&self) -> BoxFuture<'_, DgLabResult<()>>;

    /// QR code payload for the App, derived from the relay's public address.
    fn pairing_uri(&self, base: &str) -> String {
        pairing_uri(base, self.client_id())
    }
}

/// Build the App pairing payload for `client_id` reachable through `base`.
pub fn pairing_uri(base: &str, client_id: &str) -> String {
    format!("{PAIRING_PREFIX}{}/{client_id}", base.trim_end_matches('/'))
}
