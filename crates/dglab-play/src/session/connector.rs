//! Outward link establishment.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use dglab_client::RemoteLink;
use dglab_core::{DeviceLink, DgLabResult};

/// Opens a new terminal connection on demand.
///
/// The caller bounds the call with its registration timeout.
pub trait LinkConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, DgLabResult<Arc<dyn DeviceLink>>>;
}

/// Connects terminals to a remote relay over WebSocket.
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    uri: String,
}

impl RemoteConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl LinkConnector for RemoteConnector {
    fn connect(&self) -> BoxFuture<'_, DgLabResult<Arc<dyn DeviceLink>>> {
        Box::pin(async move {
            let link = RemoteLink::connect(&self.uri).await?;
            let link: Arc<dyn DeviceLink> = Arc::new(link);
            Ok(link)
        })
    }
}
