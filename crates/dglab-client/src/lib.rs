//! dglab-client: terminal side of the DG-Lab socket protocol.
//!
//! [`ClientState`] tracks one terminal's binding and turns relay frames into
//! [`LinkEvent`](dglab_core::LinkEvent)s. [`RemoteLink`] wraps it around an
//! outward WebSocket connection to a relay server.
//!
//! ```no_run
//! use dglab_client::RemoteLink;
//! use dglab_core::DeviceLink;
//!
//! # async fn example() -> dglab_core::DgLabResult<()> {
//! let link = RemoteLink::connect("wss://relay.example.com").await?;
//! println!("scan: {}", link.pairing_uri("wss://relay.example.com"));
//! link.bind().await?;
//! # Ok(())
//! # }
//! ```

pub mod remote;
pub mod state;

pub use remote::{validate_relay_uri, RemoteLink};
pub use state::{BindPhase, ClientState};

pub use dglab_core::{DgLabError, DgLabResult};
