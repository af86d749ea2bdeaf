//! Locally hosted relay: App listener, routing hub and in-process terminals.

pub mod hub;
pub mod listener;
pub mod local;

pub use hub::RelayHub;
pub use listener::RelayListener;
pub use local::LocalLink;
