pub mod connector;
pub mod gate;
pub mod lifecycle;
#[cfg(test)]
pub mod mock;
pub mod scheduler;

pub use connector::{LinkConnector, RemoteConnector};
pub use gate::Gate;
pub use lifecycle::{LinkSource, Session, SessionState, Waveform};
pub use scheduler::{ReplayPlan, WaveformScheduler, QUEUE_CAPACITY};
