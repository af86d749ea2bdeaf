//! Per-tenant terminal session.
//!
//! A session owns one device link and drives it through
//! `register -> bind -> serve -> (rebind -> serve)* -> destroy` on a
//! background task. Callers observe the registration and bind milestones
//! through two [`Gate`]s and read the latest device status at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures_util::StreamExt;
use tokio::sync::{watch, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use dglab_core::{
    Channel, DeviceLink, DgLabError, DgLabResult, FeedbackButton, LinkEvent, PulseOperation,
    StrengthData, StrengthOperation,
};

use super::connector::LinkConnector;
use super::gate::Gate;
use super::scheduler::WaveformScheduler;
use crate::config::SessionSettings;
use crate::registry::Registry;

/// Where a session gets its device link from.
pub enum LinkSource {
    /// Already registered, e.g. allocated by the local relay.
    Ready(Arc<dyn DeviceLink>),
    /// Connect outward on the serve task.
    Connect(Arc<dyn LinkConnector>),
}

/// Lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Registering,
    BoundWait,
    Serving,
    Rebinding,
    Destroyed,
}

/// The waveform currently looping on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Waveform {
    pub names: Vec<String>,
    pub segments: Vec<PulseOperation>,
}

pub struct Session {
    tenant_id: String,
    group_id: RwLock<Option<String>>,
    link: OnceLock<Arc<dyn DeviceLink>>,
    last_status: RwLock<Option<StrengthData>>,
    last_feedback: RwLock<Option<FeedbackButton>>,
    waveform: RwLock<Waveform>,
    destroyed: AtomicBool,
    state: watch::Sender<SessionState>,
    registered: Gate,
    bound: Gate,
    serve_task: Mutex<Option<AbortHandle>>,
    pulse_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    registry: Weak<Registry>,
    settings: Arc<SessionSettings>,
}

impl Session {
    /// Create a session and start serving it in the background.
    ///
    /// Both gates are still closed when this returns.
    pub fn open(
        tenant_id: impl Into<String>,
        registry: Weak<Registry>,
        source: LinkSource,
        settings: Arc<SessionSettings>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            tenant_id: tenant_id.into(),
            group_id: RwLock::new(None),
            link: OnceLock::new(),
            last_status: RwLock::new(None),
            last_feedback: RwLock::new(None),
            waveform: RwLock::new(Waveform::default()),
            destroyed: AtomicBool::new(false),
            state: watch::Sender::new(SessionState::Created),
            registered: Gate::new(),
            bound: Gate::new(),
            serve_task: Mutex::new(None),
            pulse_task: tokio::sync::Mutex::new(None),
            registry,
            settings,
        });
        if let LinkSource::Ready(link) = &source {
            let _ = session.link.set(link.clone());
        }

        let handle = tokio::spawn(session.clone().serve(source));
        if let Ok(mut task) = session.serve_task.lock() {
            *task = Some(handle.abort_handle());
        }
        debug!(tenant = %session.tenant_id, "session opened");
        session
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn group_id(&self) -> Option<String> {
        self.group_id.read().await.clone()
    }

    pub(crate) async fn set_group_id(&self, group_id: Option<String>) {
        *self.group_id.write().await = group_id;
    }

    pub fn link(&self) -> Option<Arc<dyn DeviceLink>> {
        self.link.get().cloned()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.link.get().map(|link| link.client_id())
    }

    /// QR code payload for the App, once registered.
    pub fn pairing_uri(&self) -> Option<String> {
        self.link
            .get()
            .map(|link| link.pairing_uri(&self.settings.pairing_base))
    }

    pub async fn last_status(&self) -> Option<StrengthData> {
        *self.last_status.read().await
    }

    pub async fn last_feedback(&self) -> Option<FeedbackButton> {
        *self.last_feedback.read().await
    }

    pub async fn waveform(&self) -> Waveform {
        self.waveform.read().await.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until registration finished, one way or another.
    pub async fn wait_registered(&self) {
        self.registered.wait().await
    }

    /// Wait until the first bind finished, one way or another.
    pub async fn wait_bound(&self) {
        self.bound.wait().await
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_released()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Destroyed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    async fn serve(self: Arc<Self>, source: LinkSource) {
        // Guards drop in reverse order: registration is released before bind.
        let _bind_guard = self.bound.release_on_drop();
        let register_guard = self.registered.release_on_drop();

        let Some(link) = self.register(source).await else {
            return;
        };
        drop(register_guard);

        match self.wait_for_bind(false).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(DgLabError::Closed) => {
                info!(tenant = %self.tenant_id, "device link closed before bind");
                self.destroy().await;
                return;
            }
            Err(e) => {
                error!(tenant = %self.tenant_id, error = %e, "bind failed");
                return;
            }
        }

        match self.receive(&link).await {
            Ok(()) => {
                if !self.is_destroyed() {
                    info!(tenant = %self.tenant_id, "device link closed");
                    self.destroy().await;
                }
            }
            Err(DgLabError::Closed) => {
                info!(tenant = %self.tenant_id, "device link closed during rebind");
                self.destroy().await;
            }
            Err(e) => {
                error!(tenant = %self.tenant_id, error = %e, "session serve loop failed");
            }
        }
    }

    async fn register(&self, source: LinkSource) -> Option<Arc<dyn DeviceLink>> {
        let connector = match source {
            LinkSource::Ready(link) => return Some(link),
            LinkSource::Connect(connector) => connector,
        };
        self.set_state(SessionState::Registering);
        let register_timeout = self.settings.timeouts.register_timeout;
        match timeout(register_timeout, connector.connect()).await {
            Ok(Ok(link)) => {
                if self.link.set(link.clone()).is_err() {
                    warn!(tenant = %self.tenant_id, "device link already assigned");
                    let _ = link.close().await;
                    return None;
                }
                if self.is_destroyed() {
                    let _ = link.close().await;
                    return None;
                }
                info!(
                    tenant = %self.tenant_id,
                    client_id = %link.client_id(),
                    "terminal registered"
                );
                Some(link)
            }
            Ok(Err(e)) => {
                error!(tenant = %self.tenant_id, error = %e, "terminal registration failed");
                None
            }
            Err(_) => {
                warn!(
                    tenant = %self.tenant_id,
                    timeout_secs = register_timeout.as_secs_f64(),
                    "terminal registration timed out"
                );
                self.destroy().await;
                None
            }
        }
    }

    /// Wait for the App to bind (or rebind) within the bind timeout.
    ///
    /// Returns `Ok(false)` after destroying the session on timeout. Fails with
    /// `NotBound` before registration, leaving the bind gate closed; once a
    /// link exists the bind gate is released on every path out.
    pub async fn wait_for_bind(&self, rebind: bool) -> DgLabResult<bool> {
        let link = self.link.get().cloned().ok_or(DgLabError::NotBound)?;
        let _guard = self.bound.release_on_drop();
        self.set_state(if rebind {
            SessionState::Rebinding
        } else {
            SessionState::BoundWait
        });

        let bind_timeout = self.settings.timeouts.bind_timeout;
        let pending = if rebind { link.rebind() } else { link.bind() };
        match timeout(bind_timeout, pending).await {
            Ok(Ok(())) => {
                self.set_state(SessionState::Serving);
                info!(
                    tenant = %self.tenant_id,
                    target_id = link.target_id().unwrap_or_default(),
                    rebind,
                    "terminal bound"
                );
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    tenant = %self.tenant_id,
                    timeout_secs = bind_timeout.as_secs_f64(),
                    rebind,
                    "bind timed out"
                );
                self.destroy().await;
                Ok(false)
            }
        }
    }

    /// Consume status updates until the link's stream ends.
    async fn receive(&self, link: &Arc<dyn DeviceLink>) -> DgLabResult<()> {
        let mut events = link
            .events()
            .ok_or_else(|| DgLabError::Other("status stream already taken".into()))?;
        while let Some(event) = events.next().await {
            match event {
                LinkEvent::Strength(data) => {
                    debug!(tenant = %self.tenant_id, ?data, "strength update");
                    *self.last_status.write().await = Some(data);
                }
                LinkEvent::Feedback(button) => {
                    debug!(tenant = %self.tenant_id, button = button.index(), "feedback");
                    *self.last_feedback.write().await = Some(button);
                }
                LinkEvent::Disconnected(code) => {
                    info!(
                        tenant = %self.tenant_id,
                        code = code.code(),
                        "app disconnected, waiting for rebind"
                    );
                    if !self.wait_for_bind(true).await? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace the looping waveform and restart replay on `channels`.
    ///
    /// Any running replay is cancelled and joined before the new one starts.
    pub async fn setup_pulse_job(
        &self,
        names: Vec<String>,
        segments: Vec<PulseOperation>,
        channels: &[Channel],
    ) -> DgLabResult<()> {
        if self.is_destroyed() {
            return Err(DgLabError::Closed);
        }
        let link = self.link.get().cloned().ok_or(DgLabError::NotBound)?;
        {
            let mut waveform = self.waveform.write().await;
            waveform.names.clear();
            waveform.names.extend(names);
            waveform.segments.clear();
            waveform.segments.extend_from_slice(&segments);
        }

        let mut task = self.pulse_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
            let _ = previous.await;
        }
        if self.is_destroyed() {
            return Err(DgLabError::Closed);
        }
        let scheduler = WaveformScheduler::new(
            self.tenant_id.clone(),
            link,
            segments,
            channels.to_vec(),
            self.settings.pulse.clone(),
        );
        *task = Some(tokio::spawn(scheduler.run()));
        Ok(())
    }

    /// Forward a strength command to the device.
    pub async fn set_strength(
        &self,
        channel: Channel,
        operation: StrengthOperation,
        value: u8,
    ) -> DgLabResult<()> {
        if self.is_destroyed() {
            return Err(DgLabError::Closed);
        }
        let link = self.link.get().ok_or(DgLabError::NotBound)?;
        link.set_strength(channel, operation, value).await
    }

    /// Tear the session down. Only the first call has any effect.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(SessionState::Destroyed);

        if let Some(link) = self.link.get() {
            if let Err(e) = link.close().await {
                warn!(tenant = %self.tenant_id, error = %e, "closing device link failed");
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self).await;
        }
        self.registered.release();
        self.bound.release();

        if let Some(task) = self.pulse_task.lock().await.take() {
            task.abort();
        }
        let serve = self.serve_task.lock().ok().and_then(|mut task| task.take());
        if let Some(serve) = serve {
            serve.abort();
        }
        info!(tenant = %self.tenant_id, "session destroyed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}
