//! Process-wide session registry.
//!
//! Maps tenants to their session and groups to their members. Sessions
//! report their own teardown through [`Registry::remove`], so the tables
//! only ever hold live members.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::{info, warn};

use dglab_core::DgLabResult;

use crate::config::{LocalRelaySettings, RelayMode, SessionSettings};
use crate::relay::{RelayHub, RelayListener};
use crate::session::{LinkConnector, LinkSource, RemoteConnector, Session};

/// A group member with no device behind it, for trying out group play.
#[derive(Debug)]
pub struct VirtualPlayer {
    tenant_id: String,
    group_id: RwLock<Option<String>>,
}

impl VirtualPlayer {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: RwLock::new(None),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

/// Anything that can sit in the tenant table or a group.
#[derive(Debug, Clone)]
pub enum Member {
    Device(Arc<Session>),
    Virtual(Arc<VirtualPlayer>),
}

impl Member {
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Device(session) => session.tenant_id(),
            Self::Virtual(player) => player.tenant_id(),
        }
    }

    pub async fn group_id(&self) -> Option<String> {
        match self {
            Self::Device(session) => session.group_id().await,
            Self::Virtual(player) => player.group_id.read().await.clone(),
        }
    }

    async fn set_group_id(&self, group_id: Option<String>) {
        match self {
            Self::Device(session) => session.set_group_id(group_id).await,
            Self::Virtual(player) => *player.group_id.write().await = group_id,
        }
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            Self::Device(session) => Some(session),
            Self::Virtual(_) => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }

    pub fn is_destroyed(&self) -> bool {
        match self {
            Self::Device(session) => session.is_destroyed(),
            Self::Virtual(_) => false,
        }
    }

    /// Same underlying member, not just the same tenant.
    pub fn same_as(&self, other: &Member) -> bool {
        match (self, other) {
            (Self::Device(a), Self::Device(b)) => Arc::ptr_eq(a, b),
            (Self::Virtual(a), Self::Virtual(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn is_session(&self, session: &Session) -> bool {
        matches!(self, Self::Device(s) if std::ptr::eq(Arc::as_ptr(s), session))
    }
}

enum Backend {
    Remote(Arc<dyn LinkConnector>),
    Local(LocalRelaySettings),
}

/// Tenant and group tables plus the relay sessions use.
pub struct Registry {
    me: Weak<Registry>,
    tenants: RwLock<HashMap<String, Member>>,
    groups: RwLock<HashMap<String, Vec<Member>>>,
    hub: RwLock<Option<Arc<RelayHub>>>,
    backend: Backend,
    settings: Arc<SessionSettings>,
}

impl Registry {
    pub fn new(relay: &RelayMode, settings: SessionSettings) -> Arc<Self> {
        let backend = match relay {
            RelayMode::Remote { uri } => Backend::Remote(Arc::new(RemoteConnector::new(uri.clone()))),
            RelayMode::Local(local) => Backend::Local(local.clone()),
        };
        Self::with_backend(backend, settings)
    }

    /// Registry whose sessions connect outward through `connector`.
    pub fn with_connector(connector: Arc<dyn LinkConnector>, settings: SessionSettings) -> Arc<Self> {
        Self::with_backend(Backend::Remote(connector), settings)
    }

    fn with_backend(backend: Backend, settings: SessionSettings) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tenants: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            hub: RwLock::new(None),
            backend,
            settings: Arc::new(settings),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local(_))
    }

    /// Start the local relay, if this registry hosts one.
    ///
    /// The listener runs on its own task for the rest of the process.
    pub async fn serve(&self) -> DgLabResult<()> {
        match &self.backend {
            Backend::Local(local) => {
                let hub = RelayHub::new();
                let listener = RelayListener::bind(hub.clone(), local).await?;
                *self.hub.write().await = Some(hub);
                tokio::spawn(listener.run());
                info!(publish_uri = %local.publish_uri, "apps connect through the local relay");
            }
            Backend::Remote(_) => {
                info!(relay = %self.settings.pairing_base, "apps connect through the remote relay");
            }
        }
        Ok(())
    }

    /// Use an already running hub instead of starting a listener.
    pub async fn attach_hub(&self, hub: Arc<RelayHub>) {
        *self.hub.write().await = Some(hub);
    }

    /// Create a session for `tenant_id` and wait until it is registered.
    ///
    /// Returns `None` when no link can be made: the local relay is not
    /// running, or outward registration failed. Does not check for an
    /// existing session; callers look one up first.
    pub async fn new_session(&self, tenant_id: &str) -> Option<Arc<Session>> {
        let source = match &self.backend {
            Backend::Local(_) => {
                let hub = self.hub.read().await.clone()?;
                LinkSource::Ready(hub.new_local_link().await)
            }
            Backend::Remote(connector) => LinkSource::Connect(connector.clone()),
        };

        let session = Session::open(tenant_id, self.me.clone(), source, self.settings.clone());
        let replaced = self
            .tenants
            .write()
            .await
            .insert(tenant_id.to_string(), Member::Device(session.clone()));
        // A replaced device session leaves its group when it is destroyed;
        // a virtual player has no teardown of its own.
        if let Some(previous @ Member::Virtual(_)) = replaced {
            self.leave_group(&previous).await;
        }
        session.wait_registered().await;

        if session.is_destroyed() || session.link().is_none() {
            warn!(tenant = %tenant_id, "terminal could not be registered");
            session.destroy().await;
            self.remove(&session).await;
            return None;
        }
        info!(tenant = %tenant_id, client_id = session.client_id().unwrap_or_default(), "terminal created");
        Some(session)
    }

    pub async fn member(&self, tenant_id: &str) -> Option<Member> {
        self.tenants.read().await.get(tenant_id).cloned()
    }

    pub async fn session(&self, tenant_id: &str) -> Option<Arc<Session>> {
        self.member(tenant_id)
            .await
            .and_then(|member| member.session().cloned())
    }

    /// All members, in no particular order.
    pub async fn members(&self) -> Vec<Member> {
        self.tenants.read().await.values().cloned().collect()
    }

    pub async fn group(&self, group_id: &str) -> Option<Vec<Member>> {
        self.groups.read().await.get(group_id).cloned()
    }

    /// Put `member` in `group_id`, leaving any previous group.
    ///
    /// Returns `false` if the member is already destroyed.
    pub async fn join_group(&self, member: &Member, group_id: &str) -> bool {
        let mut groups = self.groups.write().await;
        if member.is_destroyed() {
            return false;
        }
        if let Some(previous) = member.group_id().await {
            if previous == group_id {
                let present = groups
                    .get(group_id)
                    .is_some_and(|members| members.iter().any(|m| m.same_as(member)));
                if present {
                    return true;
                }
            }
            remove_from_group(&mut groups, &previous, |m| m.same_as(member));
        }
        groups
            .entry(group_id.to_string())
            .or_default()
            .push(member.clone());
        member.set_group_id(Some(group_id.to_string())).await;
        info!(tenant = %member.tenant_id(), group = %group_id, "joined group");
        true
    }

    /// Register a virtual player for `tenant_id` in `group_id`.
    pub async fn add_virtual(&self, tenant_id: &str, group_id: &str) -> Arc<VirtualPlayer> {
        let player = Arc::new(VirtualPlayer::new(tenant_id));
        let member = Member::Virtual(player.clone());
        let replaced = self
            .tenants
            .write()
            .await
            .insert(tenant_id.to_string(), member.clone());
        if let Some(previous) = replaced {
            self.leave_group(&previous).await;
        }
        self.join_group(&member, group_id).await;
        player
    }

    /// Drop a destroyed session from every table.
    pub async fn remove(&self, session: &Session) {
        {
            let mut tenants = self.tenants.write().await;
            let owned = tenants
                .get(session.tenant_id())
                .is_some_and(|member| member.is_session(session));
            if owned {
                tenants.remove(session.tenant_id());
            }
        }
        let mut groups = self.groups.write().await;
        if let Some(group_id) = session.group_id().await {
            remove_from_group(&mut groups, &group_id, |m| m.is_session(session));
        }
    }

    /// Remove any member from the tenant table and its group.
    pub async fn remove_member(&self, member: &Member) {
        if let Member::Device(session) = member {
            session.destroy().await;
            // Destroy already removed it, unless no registry was attached.
            self.remove(session).await;
            return;
        }
        {
            let mut tenants = self.tenants.write().await;
            let owned = tenants
                .get(member.tenant_id())
                .is_some_and(|m| m.same_as(member));
            if owned {
                tenants.remove(member.tenant_id());
            }
        }
        self.leave_group(member).await;
    }

    async fn leave_group(&self, member: &Member) {
        let mut groups = self.groups.write().await;
        if let Some(group_id) = member.group_id().await {
            remove_from_group(&mut groups, &group_id, |m| m.same_as(member));
            member.set_group_id(None).await;
        }
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }
}

fn remove_from_group(
    groups: &mut HashMap<String, Vec<Member>>,
    group_id: &str,
    matches: impl Fn(&Member) -> bool,
) {
    if let Some(members) = groups.get_mut(group_id) {
        members.retain(|m| !matches(m));
        if members.is_empty() {
            groups.remove(group_id);
            info!(group = %group_id, "group emptied");
        }
    }
}
