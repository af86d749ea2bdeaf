//! Command handlers over the registry.
//!
//! Each handler takes already-parsed arguments and returns a [`Reply`];
//! turning replies into chat text or images is left to the front end.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use dglab_core::{Channel, StrengthData, StrengthOperation};

use crate::pulses::PulseLibrary;
use crate::registry::{Member, Registry};
use crate::session::SessionState;

/// How a pulse command changes the current waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseMode {
    Reset,
    Append,
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Show this to the tenant as a QR code.
    PairingCode { tenant_id: String, uri: String },
    CreateFailed,
    Bound,
    BindTimeout,
    NotJoined,
    InvalidTarget,
    InvalidStrength,
    NoStrengthInfo,
    StrengthSet { a: u8, b: u8 },
    UnknownPulse(String),
    NoPulses,
    PulseSet(Vec<String>),
    Status {
        strength: Option<StrengthData>,
        pulses: Vec<String>,
    },
    PulseList(Vec<String>),
    Players(Vec<String>),
    NoPlayers,
    VirtualCreated(String),
    Left,
    Failed(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairingCode { tenant_id, uri } => {
                write!(f, "{tenant_id}: scan with the DG-Lab App: {uri}")
            }
            Self::CreateFailed => write!(f, "could not create a terminal"),
            Self::Bound => write!(f, "bound"),
            Self::BindTimeout => write!(f, "bind timed out"),
            Self::NotJoined => write!(f, "not joined yet"),
            Self::InvalidTarget => write!(f, "target has no device"),
            Self::InvalidStrength => write!(f, "strength must be a percentage in (0, 100]"),
            Self::NoStrengthInfo => write!(f, "no strength report from the device yet"),
            Self::StrengthSet { a, b } => write!(f, "strength set: A {a}, B {b}"),
            Self::UnknownPulse(name) => write!(f, "unknown pulse {name:?}"),
            Self::NoPulses => write!(f, "no pulses available"),
            Self::PulseSet(names) => write!(f, "pulse set: {}", names.join("-")),
            Self::Status { strength, pulses } => {
                match strength {
                    Some(s) => write!(f, "A {}/{}, B {}/{}", s.a, s.a_limit, s.b, s.b_limit)?,
                    None => write!(f, "strength unknown")?,
                }
                if pulses.is_empty() {
                    write!(f, "; no pulse")
                } else {
                    write!(f, "; pulse {}", pulses.join("-"))
                }
            }
            Self::PulseList(names) => write!(f, "{}", names.join(", ")),
            Self::Players(names) => write!(f, "players: {}", names.join(", ")),
            Self::NoPlayers => write!(f, "no players"),
            Self::VirtualCreated(tenant_id) => write!(f, "virtual player {tenant_id} created"),
            Self::Left => write!(f, "left the game"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Command entry points shared by every front end.
#[derive(Clone)]
pub struct Commands {
    registry: Arc<Registry>,
    pulses: Arc<PulseLibrary>,
}

impl Commands {
    pub fn new(registry: Arc<Registry>, pulses: Arc<PulseLibrary>) -> Self {
        Self { registry, pulses }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pulses(&self) -> &Arc<PulseLibrary> {
        &self.pulses
    }

    /// Reuse or create the tenant's terminal and return its pairing code.
    ///
    /// A reused terminal still registering is waited for. One that is
    /// already bound joins `group_id` right away; otherwise the group is
    /// joined by [`Commands::await_bind`].
    pub async fn device_join(&self, tenant_id: &str, group_id: Option<&str>) -> Reply {
        let session = match self.registry.session(tenant_id).await {
            Some(session) if !session.is_destroyed() => {
                session.wait_registered().await;
                if let Some(group_id) = group_id {
                    if matches!(session.state(), SessionState::Serving | SessionState::Rebinding) {
                        self.registry
                            .join_group(&Member::Device(session.clone()), group_id)
                            .await;
                    }
                }
                Some(session)
            }
            _ => self.registry.new_session(tenant_id).await,
        };
        match session.and_then(|s| s.pairing_uri()) {
            Some(uri) => Reply::PairingCode {
                tenant_id: tenant_id.to_string(),
                uri,
            },
            None => Reply::CreateFailed,
        }
    }

    /// Wait for the tenant's first bind, then join `group_id` if bound.
    pub async fn await_bind(&self, tenant_id: &str, group_id: Option<&str>) -> Reply {
        let Some(member) = self.registry.member(tenant_id).await else {
            return Reply::NotJoined;
        };
        let Some(session) = member.session() else {
            return Reply::InvalidTarget;
        };
        session.wait_bound().await;
        if session.is_destroyed() {
            return Reply::BindTimeout;
        }
        if let Some(group_id) = group_id {
            self.registry.join_group(&member, group_id).await;
        }
        Reply::Bound
    }

    /// Set both channels to `percent` of their limits.
    pub async fn strength_control(
        &self,
        target: &str,
        operation: StrengthOperation,
        percent: f64,
    ) -> Reply {
        if !(percent > 0.0 && percent <= 100.0) {
            return Reply::InvalidStrength;
        }
        let Some(session) = self.registry.session(target).await else {
            return Reply::InvalidTarget;
        };
        let Some(status) = session.last_status().await else {
            return Reply::NoStrengthInfo;
        };
        let a = scaled(status.a_limit, percent);
        let b = scaled(status.b_limit, percent);
        for (channel, value) in [(Channel::A, a), (Channel::B, b)] {
            if let Err(e) = session.set_strength(channel, operation, value).await {
                warn!(tenant = %target, error = %e, "strength command failed");
                return Reply::Failed(e.to_string());
            }
        }
        info!(tenant = %target, ?operation, a, b, "strength changed");
        Reply::StrengthSet { a, b }
    }

    /// Replace or extend the target's waveform with the named pulse.
    pub async fn pulse_control(&self, target: &str, mode: PulseMode, name: &str) -> Reply {
        let Some(pulse) = self.pulses.get(name) else {
            return Reply::UnknownPulse(name.to_string());
        };
        let Some(session) = self.registry.session(target).await else {
            return Reply::InvalidTarget;
        };
        let (names, segments) = match mode {
            PulseMode::Reset => (vec![name.to_string()], pulse.to_vec()),
            PulseMode::Append => {
                let mut current = session.waveform().await;
                current.names.push(name.to_string());
                current.segments.extend_from_slice(pulse);
                (current.names, current.segments)
            }
        };
        match session
            .setup_pulse_job(names.clone(), segments, &Channel::BOTH)
            .await
        {
            Ok(()) => Reply::PulseSet(names),
            Err(e) => Reply::Failed(e.to_string()),
        }
    }

    pub async fn random_pulse(&self, target: &str) -> Reply {
        let Some((name, _)) = self.pulses.random() else {
            return Reply::NoPulses;
        };
        let name = name.to_string();
        self.pulse_control(target, PulseMode::Reset, &name).await
    }

    pub async fn query_status(&self, target: &str) -> Reply {
        let Some(session) = self.registry.session(target).await else {
            return Reply::InvalidTarget;
        };
        Reply::Status {
            strength: session.last_status().await,
            pulses: session.waveform().await.names,
        }
    }

    pub fn show_pulses(&self) -> Reply {
        if self.pulses.is_empty() {
            Reply::NoPulses
        } else {
            Reply::PulseList(self.pulses.names().map(str::to_string).collect())
        }
    }

    /// Tenants of `group_id`, or of the whole registry.
    pub async fn players(&self, group_id: Option<&str>) -> Reply {
        let members = match group_id {
            Some(group_id) => self.registry.group(group_id).await.unwrap_or_default(),
            None => self.registry.members().await,
        };
        let mut names: Vec<String> = members.iter().map(|m| m.tenant_id().to_string()).collect();
        names.sort();
        if names.is_empty() {
            Reply::NoPlayers
        } else {
            Reply::Players(names)
        }
    }

    pub async fn create_virtual_player(&self, tenant_id: &str, group_id: &str) -> Reply {
        self.registry.add_virtual(tenant_id, group_id).await;
        info!(tenant = %tenant_id, group = %group_id, "virtual player created");
        Reply::VirtualCreated(tenant_id.to_string())
    }

    pub async fn leave(&self, tenant_id: &str) -> Reply {
        match self.registry.member(tenant_id).await {
            Some(member) => {
                self.registry.remove_member(&member).await;
                Reply::Left
            }
            None => Reply::NotJoined,
        }
    }
}

fn scaled(limit: u8, percent: f64) -> u8 {
    (f64::from(limit) * percent / 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientTimeouts, PulseSettings, SessionSettings};
    use crate::session::mock::{MockCommand, MockConnector, MockLink};
    use std::time::Duration;

    fn commands() -> (Commands, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let registry = Registry::with_connector(
            connector.clone(),
            SessionSettings {
                timeouts: ClientTimeouts::default(),
                pulse: PulseSettings {
                    duration_per_post: Duration::from_secs(5),
                    ..PulseSettings::default()
                },
                pairing_base: "wss://relay.example".into(),
            },
        );
        let pulses = PulseLibrary::from_json(
            r#"{"short": [[[10,10,10,10],[0,0,0,0]]], "long": [[[10,10,10,10],[100,100,100,100]],[[10,10,10,10],[50,50,50,50]]]}"#,
        )
        .unwrap();
        (Commands::new(registry, Arc::new(pulses)), connector)
    }

    async fn joined(commands: &Commands, connector: &MockConnector, tenant: &str) -> Arc<MockLink> {
        assert!(matches!(
            commands.device_join(tenant, None).await,
            Reply::PairingCode { .. }
        ));
        let link = connector.links().last().unwrap().clone();
        link.bind_app("app");
        assert_eq!(commands.await_bind(tenant, Some("g1")).await, Reply::Bound);
        link
    }

    #[tokio::test(start_paused = true)]
    async fn join_reuses_live_session() {
        let (commands, connector) = commands();
        let Reply::PairingCode { uri, .. } = commands.device_join("u1", None).await else {
            panic!("expected pairing code");
        };
        assert!(uri.ends_with("wss://relay.example/terminal-0"));
        commands.device_join("u1", None).await;
        assert_eq!(connector.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_joins_share_one_terminal() {
        let (commands, connector) = commands();
        let (first, second) = tokio::join!(
            commands.device_join("u1", None),
            commands.device_join("u1", None)
        );
        assert!(matches!(first, Reply::PairingCode { .. }));
        assert_eq!(first, second);
        assert_eq!(connector.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bound_rejoin_switches_group() {
        let (commands, connector) = commands();
        joined(&commands, &connector, "u1").await;
        commands.device_join("u1", Some("g2")).await;
        assert!(commands.registry().group("g1").await.is_none());
        assert_eq!(commands.registry().group("g2").await.unwrap().len(), 1);
        assert_eq!(connector.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bind_timeout_is_reported() {
        let (commands, _connector) = commands();
        commands.device_join("u1", None).await;
        assert_eq!(commands.await_bind("u1", Some("g1")).await, Reply::BindTimeout);
        assert!(commands.registry().group("g1").await.is_none());
        assert_eq!(commands.await_bind("u1", None).await, Reply::NotJoined);
    }

    #[tokio::test(start_paused = true)]
    async fn strength_scales_limits() {
        let (commands, connector) = commands();
        let link = joined(&commands, &connector, "u1").await;
        assert_eq!(
            commands
                .strength_control("u1", StrengthOperation::Set, 50.0)
                .await,
            Reply::NoStrengthInfo
        );

        link.report_strength(StrengthData {
            a: 0,
            b: 0,
            a_limit: 75,
            b_limit: 40,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            commands
                .strength_control("u1", StrengthOperation::Set, 50.0)
                .await,
            Reply::StrengthSet { a: 38, b: 20 }
        );
        let sent: Vec<MockCommand> = link.sent().into_iter().map(|s| s.command).collect();
        assert_eq!(
            sent,
            vec![
                MockCommand::Strength {
                    channel: Channel::A,
                    operation: StrengthOperation::Set,
                    value: 38
                },
                MockCommand::Strength {
                    channel: Channel::B,
                    operation: StrengthOperation::Set,
                    value: 20
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn strength_percent_bounds() {
        let (commands, _connector) = commands();
        for percent in [0.0, -5.0, 100.5, f64::NAN] {
            assert_eq!(
                commands
                    .strength_control("u1", StrengthOperation::Increase, percent)
                    .await,
                Reply::InvalidStrength
            );
        }
        assert_eq!(
            commands
                .strength_control("u1", StrengthOperation::Increase, 100.0)
                .await,
            Reply::InvalidTarget
        );
    }

    #[tokio::test(start_paused = true)]
    async fn append_extends_waveform() {
        let (commands, connector) = commands();
        joined(&commands, &connector, "u1").await;
        assert_eq!(
            commands.pulse_control("u1", PulseMode::Reset, "short").await,
            Reply::PulseSet(vec!["short".into()])
        );
        assert_eq!(
            commands.pulse_control("u1", PulseMode::Append, "long").await,
            Reply::PulseSet(vec!["short".into(), "long".into()])
        );
        let session = commands.registry().session("u1").await.unwrap();
        assert_eq!(session.waveform().await.segments.len(), 3);
        assert_eq!(
            commands.pulse_control("u1", PulseMode::Reset, "missing").await,
            Reply::UnknownPulse("missing".into())
        );
        assert!(matches!(
            commands.query_status("u1").await,
            Reply::Status { strength: None, ref pulses } if pulses.len() == 2
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn players_and_leave() {
        let (commands, connector) = commands();
        joined(&commands, &connector, "u2").await;
        commands.create_virtual_player("bot", "g1").await;
        assert_eq!(
            commands.players(Some("g1")).await,
            Reply::Players(vec!["bot".into(), "u2".into()])
        );
        assert_eq!(commands.leave("u2").await, Reply::Left);
        assert_eq!(commands.leave("u2").await, Reply::NotJoined);
        assert_eq!(
            commands.players(None).await,
            Reply::Players(vec!["bot".into()])
        );
        assert_eq!(
            commands.show_pulses(),
            Reply::PulseList(vec!["long".into(), "short".into()])
        );
    }
}
