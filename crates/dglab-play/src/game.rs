//! Dice rounds played by the members of a group.
//!
//! Players roll in turn; the lowest roll loses the round and, if it has a
//! device, gets a random waveform plus a strength bump on both channels.

use std::fmt;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dglab_core::{Channel, StrengthOperation};

use crate::commands::Commands;
use crate::config::GameSettings;
use crate::registry::{Member, Registry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roll {
    pub tenant_id: String,
    pub points: u8,
}

impl Roll {
    pub fn new(tenant_id: impl Into<String>, points: u8) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            points,
        }
    }
}

pub type RollSender = mpsc::UnboundedSender<Roll>;

/// Rolls recorded in one round, in turn order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiceRound {
    rolls: Vec<Roll>,
}

impl DiceRound {
    pub fn record(&mut self, tenant_id: &str, points: u8) {
        self.rolls.push(Roll::new(tenant_id, points));
    }

    /// A player who did not roll in time scores zero.
    pub fn timed_out(&mut self, tenant_id: &str) {
        self.record(tenant_id, 0);
    }

    pub fn rolls(&self) -> &[Roll] {
        &self.rolls
    }

    /// Lowest roll; among equal rolls the earliest one loses.
    pub fn loser(&self) -> Option<&Roll> {
        self.rolls
            .iter()
            .reduce(|low, roll| if roll.points < low.points { roll } else { low })
    }
}

/// Members of `group_id` that still own their tenant entry.
pub async fn live_players(registry: &Registry, group_id: &str) -> Vec<Member> {
    let mut live = Vec::new();
    for member in registry.group(group_id).await.unwrap_or_default() {
        if is_live(registry, &member).await {
            live.push(member);
        }
    }
    live
}

async fn is_live(registry: &Registry, member: &Member) -> bool {
    registry
        .member(member.tenant_id())
        .await
        .is_some_and(|current| current.same_as(member))
}

/// What happened to a round's loser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Punishment {
    Virtual(String),
    Lost(String),
    NoPulses(String),
    Punished { tenant_id: String, pulse: String },
    Failed { tenant_id: String, error: String },
}

impl fmt::Display for Punishment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtual(t) => write!(f, "{t} is a virtual player"),
            Self::Lost(t) => write!(f, "{t} has left"),
            Self::NoPulses(t) => write!(f, "{t} escapes: no pulses available"),
            Self::Punished { tenant_id, pulse } => write!(f, "{tenant_id} gets {pulse}"),
            Self::Failed { tenant_id, error } => write!(f, "{tenant_id} could not be punished: {error}"),
        }
    }
}

/// Play a random waveform on both channels and raise both strengths.
pub async fn punish(commands: &Commands, member: &Member, amount: u8) -> Punishment {
    let tenant_id = member.tenant_id().to_string();
    let session = match member {
        Member::Virtual(_) => return Punishment::Virtual(tenant_id),
        Member::Device(session) => session,
    };
    if session.is_destroyed() || !is_live(commands.registry(), member).await {
        return Punishment::Lost(tenant_id);
    }
    let Some((name, segments)) = commands.pulses().random() else {
        return Punishment::NoPulses(tenant_id);
    };

    let result = async {
        session
            .setup_pulse_job(vec![name.to_string()], segments.to_vec(), &Channel::BOTH)
            .await?;
        for channel in Channel::BOTH {
            session
                .set_strength(channel, StrengthOperation::Increase, amount)
                .await?;
        }
        Ok::<_, dglab_core::DgLabError>(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(tenant = %tenant_id, pulse = %name, amount, "punished");
            Punishment::Punished {
                tenant_id,
                pulse: name.to_string(),
            }
        }
        Err(e) => {
            warn!(tenant = %tenant_id, error = %e, "punishment failed");
            Punishment::Failed {
                tenant_id,
                error: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: u32,
    pub rolls: DiceRound,
    pub punishment: Punishment,
}

/// A dice game over one group, fed rolls through a [`RollSender`].
pub struct DiceGame {
    commands: Commands,
    group_id: String,
    settings: GameSettings,
    rolls: mpsc::UnboundedReceiver<Roll>,
}

impl DiceGame {
    pub fn new(commands: Commands, group_id: impl Into<String>, settings: GameSettings) -> (Self, RollSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let game = Self {
            commands,
            group_id: group_id.into(),
            settings,
            rolls: rx,
        };
        (game, tx)
    }

    /// Play until `max_round` rounds were lost, fewer than two players are
    /// left, or every roll sender is gone.
    pub async fn run(mut self) -> Vec<RoundOutcome> {
        let registry = self.commands.registry().clone();
        let mut outcomes = Vec::new();
        let mut players = shuffled(live_players(&registry, &self.group_id).await);
        let mut round = 1;

        while round <= self.settings.max_round {
            let live = live_players(&registry, &self.group_id).await;
            if players.len() < 2 || live.len() < 2 {
                break;
            }
            if live.iter().any(|m| !players.iter().any(|p| p.same_as(m))) {
                players = shuffled(live);
                info!(group = %self.group_id, count = players.len(), "new players joined");
            }

            info!(group = %self.group_id, round, max_round = self.settings.max_round, "round started");
            let mut dice = DiceRound::default();
            let mut turn = 0;
            while turn < players.len() {
                let player = players[turn].clone();
                if !is_live(&registry, &player).await {
                    info!(group = %self.group_id, tenant = %player.tenant_id(), "player lost");
                    players.remove(turn);
                    continue;
                }
                turn += 1;
                match timeout(self.settings.roll_timeout, self.wait_roll(player.tenant_id())).await {
                    Ok(Some(points)) => dice.record(player.tenant_id(), points),
                    Ok(None) => return outcomes,
                    Err(_) => {
                        info!(group = %self.group_id, tenant = %player.tenant_id(), "roll timed out");
                        dice.timed_out(player.tenant_id());
                        break;
                    }
                }
            }

            let Some(loser) = dice.loser() else {
                break;
            };
            let punishment = match players.iter().find(|p| p.tenant_id() == loser.tenant_id) {
                Some(member) => punish(&self.commands, member, self.settings.punish).await,
                None => Punishment::Lost(loser.tenant_id.clone()),
            };
            info!(group = %self.group_id, round, loser = %loser.tenant_id, %punishment, "round lost");
            outcomes.push(RoundOutcome {
                round,
                rolls: dice,
                punishment,
            });
            round += 1;
        }

        info!(group = %self.group_id, rounds = outcomes.len(), "dice game over");
        outcomes
    }

    /// Next roll by `tenant_id`; rolls from anyone else are dropped.
    async fn wait_roll(&mut self, tenant_id: &str) -> Option<u8> {
        info!(group = %self.group_id, tenant = %tenant_id, "waiting for roll");
        while let Some(roll) = self.rolls.recv().await {
            if roll.tenant_id == tenant_id {
                return Some(roll.points);
            }
            debug!(group = %self.group_id, tenant = %roll.tenant_id, "out of turn roll ignored");
        }
        None
    }
}

fn shuffled(mut members: Vec<Member>) -> Vec<Member> {
    members.shuffle(&mut rand::thread_rng());
    members
}
