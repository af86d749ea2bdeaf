//! Operator console: one command per stdin line.

use std::collections::HashMap;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dglab_core::StrengthOperation;

use crate::commands::{Commands, PulseMode, Reply};
use crate::config::GameSettings;
use crate::game::{live_players, DiceGame, Roll, RollSender};

#[derive(Parser, Debug)]
#[command(name = "console", no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Create or reuse a terminal and print its pairing code
    Join {
        tenant: String,
        /// Group to join once the App is bound
        group: Option<String>,
    },

    /// Change both channels by a percentage of their limits
    Strength {
        tenant: String,
        #[arg(value_enum)]
        operation: OperationArg,
        percent: f64,
    },

    /// Play a named pulse
    Pulse {
        tenant: String,
        #[arg(value_enum)]
        mode: ModeArg,
        name: String,
    },

    /// Play a random pulse
    Random { tenant: String },

    /// Show strength and current pulse
    Status { tenant: String },

    /// List available pulses
    Pulses,

    /// List players, optionally of one group
    Players { group: Option<String> },

    /// Add a virtual player to a group
    Virtual { tenant: String, group: String },

    /// Disconnect a tenant
    Leave { tenant: String },

    /// Start or stop a dice game
    Dice {
        #[command(subcommand)]
        action: DiceAction,
    },

    /// Submit a dice roll
    Roll {
        group: String,
        tenant: String,
        #[arg(value_parser = clap::value_parser!(u8).range(1..=6))]
        points: u8,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DiceAction {
    Start { group: String },
    Stop { group: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationArg {
    #[value(alias = "inc")]
    Increase,
    #[value(alias = "dec")]
    Decrease,
    Set,
}

impl From<OperationArg> for StrengthOperation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Increase => Self::Increase,
            OperationArg::Decrease => Self::Decrease,
            OperationArg::Set => Self::Set,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Reset,
    Append,
}

impl From<ModeArg> for PulseMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Reset => Self::Reset,
            ModeArg::Append => Self::Append,
        }
    }
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    ConsoleLine::try_parse_from(words).map(|parsed| Some(parsed.command))
}

struct RunningGame {
    rolls: RollSender,
    task: JoinHandle<()>,
}

/// Executes console commands; output lines go to `out`.
pub struct Console {
    commands: Commands,
    game: GameSettings,
    games: HashMap<String, RunningGame>,
    out: mpsc::UnboundedSender<String>,
}

impl Console {
    pub fn new(commands: Commands, game: GameSettings, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            commands,
            game,
            games: HashMap::new(),
            out,
        }
    }

    /// Read commands from `input` until EOF.
    pub async fn run<R>(mut self, input: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            match parse_line(&line) {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {}
                Err(e) => self.say(e.render().to_string().trim_end()),
            }
        }
        debug!("console input closed");
        self.stop_all();
        Ok(())
    }

    pub async fn execute(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Join { tenant, group } => {
                let reply = self.commands.device_join(&tenant, group.as_deref()).await;
                let paired = matches!(reply, Reply::PairingCode { .. });
                self.say(reply);
                if !paired {
                    return;
                }
                let commands = self.commands.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let reply = commands.await_bind(&tenant, group.as_deref()).await;
                    let _ = out.send(format!("{tenant}: {reply}"));
                });
            }
            ConsoleCommand::Strength {
                tenant,
                operation,
                percent,
            } => {
                let reply = self
                    .commands
                    .strength_control(&tenant, operation.into(), percent)
                    .await;
                self.say(reply);
            }
            ConsoleCommand::Pulse { tenant, mode, name } => {
                let reply = self.commands.pulse_control(&tenant, mode.into(), &name).await;
                self.say(reply);
            }
            ConsoleCommand::Random { tenant } => {
                let reply = self.commands.random_pulse(&tenant).await;
                self.say(reply);
            }
            ConsoleCommand::Status { tenant } => {
                let reply = self.commands.query_status(&tenant).await;
                self.say(reply);
            }
            ConsoleCommand::Pulses => {
                let reply = self.commands.show_pulses();
                self.say(reply);
            }
            ConsoleCommand::Players { group } => {
                let reply = self.commands.players(group.as_deref()).await;
                self.say(reply);
            }
            ConsoleCommand::Virtual { tenant, group } => {
                let reply = self.commands.create_virtual_player(&tenant, &group).await;
                self.say(reply);
            }
            ConsoleCommand::Leave { tenant } => {
                let reply = self.commands.leave(&tenant).await;
                self.say(reply);
            }
            ConsoleCommand::Dice { action } => match action {
                DiceAction::Start { group } => self.start_dice(group).await,
                DiceAction::Stop { group } => self.stop_dice(&group),
            },
            ConsoleCommand::Roll {
                group,
                tenant,
                points,
            } => {
                let sent = self
                    .games
                    .get(&group)
                    .filter(|g| !g.task.is_finished())
                    .is_some_and(|g| g.rolls.send(Roll::new(tenant, points)).is_ok());
                if !sent {
                    self.say(format!("no dice game in {group}"));
                }
            }
        }
    }

    async fn start_dice(&mut self, group: String) {
        if self.games.get(&group).is_some_and(|g| !g.task.is_finished()) {
            self.say(format!("dice already running in {group}"));
            return;
        }
        if live_players(self.commands.registry(), &group).await.len() < 2 {
            self.say(format!("{group} needs at least two players"));
            return;
        }

        let (game, rolls) = DiceGame::new(self.commands.clone(), group.clone(), self.game);
        let out = self.out.clone();
        let label = group.clone();
        let task = tokio::spawn(async move {
            for outcome in game.run().await {
                let _ = out.send(format!(
                    "{label} round {}: {}",
                    outcome.round, outcome.punishment
                ));
            }
            let _ = out.send(format!("dice game in {label} is over"));
        });
        info!(group = %group, "dice game started");
        self.say(format!("dice game started in {group}"));
        self.games.insert(group, RunningGame { rolls, task });
    }

    fn stop_dice(&mut self, group: &str) {
        match self.games.remove(group) {
            Some(game) => {
                game.task.abort();
                info!(group = %group, "dice game stopped");
                self.say(format!("dice game in {group} stopped"));
            }
            None => self.say(format!("no dice game in {group}")),
        }
    }

    fn stop_all(&mut self) {
        for (_, game) in self.games.drain() {
            game.task.abort();
        }
    }

    fn say(&self, line: impl ToString) {
        let _ = self.out.send(line.to_string());
    }
}
