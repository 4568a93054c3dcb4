//! Command state machine
//!
//! Every command a shard accepts is wrapped in a [`CommandMachine`] that the
//! shard loop advances. Transitions are the only way to change a command's
//! state, and [`CommandMachine::transition`] refuses any move not in the
//! table below.
//!
//! ```text
//! Initializing -> AwaitAuth -> Ingested <-> Throttled
//!                                 |
//!                                 +-> PendingDurability -> Committed -> Archived   (mutations)
//!                                 +-> Archived                                     (search, get)
//!
//! any non-terminal state -> Terminating
//! ```

use quiver_core::{Command, CommandId, CorrelationToken, Lsn};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Lifecycle state of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Constructed from a decoded ingress buffer
    Initializing,
    /// Waiting on the (external) authentication decision
    AwaitAuth,
    /// Validated and queued on the shard
    Ingested,
    /// Parked because the WAL has no room for another record
    Throttled,
    /// Handed to the WAL, durability not yet confirmed
    PendingDurability,
    /// Durable and visible in the MemTable; acknowledged
    Committed,
    /// Done: response emitted and, for mutations, captured in a segment
    Archived,
    /// Abandoned or failed
    Terminating,
}

impl CommandState {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Initializing => "initializing",
            CommandState::AwaitAuth => "await_auth",
            CommandState::Ingested => "ingested",
            CommandState::Throttled => "throttled",
            CommandState::PendingDurability => "pending_durability",
            CommandState::Committed => "committed",
            CommandState::Archived => "archived",
            CommandState::Terminating => "terminating",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Archived | CommandState::Terminating)
    }

    /// Whether the command may still be dropped without side effects.
    pub fn is_abandonable(self) -> bool {
        matches!(
            self,
            CommandState::Initializing
                | CommandState::AwaitAuth
                | CommandState::Ingested
                | CommandState::Throttled
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition {from} -> {to} for {command}")]
pub struct TransitionError {
    /// Command being advanced
    pub command: CommandId,
    /// Current state
    pub from: CommandState,
    /// Requested state
    pub to: CommandState,
}

impl From<TransitionError> for quiver_core::Error {
    fn from(e: TransitionError) -> Self {
        quiver_core::Error::Internal(e.to_string())
    }
}

/// A command together with its lifecycle state.
#[derive(Debug, Clone)]
pub struct CommandMachine {
    command: Command,
    state: CommandState,
    lsn: Option<Lsn>,
    created_at: Instant,
}

impl CommandMachine {
    /// Wrap a freshly decoded command.
    pub fn new(command: Command) -> Self {
        CommandMachine {
            command,
            state: CommandState::Initializing,
            lsn: None,
            created_at: Instant::now(),
        }
    }

    /// The command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Consume into the command.
    pub fn into_command(self) -> Command {
        self.command
    }

    /// Current state.
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Identifier.
    pub fn id(&self) -> CommandId {
        self.command.id
    }

    /// Correlation token for the response.
    pub fn correlation(&self) -> CorrelationToken {
        self.command.correlation
    }

    /// LSN assigned at WAL append.
    pub fn lsn(&self) -> Option<Lsn> {
        self.lsn
    }

    /// When the machine was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether `from -> to` is a legal move for this command.
    pub fn can_transition(&self, to: CommandState) -> bool {
        use CommandState::*;
        let mutation = self.command.is_mutation();
        match (self.state, to) {
            (from, Terminating) => !from.is_terminal(),
            (Initializing, AwaitAuth) | (AwaitAuth, Ingested) => true,
            (Ingested, Throttled) | (Throttled, Ingested) => mutation,
            (Ingested, PendingDurability) => mutation && self.lsn.is_some(),
            (PendingDurability, Committed) | (Committed, Archived) => mutation,
            (Ingested, Archived) => !mutation,
            _ => false,
        }
    }

    /// Move to `to`.
    pub fn transition(&mut self, to: CommandState) -> Result<(), TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError {
                command: self.command.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record the WAL LSN and move to `PendingDurability`.
    pub fn mark_logged(&mut self, lsn: Lsn) -> Result<(), TransitionError> {
        let previous = self.lsn.replace(lsn);
        self.transition(CommandState::PendingDurability).map_err(|e| {
            self.lsn = previous;
            e
        })
    }

    /// Run the ingress prefix: `Initializing -> AwaitAuth -> Ingested`.
    ///
    /// Authentication is decided by the transport before a command reaches
    /// the shard, so the machine passes straight through `AwaitAuth`.
    pub fn ingest(&mut self) -> Result<(), TransitionError> {
        self.transition(CommandState::AwaitAuth)?;
        self.transition(CommandState::Ingested)
    }
}
