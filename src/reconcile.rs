//! Request pipeline state and reconciliation of requested vs observed
//! switch states.

use crate::device::Received;
use crate::error::{ErrorKind, TuyaError};
use crate::payload::{DpsIndex, Dps};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Desired switch state for one plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
}

impl Command {
    pub fn is_on(self) -> bool {
        matches!(self, Command::On)
    }
}

impl FromStr for Command {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self, TuyaError> {
        match s {
            "On" => Ok(Command::On),
            "Off" => Ok(Command::Off),
            other => Err(TuyaError::InvalidCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::On => "On",
            Command::Off => "Off",
        })
    }
}

/// One independently switchable data point of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plug {
    index: DpsIndex,
    command: Option<Command>,
    always_on: bool,
}

impl Plug {
    pub fn new(index: DpsIndex) -> Self {
        Self {
            index,
            command: None,
            always_on: false,
        }
    }

    pub fn index(&self) -> DpsIndex {
        self.index
    }

    /// Command still waiting for confirmation, if any.
    pub fn pending(&self) -> Option<Command> {
        self.command
    }

    pub fn is_always_on(&self) -> bool {
        self.always_on
    }

    /// Records the command to send on the next request. Always-on plugs
    /// only ever ask for `On`.
    pub fn set_command(&mut self, command: Command) {
        self.command = Some(if self.always_on { Command::On } else { command });
    }

    pub fn set_always_on(&mut self) {
        self.always_on = true;
        self.command = Some(Command::On);
    }

    /// Compares an observed state with the pending command.
    ///
    /// Returns `true` when the device does not (yet) match the request and
    /// the command must be sent again.
    pub fn update_state(&mut self, is_on: bool) -> bool {
        if self.always_on && !is_on {
            self.command = Some(Command::On);
            return true;
        }
        match self.command {
            Some(command) if command.is_on() != is_on => true,
            _ => {
                self.command = None;
                false
            }
        }
    }

    /// Adds this plug's pending command to an outbound `set` payload.
    pub fn put_payload(&self, payload: &mut BTreeMap<DpsIndex, bool>) {
        if let Some(command) = self.command {
            payload.insert(self.index, command.is_on());
        }
    }
}

/// Kind of request the pipeline can have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Set,
    Status,
}

/// What the single connection is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    AwaitingSetAck { seqno: u32 },
    AwaitingStatus { seqno: u32 },
}

impl RequestState {
    fn outstanding(self) -> Option<(RequestKind, u32)> {
        match self {
            RequestState::Idle => None,
            RequestState::AwaitingSetAck { seqno } => Some((RequestKind::Set, seqno)),
            RequestState::AwaitingStatus { seqno } => Some((RequestKind::Status, seqno)),
        }
    }
}

/// Action the controller must take after feeding a reply to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Send a request of this kind now.
    Request(RequestKind),
    /// Authoritative status; the pipeline is idle again.
    Reconcile(Dps),
    /// Unsolicited report; the pipeline state is unchanged.
    Observe(Dps),
    /// Nothing to do until more bytes or the next heartbeat.
    Ignore,
}

/// Request/response pipeline for the one connection.
///
/// Replies are matched to the outstanding request by sequence number in
/// strict mode; otherwise the next frame is taken as the reply.
#[derive(Debug)]
pub struct Reconciler {
    state: RequestState,
    strict: bool,
    reissues: u32,
    max_reissues: u32,
}

impl Reconciler {
    pub fn new(strict: bool, max_reissues: u32) -> Self {
        Self {
            state: RequestState::Idle,
            strict,
            reissues: 0,
            max_reissues,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Records that a request went out with `seqno`.
    pub fn issued(&mut self, kind: RequestKind, seqno: u32) {
        self.state = match kind {
            RequestKind::Set => RequestState::AwaitingSetAck { seqno },
            RequestKind::Status => RequestState::AwaitingStatus { seqno },
        };
        debug!("Request pipeline now {:?}", self.state);
    }

    /// A heartbeat or host command starts a new cycle with a fresh
    /// re-issue allowance.
    pub fn start_cycle(&mut self) {
        self.reissues = 0;
    }

    /// Forgets the outstanding request (connection lost or stopped).
    pub fn reset(&mut self) {
        self.state = RequestState::Idle;
        self.reissues = 0;
    }

    pub fn on_received(&mut self, received: Received) -> Step {
        let (seqno, outcome) = match received {
            Received::Frame { seqno, result, .. } => (seqno, result),
            Received::Garbage(error) => (None, Err(error)),
        };

        let Some((kind, expected)) = self.state.outstanding() else {
            return unsolicited(outcome);
        };

        if self.strict && seqno != Some(expected) {
            return unsolicited(outcome);
        }

        match (kind, outcome) {
            // A set acknowledgement does not carry authoritative state.
            (RequestKind::Set, Ok(_)) | (RequestKind::Set, Err(TuyaError::InvalidPayload)) => {
                self.reissues = 0;
                self.state = RequestState::AwaitingStatus { seqno: expected };
                Step::Request(RequestKind::Status)
            }
            (RequestKind::Status, Ok(Some(dps))) => {
                self.reissues = 0;
                self.state = RequestState::Idle;
                Step::Reconcile(dps)
            }
            (RequestKind::Status, Ok(None)) => {
                self.reissue(kind, &TuyaError::InvalidPayload)
            }
            (_, Err(error)) => self.reissue(kind, &error),
        }
    }

    fn reissue(&mut self, kind: RequestKind, error: &TuyaError) -> Step {
        if self.reissues >= self.max_reissues {
            warn!(
                "Giving up on {:?} after {} re-issues ({}), waiting for heartbeat",
                kind, self.reissues, error
            );
            return Step::Ignore;
        }
        self.reissues += 1;
        warn!("Bad reply to {:?} request ({}), re-issuing", kind, error);
        Step::Request(kind)
    }
}

fn unsolicited(outcome: crate::error::Result<Option<Dps>>) -> Step {
    match outcome {
        Ok(Some(dps)) => Step::Observe(dps),
        Ok(None) => Step::Ignore,
        Err(error) => {
            match error.kind() {
                ErrorKind::Decode | ErrorKind::Crypto | ErrorKind::Parse => {
                    debug!("Ignoring unsolicited bad frame: {}", error)
                }
                _ => warn!("Unexpected error on unsolicited frame: {}", error),
            }
            Step::Ignore
        }
    }
}
