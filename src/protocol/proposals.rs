/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The local-proposal forwarder.
//!
//! Everything this node proposes, whether minted blocks from the minter or membership changes from
//! the administrative API, goes through one forwarder thread. It hands proposals to the event loop
//! one at a time and waits for each to be accepted into the local log before taking the next, so
//! proposals from this node enter the log in the order they were made.

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use raft::eraftpb::ConfChange;

use crate::events::{Event, ProposeBlockEvent};
use crate::shutdown::ShutdownSignal;
use crate::types::{block::Block, encoding::VersionedEncoding};

use super::event_loop::RaftInput;

const PROPOSAL_BUFFER_LEN: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) type Accepted = SyncSender<Result<(), ProposeError>>;

pub(crate) enum LocalProposal {
    Block { block: Block, accepted: Accepted },
    ConfChange { change: ConfChange, accepted: Accepted },
}

/// Submits proposals to the forwarder. Every method blocks until the proposal is accepted into this
/// node's log (not until it is committed).
#[derive(Clone)]
pub(crate) struct ProposalHandle {
    to_forwarder: SyncSender<LocalProposal>,
}

impl ProposalHandle {
    pub(crate) fn propose_block(&self, block: Block) -> Result<(), ProposeError> {
        let (accepted, acceptance) = mpsc::sync_channel(1);
        self.submit(LocalProposal::Block { block, accepted }, acceptance)
    }

    pub(crate) fn propose_conf_change(&self, change: ConfChange) -> Result<(), ProposeError> {
        let (accepted, acceptance) = mpsc::sync_channel(1);
        self.submit(LocalProposal::ConfChange { change, accepted }, acceptance)
    }

    fn submit(
        &self,
        proposal: LocalProposal,
        acceptance: Receiver<Result<(), ProposeError>>,
    ) -> Result<(), ProposeError> {
        self.to_forwarder
            .send(proposal)
            .map_err(|_| ProposeError::Stopped)?;
        acceptance.recv().map_err(|_| ProposeError::Stopped)?
    }
}

/// Spawn the forwarder thread, returning the handle proposals are submitted through.
pub(crate) fn start_forwarder(
    to_event_loop: Sender<RaftInput>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: ShutdownSignal,
) -> (ProposalHandle, JoinHandle<()>) {
    let (to_forwarder, proposals) = mpsc::sync_channel(PROPOSAL_BUFFER_LEN);

    let forwarder = thread::spawn(move || loop {
        if shutdown_signal.received() {
            return;
        }

        let proposal = match proposals.recv_timeout(POLL_INTERVAL) {
            Ok(proposal) => proposal,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let (local_accepted, local_acceptance) = mpsc::sync_channel(1);
        let (input, proposed_block, accepted) = match proposal {
            LocalProposal::Block { block, accepted } => (
                RaftInput::Propose {
                    data: block.encode(),
                    accepted: local_accepted,
                },
                Some(block.hash()),
                accepted,
            ),
            LocalProposal::ConfChange { change, accepted } => (
                RaftInput::ProposeConfChange {
                    change,
                    accepted: local_accepted,
                },
                None,
                accepted,
            ),
        };

        if to_event_loop.send(input).is_err() {
            let _ = accepted.send(Err(ProposeError::Stopped));
            return;
        }

        // Wait for the event loop, but not past shutdown.
        let result = loop {
            match local_acceptance.recv_timeout(POLL_INTERVAL) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) if !shutdown_signal.received() => continue,
                Err(_) => break Err(ProposeError::Stopped),
            }
        };

        match (&result, proposed_block) {
            (Ok(()), Some(block)) => Event::publish(
                &event_publisher,
                Event::ProposeBlock(ProposeBlockEvent {
                    timestamp: SystemTime::now(),
                    block,
                }),
            ),
            (Err(err), _) => log::warn!("Proposal was not accepted: {}", err),
            _ => (),
        }
        let _ = accepted.send(result);
    });

    (ProposalHandle { to_forwarder }, forwarder)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    /// The consensus library refused the proposal, e.g. because there is no leader to forward it
    /// to or a membership change is already pending.
    Dropped,
    /// The proposal is not a valid membership change.
    InvalidConfChange(String),
    /// The node is shutting down.
    Stopped,
}

impl Display for ProposeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::Dropped => write!(f, "proposal dropped"),
            ProposeError::InvalidConfChange(reason) => {
                write!(f, "invalid membership change: {}", reason)
            }
            ProposeError::Stopped => write!(f, "node is shutting down"),
        }
    }
}

impl std::error::Error for ProposeError {}
