/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the
//! local replica.
//!
//! Each variant of the [event enum](Event) contains an inner struct with a
//! timestamp taken at the exact time the event occurred. Events are always
//! emitted **after** the corresponding occurrence is completed; in
//! particular, events that reflect persistent state changes (commit, lock)
//! are emitted only after the change has been written at its persistence
//! level.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{BlockHeight, CryptoHash, ReplicaId, ViewNumber};

pub enum Event {
    // Events that change (possibly persistent) protocol state.
    CommitBlock(CommitBlockEvent),
    LockBlock(LockBlockEvent),
    CollectQc(CollectQcEvent),

    // Events that involve emitting a message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    TimeoutVote(TimeoutVoteEvent),
    CollectTqc(CollectTqcEvent),

    // Events that involve receiving a message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),

    // View progression.
    StartViewChange(StartViewChangeEvent),
    StartView(StartViewEvent),

    // Sleep/wake.
    StartRecovery(StartRecoveryEvent),
    EndRecovery(EndRecoveryEvent),
}

impl Event {
    /// Publishes this event on the event publisher channel, if one is
    /// defined.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block was inserted into committed history at the given height.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
}

/// The locked block advanced to the given height.
pub struct LockBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
}

/// A quorum of votes materialized into a certificate for the block with the
/// given hash and height.
pub struct CollectQcEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub hash: CryptoHash,
}

/// The replica proposed a block by broadcasting it to all replicas.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub seq: BlockHeight,
    pub hash: CryptoHash,
}

/// The replica voted for a proposal by sending a signature to the proposer.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub seq: BlockHeight,
    pub hash: CryptoHash,
}

/// The replica's rotating timer expired and it broadcast a TIMEOUT for the
/// given view.
pub struct TimeoutVoteEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// A quorum of TIMEOUT messages materialized for the given view.
pub struct CollectTqcEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// The replica received a proposal from the view leader.
pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub seq: BlockHeight,
    pub hash: CryptoHash,
}

/// The replica received a vote from another replica.
pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub seq: BlockHeight,
    pub hash: CryptoHash,
}

/// The replica started a view change targeting the given view.
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// The replica entered a view led by the given leader.
pub struct StartViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub leader: ReplicaId,
}

/// A previously sleeping replica began its recovery procedure.
pub struct StartRecoveryEvent {
    pub timestamp: SystemTime,
    pub mode: crate::config::RecMode,
}

/// A recovering replica finished catching up and is READY again.
pub struct EndRecoveryEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub highest_committed: Option<BlockHeight>,
}
