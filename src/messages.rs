/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas.
//!
//! The progress protocol and the wake-recovery protocol share one closed
//! message family, [HotStuffMessage]. Every cross-replica message travels
//! wrapped in a [SignedEnvelope]: the serialized message plus the sender's
//! signature over those bytes. Transport delivery is at-most-once per call;
//! duplicate delivery of any envelope must not violate protocol invariants.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::Keypair;
use crate::types::basic::{
    BlockHeight, CryptoHash, ReplicaId, SignatureBytes, Timestamp, ValidatorSet, ViewNumber,
};
use crate::types::block::{CommittedBlocks, QCBlock};

#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum HotStuffMessage {
    Propose(Propose),
    Vote(Vote),
    Timeout(Timeout),
    TimeoutQc(TimeoutQc),
    ViewChange(ViewChange),
    NewView(NewView),
    Rec1(Rec1),
    Echo1(Echo1),
    Rec2(Rec2),
    Echo2(Echo2),
}

impl HotStuffMessage {
    /// Returns the replica that authored a given [HotStuffMessage].
    pub fn source(&self) -> ReplicaId {
        match self {
            HotStuffMessage::Propose(Propose { source, .. }) => *source,
            HotStuffMessage::Vote(Vote { source, .. }) => *source,
            HotStuffMessage::Timeout(Timeout { source, .. }) => *source,
            HotStuffMessage::TimeoutQc(TimeoutQc { source, .. }) => *source,
            HotStuffMessage::ViewChange(ViewChange { source, .. }) => *source,
            HotStuffMessage::NewView(NewView { source, .. }) => *source,
            HotStuffMessage::Rec1(Rec1 { source, .. }) => *source,
            HotStuffMessage::Echo1(Echo1 { source, .. }) => *source,
            HotStuffMessage::Rec2(Rec2 { source, .. }) => *source,
            HotStuffMessage::Echo2(Echo2 { source, .. }) => *source,
        }
    }

    pub fn is_recovery_reply(&self) -> bool {
        matches!(
            self,
            HotStuffMessage::Echo1(_) | HotStuffMessage::Echo2(_) | HotStuffMessage::TimeoutQc(_)
        )
    }
}

/// Broadcasted by the leader of a view to propose extending the chain. `qc`
/// carries the parent block together with its certificate (`None` for the
/// very first proposal), and `hash` is the running chain hash computed by
/// [chain_hash](crate::types::block::chain_hash).
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Propose {
    pub seq: BlockHeight,
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub ops: Vec<Vec<u8>>,
    pub qc: Option<QCBlock>,
    pub hash: CryptoHash,
    pub ts: Timestamp,
    pub num: u64,
}

/// Sent by a follower to the proposer: a signature over the proposed block
/// hash.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub seq: BlockHeight,
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub hash: CryptoHash,
    pub sig: SignatureBytes,
}

/// Broadcast by a replica whose rotating timer expired in `view`.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Timeout {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub ts: Timestamp,
    pub num: u64,
}

/// A quorum of signed [Timeout] envelopes for the same view. Justifies a
/// view change without requiring the new leader to trust any single timeout.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct TimeoutQc {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub v: Vec<SignedEnvelope>,
}

/// Sent to the leader of the new view; carries the sender's current block
/// (with its certificate) as the fresh-QC justification.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub seq: BlockHeight,
    pub block: QCBlock,
}

/// Broadcast by the new leader once it holds a quorum of [ViewChange]
/// messages. `o` carries any pre-prepares to be re-injected at recipients.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub v: Vec<SignedEnvelope>,
    pub o: Vec<SignedEnvelope>,
}

/// First round of disk-free wake recovery: the waking replica asks everyone
/// for the latest view it should catch up past.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Rec1 {
    pub source: ReplicaId,
    pub ts: Timestamp,
}

/// Reply to [Rec1]. `view` is the responder's previous view (`None` while
/// the responder is still in view 0) and `v` its local TQC for that view.
/// `hash` echoes the digest of the [Rec1] being answered.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Echo1 {
    pub source: ReplicaId,
    pub view: Option<ViewNumber>,
    pub hash: CryptoHash,
    pub v: Vec<SignedEnvelope>,
}

/// Second round of disk-free wake recovery, sent once the waking replica
/// has observed its local view catch up.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Rec2 {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub ts: Timestamp,
}

/// Reply to [Rec2]: the responder's current block, locked block, and entire
/// committed history.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Echo2 {
    pub source: ReplicaId,
    pub view: ViewNumber,
    pub hash: CryptoHash,
    pub qc: QCBlock,
    pub lqc: QCBlock,
    pub com_blocks: CommittedBlocks,
}

impl From<Propose> for HotStuffMessage {
    fn from(m: Propose) -> Self {
        HotStuffMessage::Propose(m)
    }
}

impl From<Vote> for HotStuffMessage {
    fn from(m: Vote) -> Self {
        HotStuffMessage::Vote(m)
    }
}

impl From<Timeout> for HotStuffMessage {
    fn from(m: Timeout) -> Self {
        HotStuffMessage::Timeout(m)
    }
}

impl From<TimeoutQc> for HotStuffMessage {
    fn from(m: TimeoutQc) -> Self {
        HotStuffMessage::TimeoutQc(m)
    }
}

impl From<ViewChange> for HotStuffMessage {
    fn from(m: ViewChange) -> Self {
        HotStuffMessage::ViewChange(m)
    }
}

impl From<NewView> for HotStuffMessage {
    fn from(m: NewView) -> Self {
        HotStuffMessage::NewView(m)
    }
}

impl From<Rec1> for HotStuffMessage {
    fn from(m: Rec1) -> Self {
        HotStuffMessage::Rec1(m)
    }
}

impl From<Echo1> for HotStuffMessage {
    fn from(m: Echo1) -> Self {
        HotStuffMessage::Echo1(m)
    }
}

impl From<Rec2> for HotStuffMessage {
    fn from(m: Rec2) -> Self {
        HotStuffMessage::Rec2(m)
    }
}

impl From<Echo2> for HotStuffMessage {
    fn from(m: Echo2) -> Self {
        HotStuffMessage::Echo2(m)
    }
}

/// Reasons an inbound envelope is dropped before dispatch.
#[derive(Debug)]
pub enum MessageError {
    Malformed,
    UnknownReplica,
    InvalidSignature,
}

/// The unit of transport: serialized message bytes plus the author's
/// signature over them.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedEnvelope {
    pub msg: Vec<u8>,
    pub sig: SignatureBytes,
}

impl SignedEnvelope {
    /// Serializes `message` and signs the bytes with `keypair`.
    pub fn seal<M: Into<HotStuffMessage>>(keypair: &Keypair, message: M) -> SignedEnvelope {
        let msg = message
            .into()
            .try_to_vec()
            .expect("serializing a message cannot fail");
        let sig = keypair.sign(&msg);
        SignedEnvelope { msg, sig }
    }

    /// Deserializes the carried message and checks the envelope signature
    /// against the author named inside it.
    pub fn open(&self, validator_set: &ValidatorSet) -> Result<HotStuffMessage, MessageError> {
        let message =
            HotStuffMessage::try_from_slice(&self.msg).map_err(|_| MessageError::Malformed)?;
        let source = message.source();
        if validator_set.key_of(source).is_none() {
            return Err(MessageError::UnknownReplica);
        }
        if !validator_set.verify(source, &self.msg, &self.sig) {
            return Err(MessageError::InvalidSignature);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn keypair() -> Keypair {
        Keypair::new(SigningKey::generate(&mut OsRng))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let keypair = keypair();
        let set = ValidatorSet::new(vec![keypair.public()]);
        let vote = Vote {
            seq: BlockHeight::new(4),
            source: ReplicaId::new(0),
            view: ViewNumber::new(2),
            hash: crate::crypto::hash(b"block"),
            sig: keypair.sign(b"block"),
        };

        let envelope = SignedEnvelope::seal(&keypair, vote.clone());
        match envelope.open(&set) {
            Ok(HotStuffMessage::Vote(decoded)) => {
                assert_eq!(decoded.seq, vote.seq);
                assert_eq!(decoded.view, vote.view);
                assert!(decoded.hash == vote.hash);
            }
            _ => panic!("expected a vote"),
        }
    }

    #[test]
    fn open_rejects_a_tampered_envelope() {
        let keypair = keypair();
        let set = ValidatorSet::new(vec![keypair.public()]);
        let mut envelope = SignedEnvelope::seal(
            &keypair,
            Rec1 {
                source: ReplicaId::new(0),
                ts: Timestamp::new(1),
            },
        );
        envelope.msg.push(0);
        assert!(matches!(
            envelope.open(&set),
            Err(MessageError::Malformed) | Err(MessageError::InvalidSignature)
        ));
    }

    #[test]
    fn open_rejects_a_forged_author() {
        let author = keypair();
        let impostor = keypair();
        // Validator 0 is `author`, but the envelope is signed by `impostor`.
        let set = ValidatorSet::new(vec![author.public(), impostor.public()]);
        let envelope = SignedEnvelope::seal(
            &impostor,
            Rec1 {
                source: ReplicaId::new(0),
                ts: Timestamp::new(1),
            },
        );
        assert!(matches!(
            envelope.open(&set),
            Err(MessageError::InvalidSignature)
        ));
    }
}
