/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus state machine: proposal pipeline, vote handling, quorum
//! certificate formation, and the three-chain commit rule.
//!
//! [ConsensusCore] owns every piece of mutable protocol state behind
//! per-field locks (the sharing policy is stated on each field). Inbound
//! envelopes enter through [ConsensusCore::handle_delivery], one handler
//! task per envelope; every handler holds the sleep gate shared for its
//! whole run, so the sleep transition (which takes the gate exclusively)
//! can never interleave with a half-processed message.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::config::Configuration;
use crate::crypto::{self, Keypair};
use crate::events::*;
use crate::messages::{
    HotStuffMessage, Propose, SignedEnvelope, Vote,
};
use crate::networking::{Network, SenderHandle};
use crate::quorum::{
    EchoPool, PoolOutcome, QuorumParams, TimeoutPool, VotePool, ViewChangePool,
};
use crate::recovery::RecoveryState;
use crate::request_queue::RequestQueue;
use crate::state::{paths, KVStore, PersistLevel, ReplicaStore};
use crate::types::basic::{
    BlockHeight, CryptoHash, ReplicaId, Status, Timestamp, ValidatorSet, ViewNumber,
};
use crate::types::block::{chain_hash, ClientRequest, CommittedBlocks, QCBlock, Transaction};
use crate::view_change::ViewClock;

/// The replica status behind a read-write lock; read by every handler for
/// fast-path admission, written on state transitions.
pub(crate) struct StatusFlag(RwLock<Status>);

impl StatusFlag {
    pub(crate) fn new() -> StatusFlag {
        StatusFlag(RwLock::new(Status::Ready))
    }

    pub(crate) fn get(&self) -> Status {
        *self.0.read().unwrap()
    }

    pub(crate) fn set(&self, status: Status) {
        *self.0.write().unwrap() = status;
    }
}

pub(crate) struct ConsensusCore<K: KVStore, N: Network> {
    pub(crate) id: ReplicaId,
    pub(crate) keypair: Keypair,
    pub(crate) validator_set: ValidatorSet,
    pub(crate) quorum: QuorumParams,
    pub(crate) config: Configuration,
    pub(crate) store: ReplicaStore<K>,
    pub(crate) sender: SenderHandle<N>,
    pub(crate) queue: RequestQueue,

    pub(crate) status: StatusFlag,
    /// Held shared by every inbound handler and the monitor's propose step;
    /// held exclusively by the sleep transition.
    pub(crate) sleep_gate: RwLock<()>,
    /// The current view. Writers notify; recovery handlers block on it
    /// instead of spinning.
    pub(crate) view: ViewClock,

    /// The current proposed height. Leader-only authoritative.
    sequence: Mutex<BlockHeight>,
    /// The most recently QC'd block known to this replica.
    cur_block: Mutex<QCBlock>,
    /// The value of `cur_block` before the vote-quorum path last swapped it.
    /// The commit rule locks this snapshot on the leader, where `cur_block`
    /// has already moved one block ahead of the semantic lock.
    prev_block: Mutex<QCBlock>,
    /// The running hash chaining new proposals.
    cur_hash: Mutex<CryptoHash>,
    /// Read on every proposal validation, written on lock advancement.
    locked_block: RwLock<QCBlock>,
    /// Committed history. Inserts are per-height and never overwrite.
    committed: Mutex<CommittedBlocks>,
    /// height → (view, hash) of blocks this replica voted for. Consulted
    /// before every vote: at most one vote per (view, height).
    voted_blocks: Mutex<HashMap<BlockHeight, (ViewNumber, CryptoHash)>>,
    /// height → hash of blocks this replica proposed; fills
    /// `pre_hash`/`pre_pre_hash` when a certificate forms. Cleared on view
    /// change.
    awaiting_blocks: Mutex<HashMap<BlockHeight, CryptoHash>>,
    awaiting_txs: Mutex<HashMap<BlockHeight, Vec<Vec<u8>>>>,
    /// In-flight pipeline slots, pruned three heights behind.
    awaiting_decision: Mutex<HashMap<BlockHeight, CryptoHash>>,
    awaiting_decision_copy: Mutex<HashMap<BlockHeight, CryptoHash>>,

    pub(crate) votes: VotePool,
    pub(crate) timeouts: TimeoutPool,
    pub(crate) view_changes: ViewChangePool,
    pub(crate) echoes: EchoPool,
    pub(crate) rec: Mutex<RecoveryState>,
    /// Serializes the recovery rounds of a waking replica.
    pub(crate) rec_gate: Mutex<()>,

    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> ConsensusCore<K, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ReplicaId,
        keypair: Keypair,
        validator_set: ValidatorSet,
        quorum: QuorumParams,
        config: Configuration,
        store: ReplicaStore<K>,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Arc<ConsensusCore<K, N>> {
        let core = ConsensusCore {
            id,
            keypair,
            validator_set,
            quorum,
            config,
            store,
            sender,
            queue: RequestQueue::new(),
            status: StatusFlag::new(),
            sleep_gate: RwLock::new(()),
            view: ViewClock::new(),
            sequence: Mutex::new(BlockHeight::new(0)),
            cur_block: Mutex::new(QCBlock::genesis()),
            prev_block: Mutex::new(QCBlock::genesis()),
            cur_hash: Mutex::new(CryptoHash::zero()),
            locked_block: RwLock::new(QCBlock::genesis()),
            committed: Mutex::new(CommittedBlocks::new()),
            voted_blocks: Mutex::new(HashMap::new()),
            awaiting_blocks: Mutex::new(HashMap::new()),
            awaiting_txs: Mutex::new(HashMap::new()),
            awaiting_decision: Mutex::new(HashMap::new()),
            awaiting_decision_copy: Mutex::new(HashMap::new()),
            votes: VotePool::new(quorum.quorum),
            timeouts: TimeoutPool::new(quorum.quorum),
            view_changes: ViewChangePool::new(quorum.quorum),
            echoes: EchoPool::new(quorum.rec_quorum),
            rec: Mutex::new(RecoveryState::default()),
            rec_gate: Mutex::new(()),
            event_publisher,
        };
        Arc::new(core)
    }

    /* ↓↓↓ Leadership and views ↓↓↓ */

    pub(crate) fn local_view(&self) -> ViewNumber {
        self.view.get()
    }

    pub(crate) fn leader_id(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new(view.int() % self.quorum.n as u64)
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader_id(self.local_view()) == self.id
    }

    /* ↓↓↓ Sequence number ↓↓↓ */

    pub(crate) fn sequence(&self) -> BlockHeight {
        *self.sequence.lock().unwrap()
    }

    fn increment_seq(&self) -> BlockHeight {
        let mut sequence = self.sequence.lock().unwrap();
        *sequence += 1;
        let seq = *sequence;
        drop(sequence);
        self.store.persist(&paths::SEQUENCE, &seq, PersistLevel::All);
        seq
    }

    pub(crate) fn update_seq(&self, seq: BlockHeight) {
        let mut sequence = self.sequence.lock().unwrap();
        if seq > *sequence {
            *sequence = seq;
            drop(sequence);
            self.store.persist(&paths::SEQUENCE, &seq, PersistLevel::All);
        }
    }

    /* ↓↓↓ State snapshots ↓↓↓ */

    pub(crate) fn cur_block(&self) -> QCBlock {
        self.cur_block.lock().unwrap().clone()
    }

    pub(crate) fn locked_block(&self) -> QCBlock {
        self.locked_block.read().unwrap().clone()
    }

    pub(crate) fn committed_blocks(&self) -> CommittedBlocks {
        self.committed.lock().unwrap().clone()
    }

    pub(crate) fn pending_undecided(&self) -> usize {
        self.awaiting_decision_copy.lock().unwrap().len()
    }

    /// Swaps `cur_block`, remembering the previous value for the commit
    /// rule's leader snapshot, and persists both the block and the running
    /// hash.
    pub(crate) fn adopt_cur_block(&self, block: QCBlock, update_hash: bool) {
        let mut cur = self.cur_block.lock().unwrap();
        let mut prev = self.prev_block.lock().unwrap();
        *prev = cur.clone();
        *cur = block.clone();
        drop(prev);
        drop(cur);
        self.store.persist(&paths::CUR_BLOCK, &block, PersistLevel::All);
        if update_hash {
            if let Some(hash) = block.hash {
                *self.cur_hash.lock().unwrap() = hash;
                self.store.persist(&paths::CUR_HASH, &hash, PersistLevel::All);
            }
        }
    }

    /// Overwrites committed history wholesale; only used when recovering
    /// from disk.
    pub(crate) fn restore_committed(&self, blocks: CommittedBlocks) {
        *self.committed.lock().unwrap() = blocks;
    }

    pub(crate) fn restore_locked(&self, block: QCBlock) {
        *self.locked_block.write().unwrap() = block;
    }

    /// Merges a peer's committed history, inserting only missing heights,
    /// and persists the result at the critical level.
    pub(crate) fn merge_committed(&self, other: &CommittedBlocks) {
        let mut committed = self.committed.lock().unwrap();
        committed.merge_missing(other);
        let snapshot = committed.clone();
        drop(committed);
        self.store
            .persist(&paths::COMMITTED_BLOCKS, &snapshot, PersistLevel::Critical);
    }

    /// Adopts a higher locked block learned during recovery.
    pub(crate) fn adopt_locked_if_higher(&self, lqc: &QCBlock) {
        let mut locked = self.locked_block.write().unwrap();
        if !lqc.is_genesis() && lqc.height > locked.height {
            *locked = lqc.clone();
            let snapshot = locked.clone();
            drop(locked);
            self.store
                .persist(&paths::LOCKED_BLOCK, &snapshot, PersistLevel::Critical);
        }
    }

    /// Wipes all volatile protocol state. Models the total memory loss of a
    /// replica that slept; committed history is the one in-memory structure
    /// deliberately retained, since recovery only ever extends it.
    pub(crate) fn reset_volatile(&self) {
        *self.sequence.lock().unwrap() = BlockHeight::new(0);
        *self.cur_block.lock().unwrap() = QCBlock::genesis();
        *self.prev_block.lock().unwrap() = QCBlock::genesis();
        *self.cur_hash.lock().unwrap() = CryptoHash::zero();
        *self.locked_block.write().unwrap() = QCBlock::genesis();
        self.voted_blocks.lock().unwrap().clear();
        self.awaiting_blocks.lock().unwrap().clear();
        self.awaiting_txs.lock().unwrap().clear();
        self.awaiting_decision.lock().unwrap().clear();
        self.awaiting_decision_copy.lock().unwrap().clear();
        self.votes.clear();
        self.timeouts.clear();
        self.view_changes.clear();
        self.echoes.clear();
        *self.rec.lock().unwrap() = RecoveryState::default();
        self.view.reset();
    }

    pub(crate) fn clear_awaiting_blocks(&self) {
        self.awaiting_blocks.lock().unwrap().clear();
        self.store.persist(
            &paths::AWAITING_BLOCKS,
            &*self.awaiting_blocks.lock().unwrap(),
            PersistLevel::All,
        );
    }

    /* ↓↓↓ Inbound dispatch ↓↓↓ */

    /// Entry point for every inbound envelope (network or self-delivered).
    /// Verifies the envelope, applies the sleep/recovery admission rules,
    /// and dispatches on the message type.
    pub(crate) fn handle_delivery(core: &Arc<Self>, envelope: SignedEnvelope) {
        let message = match envelope.open(&core.validator_set) {
            Ok(message) => message,
            Err(crate::messages::MessageError::Malformed) => {
                log::debug!("dropping a malformed envelope");
                return;
            }
            Err(err) => {
                log::error!("dropping an envelope with a bad signature: {:?}", err);
                return;
            }
        };

        let _gate = core.sleep_gate.read().unwrap();
        match core.status.get() {
            Status::Sleeping => return,
            Status::Recovering if !message.is_recovery_reply() => return,
            _ => {}
        }

        match message {
            HotStuffMessage::Propose(m) => core.on_propose(m),
            HotStuffMessage::Vote(m) => core.on_vote(m),
            HotStuffMessage::Timeout(m) => core.on_timeout(m, envelope),
            HotStuffMessage::TimeoutQc(m) => Self::on_timeout_qc(core, m),
            HotStuffMessage::ViewChange(m) => Self::on_view_change(core, m, envelope),
            HotStuffMessage::NewView(m) => core.on_new_view(m),
            HotStuffMessage::Rec1(m) => core.on_rec1(m),
            HotStuffMessage::Echo1(m) => core.on_echo1(m),
            HotStuffMessage::Rec2(m) => core.on_rec2(m),
            HotStuffMessage::Echo2(m) => core.on_echo2(m),
        }
    }

    /* ↓↓↓ Proposing (leader) ↓↓↓ */

    /// Broadcasts a new proposal carrying `batch`. Invoked by the request
    /// monitor whenever the leader is READY and has pending work.
    pub(crate) fn start_hotstuff(&self, batch: Vec<Vec<u8>>) {
        let seq = self.increment_seq();
        let qc = self.fetch_block_info(seq);
        let payload_hash = crypto::batch_hash(&batch);
        let hash = {
            let cur_hash = self.cur_hash.lock().unwrap();
            chain_hash(&cur_hash, seq, &payload_hash)
        };

        let proposal = Propose {
            seq,
            source: self.id,
            view: self.local_view(),
            ops: batch.clone(),
            qc,
            hash,
            ts: Timestamp::now(),
            num: self.quorum.n as u64,
        };

        *self.cur_hash.lock().unwrap() = hash;
        self.store.persist(&paths::CUR_HASH, &hash, PersistLevel::All);

        {
            let mut awaiting = self.awaiting_blocks.lock().unwrap();
            awaiting.insert(seq, hash);
            self.store
                .persist(&paths::AWAITING_BLOCKS, &*awaiting, PersistLevel::All);
        }
        self.awaiting_txs.lock().unwrap().insert(seq, batch);
        {
            let mut copy = self.awaiting_decision_copy.lock().unwrap();
            copy.insert(seq, hash);
            self.store
                .persist(&paths::AWAITING_DECISION_COPY, &*copy, PersistLevel::All);
        }

        log::info!(
            "proposing block with height {}, awaiting {} blocks",
            seq,
            self.pending_undecided()
        );
        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            seq,
            hash,
        })
        .publish(&self.event_publisher);

        let envelope = SignedEnvelope::seal(&self.keypair, proposal);
        // The proposal is first received by the proposer itself.
        self.sender.broadcast_with_self(envelope);
    }

    /// The parent reference for a proposal at `seq`: the current block, or
    /// `None` for the initial block.
    fn fetch_block_info(&self, seq: BlockHeight) -> Option<QCBlock> {
        let cur = self.cur_block.lock().unwrap();
        if seq == BlockHeight::new(1) || cur.height == BlockHeight::new(0) {
            return None;
        }
        Some(cur.clone())
    }

    /* ↓↓↓ Proposal handling (everyone) ↓↓↓ */

    fn on_propose(&self, content: Propose) {
        if content.view < self.local_view() || self.status.get() == Status::ViewChange {
            return;
        }

        if !content.ops.is_empty() {
            let mut awaiting = self.awaiting_decision.lock().unwrap();
            awaiting.insert(content.seq, content.hash);
            self.store
                .persist(&paths::AWAITING_DECISION, &*awaiting, PersistLevel::All);
            drop(awaiting);
            if !self.is_leader() {
                let mut copy = self.awaiting_decision_copy.lock().unwrap();
                copy.insert(content.seq, content.hash);
                self.store
                    .persist(&paths::AWAITING_DECISION_COPY, &*copy, PersistLevel::All);
            }
        }

        let parent = content.qc.clone().unwrap_or_else(QCBlock::genesis);
        if !self.verify_block(content.seq, content.source, &parent) {
            log::error!(
                "block with height {} not verified (parent height {})",
                content.seq,
                parent.height
            );
            return;
        }

        Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            origin: content.source,
            seq: content.seq,
            hash: content.hash,
        })
        .publish(&self.event_publisher);

        self.process_qc_info(&parent, content.seq);

        // Vote at most once per (view, height); a conflicting second
        // proposal for a slot this replica already voted in is ignored. A
        // later view may legitimately re-propose the height.
        {
            let view = self.local_view();
            let mut voted = self.voted_blocks.lock().unwrap();
            match voted.get(&content.seq) {
                Some((voted_view, hash)) if *voted_view == view && *hash != content.hash => {
                    log::error!(
                        "already voted for a different block at height {}",
                        content.seq
                    );
                    return;
                }
                Some((voted_view, _)) if *voted_view == view => return,
                _ => {
                    voted.insert(content.seq, (view, content.hash));
                }
            }
            self.store
                .persist(&paths::VOTED_BLOCKS, &*voted, PersistLevel::All);
        }

        let sig = self.keypair.sign(&content.hash.bytes());
        let vote = Vote {
            seq: content.seq,
            source: self.id,
            view: self.local_view(),
            hash: content.hash,
            sig,
        };

        Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            seq: content.seq,
            hash: content.hash,
        })
        .publish(&self.event_publisher);

        let envelope = SignedEnvelope::seal(&self.keypair, vote);
        self.sender.send_to(content.source, envelope);
    }

    /// Whether the parent block carried in a proposal at `seq` is acceptable:
    /// either it is the genesis case of the very first proposal, or its
    /// height does not regress below the lock and its certificate holds a
    /// quorum of valid signatures.
    pub(crate) fn verify_block(
        &self,
        seq: BlockHeight,
        source: ReplicaId,
        parent: &QCBlock,
    ) -> bool {
        if seq == BlockHeight::new(1) && (self.sequence() < seq || source == self.id) {
            return true;
        }
        if parent.height < self.locked_block.read().unwrap().height {
            return false;
        }
        if parent.qc.len() < self.quorum.quorum {
            return false;
        }
        if !parent.verify(self.quorum.quorum, &self.validator_set) {
            log::error!("block signature {} not verified", parent.height);
            return false;
        }
        true
    }

    /* ↓↓↓ Three-chain commit rule ↓↓↓ */

    /// Advances lock/commit state given the newly-validated parent block
    /// carried in a proposal at height `seq`.
    ///
    /// The parent confirms the block below it; two confirmations on top of
    /// the lock are the commit point. Re-applying with a parent that does
    /// not extend the newest QC'd block is a no-op. On the leader the
    /// staleness reference is the `prev_block` snapshot: its `cur_block`
    /// already moved forward when the vote quorum formed, and comparing
    /// against it would make every one of the leader's own parents look
    /// stale.
    pub(crate) fn process_qc_info(&self, parent: &QCBlock, seq: BlockHeight) {
        if parent.height >= BlockHeight::new(2) {
            let reference_height = if self.is_leader() {
                self.prev_block.lock().unwrap().height
            } else {
                self.cur_block.lock().unwrap().height
            };
            if parent.height <= reference_height {
                return;
            }
            if parent.height >= BlockHeight::new(3) {
                let locked = self.locked_block.read().unwrap().clone();
                if parent.height >= locked.height + 2 {
                    let snapshot = {
                        let mut committed = self.committed.lock().unwrap();
                        committed.insert(locked.height, locked.clone());
                        committed.clone()
                    };
                    self.store.persist(
                        &paths::COMMITTED_BLOCKS,
                        &snapshot,
                        PersistLevel::Critical,
                    );
                    log::info!("[!!!] ready to output a value for height {}", locked.height);
                    Event::CommitBlock(CommitBlockEvent {
                        timestamp: SystemTime::now(),
                        height: locked.height,
                    })
                    .publish(&self.event_publisher);
                    if self.config.is_double_spend_test() {
                        if let Err(err) =
                            crate::logging::output_blockchain(locked.height, &snapshot)
                        {
                            log::error!(
                                "error dumping the chain at height {}: {}",
                                locked.height,
                                err
                            );
                        }
                    }
                }
            }

            // The previously-QC'd block becomes locked. On the leader,
            // `cur_block` was already swapped forward when the vote quorum
            // formed, so the snapshot taken at that swap is the semantic
            // parent.
            let new_locked = if self.is_leader() {
                self.prev_block.lock().unwrap().clone()
            } else {
                self.cur_block.lock().unwrap().clone()
            };
            {
                let mut locked = self.locked_block.write().unwrap();
                *locked = new_locked.clone();
            }
            self.store
                .persist(&paths::LOCKED_BLOCK, &new_locked, PersistLevel::Critical);
            Event::LockBlock(LockBlockEvent {
                timestamp: SystemTime::now(),
                height: new_locked.height,
            })
            .publish(&self.event_publisher);

            {
                let mut voted = self.voted_blocks.lock().unwrap();
                voted.remove(&new_locked.height);
                self.store
                    .persist(&paths::VOTED_BLOCKS, &*voted, PersistLevel::All);
            }
        }

        if !self.is_leader() && parent.height > self.cur_block.lock().unwrap().height {
            self.adopt_cur_block(parent.clone(), true);
        }

        if seq > BlockHeight::new(3) {
            let expired = seq.checked_sub(3).unwrap();
            {
                let mut awaiting = self.awaiting_decision.lock().unwrap();
                awaiting.remove(&expired);
                self.store
                    .persist(&paths::AWAITING_DECISION, &*awaiting, PersistLevel::All);
            }
            {
                let mut copy = self.awaiting_decision_copy.lock().unwrap();
                copy.remove(&expired);
                self.store
                    .persist(&paths::AWAITING_DECISION_COPY, &*copy, PersistLevel::All);
            }
        }

        self.update_seq(seq);
    }

    /* ↓↓↓ Vote handling (proposer) ↓↓↓ */

    fn on_vote(&self, content: Vote) {
        let local_view = self.local_view();
        if content.view < local_view || self.status.get() == Status::ViewChange {
            return;
        }

        // Equivocation guard: the vote must be for the block this replica
        // proposed at that height.
        if let Some(hash) = self.awaiting_blocks.lock().unwrap().get(&content.seq) {
            if *hash != content.hash {
                log::error!("hash not matching for votes at height {}", content.seq);
                return;
            }
        }

        if !self
            .validator_set
            .verify(content.source, &content.hash.bytes(), &content.sig)
        {
            log::error!(
                "signature for vote at height {} from {} not verified",
                content.seq,
                content.source
            );
            return;
        }

        Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            origin: content.source,
            seq: content.seq,
            hash: content.hash,
        })
        .publish(&self.event_publisher);

        let certificate = match self.votes.insert(content.hash, content.source, content.sig) {
            PoolOutcome::AlreadyPrepared | PoolOutcome::Counted => return,
            PoolOutcome::Quorum(certificate) => certificate,
        };

        let height = self.cur_block.lock().unwrap().height + 1;
        let pre_hash = content
            .seq
            .checked_sub(1)
            .and_then(|h| self.awaiting_blocks.lock().unwrap().get(&h).copied());
        let pre_pre_hash = content
            .seq
            .checked_sub(2)
            .and_then(|h| self.awaiting_blocks.lock().unwrap().get(&h).copied());

        let txs = match self.awaiting_txs.lock().unwrap().get(&content.seq) {
            Some(batch) => {
                let mut txs = Vec::with_capacity(batch.len() + 1);
                let coinbase = Transaction::coinbase(self.id);
                txs.push(ClientRequest {
                    id: self.id.int(),
                    op: borsh::BorshSerialize::try_to_vec(&coinbase)
                        .expect("serializing a transaction cannot fail"),
                    ts: Timestamp::now(),
                });
                txs.extend(batch.iter().map(|raw| ClientRequest::from_raw(raw)));
                txs
            }
            None => Vec::new(),
        };

        let qcblock = QCBlock {
            view: local_view,
            height,
            hash: Some(content.hash),
            pre_hash,
            pre_pre_hash,
            qc: certificate.sigs,
            ids: certificate.ids,
            txs,
        };

        Event::CollectQc(CollectQcEvent {
            timestamp: SystemTime::now(),
            height,
            hash: content.hash,
        })
        .publish(&self.event_publisher);

        if qcblock.height > self.cur_block.lock().unwrap().height {
            self.adopt_cur_block(qcblock, false);
        } else {
            log::info!(
                "new block's QC at height {} is not above curBlock",
                qcblock.height
            );
        }
        self.status.set(Status::Ready);
    }
}
