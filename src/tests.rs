/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol-level tests: clusters of consensus cores wired through a mock
//! network and an in-memory KV store, driven deterministically by pumping
//! envelopes between them. No replica threads are started; every handler
//! runs on the test thread, so assertions observe quiescent states.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::algorithm::ConsensusCore;
use crate::config::{test_config, Configuration, RecMode, TestType};
use crate::crypto::{self, Keypair};
use crate::messages::{Propose, SignedEnvelope, Timeout, TimeoutQc, Vote};
use crate::networking::{Liveness, Network, NetworkError, SenderHandle};
use crate::state::mem_db::MemDB;
use crate::state::ReplicaStore;
use crate::types::basic::{
    BlockHeight, ReplicaId, Status, Timestamp, ValidatorSet, ViewNumber,
};
use crate::types::block::Transaction;

/// A mock network: sends append to a cluster-wide wire queue which the test
/// pump later delivers.
#[derive(Clone)]
struct NetworkStub {
    wires: Arc<Mutex<VecDeque<(ReplicaId, SignedEnvelope)>>>,
}

impl Network for NetworkStub {
    fn send(
        &mut self,
        peer: ReplicaId,
        envelope: SignedEnvelope,
        _timeout: Duration,
    ) -> Result<(), NetworkError> {
        self.wires.lock().unwrap().push_back((peer, envelope));
        Ok(())
    }

    fn recv(&mut self) -> Option<(ReplicaId, SignedEnvelope)> {
        None
    }
}

struct TestNode {
    core: Arc<ConsensusCore<MemDB, NetworkStub>>,
    loopback: Receiver<(ReplicaId, SignedEnvelope)>,
    db: MemDB,
}

struct TestCluster {
    keypairs: Vec<Keypair>,
    validator_set: ValidatorSet,
    config: Configuration,
    wires: Arc<Mutex<VecDeque<(ReplicaId, SignedEnvelope)>>>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    fn new(config: Configuration) -> TestCluster {
        let n = config.n();
        let keypairs: Vec<Keypair> = (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut OsRng)))
            .collect();
        let validator_set = ValidatorSet::new(keypairs.iter().map(|k| k.public()).collect());
        let wires = Arc::new(Mutex::new(VecDeque::new()));

        let mut cluster = TestCluster {
            keypairs,
            validator_set,
            config,
            wires,
            nodes: Vec::new(),
        };
        for i in 0..n {
            let db = MemDB::new();
            crate::Replica::<MemDB, NetworkStub>::initialize(db.clone(), &cluster.config)
                .unwrap();
            let node = cluster.build_node(ReplicaId::new(i as u64), db);
            cluster.nodes.push(node);
        }
        cluster
    }

    fn build_node(&self, id: ReplicaId, db: MemDB) -> TestNode {
        let (loopback_sender, loopback) = mpsc::channel();
        let sender = SenderHandle::new(
            id,
            self.validator_set.ids().collect(),
            NetworkStub {
                wires: Arc::clone(&self.wires),
            },
            Arc::new(Liveness::new()),
            Duration::from_millis(self.config.broadcast_timer),
            loopback_sender,
        );
        let store = ReplicaStore::new(db.clone(), self.config.persist_level().unwrap());
        let core = ConsensusCore::new(
            id,
            self.keypairs[id.as_usize()].clone(),
            self.validator_set.clone(),
            self.config.quorum_params().unwrap(),
            self.config.clone(),
            store,
            sender,
            None,
        );
        TestNode { core, loopback, db }
    }

    fn node(&self, i: usize) -> &Arc<ConsensusCore<MemDB, NetworkStub>> {
        &self.nodes[i].core
    }

    /// Rebuilds node `i` on its existing KV store, as a process restart
    /// would.
    fn restart_node(&mut self, i: usize) {
        let db = self.nodes[i].db.clone();
        self.nodes[i] = self.build_node(ReplicaId::new(i as u64), db);
    }

    /// Collects every queued envelope (self-deliveries first, then wires)
    /// without dispatching any of them.
    fn drain_deliveries(&self) -> Vec<(usize, SignedEnvelope)> {
        for node in &self.nodes {
            node.core.sender.flush();
        }

        let mut deliveries: Vec<(usize, SignedEnvelope)> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            while let Ok((_, envelope)) = node.loopback.try_recv() {
                deliveries.push((i, envelope));
            }
        }
        let mut wires = self.wires.lock().unwrap();
        while let Some((dest, envelope)) = wires.pop_front() {
            deliveries.push((dest.as_usize(), envelope));
        }
        deliveries
    }

    /// Delivers queued envelopes until the cluster is quiescent.
    fn pump(&self) {
        self.pump_filtered(None);
    }

    /// Pumps while discarding envelopes addressed to `skip` (best-effort
    /// transport may drop deliveries at any time).
    fn pump_excluding(&self, skip: usize) {
        self.pump_filtered(Some(skip));
    }

    fn pump_filtered(&self, skip: Option<usize>) {
        for _ in 0..1000 {
            let deliveries = self.drain_deliveries();
            if deliveries.is_empty() {
                return;
            }
            for (dest, envelope) in deliveries {
                if Some(dest) == skip {
                    continue;
                }
                ConsensusCore::handle_delivery(&self.nodes[dest].core, envelope);
            }
        }
        panic!("cluster did not quiesce");
    }

    /// Has the current view-0 leader drive the pipeline to `height`, the
    /// first proposal carrying `batch` and the rest empty.
    fn drive_to_height(&self, leader: usize, batch: Vec<Vec<u8>>, height: u64) {
        for h in 1..=height {
            let batch = if h == 1 { batch.clone() } else { Vec::new() };
            self.node(leader).start_hotstuff(batch);
            self.pump();
            assert_eq!(self.node(leader).status.get(), Status::Ready);
        }
    }
}

fn quiet_config(n: usize, persist_level: u8) -> Configuration {
    let mut config = test_config::hotstuff(n, persist_level);
    // Keep the rotating timer and any spawned monitor loops inert; the
    // tests fire timeouts and proposals explicitly.
    config.rotating_time = 3600;
    config.sleep_timer = 10_000;
    config
}

/* ↓↓↓ Normal-case pipeline and the three-chain rule ↓↓↓ */

#[test]
fn four_proposals_commit_height_one_everywhere() {
    let cluster = TestCluster::new(quiet_config(4, 3));
    let batch = vec![b"r1".to_vec(), b"r2".to_vec()];

    // Heights 1..3: a QC exists at 1 and 2, but nothing commits yet.
    cluster.drive_to_height(0, batch.clone(), 3);
    for i in 0..4 {
        assert!(
            !cluster.node(i).committed_blocks().contains(BlockHeight::new(1)),
            "replica {} committed height 1 before the three-chain closed",
            i
        );
    }

    // Height 4's proposal carries height 3's QC: the chain 1←2←3 closes
    // and height 1 commits on every replica, leader included.
    cluster.node(0).start_hotstuff(Vec::new());
    cluster.pump();

    let reference = cluster
        .node(0)
        .committed_blocks()
        .get(BlockHeight::new(1))
        .cloned()
        .expect("leader committed height 1");
    for i in 0..4 {
        let committed = cluster.node(i).committed_blocks();
        let block = committed
            .get(BlockHeight::new(1))
            .unwrap_or_else(|| panic!("replica {} did not commit height 1", i));
        assert!(block == &reference, "replica {} committed a different block", i);
        assert!(!committed.contains(BlockHeight::new(2)));
        assert_eq!(cluster.node(i).locked_block().height, BlockHeight::new(2));
    }
}

#[test]
fn committed_batch_is_prefixed_by_the_coinbase_entry() {
    let cluster = TestCluster::new(quiet_config(4, 3));
    cluster.drive_to_height(0, vec![b"r1".to_vec(), b"r2".to_vec()], 4);

    let committed = cluster.node(1).committed_blocks();
    let block = committed.get(BlockHeight::new(1)).unwrap();
    assert_eq!(block.txs.len(), 3);

    let coinbase: Transaction =
        borsh::BorshDeserialize::try_from_slice(&block.txs[0].op).unwrap();
    assert_eq!(coinbase, Transaction::coinbase(ReplicaId::new(0)));
    assert_eq!(block.txs[1].op, b"r1".to_vec());
    assert_eq!(block.txs[2].op, b"r2".to_vec());
}

#[test]
fn reapplying_a_stale_parent_is_a_noop() {
    let cluster = TestCluster::new(quiet_config(4, 3));
    cluster.drive_to_height(0, vec![b"r1".to_vec()], 4);

    let follower = cluster.node(1);
    let cur_before = follower.cur_block();
    let locked_before = follower.locked_block();
    let committed_before = follower.committed_blocks().len();

    // A parent at cur_block's own height (or below) advances nothing.
    follower.process_qc_info(&cur_before, cur_before.height + 1);
    follower.process_qc_info(&locked_before, locked_before.height + 1);

    assert!(follower.cur_block() == cur_before);
    assert!(follower.locked_block() == locked_before);
    assert_eq!(follower.committed_blocks().len(), committed_before);
}

/* ↓↓↓ Equivocation ↓↓↓ */

#[test]
fn followers_vote_once_per_slot_under_an_equivocating_leader() {
    let cluster = TestCluster::new(quiet_config(4, 3));
    let leader_keypair = cluster.keypairs[0].clone();

    let make_proposal = |payload: &[u8]| Propose {
        seq: BlockHeight::new(1),
        source: ReplicaId::new(0),
        view: ViewNumber::init(),
        ops: vec![payload.to_vec()],
        qc: None,
        hash: crypto::hash(payload),
        ts: Timestamp::now(),
        num: 4,
    };

    ConsensusCore::handle_delivery(
        cluster.node(1),
        SignedEnvelope::seal(&leader_keypair, make_proposal(b"one")),
    );
    ConsensusCore::handle_delivery(
        cluster.node(1),
        SignedEnvelope::seal(&leader_keypair, make_proposal(b"two")),
    );
    cluster.node(1).sender.flush();

    // Exactly one vote left replica 1.
    let votes = cluster.wires.lock().unwrap().len();
    assert_eq!(votes, 1);
}

#[test]
fn leader_drops_votes_for_a_hash_it_did_not_propose() {
    let cluster = TestCluster::new(quiet_config(4, 3));
    let leader = cluster.node(0);
    leader.start_hotstuff(vec![b"r1".to_vec()]);
    // Do not pump: no legitimate votes counted yet.

    let wrong_hash = crypto::hash(b"somebody else's block");
    for voter in 1..4 {
        let vote = Vote {
            seq: BlockHeight::new(1),
            source: ReplicaId::new(voter),
            view: ViewNumber::init(),
            hash: wrong_hash,
            sig: cluster.keypairs[voter as usize].sign(&wrong_hash.bytes()),
        };
        ConsensusCore::handle_delivery(
            leader,
            SignedEnvelope::seal(&cluster.keypairs[voter as usize], vote),
        );
    }

    // Three forged votes formed no certificate.
    assert_eq!(leader.cur_block().height, BlockHeight::new(0));
}

/* ↓↓↓ View change ↓↓↓ */

#[test]
fn timeout_quorum_rotates_the_leader() {
    // No persistence, so the TIMEOUT/TQC round is exercised.
    let cluster = TestCluster::new(quiet_config(4, 3));

    for i in 0..4 {
        ConsensusCore::timeout_handler(cluster.node(i), ViewNumber::init());
    }
    cluster.pump();

    for i in 0..4 {
        assert_eq!(
            cluster.node(i).local_view(),
            ViewNumber::new(1),
            "replica {} did not enter view 1",
            i
        );
        assert_eq!(cluster.node(i).status.get(), Status::Ready);
    }

    // The view-1 leader proposes and the pipeline moves again.
    cluster.node(1).start_hotstuff(vec![b"after vc".to_vec()]);
    cluster.pump();
    assert_eq!(cluster.node(1).cur_block().height, BlockHeight::new(1));
    assert_eq!(cluster.node(1).cur_block().view, ViewNumber::new(1));
}

#[test]
fn persisted_view_skips_the_timeout_round() {
    // Persist-critical: TimeoutHandler goes straight to the view change.
    let cluster = TestCluster::new(quiet_config(4, 2));

    for i in 0..4 {
        ConsensusCore::timeout_handler(cluster.node(i), ViewNumber::init());
    }
    cluster.pump();

    for i in 0..4 {
        assert_eq!(cluster.node(i).local_view(), ViewNumber::new(1));
    }
}

/* ↓↓↓ Crash recovery from disk ↓↓↓ */

#[test]
fn rec_from_disk_reenters_at_the_next_view_with_the_locked_block() {
    let mut cluster = TestCluster::new(quiet_config(4, 2));
    cluster.drive_to_height(0, vec![b"r1".to_vec()], 4);

    // Follower 3 has locked height 2 and committed height 1; crash it.
    assert_eq!(cluster.node(3).locked_block().height, BlockHeight::new(2));
    cluster.restart_node(3);
    assert_eq!(cluster.node(3).cur_block().height, BlockHeight::new(0));

    cluster.node(3).status.set(Status::Sleeping);
    ConsensusCore::recovery_process(cluster.node(3), RecMode::RecFromDisk).unwrap();

    let node = cluster.node(3);
    assert_eq!(node.local_view(), ViewNumber::new(1));
    assert_eq!(node.cur_block().height, BlockHeight::new(2));
    assert!(node.cur_block() == node.locked_block());
    assert!(node.committed_blocks().contains(BlockHeight::new(1)));

    // Any proposal whose parent falls below the recovered lock is refused.
    let low_parent = node.committed_blocks().get(BlockHeight::new(1)).unwrap().clone();
    assert!(!node.verify_block(BlockHeight::new(5), ReplicaId::new(0), &low_parent));
}

/* ↓↓↓ Disk-free wake recovery ↓↓↓ */

fn koala2_config(n: usize) -> Configuration {
    let mut config = quiet_config(n, 2);
    config.num_of_mal = 1;
    config.num_of_sleepy = 1;
    config.gat = true;
    config.test.test_id = TestType::Koala2DoubleSpend;
    config
}

#[test]
fn koala2_wake_recovery_catches_up_committed_history() {
    // n=4, f=1, s=1, persisted view + GAT: Q=3, Q'=2.
    let cluster = TestCluster::new(koala2_config(4));
    assert_eq!(cluster.node(0).quorum.quorum, 3);
    assert_eq!(cluster.node(0).quorum.rec_quorum, 2);

    // Replica 3 sleeps through the whole pipeline, which stays in view 0:
    // its handler drops everything while SLEEPING (a sleeping replica emits
    // nothing either).
    cluster.node(3).status.set(Status::Sleeping);
    cluster.drive_to_height(0, vec![b"r1".to_vec()], 5);
    assert!(cluster.node(3).committed_blocks().is_empty());

    // Wake up with nothing but the committed prefix it had (none).
    cluster.node(3).reset_volatile();
    ConsensusCore::recovery_process(cluster.node(3), RecMode::RecKoala2).unwrap();

    // First round: deliver the REC1s; the awake replicas reply with
    // "no previous view" (they never left view 0) and an empty TQC.
    for (dest, envelope) in cluster.drain_deliveries() {
        ConsensusCore::handle_delivery(&cluster.nodes[dest].core, envelope);
    }
    let echo1s: Vec<SignedEnvelope> = cluster
        .drain_deliveries()
        .into_iter()
        .map(|(dest, envelope)| {
            assert_eq!(dest, 3);
            envelope
        })
        .collect();
    assert_eq!(echo1s.len(), 3);

    // An all-view-0 quorum fixes the catch-up target at view 1, so the
    // ECHO1 handler must block instead of opening the second round.
    let woken = Arc::clone(cluster.node(3));
    let echo1_round = thread::spawn(move || {
        for envelope in echo1s {
            ConsensusCore::handle_delivery(&woken, envelope);
        }
    });

    thread::sleep(Duration::from_millis(100));
    assert_eq!(cluster.node(3).status.get(), Status::Recovering);
    assert_eq!(cluster.node(3).local_view(), ViewNumber::init());
    assert!(
        cluster.drain_deliveries().is_empty(),
        "REC2 must not go out before the local view passes the catch-up target"
    );

    // A timeout quorum for view 0 moves the awake replicas into view 1;
    // the recovering replica sees none of it yet.
    let timeouts: Vec<SignedEnvelope> = (0..3)
        .map(|i| {
            SignedEnvelope::seal(
                &cluster.keypairs[i],
                Timeout {
                    source: ReplicaId::new(i as u64),
                    view: ViewNumber::init(),
                    ts: Timestamp::now(),
                    num: 4,
                },
            )
        })
        .collect();
    let tqc = TimeoutQc {
        source: ReplicaId::new(0),
        view: ViewNumber::init(),
        v: timeouts,
    };
    for i in 0..3 {
        ConsensusCore::handle_delivery(
            cluster.node(i),
            SignedEnvelope::seal(&cluster.keypairs[0], tqc.clone()),
        );
    }
    cluster.pump_excluding(3);
    for i in 0..3 {
        assert_eq!(cluster.node(i).local_view(), ViewNumber::new(1));
    }
    // The whole cluster moved on and the waking replica is still holding.
    assert_eq!(cluster.node(3).local_view(), ViewNumber::init());
    assert_eq!(cluster.node(3).status.get(), Status::Recovering);

    // Once the TQC reaches the recovering replica its view passes the
    // target and REC2 is released, while the status is still RECOVERING.
    ConsensusCore::handle_delivery(
        cluster.node(3),
        SignedEnvelope::seal(&cluster.keypairs[0], tqc),
    );
    echo1_round.join().unwrap();
    assert_eq!(cluster.node(3).local_view(), ViewNumber::new(1));
    assert_eq!(cluster.node(3).status.get(), Status::Recovering);

    // Second round: the ECHO2s bring the blocks over.
    cluster.pump();

    let woken = cluster.node(3);
    assert_eq!(woken.status.get(), Status::Ready);
    assert_eq!(woken.local_view(), ViewNumber::new(1));

    // Committed history now covers everything the awake replicas committed.
    let awake = cluster.node(1).committed_blocks();
    let recovered = woken.committed_blocks();
    for (height, block) in awake.iter() {
        assert!(
            recovered.get(*height) == Some(block),
            "height {} missing after recovery",
            height
        );
    }
    assert_eq!(woken.locked_block().height, cluster.node(1).locked_block().height);
    assert!(woken.cur_block().height >= cluster.node(1).cur_block().height);
}

#[test]
fn recovery_requires_the_sleeping_state() {
    let cluster = TestCluster::new(koala2_config(4));
    assert!(matches!(
        ConsensusCore::recovery_process(cluster.node(0), RecMode::RecKoala2),
        Err(crate::RecoveryError::NotSleeping)
    ));
}
