/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum sizes and quorum accounting.
//!
//! [QuorumParams] fixes the quorum `Q` and recovery quorum `Q'` for the
//! configured fault model. The pools in this module collect votes, timeouts,
//! view changes and recovery echoes; each key (block hash or view) is an
//! independent set guarded by the pool's internal lock, and each set reaches
//! the PREPARED state exactly once. Inserts after PREPARED observe the
//! marker and are dropped, which makes redelivery harmless.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::messages::SignedEnvelope;
use crate::state::PersistLevel;
use crate::types::basic::{CryptoHash, ReplicaId, SignatureBytes, ViewNumber};

/// Numeric parameters of the fault model: `n` replicas, up to `f` Byzantine,
/// up to `s` temporarily sleeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuorumParams {
    pub n: usize,
    pub f: usize,
    pub s: usize,
    pub quorum: usize,
    pub rec_quorum: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QuorumConfigError {
    /// `3f >= n`: the basic Byzantine bound is violated.
    TooManyFaults { n: usize, f: usize },
    /// `n` does not satisfy the equation of the selected sleepy mode.
    SizeMismatch { mode: &'static str, n: usize },
}

impl QuorumParams {
    /// The HotStuff baseline with no sleepy replicas: `f = (n-1)/3` and
    /// `Q = ⌈(n+f+1)/2⌉`.
    pub fn hotstuff_baseline(n: usize) -> QuorumParams {
        let f = (n - 1) / 3;
        let mut quorum = (n + f + 1) / 2;
        if (n + f + 1) % 2 > 0 {
            quorum += 1;
        }
        QuorumParams {
            n,
            f,
            s: 0,
            quorum,
            rec_quorum: quorum,
        }
    }

    /// Quorum sizes for the sleepy variants. The mode follows from whether
    /// the view is persisted and whether GAT (global awake time) is assumed:
    ///
    /// | persistence | GAT | mode     | Q     | Q'      |
    /// |-------------|-----|----------|-------|---------|
    /// | none        | yes | 3f+s+1   | n−f   | n−f−s   |
    /// | any         | yes | 3f+1     | n−f   | n−f−s   |
    /// | any         | no  | 3f+2s+1  | n−f−s | n−f−s   |
    pub fn sleepy(
        n: usize,
        f: usize,
        s: usize,
        gat: bool,
        persist_level: PersistLevel,
    ) -> Result<QuorumParams, QuorumConfigError> {
        if 3 * f >= n {
            return Err(QuorumConfigError::TooManyFaults { n, f });
        }

        let mode = if persist_level == PersistLevel::None {
            if gat {
                "3f+s+1"
            } else {
                "3f+2s+1"
            }
        } else if gat {
            "3f+1"
        } else {
            "3f+2s+1"
        };

        let (quorum, rec_quorum) = match mode {
            "3f+1" => {
                if n < 3 * f + 1 {
                    return Err(QuorumConfigError::SizeMismatch { mode, n });
                }
                (n - f, n - f - s)
            }
            "3f+s+1" => {
                if n < 3 * f + s + 1 {
                    return Err(QuorumConfigError::SizeMismatch { mode, n });
                }
                (n - f, n - f - s)
            }
            "3f+2s+1" => {
                if n < 3 * f + 2 * s + 1 {
                    return Err(QuorumConfigError::SizeMismatch { mode, n });
                }
                (n - f - s, n - f - s)
            }
            _ => unreachable!(),
        };

        Ok(QuorumParams {
            n,
            f,
            s,
            quorum,
            rec_quorum,
        })
    }
}

/// Outcome of inserting one contribution into a pool.
pub(crate) enum PoolOutcome<C> {
    /// The set for this key already reached PREPARED.
    AlreadyPrepared,
    /// Counted, quorum not yet reached.
    Counted,
    /// This insert completed the quorum; the set is now PREPARED.
    Quorum(C),
}

/// Per-block-hash vote sets. A vote is `(voter, signature-over-hash)`; the
/// assembled certificate is handed out exactly once per hash.
pub(crate) struct VotePool {
    quorum: usize,
    inner: Mutex<HashMap<CryptoHash, VoteSet>>,
}

#[derive(Default)]
struct VoteSet {
    votes: Vec<(ReplicaId, SignatureBytes)>,
    prepared: bool,
}

/// A quorum of signatures over one block hash, ready to be placed into a
/// [QCBlock](crate::types::block::QCBlock).
pub(crate) struct Certificate {
    pub(crate) sigs: Vec<SignatureBytes>,
    pub(crate) ids: Vec<ReplicaId>,
}

impl VotePool {
    pub(crate) fn new(quorum: usize) -> VotePool {
        VotePool {
            quorum,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &self,
        hash: CryptoHash,
        voter: ReplicaId,
        sig: SignatureBytes,
    ) -> PoolOutcome<Certificate> {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(hash).or_default();
        if set.prepared {
            return PoolOutcome::AlreadyPrepared;
        }
        if set.votes.iter().any(|(id, _)| *id == voter) {
            return PoolOutcome::Counted;
        }
        set.votes.push((voter, sig));
        if set.votes.len() >= self.quorum {
            set.prepared = true;
            let (ids, sigs) = set.votes.iter().map(|(id, sig)| (*id, *sig)).unzip();
            PoolOutcome::Quorum(Certificate { sigs, ids })
        } else {
            PoolOutcome::Counted
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Per-view sets of signed TIMEOUT envelopes. The PREPARED marker is shared
/// between aggregation (a quorum of timeouts collected locally) and adoption
/// (a TQC received from another replica), so a TQC is assembled or forwarded
/// at most once per view.
pub(crate) struct TimeoutPool {
    quorum: usize,
    inner: Mutex<HashMap<ViewNumber, TimeoutSet>>,
}

#[derive(Default)]
struct TimeoutSet {
    envelopes: Vec<(ReplicaId, SignedEnvelope)>,
    prepared: bool,
}

impl TimeoutPool {
    pub(crate) fn new(quorum: usize) -> TimeoutPool {
        TimeoutPool {
            quorum,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &self,
        view: ViewNumber,
        source: ReplicaId,
        envelope: SignedEnvelope,
    ) -> PoolOutcome<Vec<SignedEnvelope>> {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(view).or_default();
        if set.prepared {
            return PoolOutcome::AlreadyPrepared;
        }
        if set.envelopes.iter().any(|(id, _)| *id == source) {
            return PoolOutcome::Counted;
        }
        set.envelopes.push((source, envelope));
        if set.envelopes.len() >= self.quorum {
            set.prepared = true;
            PoolOutcome::Quorum(set.envelopes.iter().map(|(_, e)| e.clone()).collect())
        } else {
            PoolOutcome::Counted
        }
    }

    /// Adopts a complete TQC received from elsewhere. Returns true the first
    /// time, false once the view is already PREPARED (suppresses
    /// re-broadcast).
    pub(crate) fn adopt(&self, view: ViewNumber, envelopes: Vec<SignedEnvelope>) -> bool {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(view).or_default();
        if set.prepared {
            return false;
        }
        set.prepared = true;
        set.envelopes = envelopes
            .into_iter()
            .map(|e| (ReplicaId::new(u64::MAX), e))
            .collect();
        true
    }

    /// The envelopes collected for `view` so far; empty if none. Served to
    /// waking replicas in ECHO1.
    pub(crate) fn get_v(&self, view: ViewNumber) -> Vec<SignedEnvelope> {
        let pool = self.inner.lock().unwrap();
        pool.get(&view)
            .map(|set| set.envelopes.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Per-view sets of VIEWCHANGE envelopes collected by the new leader.
///
/// Counting and the PREPARED transition are deliberately separate here: the
/// new leader may still be READY in the previous view when the quorum-th
/// VIEWCHANGE arrives, in which case it only acts on the quorum later, from
/// a subsequent message.
pub(crate) struct ViewChangePool {
    quorum: usize,
    inner: Mutex<HashMap<ViewNumber, TimeoutSet>>,
}

impl ViewChangePool {
    pub(crate) fn new(quorum: usize) -> ViewChangePool {
        ViewChangePool {
            quorum,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_prepared(&self, view: ViewNumber) -> bool {
        let pool = self.inner.lock().unwrap();
        pool.get(&view).map(|set| set.prepared).unwrap_or(false)
    }

    /// Counts a VIEWCHANGE from `source`; duplicates do not count twice.
    pub(crate) fn insert(&self, view: ViewNumber, source: ReplicaId, envelope: SignedEnvelope) {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(view).or_default();
        if set.envelopes.iter().any(|(id, _)| *id == source) {
            return;
        }
        set.envelopes.push((source, envelope));
    }

    pub(crate) fn quorum_reached(&self, view: ViewNumber) -> bool {
        let pool = self.inner.lock().unwrap();
        pool.get(&view)
            .map(|set| set.envelopes.len() >= self.quorum)
            .unwrap_or(false)
    }

    /// Marks the view PREPARED. The first caller gets the collected
    /// envelope set for the NEWVIEW broadcast; everyone after gets None.
    pub(crate) fn try_prepare(&self, view: ViewNumber) -> Option<Vec<SignedEnvelope>> {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(view).or_default();
        if set.prepared {
            return None;
        }
        set.prepared = true;
        Some(set.envelopes.iter().map(|(_, e)| e.clone()).collect())
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Per-request-hash counters of recovery echoes, checked against `Q'`.
pub(crate) struct EchoPool {
    rec_quorum: usize,
    inner: Mutex<HashMap<CryptoHash, EchoSet>>,
}

#[derive(Default)]
struct EchoSet {
    sources: HashSet<ReplicaId>,
    prepared: bool,
}

impl EchoPool {
    pub(crate) fn new(rec_quorum: usize) -> EchoPool {
        EchoPool {
            rec_quorum,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, hash: CryptoHash, source: ReplicaId) -> PoolOutcome<()> {
        let mut pool = self.inner.lock().unwrap();
        let set = pool.entry(hash).or_default();
        if set.prepared {
            return PoolOutcome::AlreadyPrepared;
        }
        set.sources.insert(source);
        if set.sources.len() >= self.rec_quorum {
            set.prepared = true;
            PoolOutcome::Quorum(())
        } else {
            PoolOutcome::Counted
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn baseline_quorum_sizes() {
        // n=4, f=1: Q = ceil(6/2) = 3.
        let params = QuorumParams::hotstuff_baseline(4);
        assert_eq!(params.f, 1);
        assert_eq!(params.quorum, 3);

        // n=7, f=2: Q = ceil(10/2) = 5.
        let params = QuorumParams::hotstuff_baseline(7);
        assert_eq!(params.f, 2);
        assert_eq!(params.quorum, 5);
    }

    #[test]
    fn sleepy_quorum_sizes_per_mode() {
        // No persistence + GAT ("3f+s+1"): Q = n−f, Q' = n−f−s.
        let params = QuorumParams::sleepy(7, 1, 2, true, PersistLevel::None).unwrap();
        assert_eq!(params.quorum, 6);
        assert_eq!(params.rec_quorum, 4);

        // Persisted view + GAT ("3f+1").
        let params = QuorumParams::sleepy(4, 1, 1, true, PersistLevel::Critical).unwrap();
        assert_eq!(params.quorum, 3);
        assert_eq!(params.rec_quorum, 2);

        // General ("3f+2s+1"): Q = Q' = n−f−s.
        let params = QuorumParams::sleepy(6, 1, 1, false, PersistLevel::None).unwrap();
        assert_eq!(params.quorum, 4);
        assert_eq!(params.rec_quorum, 4);
    }

    #[test]
    fn sleepy_rejects_undersized_n() {
        assert_eq!(
            QuorumParams::sleepy(4, 1, 1, true, PersistLevel::None),
            Err(QuorumConfigError::SizeMismatch {
                mode: "3f+s+1",
                n: 4
            })
        );
        assert_eq!(
            QuorumParams::sleepy(6, 2, 0, true, PersistLevel::None),
            Err(QuorumConfigError::TooManyFaults { n: 6, f: 2 })
        );
    }

    #[test]
    fn vote_pool_reaches_quorum_exactly_once() {
        let pool = VotePool::new(3);
        let hash = crypto::hash(b"block");
        let sig = SignatureBytes::new([7u8; 64]);

        assert!(matches!(
            pool.insert(hash, ReplicaId::new(0), sig),
            PoolOutcome::Counted
        ));
        // Redelivery of the same vote does not advance the count.
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(0), sig),
            PoolOutcome::Counted
        ));
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(1), sig),
            PoolOutcome::Counted
        ));
        match pool.insert(hash, ReplicaId::new(2), sig) {
            PoolOutcome::Quorum(cert) => {
                assert_eq!(cert.ids.len(), 3);
                assert_eq!(cert.sigs.len(), 3);
            }
            _ => panic!("expected quorum on the third distinct vote"),
        }
        // Anything after PREPARED is dropped.
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(3), sig),
            PoolOutcome::AlreadyPrepared
        ));
    }

    #[test]
    fn timeout_pool_adopt_suppresses_rebroadcast() {
        let pool = TimeoutPool::new(3);
        let view = ViewNumber::new(5);
        assert!(pool.adopt(view, Vec::new()));
        assert!(!pool.adopt(view, Vec::new()));
        assert!(matches!(
            pool.insert(view, ReplicaId::new(0), SignedEnvelope {
                msg: Vec::new(),
                sig: SignatureBytes::new([0u8; 64])
            }),
            PoolOutcome::AlreadyPrepared
        ));
    }

    #[test]
    fn echo_pool_counts_distinct_sources() {
        let pool = EchoPool::new(2);
        let hash = crypto::hash(b"rec");
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(1)),
            PoolOutcome::Counted
        ));
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(1)),
            PoolOutcome::Counted
        ));
        assert!(matches!(
            pool.insert(hash, ReplicaId::new(2)),
            PoolOutcome::Quorum(())
        ));
    }
}
