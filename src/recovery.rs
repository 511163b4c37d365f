/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The wake-recovery protocol: how a previously sleeping replica learns the
//! most recent locked block and committed prefix before participating again.
//!
//! Three modes: NoRec returns straight to READY, RecFromDisk re-reads the
//! critical keys and re-enters through a view change, and RecKoala2 runs the
//! disk-free REC1/ECHO1/REC2/ECHO2 rounds against the recovery quorum `Q'`.
//! While RECOVERING, a replica admits only ECHO1, ECHO2 and TQC messages;
//! TQCs observed from ongoing traffic advance its local view until the
//! catch-up predicate of the second round is met.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use borsh::BorshSerialize;

use crate::algorithm::ConsensusCore;
use crate::config::RecMode;
use crate::crypto;
use crate::events::*;
use crate::messages::{Echo1, Echo2, HotStuffMessage, Rec1, Rec2, SignedEnvelope};
use crate::networking::Network;
use crate::quorum::PoolOutcome;
use crate::state::{paths, KVStore, PersistLevel};
use crate::types::basic::{CryptoHash, Status, Timestamp, ViewNumber};
use crate::types::block::{CommittedBlocks, QCBlock};

/// Volatile bookkeeping of a waking replica: the digest of its latest
/// recovery request, and the highest view reported in ECHO1 replies.
#[derive(Default)]
pub(crate) struct RecoveryState {
    pub(crate) req_hash: Option<CryptoHash>,
    pub(crate) h_view: HighestEcho1View,
}

/// Highest previous view reported across ECHO1 replies.
///
/// "Every responder was still in view 0" (each reply carries `view: None`)
/// must stay distinguishable from "no reply counted yet": the former fixes
/// the catch-up target at view 1, the latter means no target can be
/// computed at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum HighestEcho1View {
    #[default]
    Unknown,
    Reported(Option<ViewNumber>),
}

impl HighestEcho1View {
    /// Folds one ECHO1's reported previous view into the running maximum.
    pub(crate) fn observe(&mut self, view: Option<ViewNumber>) {
        *self = match *self {
            HighestEcho1View::Unknown => HighestEcho1View::Reported(view),
            HighestEcho1View::Reported(highest) => {
                HighestEcho1View::Reported(highest.max(view))
            }
        };
    }

    /// The view the waking replica must reach before opening the second
    /// round: two past the highest reported previous view, where "no
    /// previous view" counts as one below view 0. An all-view-0 quorum
    /// therefore still forces a wait until view 1. None until a reply has
    /// been counted.
    pub(crate) fn catch_up_target(&self) -> Option<ViewNumber> {
        match self {
            HighestEcho1View::Unknown => None,
            HighestEcho1View::Reported(None) => Some(ViewNumber::new(1)),
            HighestEcho1View::Reported(Some(highest)) => Some(*highest + 2),
        }
    }
}

#[derive(Debug)]
pub enum RecoveryError {
    /// Recovery may only start from the SLEEPING state.
    NotSleeping,
}

impl<K: KVStore, N: Network> ConsensusCore<K, N> {
    /// Transitions SLEEPING → RECOVERING and runs the configured mode.
    pub(crate) fn recovery_process(core: &Arc<Self>, mode: RecMode) -> Result<(), RecoveryError> {
        log::info!("start the recovery process");
        if core.status.get() != Status::Sleeping {
            return Err(RecoveryError::NotSleeping);
        }
        let _rec = core.rec_gate.lock().unwrap();
        *core.rec.lock().unwrap() = RecoveryState::default();
        core.status.set(Status::Recovering);
        Event::StartRecovery(StartRecoveryEvent {
            timestamp: SystemTime::now(),
            mode,
        })
        .publish(&core.event_publisher);

        match mode {
            RecMode::NoRec => {
                core.status.set(Status::Ready);
                let _ = crate::monitor::start_request_monitor(core, ViewNumber::init());
                log::info!("recover to READY");
                Ok(())
            }
            RecMode::RecFromDisk => {
                Self::recover_from_disk(core);
                Ok(())
            }
            RecMode::RecKoala2 => {
                let rec1 = Rec1 {
                    source: core.id,
                    ts: Timestamp::now(),
                };
                let envelope = SignedEnvelope::seal(&core.keypair, rec1);
                core.rec.lock().unwrap().req_hash = Some(crypto::hash(&envelope.msg));
                core.sender.broadcast(envelope);
                Ok(())
            }
        }
    }

    /* ↓↓↓ First round: learn the highest view ↓↓↓ */

    /// Any awake replica answers a REC1 with its previous view and the TQC
    /// it holds for that view.
    pub(crate) fn on_rec1(&self, content: Rec1) {
        log::info!("receive a REC1 msg from replica {}", content.source);
        let source = content.source;
        let request_bytes = HotStuffMessage::Rec1(content)
            .try_to_vec()
            .expect("serializing a message cannot fail");

        let local_view = self.local_view();
        let prev_view = local_view.checked_prev();
        let echo = Echo1 {
            source: self.id,
            view: prev_view,
            hash: crypto::hash(&request_bytes),
            v: prev_view.map(|v| self.timeouts.get_v(v)).unwrap_or_default(),
        };

        let envelope = SignedEnvelope::seal(&self.keypair, echo);
        self.sender.send_to(source, envelope);
    }

    /// The waking replica collects ECHO1s. At `Q'` matching replies it knows
    /// the highest recent view, waits for its local view to catch up past
    /// it, and opens the second round.
    pub(crate) fn on_echo1(&self, content: Echo1) {
        log::info!("receive a ECHO1 msg from replica {}", content.source);
        let _rec = self.rec_gate.lock().unwrap();
        if self.status.get() != Status::Recovering {
            return;
        }
        if Some(content.hash) != self.rec.lock().unwrap().req_hash {
            log::info!(
                "the ECHO1 msg from replica {} does not match the latest request",
                content.source
            );
            return;
        }

        if !self.verify_tqc(content.view, &content.v) {
            log::info!(
                "TQC in the ECHO1 msg from replica {} is not verified",
                content.source
            );
            return;
        }

        self.rec.lock().unwrap().h_view.observe(content.view);

        match self.echoes.insert(content.hash, content.source) {
            PoolOutcome::AlreadyPrepared | PoolOutcome::Counted => {}
            PoolOutcome::Quorum(()) => {
                // The local view catches up through TQCs observed from
                // ongoing traffic; block here until it has.
                let target = match self.rec.lock().unwrap().h_view.catch_up_target() {
                    Some(target) => target,
                    // A quorum implies at least one counted reply.
                    None => return,
                };
                self.view.wait_until(target);

                let rec2 = Rec2 {
                    source: self.id,
                    view: self.local_view(),
                    ts: Timestamp::now(),
                };
                let envelope = SignedEnvelope::seal(&self.keypair, rec2);
                self.rec.lock().unwrap().req_hash = Some(crypto::hash(&envelope.msg));
                self.sender.broadcast(envelope);
            }
        }
    }

    /* ↓↓↓ Second round: fetch blocks ↓↓↓ */

    /// Any awake replica answers a REC2 with its current block, locked
    /// block, and entire committed history — once its own view has reached
    /// the view named in the request.
    pub(crate) fn on_rec2(&self, content: Rec2) {
        log::info!("receive a REC2 msg from replica {}", content.source);
        self.view.wait_until(content.view);

        let source = content.source;
        let request_bytes = HotStuffMessage::Rec2(content)
            .try_to_vec()
            .expect("serializing a message cannot fail");

        let echo = Echo2 {
            source: self.id,
            view: self.local_view(),
            hash: crypto::hash(&request_bytes),
            qc: self.cur_block(),
            lqc: self.locked_block(),
            com_blocks: self.committed_blocks(),
        };

        let envelope = SignedEnvelope::seal(&self.keypair, echo);
        self.sender.send_to(source, envelope);
    }

    /// The waking replica merges every ECHO2's committed history, adopts the
    /// highest verified current/locked blocks, and returns to READY at `Q'`
    /// matching replies (after a short grace period that absorbs late
    /// ECHO2s).
    pub(crate) fn on_echo2(&self, content: Echo2) {
        log::info!("receive a ECHO2 msg from replica {}", content.source);

        // Merge committed history before any admission check, so even late
        // or mismatched ECHO2s can only extend what this replica knows.
        self.merge_committed(&content.com_blocks);

        let _rec = self.rec_gate.lock().unwrap();
        if self.status.get() != Status::Recovering {
            return;
        }
        if Some(content.hash) != self.rec.lock().unwrap().req_hash {
            log::info!(
                "the ECHO2 msg from replica {} does not match the latest request",
                content.source
            );
            return;
        }

        if !content.qc.verify(self.quorum.quorum, &self.validator_set)
            || !content.lqc.verify(self.quorum.quorum, &self.validator_set)
        {
            log::info!(
                "QC or lockQC in ECHO2 msg from replica {} is not verified",
                content.source
            );
            return;
        }

        if !content.qc.is_genesis() && content.qc.height > self.cur_block().height {
            self.adopt_cur_block(content.qc.clone(), true);
            self.update_seq(content.qc.height);
        }
        self.adopt_locked_if_higher(&content.lqc);

        match self.echoes.insert(content.hash, content.source) {
            PoolOutcome::AlreadyPrepared | PoolOutcome::Counted => {}
            PoolOutcome::Quorum(()) => {
                // Absorb late ECHO2s so committedBlocks is as complete as
                // possible before rejoining.
                thread::sleep(Duration::from_millis(100));
                self.status.set(Status::Ready);
                Event::EndRecovery(EndRecoveryEvent {
                    timestamp: SystemTime::now(),
                    view: self.local_view(),
                    highest_committed: self.committed_blocks().highest(),
                })
                .publish(&self.event_publisher);
                log::info!("recover to READY");
            }
        }
    }

    /* ↓↓↓ Disk recovery ↓↓↓ */

    /// Re-reads the critical keys and re-enters at `persisted view + 1` via
    /// the view-change path; READY arrives when that view change completes.
    /// The safety argument depends on this state, so a missing or corrupt
    /// critical key halts the replica.
    fn recover_from_disk(core: &Arc<Self>) {
        match core.store.level() {
            PersistLevel::Critical => {
                let view: ViewNumber = core
                    .store
                    .recover(&paths::VIEW)
                    .unwrap_or_else(|err| panic!("cannot recover view: {:?}", err));
                let locked: QCBlock = core
                    .store
                    .recover(&paths::LOCKED_BLOCK)
                    .unwrap_or_else(|err| panic!("cannot recover lockedBlock: {:?}", err));
                let committed: CommittedBlocks =
                    match core.store.recover(&paths::COMMITTED_BLOCKS) {
                        Ok(committed) => committed,
                        Err(crate::state::StateError::Missing) => CommittedBlocks::new(),
                        Err(err) => panic!("cannot recover committedBlocks: {:?}", err),
                    };

                core.restore_locked(locked.clone());
                core.adopt_cur_block(locked.clone(), true);
                core.update_seq(locked.height);
                core.restore_committed(committed);

                log::info!("recover to the view {}", view + 1);
                // READY arrives via the view-change completion path.
                Self::start_view_change(core, view);
            }
            PersistLevel::All => {
                core.status.set(Status::Ready);
                log::info!("recover to READY");
            }
            PersistLevel::None => {}
        }
    }

    /// View progression while RECOVERING: adopt the view a TQC proves
    /// without emitting anything.
    pub(crate) fn view_change_in_recovery(&self, view: ViewNumber) {
        if view < self.local_view() {
            return;
        }
        self.set_view(view + 1);
        log::info!("starting view change to view {}", view + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_target_until_a_reply_is_counted() {
        let h_view = HighestEcho1View::default();
        assert_eq!(h_view.catch_up_target(), None);
    }

    #[test]
    fn all_responders_in_view_zero_still_force_a_wait() {
        let mut h_view = HighestEcho1View::default();
        h_view.observe(None);
        h_view.observe(None);
        // Not "no target": the waking replica must see one view change
        // before opening the second round.
        assert_eq!(h_view.catch_up_target(), Some(ViewNumber::new(1)));
    }

    #[test]
    fn target_is_two_past_the_highest_reported_view() {
        let mut h_view = HighestEcho1View::default();
        h_view.observe(Some(ViewNumber::new(5)));
        h_view.observe(Some(ViewNumber::new(3)));
        h_view.observe(None);
        assert_eq!(h_view.catch_up_target(), Some(ViewNumber::new(7)));
    }
}
