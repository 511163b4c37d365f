/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! View change on leader timeout: the rotating timer, TIMEOUT/TQC
//! aggregation, and the VIEWCHANGE/NEWVIEW exchange with the new leader.
//!
//! When the durable view is persisted, the TIMEOUT/TQC round is skipped
//! entirely: the persisted view already serves as the proof a timeout quorum
//! would provide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use crate::algorithm::ConsensusCore;
use crate::events::*;
use crate::messages::{
    HotStuffMessage, NewView, SignedEnvelope, Timeout, TimeoutQc, ViewChange,
};
use crate::networking::Network;
use crate::quorum::PoolOutcome;
use crate::state::{paths, KVStore, PersistLevel};
use crate::types::basic::{Status, Timestamp, ViewNumber};

/// The current view number behind a mutex/condvar pair. Setters only ever
/// move the view forward and notify; the recovery handlers block on
/// [ViewClock::wait_until] instead of spinning on the value.
pub(crate) struct ViewClock {
    view: Mutex<ViewNumber>,
    generation: AtomicU64,
    wakeup: Condvar,
}

impl ViewClock {
    pub(crate) fn new() -> ViewClock {
        ViewClock {
            view: Mutex::new(ViewNumber::init()),
            generation: AtomicU64::new(0),
            wakeup: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ViewNumber {
        *self.view.lock().unwrap()
    }

    /// Moves the view forward. Lower or equal values are ignored, so the
    /// view is monotone on a running replica.
    pub(crate) fn advance_to(&self, target: ViewNumber) -> bool {
        let mut view = self.view.lock().unwrap();
        if target <= *view {
            return false;
        }
        *view = target;
        self.wakeup.notify_all();
        true
    }

    /// Blocks until the local view reaches `target`.
    pub(crate) fn wait_until(&self, target: ViewNumber) {
        let mut view = self.view.lock().unwrap();
        while *view < target {
            view = self.wakeup.wait(view).unwrap();
        }
    }

    /// Drops the view back to zero. Only the wake harness uses this, to
    /// model a replica that lost its memory while asleep.
    pub(crate) fn reset(&self) {
        let mut view = self.view.lock().unwrap();
        *view = ViewNumber::init();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    /// Distinguishes views across harness resets so a stale monitor loop
    /// can notice its world ended.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl<K: KVStore, N: Network> ConsensusCore<K, N> {
    /// Sets the local view (monotonically) and persists it at the critical
    /// level before any message that depends on it can be emitted.
    pub(crate) fn set_view(&self, view: ViewNumber) {
        self.view.advance_to(view);
        self.store.persist(&paths::VIEW, &view, PersistLevel::Critical);
    }

    /* ↓↓↓ Timeout round ↓↓↓ */

    /// Fired by the rotating timer armed for `view`.
    pub(crate) fn timeout_handler(core: &Arc<Self>, view: ViewNumber) {
        let _gate = core.sleep_gate.read().unwrap();
        match core.status.get() {
            Status::Sleeping | Status::Recovering => return,
            _ => {}
        }
        log::info!("rotating timer expires in view {}", view);

        if core.store.level() != PersistLevel::None {
            // With a persisted view, the TIMEOUT/TQC round is unnecessary.
            Self::start_view_change(core, view);
            return;
        }
        if view < core.local_view() {
            return;
        }

        core.status.set(Status::ViewChange);

        let timeout = Timeout {
            source: core.id,
            view,
            ts: Timestamp::now(),
            num: core.quorum.n as u64,
        };
        Event::TimeoutVote(TimeoutVoteEvent {
            timestamp: SystemTime::now(),
            view,
        })
        .publish(&core.event_publisher);

        let envelope = SignedEnvelope::seal(&core.keypair, timeout);
        core.sender.broadcast_with_self(envelope);
    }

    /// Collects signed TIMEOUT envelopes per view; at a quorum, assembles
    /// and broadcasts the TQC.
    pub(crate) fn on_timeout(&self, content: Timeout, envelope: SignedEnvelope) {
        log::info!(
            "receive a timeout msg from replica {} for view {}",
            content.source,
            content.view
        );
        if content.view < self.local_view() {
            return;
        }

        match self.timeouts.insert(content.view, content.source, envelope) {
            PoolOutcome::AlreadyPrepared | PoolOutcome::Counted => {}
            PoolOutcome::Quorum(v) => {
                Event::CollectTqc(CollectTqcEvent {
                    timestamp: SystemTime::now(),
                    view: content.view,
                })
                .publish(&self.event_publisher);
                let tqc = TimeoutQc {
                    source: self.id,
                    view: content.view,
                    v,
                };
                let envelope = SignedEnvelope::seal(&self.keypair, tqc);
                self.sender.broadcast_with_self(envelope);
            }
        }
    }

    /// Checks a quorum of signed TIMEOUT envelopes for `view`: every
    /// envelope must carry a TIMEOUT for exactly that view from a distinct
    /// source, correctly signed. `view = None` (a responder that never left
    /// view 0) is trivially valid.
    pub(crate) fn verify_tqc(
        &self,
        view: Option<ViewNumber>,
        tqc: &[SignedEnvelope],
    ) -> bool {
        let view = match view {
            Some(view) => view,
            None => return true,
        };
        if tqc.len() < self.quorum.quorum {
            log::info!(
                "tqc has {} timeouts, quorum is {}",
                tqc.len(),
                self.quorum.quorum
            );
            return false;
        }
        let mut sources = std::collections::HashSet::new();
        for envelope in tqc {
            let timeout = match envelope.open(&self.validator_set) {
                Ok(HotStuffMessage::Timeout(timeout)) => timeout,
                Ok(_) | Err(_) => return false,
            };
            if timeout.view != view || !sources.insert(timeout.source) {
                return false;
            }
        }
        true
    }

    /// A replica changes its view at the moment it receives a valid TQC.
    pub(crate) fn on_timeout_qc(core: &Arc<Self>, content: TimeoutQc) {
        log::info!(
            "receive a TQC msg from replica {} for view {}",
            content.source,
            content.view
        );
        if !core.verify_tqc(Some(content.view), &content.v) {
            log::info!("TQC from replica {} is not verified", content.source);
            return;
        }

        if content.view < core.local_view() {
            return;
        }
        if core.status.get() == Status::Recovering {
            core.view_change_in_recovery(content.view);
        } else {
            Self::start_view_change(core, content.view);
        }

        // Forward the TQC once; the PREPARED marker suppresses re-broadcast.
        if core.timeouts.adopt(content.view, content.v.clone()) {
            let forward = TimeoutQc {
                source: core.id,
                view: content.view,
                v: content.v,
            };
            let envelope = SignedEnvelope::seal(&core.keypair, forward);
            core.sender.broadcast(envelope);
        }
    }

    /* ↓↓↓ View change proper ↓↓↓ */

    /// Moves to view `v + 1` and sends the new leader a VIEWCHANGE carrying
    /// the current block as the fresh-QC justification. The view is
    /// persisted before the message leaves.
    pub(crate) fn start_view_change(core: &Arc<Self>, view: ViewNumber) {
        if view < core.local_view() {
            return;
        }

        core.status.set(Status::ViewChange);
        core.set_view(view + 1);
        log::info!("starting view change to view {}", view + 1);
        Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            view: view + 1,
        })
        .publish(&core.event_publisher);

        let cur = core.cur_block();
        let message = ViewChange {
            source: core.id,
            view: core.local_view(),
            seq: cur.height,
            block: cur,
        };

        // The first block of the new view chains from scratch.
        core.clear_awaiting_blocks();

        let new_leader = core.leader_id(view + 1);
        log::info!(
            "starting view change to view {} sending qc-vc to {}",
            view + 1,
            new_leader
        );
        let envelope = SignedEnvelope::seal(&core.keypair, message);
        core.sender.send_to(new_leader, envelope);

        if new_leader != core.id {
            core.status.set(Status::Ready);
            crate::monitor::start_rotating_timer(core, view + 1);
        }
    }

    /// For the new leader: collect VIEWCHANGE messages, adopt the highest
    /// carried block, and become READY at a quorum.
    pub(crate) fn on_view_change(
        core: &Arc<Self>,
        content: ViewChange,
        envelope: SignedEnvelope,
    ) {
        log::info!(
            "receive a VC msg from replica {} for new view {}",
            content.source,
            content.view
        );
        let local_view = core.local_view();
        if content.view < local_view {
            log::info!(
                "VC for view {} below local view {}",
                content.view,
                local_view
            );
            return;
        }
        // content.view == local_view + 1 can happen when this replica has
        // not yet started its own view change.
        if content.view != local_view && content.view != local_view + 1 {
            log::error!(
                "VC to view {} from {} does not match local view {}",
                content.view,
                content.source,
                local_view
            );
            return;
        }
        if core.leader_id(content.view) != core.id {
            log::info!(
                "VC is for view {} leader {}",
                content.view,
                core.leader_id(content.view)
            );
            return;
        }

        if !content.block.verify(core.quorum.quorum, &core.validator_set) {
            log::error!("carried block not verified in VC for view {}", content.view);
            return;
        }

        if core.view_changes.is_prepared(content.view) {
            log::info!("enough VCs for view {} have been received", content.view);
            return;
        }
        core.view_changes.insert(content.view, content.source, envelope);

        if !content.block.is_genesis() && content.block.height >= core.cur_block().height {
            core.adopt_cur_block(content.block.clone(), true);
            core.update_seq(content.block.height);
        }

        if core.status.get() == Status::Ready {
            // The new leader is still in the previous view; its own timeout
            // has not fired yet.
            log::info!("receiving VC for view {} while READY", content.view);
            return;
        }

        if core.view_changes.quorum_reached(content.view) {
            if let Some(v) = core.view_changes.try_prepare(content.view) {
                core.set_view(content.view);
                core.status.set(Status::Ready);
                Self::start_new_view(core, content.view, v);
                Event::StartView(StartViewEvent {
                    timestamp: SystemTime::now(),
                    view: content.view,
                    leader: core.id,
                })
                .publish(&core.event_publisher);
                let _ = crate::monitor::start_request_monitor(core, core.local_view());
            }
        }
    }

    /// Broadcast by the new leader once its VIEWCHANGE quorum is in: the
    /// quorum itself plus any pre-prepares to re-inject.
    fn start_new_view(core: &Arc<Self>, view: ViewNumber, v: Vec<SignedEnvelope>) {
        let message = NewView {
            source: core.id,
            view,
            v,
            o: Vec::new(),
        };
        let envelope = SignedEnvelope::seal(&core.keypair, message);
        core.sender.broadcast(envelope);
    }

    pub(crate) fn on_new_view(&self, content: NewView) {
        if content.view < self.local_view() {
            return;
        }
        if content.v.len() < self.quorum.quorum {
            log::error!(
                "NEWVIEW for view {} carries only {} view changes",
                content.view,
                content.v.len()
            );
            return;
        }
        log::info!(
            "replica {} leads view {}",
            self.leader_id(content.view),
            content.view
        );
        self.status.set(Status::Ready);
        for envelope in content.o {
            self.sender.deliver_self(envelope);
        }
        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            view: content.view,
            leader: self.leader_id(content.view),
        })
        .publish(&self.event_publisher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn view_clock_is_monotone() {
        let clock = ViewClock::new();
        assert!(clock.advance_to(ViewNumber::new(3)));
        assert!(!clock.advance_to(ViewNumber::new(2)));
        assert!(!clock.advance_to(ViewNumber::new(3)));
        assert_eq!(clock.get(), ViewNumber::new(3));
    }

    #[test]
    fn wait_until_unblocks_on_advance() {
        let clock = Arc::new(ViewClock::new());
        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                clock.wait_until(ViewNumber::new(2));
                clock.get()
            })
        };

        thread::sleep(Duration::from_millis(20));
        clock.advance_to(ViewNumber::new(1));
        thread::sleep(Duration::from_millis(20));
        clock.advance_to(ViewNumber::new(2));

        assert_eq!(waiter.join().unwrap(), ViewNumber::new(2));
    }
}
