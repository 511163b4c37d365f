/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-view scheduler threads: the request monitor (the leader's
//! proposal loop), the rotating leader timer, and the sleep/recover test
//! harness.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::algorithm::ConsensusCore;
use crate::networking::Network;
use crate::state::{paths, KVStore, PersistLevel};
use crate::types::basic::{BlockHeight, Status, ViewNumber};

/// Spawns the monitor for view `v`.
///
/// The monitor proposes whenever the replica leads `v`, is READY, and either
/// a pending request exists or in-flight undecided blocks still need the
/// pipeline to advance (those proposals may carry an empty batch). It exits
/// as soon as the view moves on, the replica stops leading, or the replica
/// falls asleep. In view 0 it first waits for the very first client request:
/// the system's clock starts when the first request arrives.
pub(crate) fn start_request_monitor<K: KVStore, N: Network>(
    core: &Arc<ConsensusCore<K, N>>,
    v: ViewNumber,
) -> JoinHandle<()> {
    let core = Arc::clone(core);
    thread::spawn(move || {
        let sleep_timer = Duration::from_millis(core.config.sleep_timer);

        while core.queue.is_empty() && core.local_view() == ViewNumber::init() {
            thread::sleep(sleep_timer);
        }
        if core.config.view_change {
            start_rotating_timer(&core, v);
        }

        let generation = core.view.generation();
        loop {
            if v != core.local_view() || generation != core.view.generation() {
                return;
            }

            let gate = core.sleep_gate.read().unwrap();
            let status = core.status.get();
            if status == Status::Sleeping {
                return;
            }
            if core.leader_id(v) != core.id {
                return;
            }

            if !(status == Status::Ready
                && (core.pending_undecided() > 0 || !core.queue.is_empty()))
            {
                drop(gate);
                thread::sleep(sleep_timer);
                continue;
            }

            core.status.set(Status::Processing);
            let batch = core
                .queue
                .grab_with_max_len_and_clear(core.config.max_batch_size);
            core.store
                .persist(&paths::QUEUE, &core.queue.to_vec(), PersistLevel::All);
            log::info!("batchSize: {}", batch.len());
            core.start_hotstuff(batch);
            drop(gate);
        }
    })
}

/// Arms the rotating leader timer for view `v`: after `rotatingTime`
/// seconds, the timeout handler fires.
pub(crate) fn start_rotating_timer<K: KVStore, N: Network>(
    core: &Arc<ConsensusCore<K, N>>,
    v: ViewNumber,
) {
    let core = Arc::clone(core);
    let _ = thread::spawn(move || {
        thread::sleep(Duration::from_secs(core.config.rotating_time));
        ConsensusCore::timeout_handler(&core, v);
    });
}

/// Spawns the sleep/recover harness if the test configuration puts this
/// replica to sleep: wait until the agreed sequence number, go SLEEPING
/// under the sleep gate, nap, forget all volatile state, then run the
/// configured recovery mode.
pub(crate) fn start_sleep_harness<K: KVStore, N: Network>(
    core: &Arc<ConsensusCore<K, N>>,
) -> Option<JoinHandle<()>> {
    let param = core.config.sleepy_param(core.id)?;
    let core = Arc::clone(core);
    Some(thread::spawn(move || {
        while core.sequence() < BlockHeight::new(param.sleep_seq) {
            thread::sleep(Duration::from_millis(1));
        }
        log::info!("falling asleep in sequence {}...", param.sleep_seq);
        {
            let _gate = core.sleep_gate.write().unwrap();
            core.status.set(Status::Sleeping);
        }
        log::info!("sleepTime: {} ms", param.sleep_time);
        thread::sleep(Duration::from_millis(param.sleep_time));
        // A woken replica remembers nothing that was not persisted.
        core.reset_volatile();
        log::info!("wake up...");
        if let Err(err) = ConsensusCore::recovery_process(&core, param.rec_mode) {
            panic!("recovery failed: {:?}", err);
        }
    }))
}
