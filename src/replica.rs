/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [initialize](Replica::initialize) and [start](Replica::start)
//! a replica, as well as the type which keeps the replica alive.
//!
//! A started replica owns four kinds of threads: the poller (which merges
//! network deliveries with self-deliveries), the handler loop (which spawns
//! one task per inbound envelope), the per-view monitor and timer threads,
//! and — when any event handlers are registered — the event bus. Dropping
//! the [Replica] shuts them down in dependency order.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::algorithm::ConsensusCore;
use crate::config::{ConfigError, Configuration, RecMode};
use crate::crypto::Keypair;
use crate::event_bus::{start_event_bus, EventHandlers};
use crate::messages::SignedEnvelope;
use crate::monitor::{start_request_monitor, start_sleep_harness};
use crate::networking::{recv_inbound, start_polling, Liveness, Network, SenderHandle};
use crate::recovery::RecoveryError;
use crate::state::{paths, KVStore, PersistLevel, ReplicaStore};
use crate::types::basic::{BlockHeight, ReplicaId, Status, ValidatorSet, ViewNumber};
use crate::types::block::{CommittedBlocks, QCBlock};

#[derive(Debug)]
pub enum StartError {
    /// The keypair's public key is not in the validator set.
    UnknownReplica,
    Config(ConfigError),
}

pub struct Replica<K: KVStore, N: Network> {
    core: Arc<ConsensusCore<K, N>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    handler_loop: Option<JoinHandle<()>>,
    handler_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore, N: Network> Replica<K, N> {
    /// Seeds the durable state of a fresh replica: view 0 and an empty
    /// committed history at the critical level, an empty queue and zero
    /// sequence at the persist-all level.
    pub fn initialize(kv_store: K, config: &Configuration) -> Result<(), ConfigError> {
        let store = ReplicaStore::new(kv_store, config.persist_level()?);
        store.persist(&paths::VIEW, &ViewNumber::init(), PersistLevel::Critical);
        store.persist(
            &paths::COMMITTED_BLOCKS,
            &CommittedBlocks::new(),
            PersistLevel::Critical,
        );
        store.persist(&paths::SEQUENCE, &BlockHeight::new(0), PersistLevel::All);
        store.persist(&paths::QUEUE, &Vec::<Vec<u8>>::new(), PersistLevel::All);
        Ok(())
    }

    pub fn start(
        keypair: Keypair,
        network: N,
        kv_store: K,
        config: Configuration,
        validator_set: ValidatorSet,
        event_handlers: EventHandlers,
    ) -> Result<Replica<K, N>, StartError> {
        let id = validator_set
            .id_of(&keypair.public())
            .ok_or(StartError::UnknownReplica)?;
        let quorum = config.quorum_params().map_err(StartError::Config)?;
        let level = config.persist_level().map_err(StartError::Config)?;
        let store = ReplicaStore::new(kv_store, level);

        let liveness = Arc::new(Liveness::new());
        let (loopback_sender, loopback_receiver) = mpsc::channel();
        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, inbound) = start_polling(
            network.clone(),
            Arc::clone(&liveness),
            loopback_receiver,
            poller_shutdown_receiver,
        );

        let sender = SenderHandle::new(
            id,
            validator_set.ids().collect(),
            network,
            liveness,
            Duration::from_millis(config.broadcast_timer),
            loopback_sender,
        );

        let (event_publisher, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (publisher, subscriber) = mpsc::channel();
            let (shutdown, shutdown_receiver) = mpsc::channel();
            let bus = start_event_bus(event_handlers, subscriber, shutdown_receiver);
            (Some(publisher), Some(bus), Some(shutdown))
        };

        let core = ConsensusCore::new(
            id,
            keypair,
            validator_set,
            quorum,
            config,
            store,
            sender,
            event_publisher,
        );

        let (handler_shutdown, handler_shutdown_receiver) = mpsc::channel();
        let handler_loop = {
            let core = Arc::clone(&core);
            thread::spawn(move || loop {
                if handler_shutdown_receiver.try_recv().is_ok() {
                    return;
                }
                match recv_inbound(&inbound, Duration::from_millis(50)) {
                    Ok(Some((_origin, envelope))) => {
                        let core = Arc::clone(&core);
                        let _ = thread::spawn(move || {
                            ConsensusCore::handle_delivery(&core, envelope);
                        });
                    }
                    Ok(None) => {}
                    Err(()) => return,
                }
            })
        };

        let _ = start_request_monitor(&core, core.local_view());
        let _ = start_sleep_harness(&core);

        Ok(Replica {
            core,
            poller: Some(poller),
            poller_shutdown,
            handler_loop: Some(handler_loop),
            handler_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }

    /* ↓↓↓ Client ingestion ↓↓↓ */

    /// Accepts one opaque client payload. Ingestion is acknowledged by the
    /// payload sitting (durably, if configured) in the queue; there is no
    /// further client reply protocol.
    pub fn submit_request(&self, request: Vec<u8>) {
        self.core.queue.append(request);
        self.core
            .store
            .persist(&paths::QUEUE, &self.core.queue.to_vec(), PersistLevel::All);
    }

    pub fn submit_batch(&self, requests: Vec<Vec<u8>>) {
        log::info!("handling batch requests with len {}", requests.len());
        self.core.queue.append_batch(requests);
        self.core
            .store
            .persist(&paths::QUEUE, &self.core.queue.to_vec(), PersistLevel::All);
    }

    /// Deliver an envelope into this replica's inbound path, as the
    /// transport's receive callback would.
    pub fn deliver(&self, envelope: SignedEnvelope) {
        self.core.sender.deliver_self(envelope);
    }

    /* ↓↓↓ Recovery entry point ↓↓↓ */

    /// Runs the recovery protocol of a replica that is (or is treated as)
    /// asleep — e.g. a process restarted after a crash, before it
    /// participates again.
    pub fn begin_recovery(&self, mode: RecMode) -> Result<(), RecoveryError> {
        {
            let _gate = self.core.sleep_gate.write().unwrap();
            self.core.status.set(Status::Sleeping);
        }
        ConsensusCore::recovery_process(&self.core, mode)
    }

    /* ↓↓↓ Inspection ↓↓↓ */

    pub fn id(&self) -> ReplicaId {
        self.core.id
    }

    pub fn local_view(&self) -> ViewNumber {
        self.core.local_view()
    }

    pub fn cur_block(&self) -> QCBlock {
        self.core.cur_block()
    }

    pub fn locked_block(&self) -> QCBlock {
        self.core.locked_block()
    }

    pub fn committed_blocks(&self) -> CommittedBlocks {
        self.core.committed_blocks()
    }
}

impl<K: KVStore, N: Network> Drop for Replica<K, N> {
    fn drop(&mut self) {
        // Shutdown order matters: the handler loop consumes from the
        // poller, so the poller must outlive it.
        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.handler_shutdown.send(());
        if let Some(handler_loop) = self.handler_loop.take() {
            let _ = handler_loop.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
