/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, and the
//! internal types replicas use to interact with the network.
//!
//! The networking provider only has to move [SignedEnvelope]s between replica
//! ids, best-effort. Everything protocol-relevant sits on this side of the
//! seam: [SenderHandle] fans broadcasts out as per-peer unicasts on a thread
//! pool, applies the per-call deadline (doubling it whenever a peer fails),
//! skips peers marked not-live, and loops a copy of every broadcast back to
//! the local replica *before* the network send, so the sender always counts
//! toward its own quorums.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::messages::SignedEnvelope;
use crate::types::basic::ReplicaId;

#[derive(Debug)]
pub enum NetworkError {
    /// The peer did not acknowledge within the deadline.
    Timeout,
    /// The peer is unreachable.
    NotConnected,
}

pub trait Network: Clone + Send + Sync + 'static {
    /// Best-effort unicast with a per-call deadline.
    fn send(
        &mut self,
        peer: ReplicaId,
        envelope: SignedEnvelope,
        timeout: Duration,
    ) -> Result<(), NetworkError>;

    /// Receive an envelope from any peer. Returns immediately with None if
    /// no message is available now.
    fn recv(&mut self) -> Option<(ReplicaId, SignedEnvelope)>;
}

/// Tracks which peers are believed reachable. A peer that fails a send is
/// flagged not-live and skipped until it delivers a message to us again.
#[derive(Default)]
pub(crate) struct Liveness {
    not_live: Mutex<HashSet<ReplicaId>>,
}

impl Liveness {
    pub(crate) fn new() -> Liveness {
        Liveness::default()
    }

    pub(crate) fn is_live(&self, peer: ReplicaId) -> bool {
        !self.not_live.lock().unwrap().contains(&peer)
    }

    pub(crate) fn mark_live(&self, peer: ReplicaId) {
        self.not_live.lock().unwrap().remove(&peer);
    }

    pub(crate) fn mark_not_live(&self, peer: ReplicaId) {
        self.not_live.lock().unwrap().insert(peer);
    }
}

/// Handle for sending and broadcasting envelopes. Cheap to clone; all clones
/// share the liveness registry, the adaptive deadline and the send pool.
pub(crate) struct SenderHandle<N: Network> {
    me: ReplicaId,
    peers: Vec<ReplicaId>,
    network: N,
    liveness: Arc<Liveness>,
    deadline: Arc<Mutex<Duration>>,
    pool: ThreadPool,
    loopback: Sender<(ReplicaId, SignedEnvelope)>,
}

impl<N: Network> Clone for SenderHandle<N> {
    fn clone(&self) -> Self {
        SenderHandle {
            me: self.me,
            peers: self.peers.clone(),
            network: self.network.clone(),
            liveness: Arc::clone(&self.liveness),
            deadline: Arc::clone(&self.deadline),
            pool: self.pool.clone(),
            loopback: self.loopback.clone(),
        }
    }
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(
        me: ReplicaId,
        peers: Vec<ReplicaId>,
        network: N,
        liveness: Arc<Liveness>,
        initial_deadline: Duration,
        loopback: Sender<(ReplicaId, SignedEnvelope)>,
    ) -> SenderHandle<N> {
        SenderHandle {
            me,
            peers,
            network,
            liveness,
            deadline: Arc::new(Mutex::new(initial_deadline)),
            pool: ThreadPool::new(4),
            loopback,
        }
    }

    /// Unicast to one peer on the send pool. Never blocks the caller.
    pub(crate) fn send_to(&self, peer: ReplicaId, envelope: SignedEnvelope) {
        if peer == self.me {
            self.deliver_self(envelope);
            return;
        }
        if !self.liveness.is_live(peer) {
            return;
        }
        let mut network = self.network.clone();
        let liveness = Arc::clone(&self.liveness);
        let deadline = Arc::clone(&self.deadline);
        self.pool.execute(move || {
            let timeout = *deadline.lock().unwrap();
            if let Err(err) = network.send(peer, envelope, timeout) {
                log::error!("could not send to replica {}, set it to notlive: {:?}", peer, err);
                liveness.mark_not_live(peer);
                let mut deadline = deadline.lock().unwrap();
                *deadline = deadline.saturating_mul(2);
            }
        });
    }

    /// Fan-out unicast to every known peer except self. Peers marked
    /// not-live are skipped.
    pub(crate) fn broadcast(&self, envelope: SignedEnvelope) {
        for peer in &self.peers {
            if *peer != self.me {
                self.send_to(*peer, envelope.clone());
            }
        }
    }

    /// Enqueues a copy of `envelope` into the local inbound path. Must be
    /// invoked before the corresponding network broadcast so the sender's
    /// own contribution is counted first.
    pub(crate) fn deliver_self(&self, envelope: SignedEnvelope) {
        let _ = self.loopback.send((self.me, envelope));
    }

    /// Self-deliver, then broadcast.
    pub(crate) fn broadcast_with_self(&self, envelope: SignedEnvelope) {
        self.deliver_self(envelope.clone());
        self.broadcast(envelope);
    }

    /// Blocks until every queued outbound send has run. Test-only
    /// determinism aid.
    #[cfg(test)]
    pub(crate) fn flush(&self) {
        self.pool.join();
    }
}

/// Spawns the poller thread, which merges envelopes from the network with
/// self-delivered envelopes from the loopback channel into a single inbound
/// stream, re-marking every delivering peer as live.
pub(crate) fn start_polling<N: Network>(
    mut network: N,
    liveness: Arc<Liveness>,
    loopback: Receiver<(ReplicaId, SignedEnvelope)>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(ReplicaId, SignedEnvelope)>) {
    let (to_inbound, inbound) = mpsc::channel();

    let poller = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        let mut moved = false;

        match loopback.try_recv() {
            Ok(delivery) => {
                moved = true;
                let _ = to_inbound.send(delivery);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        if let Some((origin, envelope)) = network.recv() {
            moved = true;
            liveness.mark_live(origin);
            let _ = to_inbound.send((origin, envelope));
        }

        if !moved {
            thread::sleep(Duration::from_millis(1));
        }
    });

    (poller, inbound)
}

/// Blocks on the inbound stream until an envelope arrives or the channel
/// closes.
pub(crate) fn recv_inbound(
    inbound: &Receiver<(ReplicaId, SignedEnvelope)>,
    timeout: Duration,
) -> Result<Option<(ReplicaId, SignedEnvelope)>, ()> {
    match inbound.recv_timeout(timeout) {
        Ok(delivery) => Ok(Some(delivery)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(()),
    }
}
