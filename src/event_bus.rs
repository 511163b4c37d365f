/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the consensus threads and passes
//! them to event handlers.
//!
//! When the thread receives an [event](crate::events::Event), it triggers
//! every handler registered for the contained event type. When a replica's
//! [EventHandlers] is empty, the thread is not started at all.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

/// Pointer to a handler closure, parameterized by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The handlers registered for each event type: any number of user-defined
/// handlers, plus the default logging handlers when logging is enabled.
#[derive(Default)]
pub struct EventHandlers {
    pub commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub lock_block_handlers: Vec<HandlerPtr<LockBlockEvent>>,
    pub collect_qc_handlers: Vec<HandlerPtr<CollectQcEvent>>,
    pub propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub timeout_vote_handlers: Vec<HandlerPtr<TimeoutVoteEvent>>,
    pub collect_tqc_handlers: Vec<HandlerPtr<CollectTqcEvent>>,
    pub receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub start_view_handlers: Vec<HandlerPtr<StartViewEvent>>,
    pub start_recovery_handlers: Vec<HandlerPtr<StartRecoveryEvent>>,
    pub end_recovery_handlers: Vec<HandlerPtr<EndRecoveryEvent>>,
}

impl EventHandlers {
    /// Handlers that log every event in the CSV format of
    /// [logging](crate::logging).
    pub fn with_logging() -> EventHandlers {
        let mut handlers = EventHandlers::default();
        handlers.commit_block_handlers.push(CommitBlockEvent::get_logger());
        handlers.lock_block_handlers.push(LockBlockEvent::get_logger());
        handlers.collect_qc_handlers.push(CollectQcEvent::get_logger());
        handlers.propose_handlers.push(ProposeEvent::get_logger());
        handlers.vote_handlers.push(VoteEvent::get_logger());
        handlers.timeout_vote_handlers.push(TimeoutVoteEvent::get_logger());
        handlers.collect_tqc_handlers.push(CollectTqcEvent::get_logger());
        handlers
            .receive_proposal_handlers
            .push(ReceiveProposalEvent::get_logger());
        handlers.receive_vote_handlers.push(ReceiveVoteEvent::get_logger());
        handlers
            .start_view_change_handlers
            .push(StartViewChangeEvent::get_logger());
        handlers.start_view_handlers.push(StartViewEvent::get_logger());
        handlers.start_recovery_handlers.push(StartRecoveryEvent::get_logger());
        handlers.end_recovery_handlers.push(EndRecoveryEvent::get_logger());
        handlers
    }

    pub fn is_empty(&self) -> bool {
        self.commit_block_handlers.is_empty()
            && self.lock_block_handlers.is_empty()
            && self.collect_qc_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.timeout_vote_handlers.is_empty()
            && self.collect_tqc_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.start_view_handlers.is_empty()
            && self.start_recovery_handlers.is_empty()
            && self.end_recovery_handlers.is_empty()
    }

    fn handle(&self, event: &Event) {
        match event {
            Event::CommitBlock(e) => self.commit_block_handlers.iter().for_each(|h| h(e)),
            Event::LockBlock(e) => self.lock_block_handlers.iter().for_each(|h| h(e)),
            Event::CollectQc(e) => self.collect_qc_handlers.iter().for_each(|h| h(e)),
            Event::Propose(e) => self.propose_handlers.iter().for_each(|h| h(e)),
            Event::Vote(e) => self.vote_handlers.iter().for_each(|h| h(e)),
            Event::TimeoutVote(e) => self.timeout_vote_handlers.iter().for_each(|h| h(e)),
            Event::CollectTqc(e) => self.collect_tqc_handlers.iter().for_each(|h| h(e)),
            Event::ReceiveProposal(e) => {
                self.receive_proposal_handlers.iter().for_each(|h| h(e))
            }
            Event::ReceiveVote(e) => self.receive_vote_handlers.iter().for_each(|h| h(e)),
            Event::StartViewChange(e) => {
                self.start_view_change_handlers.iter().for_each(|h| h(e))
            }
            Event::StartView(e) => self.start_view_handlers.iter().for_each(|h| h(e)),
            Event::StartRecovery(e) => self.start_recovery_handlers.iter().for_each(|h| h(e)),
            Event::EndRecovery(e) => self.end_recovery_handlers.iter().for_each(|h| h(e)),
        }
    }
}

/// Spawns the event bus thread.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.handle(&event),
            Err(_) => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    use crate::types::BlockHeight;

    #[test]
    fn registered_handlers_receive_published_events() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&committed);

        let mut handlers = EventHandlers::default();
        handlers
            .commit_block_handlers
            .push(Box::new(move |e: &CommitBlockEvent| {
                sink.lock().unwrap().push(e.height);
            }));

        let (publisher, subscriber) = mpsc::channel();
        let (shutdown, shutdown_rx) = mpsc::channel();
        let bus = start_event_bus(handlers, subscriber, shutdown_rx);

        Event::CommitBlock(CommitBlockEvent {
            timestamp: SystemTime::now(),
            height: BlockHeight::new(3),
        })
        .publish(&Some(publisher));

        std::thread::sleep(std::time::Duration::from_millis(50));
        shutdown.send(()).unwrap();
        bus.join().unwrap();

        assert_eq!(*committed.lock().unwrap(), vec![BlockHeight::new(3)]);
    }
}
