/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A chained leader-based BFT SMR engine in the HotStuff family, extended
//! with a *sleepy* variant: up to `s` honest replicas may be temporarily
//! offline, and a wake-recovery protocol lets them learn the most recent
//! locked block and committed prefix before participating again.

pub mod config;

pub mod crypto;

pub mod event_bus;

pub mod events;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod quorum;

pub mod replica;

pub mod request_queue;

pub mod state;

pub mod types;

pub(crate) mod algorithm;

pub(crate) mod monitor;

pub(crate) mod recovery;

pub(crate) mod view_change;

#[cfg(test)]
mod tests;

// Re-exports
pub use event_bus::EventHandlers;
pub use recovery::RecoveryError;
pub use replica::Replica;
