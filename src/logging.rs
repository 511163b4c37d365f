/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events, and the committed-chain JSON dump.
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate; to
//! get messages printed to a terminal or file, set up a logging
//! implementation.
//!
//! ## Log message format
//!
//! Event log messages are CSVs with at least two values. The first two are
//! always the event name in PascalCase and the time the event was emitted
//! (seconds since the Unix epoch). Block hashes are abbreviated to the first
//! seven characters of their Base64 encoding:
//!
//! ```text
//! ReceiveProposal, 1701329264, 2, fNGCJyk, 5
//! ```

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;
use crate::types::basic::BlockHeight;
use crate::types::block::{ClientRequest, CommittedBlocks, Transaction};

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const LOCK_BLOCK: &str = "LockBlock";
pub const COLLECT_QC: &str = "CollectQC";
pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const TIMEOUT_VOTE: &str = "TimeoutVote";
pub const COLLECT_TQC: &str = "CollectTQC";
pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const START_VIEW: &str = "StartView";
pub const START_RECOVERY: &str = "StartRecovery";
pub const END_RECOVERY: &str = "EndRecovery";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height
            )
        })
    }
}

impl Logger for LockBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &LockBlockEvent| {
            log::info!(
                "{}, {}, {}",
                LOCK_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height
            )
        })
    }
}

impl Logger for CollectQcEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectQcEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COLLECT_QC,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.hash.bytes()),
                event.height
            )
        })
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.hash.bytes()),
                event.seq
            )
        })
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.hash.bytes()),
                event.seq
            )
        })
    }
}

impl Logger for TimeoutVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &TimeoutVoteEvent| {
            log::info!(
                "{}, {}, {}",
                TIMEOUT_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.view
            )
        })
    }
}

impl Logger for CollectTqcEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectTqcEvent| {
            log::info!(
                "{}, {}, {}",
                COLLECT_TQC,
                secs_since_unix_epoch(event.timestamp),
                event.view
            )
        })
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                first_seven_base64_chars(&event.hash.bytes()),
                event.seq
            )
        })
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                first_seven_base64_chars(&event.hash.bytes()),
                event.seq
            )
        })
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.view
            )
        })
    }
}

impl Logger for StartViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event.leader
            )
        })
    }
}

impl Logger for StartRecoveryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartRecoveryEvent| {
            log::info!(
                "{}, {}, {:?}",
                START_RECOVERY,
                secs_since_unix_epoch(event.timestamp),
                event.mode
            )
        })
    }
}

impl Logger for EndRecoveryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EndRecoveryEvent| {
            log::info!(
                "{}, {}, {}, {}",
                END_RECOVERY,
                secs_since_unix_epoch(event.timestamp),
                event.view,
                event
                    .highest_committed
                    .map(|h| h.int() as i64)
                    .unwrap_or(-1)
            )
        })
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    encoded.chars().take(7).collect()
}

/// One dumped transaction: the submitter, the decoded transfer, and the
/// request timestamp (the deduplication key).
#[derive(serde::Serialize)]
struct TxDump {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "TX")]
    tx: Transaction,
    #[serde(rename = "Timestamp")]
    timestamp: i64,
}

#[derive(serde::Serialize)]
struct BlockDump {
    #[serde(rename = "View")]
    view: u64,
    #[serde(rename = "Height")]
    height: u64,
    #[serde(rename = "TXS")]
    txs: Vec<TxDump>,
}

/// Dumps the committed chain up to `height` as one JSON line per block,
/// genesis first. Requests whose timestamp was already printed are skipped,
/// and payloads that do not decode into a [Transaction] print as the empty
/// transfer.
pub(crate) fn output_blockchain(
    height: BlockHeight,
    blockchain: &CommittedBlocks,
) -> Result<(), serde_json::Error> {
    let genesis = BlockDump {
        view: 0,
        height: 0,
        txs: vec![TxDump {
            id: 0,
            tx: Transaction {
                from: String::new(),
                to: "0".to_string(),
                value: 50,
            },
            timestamp: 0,
        }],
    };
    log::info!("{}", serde_json::to_string(&genesis)?);

    let mut seen_timestamps = std::collections::HashSet::new();

    for h in 1..=height.int() {
        let block = match blockchain.get(BlockHeight::new(h)) {
            Some(block) => block,
            None => continue,
        };
        let mut txs = Vec::new();
        for request in &block.txs {
            if !seen_timestamps.insert(request.ts.int()) {
                continue;
            }
            txs.push(dump_tx(request));
        }
        let dump = BlockDump {
            view: block.view.int(),
            height: block.height.int(),
            txs,
        };
        log::info!("{}", serde_json::to_string(&dump)?);
    }
    Ok(())
}

fn dump_tx(request: &ClientRequest) -> TxDump {
    let tx = borsh::BorshDeserialize::try_from_slice(&request.op).unwrap_or(Transaction {
        from: String::new(),
        to: String::new(),
        value: 0,
    });
    TxDump {
        id: request.id,
        tx,
        timestamp: request.ts.int(),
    }
}
