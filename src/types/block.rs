/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definition of the chained [QCBlock]: a block together with the quorum
//! certificate that formed over it. Blocks reference their ancestors by
//! content hash, never by pointer, so committed history is a dense
//! height-keyed map with hash cross-references.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto;
use crate::types::basic::{
    BlockHeight, CryptoHash, ReplicaId, SignatureBytes, Timestamp, ViewNumber,
};

/// A block that has gathered a quorum certificate: Q signatures over `hash`
/// by the replicas listed in `ids`.
///
/// `hash` is `None` only for the genesis block, which no replica ever signs.
/// `pre_hash`/`pre_pre_hash` chain the block to its parent and grandparent
/// for the three-chain commit rule; the first block of a view carries `None`
/// for both.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QCBlock {
    pub view: ViewNumber,
    pub height: BlockHeight,
    pub hash: Option<CryptoHash>,
    pub pre_hash: Option<CryptoHash>,
    pub pre_pre_hash: Option<CryptoHash>,
    pub qc: Vec<SignatureBytes>,
    pub ids: Vec<ReplicaId>,
    pub txs: Vec<ClientRequest>,
}

impl QCBlock {
    pub fn genesis() -> QCBlock {
        QCBlock {
            view: ViewNumber::init(),
            height: BlockHeight::new(0),
            hash: None,
            pre_hash: None,
            pre_pre_hash: None,
            qc: Vec::new(),
            ids: Vec::new(),
            txs: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.hash.is_none()
    }

    /// Checks that the certificate is well-formed: at least `quorum`
    /// signatures over `hash`, each by a distinct replica, each valid. The
    /// genesis block is automatically correct.
    pub fn verify(&self, quorum: usize, validator_set: &crate::types::ValidatorSet) -> bool {
        let hash = match self.hash {
            Some(hash) => hash,
            None => return true,
        };

        if self.qc.len() != self.ids.len() || self.qc.len() < quorum {
            return false;
        }

        let mut seen = std::collections::HashSet::new();
        for (signer, signature) in self.ids.iter().zip(self.qc.iter()) {
            if !seen.insert(*signer) {
                return false;
            }
            if !validator_set.verify(*signer, &hash.bytes(), signature) {
                return false;
            }
        }
        true
    }
}

/// The running-hash chaining rule for a proposal at height `h` with batch
/// digest `payload_hash`:
///
/// ```text
/// innerHash = H( bytes(h) ‖ payloadHash )
/// blockHash = H( curHash ‖ innerHash )
/// ```
pub(crate) fn chain_hash(
    cur_hash: &CryptoHash,
    height: BlockHeight,
    payload_hash: &[u8],
) -> CryptoHash {
    let inner = crypto::hash_two(&height.to_le_bytes(), payload_hash);
    crypto::hash_two(&cur_hash.bytes(), &inner.bytes())
}

/// A transfer record. The first entry of every committed block is the
/// coinbase-style `Transaction { from: "", to: proposer, value: 50 }`.
#[derive(
    Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, serde::Serialize,
    serde::Deserialize,
)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub value: u64,
}

impl Transaction {
    pub(crate) fn coinbase(proposer: ReplicaId) -> Transaction {
        Transaction {
            from: String::new(),
            to: proposer.to_string(),
            value: 50,
        }
    }
}

/// A client payload as it travels through the request queue and into a
/// block: the submitting identity, the opaque operation bytes, and a
/// timestamp that doubles as a deduplication key in the chain dump.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ClientRequest {
    pub id: u64,
    pub op: Vec<u8>,
    pub ts: Timestamp,
}

impl ClientRequest {
    /// Interpret raw queue bytes as a [ClientRequest]. Payloads that were
    /// not produced by [ClientRequest] serialization are carried verbatim in
    /// `op`, so consensus stays agnostic to the payload format.
    pub(crate) fn from_raw(raw: &[u8]) -> ClientRequest {
        match ClientRequest::try_from_slice(raw) {
            Ok(request) => request,
            Err(_) => ClientRequest {
                id: 0,
                op: raw.to_vec(),
                ts: Timestamp::new(0),
            },
        }
    }
}

/// Committed history: a dense mapping from height to the committed block.
/// Once inserted, a block at a height is immutable.
#[derive(Clone, Default, BorshSerialize, BorshDeserialize)]
pub struct CommittedBlocks(BTreeMap<BlockHeight, QCBlock>);

impl CommittedBlocks {
    pub fn new() -> CommittedBlocks {
        CommittedBlocks(BTreeMap::new())
    }

    /// Inserts `block` at `height` unless the height is already committed.
    pub fn insert(&mut self, height: BlockHeight, block: QCBlock) {
        self.0.entry(height).or_insert(block);
    }

    pub fn get(&self, height: BlockHeight) -> Option<&QCBlock> {
        self.0.get(&height)
    }

    pub fn contains(&self, height: BlockHeight) -> bool {
        self.0.contains_key(&height)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn highest(&self) -> Option<BlockHeight> {
        self.0.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockHeight, &QCBlock)> {
        self.0.iter()
    }

    /// Merges another committed history into this one, inserting only the
    /// heights missing locally.
    pub fn merge_missing(&mut self, other: &CommittedBlocks) {
        for (height, block) in other.iter() {
            if !self.0.contains_key(height) {
                self.0.insert(*height, block.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::types::ValidatorSet;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        (0..n)
            .map(|_| Keypair::new(SigningKey::generate(&mut OsRng)))
            .collect()
    }

    #[test]
    fn genesis_always_verifies() {
        let set = ValidatorSet::new(Vec::new());
        assert!(QCBlock::genesis().verify(3, &set));
    }

    #[test]
    fn qc_requires_quorum_of_distinct_valid_signatures() {
        let keypairs = keypairs(4);
        let set = ValidatorSet::new(keypairs.iter().map(|k| k.public()).collect());
        let hash = crypto::hash(b"block");

        let mut block = QCBlock::genesis();
        block.height = BlockHeight::new(1);
        block.hash = Some(hash);
        block.qc = keypairs[..3]
            .iter()
            .map(|k| k.sign(&hash.bytes()))
            .collect();
        block.ids = (0..3).map(ReplicaId::new).collect();
        assert!(block.verify(3, &set));

        // One signature short of a quorum.
        let mut short = block.clone();
        short.qc.pop();
        short.ids.pop();
        assert!(!short.verify(3, &set));

        // A duplicated signer does not count twice.
        let mut duplicated = block.clone();
        duplicated.ids[2] = ReplicaId::new(0);
        duplicated.qc[2] = duplicated.qc[0];
        assert!(!duplicated.verify(3, &set));

        // A forged signature invalidates the whole certificate.
        let mut forged = block.clone();
        forged.qc[1] = keypairs[3].sign(&hash.bytes());
        assert!(!forged.verify(3, &set));
    }

    #[test]
    fn block_round_trips_through_borsh() {
        let mut block = QCBlock::genesis();
        block.view = ViewNumber::new(3);
        block.height = BlockHeight::new(7);
        block.hash = Some(crypto::hash(b"h"));
        block.pre_hash = Some(crypto::hash(b"p"));
        block.txs = vec![ClientRequest {
            id: 2,
            op: b"op".to_vec(),
            ts: Timestamp::new(99),
        }];

        let bytes = block.try_to_vec().unwrap();
        let decoded = QCBlock::try_from_slice(&bytes).unwrap();
        assert!(decoded == block);
    }

    #[test]
    fn committed_blocks_are_immutable_once_inserted() {
        let mut committed = CommittedBlocks::new();
        let mut first = QCBlock::genesis();
        first.hash = Some(crypto::hash(b"one"));
        let mut second = QCBlock::genesis();
        second.hash = Some(crypto::hash(b"two"));

        committed.insert(BlockHeight::new(1), first.clone());
        committed.insert(BlockHeight::new(1), second);
        assert!(committed.get(BlockHeight::new(1)) == Some(&first));
    }

    #[test]
    fn merge_only_fills_missing_heights() {
        let mut mine = CommittedBlocks::new();
        let mut local = QCBlock::genesis();
        local.hash = Some(crypto::hash(b"local"));
        mine.insert(BlockHeight::new(1), local.clone());

        let mut theirs = CommittedBlocks::new();
        let mut remote = QCBlock::genesis();
        remote.hash = Some(crypto::hash(b"remote"));
        theirs.insert(BlockHeight::new(1), remote.clone());
        theirs.insert(BlockHeight::new(2), remote.clone());

        mine.merge_missing(&theirs);
        assert!(mine.get(BlockHeight::new(1)) == Some(&local));
        assert!(mine.get(BlockHeight::new(2)) == Some(&remote));
        assert_eq!(mine.highest(), Some(BlockHeight::new(2)));
    }
}
