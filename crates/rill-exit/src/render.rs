//! Client-facing transaction view.

use serde::{Deserialize, Serialize};

use crate::address::{encode_address, Network};
use crate::types::{AccountId, BlockInfo, ChainEntry, Hash256, StoredTransaction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPointView {
    pub hash: Hash256,
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutInput {
    pub outpoint: OutPointView,
    /// Hex-encoded signature.
    pub signature: String,
    /// Hex-encoded public key.
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOutput {
    /// Value in rills, as a decimal string.
    pub value: String,
    pub address: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutBlock {
    pub hash: Hash256,
    pub height: u64,
}

/// A transaction as sent to clients.
///
/// Chain fields are present only for confirmed entries. `timestamp` is the
/// block time when confirmed, else the first-seen time if known.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutTx {
    pub version: u64,
    pub lock_time: u64,
    pub hash: Hash256,
    pub ins: Vec<OutInput>,
    pub outs: Vec<OutOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_hash: Option<Hash256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<OutBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revoked: bool,
}

impl OutTx {
    /// Render an unconfirmed transaction.
    pub fn unconfirmed(stored: &StoredTransaction, network: Network) -> Self {
        let tx = &stored.tx;
        Self {
            version: tx.version,
            lock_time: tx.lock_time,
            hash: stored.txid,
            ins: tx
                .inputs
                .iter()
                .map(|input| OutInput {
                    outpoint: OutPointView {
                        hash: input.previous_output.txid,
                        index: input.previous_output.index,
                    },
                    signature: hex::encode(&input.signature),
                    public_key: hex::encode(&input.public_key),
                })
                .collect(),
            outs: tx
                .outputs
                .iter()
                .map(|output| OutOutput {
                    value: output.value.to_string(),
                    address: encode_address(&AccountId(output.pubkey_hash), network),
                })
                .collect(),
            chain_hash: None,
            index: None,
            block: None,
            timestamp: stored.first_seen,
            revoked: false,
        }
    }

    /// Render a chain entry. `block` is `None` when the store no longer
    /// knows the containing block.
    pub fn confirmed(
        stored: &StoredTransaction,
        entry: &ChainEntry,
        block: Option<&BlockInfo>,
        network: Network,
    ) -> Self {
        let mut out = Self::unconfirmed(stored, network);
        out.chain_hash = Some(entry.chain_hash);
        out.index = Some(entry.position);
        out.revoked = entry.revoked;
        if let Some(block) = block {
            out.block = Some(OutBlock {
                hash: block.hash,
                height: block.height,
            });
            out.timestamp = Some(block.timestamp);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, Transaction, TxInput, TxOutput};

    fn stored() -> StoredTransaction {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    txid: Hash256([3; 32]),
                    index: 1,
                },
                signature: vec![0xde, 0xad],
                public_key: vec![0xbe, 0xef],
            }],
            outputs: vec![TxOutput {
                value: 12_345,
                pubkey_hash: Hash256([4; 32]),
            }],
            lock_time: 0,
        };
        StoredTransaction {
            txid: Hash256([5; 32]),
            tx,
            block: None,
            first_seen: Some(77),
        }
    }

    #[test]
    fn unconfirmed_uses_first_seen() {
        let out = OutTx::unconfirmed(&stored(), Network::Mainnet);
        assert_eq!(out.timestamp, Some(77));
        assert_eq!(out.ins[0].signature, "dead");
        assert_eq!(out.outs[0].value, "12345");
        assert!(out.outs[0].address.starts_with("rill1"));
        assert!(out.chain_hash.is_none() && out.block.is_none());

        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("chain_hash").is_none());
        assert!(json.get("revoked").is_none());
    }

    #[test]
    fn confirmed_prefers_block_time() {
        let entry = ChainEntry {
            txid: Hash256([5; 32]),
            chain_hash: Hash256([6; 32]),
            height: 9,
            position: 2,
            revoked: false,
        };
        let block = BlockInfo {
            hash: Hash256([8; 32]),
            height: 9,
            timestamp: 1_700_000_000,
        };
        let out = OutTx::confirmed(&stored(), &entry, Some(&block), Network::Testnet);
        assert_eq!(out.timestamp, Some(1_700_000_000));
        assert_eq!(out.index, Some(2));
        assert_eq!(out.block.unwrap().height, 9);
        assert!(out.outs[0].address.starts_with("trill1"));

        let missing = OutTx::confirmed(&stored(), &entry, None, Network::Mainnet);
        assert_eq!(missing.timestamp, Some(77));
        assert!(missing.block.is_none());
    }
}
