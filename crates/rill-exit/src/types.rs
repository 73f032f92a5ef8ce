//! Core data types: hashes, account identifiers, transaction references,
//! chain entries, and the transaction/block shapes the exit node serves.
//!
//! Hashes render as lowercase hex on the wire. Transaction IDs are BLAKE3
//! over the canonical bincode encoding; chain hashes and handles use SHA-256.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::StoreError;

/// A 32-byte hash value.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The null hash. Reported as the chain top when a chain is empty.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// SHA-256 of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parse a 64-character hex string. Returns `None` on bad length or digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 64 hex characters"))
    }
}

/// Transaction identifier.
pub type TxId = Hash256;

/// Account identifier: the 32-byte pubkey hash an address decodes to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct AccountId(pub Hash256);

impl AccountId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Hash256(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Account that owns the given Ed25519 public key (BLAKE3 of the key bytes).
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Hash256(blake3::hash(public_key).into()))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque cache key returned by registration.
///
/// SHA-256 of the trimmed raw register request, hex encoded. Requests that
/// differ only in key order or inner whitespace produce different handles.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Derive the handle for a raw register request.
    pub fn from_request(raw: &str) -> Self {
        Self(Hash256::sha256(raw.trim().as_bytes()).to_hex())
    }

    /// Derive a handle from the account set itself (sorted, de-duplicated).
    pub fn from_accounts(ids: &[AccountId]) -> Self {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut data = Vec::with_capacity(sorted.len() * 32);
        for id in &sorted {
            data.extend_from_slice(id.as_bytes());
        }
        Self(Hash256::sha256(&data).to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a confirmed transaction affecting an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef {
    pub txid: TxId,
    /// Height of the containing block.
    pub height: u64,
    /// Index of the transaction within its block.
    pub position: u32,
}

/// An account and its confirmed history, in store order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub txs: Vec<TxRef>,
}

impl Account {
    /// Zero-history account for an id the store does not know yet.
    pub fn placeholder(id: AccountId) -> Self {
        Self { id, txs: Vec::new() }
    }
}

/// One link of an account-set chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub txid: TxId,
    pub chain_hash: Hash256,
    pub height: u64,
    pub position: u32,
    /// Set when the ledger revoked the transaction. Revoked entries stay in
    /// place but are skipped when folding chain hashes.
    #[serde(default)]
    pub revoked: bool,
}

impl ChainEntry {
    pub fn sort_key(&self) -> (u64, u32) {
        (self.height, self.position)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u64,
}

impl OutPoint {
    /// Coinbase marker.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }
}

#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in rills.
    pub value: u64,
    pub pubkey_hash: Hash256,
}

#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
}

impl Transaction {
    /// BLAKE3 over the standard bincode encoding.
    pub fn txid(&self) -> Result<TxId, StoreError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Decode a hex-encoded bincode transaction.
    pub fn from_hex(hex_data: &str) -> Result<Self, StoreError> {
        let raw = hex::decode(hex_data.trim())
            .map_err(|_| StoreError::Corrupt("invalid hex encoding".into()))?;
        let (tx, _): (Transaction, usize) =
            bincode::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(format!("decode error: {e}")))?;
        Ok(tx)
    }

    pub fn to_hex(&self) -> Result<String, StoreError> {
        let raw = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(hex::encode(raw))
    }
}

/// A transaction as resolved from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTransaction {
    pub txid: TxId,
    pub tx: Transaction,
    /// Containing block, `None` while unconfirmed.
    pub block: Option<Hash256>,
    /// Unix seconds when the node first saw the transaction.
    pub first_seen: Option<u64>,
}

/// Summary of a connected block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: Hash256,
    pub height: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

/// A block as connected by the in-memory ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub prev_hash: Hash256,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// SHA-256 over `prev_hash || timestamp (LE) || txid...`.
    pub fn hash(&self) -> Result<Hash256, StoreError> {
        let mut data = Vec::with_capacity(40 + self.transactions.len() * 32);
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        for tx in &self.transactions {
            data.extend_from_slice(tx.txid()?.as_bytes());
        }
        Ok(Hash256::sha256(&data))
    }
}
