//! Hash-chained, de-duplicated transaction ledger for an account set.
//!
//! [`build`] merges the confirmed history of every registered account into
//! one ordered chain. The first entry's chain hash is its txid; each later
//! live entry links as `SHA256(prev.chain_hash || txid)`. References with the
//! same txid as the previous emitted entry are dropped, which removes the
//! duplicate produced when one transaction touches two registered accounts.
//!
//! [`ChainData`] is the cached value behind a handle. Its [`ChainState`] is
//! mutated only by the initial build and by the live update router, under a
//! write lock that is never held across an await.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::live::LiveAttachment;
use crate::pagination::{self, Page};
use crate::types::{Account, AccountId, BlockInfo, ChainEntry, Handle, Hash256, StoredTransaction, TxId, TxRef};

/// Link `txid` onto a chain whose previous live entry hashed to `prev`.
pub fn link(prev: &Hash256, txid: &TxId) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(prev.as_bytes());
    data[32..].copy_from_slice(txid.as_bytes());
    Hash256::sha256(&data)
}

/// Build the chain for `accounts`.
///
/// References are ordered by `(height, position)`; txid breaks remaining ties
/// so the result does not depend on account order.
pub fn build(accounts: &[Account]) -> Vec<ChainEntry> {
    let mut refs: Vec<TxRef> = accounts.iter().flat_map(|a| a.txs.iter().copied()).collect();
    refs.sort_by_key(|r| (r.height, r.position, r.txid));

    let mut chain: Vec<ChainEntry> = Vec::with_capacity(refs.len());
    for r in refs {
        let chain_hash = match chain.last() {
            None => r.txid,
            Some(prev) if prev.txid == r.txid => continue,
            Some(prev) => link(&prev.chain_hash, &r.txid),
        };
        chain.push(ChainEntry {
            txid: r.txid,
            chain_hash,
            height: r.height,
            position: r.position,
            revoked: false,
        });
    }
    chain
}

/// Recompute chain hashes from `start` to the tail, skipping revoked entries.
fn rehash_from(chain: &mut [ChainEntry], start: usize) {
    let mut prev = chain[..start]
        .iter()
        .rev()
        .find(|e| !e.revoked)
        .map(|e| e.chain_hash);
    for entry in chain[start..].iter_mut().filter(|e| !e.revoked) {
        let hash = match prev {
            None => entry.txid,
            Some(p) => link(&p, &entry.txid),
        };
        entry.chain_hash = hash;
        prev = Some(hash);
    }
}

/// Accounts and chain for one handle.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    accounts: Vec<Account>,
    chain: Vec<ChainEntry>,
    /// Txids of live (non-revoked) entries.
    live: HashSet<TxId>,
}

impl ChainState {
    pub fn new(accounts: Vec<Account>) -> Self {
        let chain = build(&accounts);
        let live = chain.iter().map(|e| e.txid).collect();
        Self { accounts, chain, live }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn chain(&self) -> &[ChainEntry] {
        &self.chain
    }

    /// Chain hash of the last live entry, or the null hash.
    pub fn top(&self) -> Hash256 {
        pagination::tail_hash(&self.chain)
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.live.contains(txid)
    }

    /// Add a newly confirmed reference.
    ///
    /// Returns the new entry, or `None` if the txid is already live in the
    /// chain. A reference ordered after the tail is appended. One that sorts
    /// before it is inserted where [`build`] would place it, txid breaking
    /// ties, and the hashes after it are recomputed, so the chain always
    /// equals a fresh build of the same refs. Page readers resuming past the
    /// insertion point do not see the entry; live sessions get it as `txAdd`.
    pub fn insert(&mut self, r: TxRef) -> Option<ChainEntry> {
        if !self.live.insert(r.txid) {
            return None;
        }
        let key = (r.height, r.position, r.txid);
        let order = |e: &ChainEntry| (e.height, e.position, e.txid);
        let index = match self.chain.last() {
            Some(tail) if order(tail) > key => self.chain.partition_point(|e| order(e) <= key),
            _ => self.chain.len(),
        };
        self.chain.insert(
            index,
            ChainEntry {
                txid: r.txid,
                chain_hash: r.txid,
                height: r.height,
                position: r.position,
                revoked: false,
            },
        );
        rehash_from(&mut self.chain, index);
        Some(self.chain[index])
    }

    /// Mark the live entry for `txid` revoked and relink everything after it.
    pub fn revoke(&mut self, txid: &TxId) -> Option<ChainEntry> {
        if !self.live.remove(txid) {
            return None;
        }
        let index = self
            .chain
            .iter()
            .rposition(|e| e.txid == *txid && !e.revoked)?;
        self.chain[index].revoked = true;
        rehash_from(&mut self.chain, index + 1);
        Some(self.chain[index])
    }
}

/// Chain-level deltas emitted as the live router applies ledger events.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    Appended {
        tx: Arc<StoredTransaction>,
        entry: ChainEntry,
        block: BlockInfo,
    },
    Revoked { txid: TxId },
}

/// The cached value for a handle.
pub struct ChainData {
    handle: Handle,
    state: RwLock<ChainState>,
    events: broadcast::Sender<ChainEvent>,
    live: Mutex<Option<LiveAttachment>>,
}

impl ChainData {
    /// Build the chain for `accounts`. `event_capacity` bounds how far a
    /// listener may lag behind before it misses deltas.
    pub fn new(handle: Handle, accounts: Vec<Account>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            handle,
            state: RwLock::new(ChainState::new(accounts)),
            events,
            live: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.state.read().accounts.iter().map(|a| a.id).collect()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.state.read().accounts.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn top(&self) -> Hash256 {
        self.state.read().top()
    }

    /// Copy of the current chain.
    pub fn entries(&self) -> Vec<ChainEntry> {
        self.state.read().chain.clone()
    }

    /// Slice a page out of the chain under the read lock.
    pub fn page(&self, locator: &[TxId], limit: usize) -> Page {
        pagination::page(&self.state.read().chain, locator, limit)
    }

    /// Subscribe to chain deltas.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub(crate) fn insert(&self, r: TxRef) -> Option<ChainEntry> {
        self.state.write().insert(r)
    }

    pub(crate) fn revoke(&self, txid: &TxId) -> Option<ChainEntry> {
        self.state.write().revoke(txid)
    }

    pub(crate) fn emit(&self, event: ChainEvent) {
        // No receivers is fine: nobody is listening live.
        let _ = self.events.send(event);
    }

    pub(crate) fn set_live(&self, attachment: LiveAttachment) {
        *self.live.lock() = Some(attachment);
    }

    /// Whether a live router is attached.
    pub fn is_live(&self) -> bool {
        self.live.lock().is_some()
    }
}

impl std::fmt::Debug for ChainData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ChainData")
            .field("handle", &self.handle)
            .field("accounts", &state.accounts.len())
            .field("chain", &state.chain.len())
            .finish()
    }
}
