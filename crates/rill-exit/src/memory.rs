//! In-memory ledger and store.
//!
//! Implements both [`AccountStore`] and [`Ledger`] over plain maps. Blocks
//! are connected explicitly (or mined from the mempool in regtest mode);
//! every change is published to per-account subscribers after the state
//! lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::events::{AccountEvent, EventRegistry, MempoolEvent, Subscription};
use crate::traits::{AccountStore, Ledger};
use crate::types::{
    AccountId, Block, BlockInfo, Hash256, StoredTransaction, Transaction, TxId, TxRef,
};

const BLOCK_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct LedgerState {
    /// Connected blocks by height; index 0 is genesis.
    blocks: Vec<BlockInfo>,
    block_index: HashMap<Hash256, BlockInfo>,
    transactions: HashMap<TxId, StoredTransaction>,
    history: HashMap<AccountId, Vec<TxRef>>,
    /// Txid to (height, position) of confirmed transactions.
    confirmed: HashMap<TxId, TxRef>,
    mempool: Vec<TxId>,
    mempool_txs: HashMap<TxId, StoredTransaction>,
}

impl LedgerState {
    fn tip(&self) -> BlockInfo {
        self.blocks.last().copied().unwrap_or(BlockInfo {
            hash: Hash256::ZERO,
            height: 0,
            timestamp: 0,
        })
    }

    fn lookup(&self, txid: &TxId) -> Option<&StoredTransaction> {
        self.transactions
            .get(txid)
            .or_else(|| self.mempool_txs.get(txid))
    }

    /// Accounts a transaction touches: output owners, then the owners of
    /// spent outputs. First occurrence order, no duplicates.
    fn touched(&self, tx: &Transaction) -> Vec<AccountId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |id: AccountId| {
            if seen.insert(id) {
                out.push(id);
            }
        };
        for output in &tx.outputs {
            push(AccountId(output.pubkey_hash));
        }
        for input in &tx.inputs {
            if input.previous_output.is_null() {
                continue;
            }
            let spent = self
                .lookup(&input.previous_output.txid)
                .and_then(|prev| usize::try_from(input.previous_output.index).ok().and_then(|i| prev.tx.outputs.get(i)));
            match spent {
                Some(output) => push(AccountId(output.pubkey_hash)),
                None if !input.public_key.is_empty() => push(AccountId::from_public_key(&input.public_key)),
                None => {}
            }
        }
        out
    }
}

/// In-memory [`AccountStore`] + [`Ledger`].
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    chain_events: EventRegistry<AccountEvent>,
    mempool_events: EventRegistry<MempoolEvent>,
    blocks: broadcast::Sender<BlockInfo>,
    unavailable: AtomicBool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// A ledger holding only the genesis block.
    pub fn new() -> Self {
        let genesis = Block {
            prev_hash: Hash256::ZERO,
            timestamp: 0,
            transactions: Vec::new(),
        };
        let info = BlockInfo {
            // An empty block hashes without encoding any transaction.
            hash: genesis.hash().unwrap_or_default(),
            height: 0,
            timestamp: 0,
        };
        let mut state = LedgerState::default();
        state.blocks.push(info);
        state.block_index.insert(info.hash, info);

        let (blocks, _) = broadcast::channel(BLOCK_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(state),
            chain_events: EventRegistry::new(),
            mempool_events: EventRegistry::new(),
            blocks,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every store and ledger call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory ledger offline".into()));
        }
        Ok(())
    }

    pub fn height(&self) -> u64 {
        self.state.read().tip().height
    }

    pub fn mempool_len(&self) -> usize {
        self.state.read().mempool.len()
    }

    pub fn chain_subscribers(&self) -> usize {
        self.chain_events.total_subscribers()
    }

    pub fn mempool_subscribers(&self) -> usize {
        self.mempool_events.total_subscribers()
    }

    /// Connect a block containing `transactions` on top of the tip.
    pub fn connect_block(
        &self,
        transactions: Vec<Transaction>,
        timestamp: u64,
    ) -> Result<BlockInfo, StoreError> {
        let mut published = Vec::new();
        let (info, count) = {
            let mut state = self.state.write();
            let tip = state.tip();
            let block = Block {
                prev_hash: tip.hash,
                timestamp,
                transactions,
            };
            let info = BlockInfo {
                hash: block.hash()?,
                height: tip.height + 1,
                timestamp,
            };

            let mut txids = Vec::with_capacity(block.transactions.len());
            for tx in &block.transactions {
                let txid = tx.txid()?;
                if state.confirmed.contains_key(&txid) || txids.contains(&txid) {
                    return Err(StoreError::Corrupt(format!("transaction {txid} already confirmed")));
                }
                txids.push(txid);
            }

            for (position, (tx, txid)) in block.transactions.into_iter().zip(txids).enumerate() {
                let position = u32::try_from(position)
                    .map_err(|_| StoreError::Corrupt("block too large".into()))?;
                let first_seen = state.mempool_txs.remove(&txid).and_then(|s| s.first_seen);
                state.mempool.retain(|id| *id != txid);

                let touched = state.touched(&tx);
                let r = TxRef {
                    txid,
                    height: info.height,
                    position,
                };
                for id in &touched {
                    state.history.entry(*id).or_default().push(r);
                }
                state.confirmed.insert(txid, r);
                let stored = StoredTransaction {
                    txid,
                    tx,
                    block: Some(info.hash),
                    first_seen,
                };
                state.transactions.insert(txid, stored.clone());
                published.push((touched, Arc::new(stored), position));
            }

            state.blocks.push(info);
            state.block_index.insert(info.hash, info);
            (info, published.len())
        };

        for (touched, stored, position) in published {
            for id in &touched {
                self.chain_events.publish(
                    id,
                    AccountEvent::TransactionAdded {
                        tx: Arc::clone(&stored),
                        block: info,
                        position,
                    },
                );
            }
        }
        let _ = self.blocks.send(info);
        info!(height = info.height, hash = %info.hash, txs = count, "block connected");
        Ok(info)
    }

    /// Accept an unconfirmed transaction into the mempool.
    pub fn add_unconfirmed(&self, tx: Transaction, first_seen: u64) -> Result<TxId, StoreError> {
        let txid = tx.txid()?;
        let (touched, stored) = {
            let mut state = self.state.write();
            if state.lookup(&txid).is_some() {
                return Err(StoreError::Corrupt(format!("transaction {txid} already known")));
            }
            let touched = state.touched(&tx);
            let stored = StoredTransaction {
                txid,
                tx,
                block: None,
                first_seen: Some(first_seen),
            };
            state.mempool.push(txid);
            state.mempool_txs.insert(txid, stored.clone());
            (touched, Arc::new(stored))
        };
        for id in &touched {
            self.mempool_events
                .publish(id, MempoolEvent::Notify { tx: Arc::clone(&stored) });
        }
        debug!(txid = %txid, accounts = touched.len(), "unconfirmed transaction accepted");
        Ok(txid)
    }

    /// Drop an unconfirmed transaction. Returns `false` if it was not pending.
    pub fn drop_unconfirmed(&self, txid: &TxId) -> bool {
        let touched = {
            let mut state = self.state.write();
            let Some(stored) = state.mempool_txs.remove(txid) else {
                return false;
            };
            state.mempool.retain(|id| id != txid);
            state.touched(&stored.tx)
        };
        for id in &touched {
            self.mempool_events
                .publish(id, MempoolEvent::Cancel { txid: *txid });
        }
        true
    }

    /// Revoke a confirmed transaction, as after a reorg.
    pub fn revoke_transaction(&self, txid: &TxId) -> Result<(), StoreError> {
        let touched = {
            let mut state = self.state.write();
            if state.confirmed.remove(txid).is_none() {
                return Err(StoreError::NotFound(format!("transaction {txid}")));
            }
            let tx = match state.transactions.get_mut(txid) {
                Some(stored) => {
                    stored.block = None;
                    stored.tx.clone()
                }
                None => return Err(StoreError::Corrupt(format!("transaction {txid} missing"))),
            };
            let touched = state.touched(&tx);
            for id in &touched {
                if let Some(refs) = state.history.get_mut(id) {
                    refs.retain(|r| r.txid != *txid);
                }
            }
            touched
        };
        for id in &touched {
            self.chain_events
                .publish(id, AccountEvent::TransactionRevoked { txid: *txid });
        }
        info!(txid = %txid, "transaction revoked");
        Ok(())
    }

    /// Connect every pending mempool transaction in one block.
    pub fn mine_pending(&self, timestamp: u64) -> Result<BlockInfo, StoreError> {
        let pending: Vec<Transaction> = {
            let state = self.state.read();
            state
                .mempool
                .iter()
                .filter_map(|id| state.mempool_txs.get(id).map(|s| s.tx.clone()))
                .collect()
        };
        self.connect_block(pending, timestamp)
    }
}

#[async_trait]
impl AccountStore for MemoryLedger {
    async fn transaction_history(&self, id: &AccountId) -> Result<Vec<TxRef>, StoreError> {
        self.check()?;
        Ok(self.state.read().history.get(id).cloned().unwrap_or_default())
    }

    async fn find_transactions(&self, txids: &[TxId]) -> Result<Vec<StoredTransaction>, StoreError> {
        self.check()?;
        let state = self.state.read();
        Ok(txids.iter().filter_map(|id| state.lookup(id).cloned()).collect())
    }

    async fn find_blocks(&self, hashes: &[Hash256]) -> Result<Vec<BlockInfo>, StoreError> {
        self.check()?;
        let state = self.state.read();
        Ok(hashes
            .iter()
            .filter_map(|h| state.block_index.get(h).copied())
            .collect())
    }

    async fn find_unconfirmed(&self, ids: &[AccountId]) -> Result<Vec<StoredTransaction>, StoreError> {
        self.check()?;
        let wanted: HashSet<&AccountId> = ids.iter().collect();
        let state = self.state.read();
        Ok(state
            .mempool
            .iter()
            .filter_map(|txid| state.mempool_txs.get(txid))
            .filter(|stored| state.touched(&stored.tx).iter().any(|id| wanted.contains(id)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn top_block(&self) -> Result<BlockInfo, StoreError> {
        self.check()?;
        Ok(self.state.read().tip())
    }

    async fn submit_transaction(&self, tx: Transaction) -> Result<TxId, StoreError> {
        self.check()?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.add_unconfirmed(tx, now)
    }

    fn subscribe_chain(
        &self,
        account: AccountId,
        sender: mpsc::UnboundedSender<AccountEvent>,
    ) -> Subscription {
        self.chain_events.attach(account, sender)
    }

    fn subscribe_mempool(
        &self,
        account: AccountId,
        sender: mpsc::UnboundedSender<MempoolEvent>,
    ) -> Subscription {
        self.mempool_events.attach(account, sender)
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockInfo> {
        self.blocks.subscribe()
    }
}
