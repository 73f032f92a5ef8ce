//! Caller-facing operations of the exit node.
//!
//! [`AccountChainService`] validates register requests, drives the chain
//! cache, and enriches chain entries with stored transaction and block
//! detail. It is transport agnostic; the RPC layer maps its results and
//! errors onto JSON-RPC.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::{encode_address, parse_account, Network};
use crate::cache::{ChainCache, ChainResult};
use crate::chain::ChainData;
use crate::error::ExitError;
use crate::fanout::{NotificationFanout, PushMessage, Session};
use crate::live::LiveUpdateRouter;
use crate::pagination::DEFAULT_PAGE_LIMIT;
use crate::render::OutTx;
use crate::traits::{AccountStore, Ledger};
use crate::types::{Account, AccountId, BlockInfo, ChainEntry, Handle, Hash256, Transaction, TxId};

/// Settings the service needs at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub network: Network,
    pub page_limit: usize,
    pub event_capacity: usize,
    pub canonical_handles: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            page_limit: DEFAULT_PAGE_LIMIT,
            event_capacity: 256,
            canonical_handles: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub handle: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPage {
    /// Locator for the next page. The tail hash once the page reaches the
    /// end of the chain; the null hash for an empty chain.
    pub top: Hash256,
    pub txs: Vec<OutTx>,
    /// Current ledger height.
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedTxs {
    pub txs: Vec<OutTx>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: AccountId,
    pub address: String,
    /// Confirmed transactions known when the chain was built.
    pub tx_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub handle: Handle,
    pub accounts: Vec<AccountSummary>,
    pub chain_length: usize,
    pub top: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub hash: Hash256,
    pub height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTransaction {
    pub txid: TxId,
}

/// Parse a comma-separated register request into account ids.
///
/// Blank keys are skipped and repeated ids collapse to their first
/// occurrence.
pub fn parse_keys(raw: &str, network: Network) -> Result<Vec<AccountId>, ExitError> {
    let mut ids: Vec<AccountId> = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        let id = parse_account(key, network).map_err(|e| {
            ExitError::InvalidKeys(format!("not a valid address or account id: '{key}' ({e})"))
        })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(ExitError::NoKeys);
    }
    Ok(ids)
}

pub struct AccountChainService {
    store: Arc<dyn AccountStore>,
    ledger: Arc<dyn Ledger>,
    cache: ChainCache,
    fanout: NotificationFanout,
    config: ServiceConfig,
}

impl AccountChainService {
    pub fn new(store: Arc<dyn AccountStore>, ledger: Arc<dyn Ledger>, config: ServiceConfig) -> Self {
        let fanout = NotificationFanout::new(Arc::clone(&ledger), config.network);
        Self {
            store,
            ledger,
            cache: ChainCache::new(),
            fanout,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }

    fn handle_for(&self, raw: &str, ids: &[AccountId]) -> Handle {
        if self.config.canonical_handles {
            Handle::from_accounts(ids)
        } else {
            Handle::from_request(raw)
        }
    }

    fn build_task(
        &self,
        handle: &Handle,
        ids: Vec<AccountId>,
    ) -> impl Future<Output = ChainResult> + Send + use<> {
        compute_chain(
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            handle.clone(),
            ids,
            self.config.event_capacity,
        )
    }

    /// Validate `raw` and start building its chain in the background.
    ///
    /// Returns as soon as the handle is known. Registering a handle that is
    /// already cached reuses the existing chain.
    pub fn register(&self, raw: &str) -> Result<Registration, ExitError> {
        let ids = parse_keys(raw, self.config.network)?;
        let handle = self.handle_for(raw, &ids);
        let count = ids.len();
        let task = self.build_task(&handle, ids);
        let started = self.cache.start(&handle, move || task);
        info!(handle = %handle, accounts = count, started, "account set registered");
        Ok(Registration { handle })
    }

    /// Drop a failed chain for `raw` and build it again. Returns `false` if
    /// the handle had not failed.
    pub fn recompute(&self, raw: &str) -> Result<bool, ExitError> {
        let ids = parse_keys(raw, self.config.network)?;
        let handle = self.handle_for(raw, &ids);
        let task = self.build_task(&handle, ids);
        let restarted = self.cache.recompute(&handle, move || task);
        if restarted {
            info!(handle = %handle, "failed chain rebuilt");
        }
        Ok(restarted)
    }

    /// The chain behind `handle`, once built.
    pub async fn chain(&self, handle: &Handle) -> ChainResult {
        self.cache.get(handle).await
    }

    /// Next page of confirmed transactions after `locator`.
    pub async fn fetch_page(&self, handle: &Handle, locator: &[TxId]) -> Result<TxPage, ExitError> {
        let data = self.cache.get(handle).await?;
        self.page_of(&data, locator).await
    }

    async fn page_of(&self, data: &ChainData, locator: &[TxId]) -> Result<TxPage, ExitError> {
        let page = data.page(locator, self.config.page_limit);
        let txs = self.enrich(&page.entries).await?;
        let height = self.ledger.current_height().await?;
        debug!(handle = %data.handle(), count = txs.len(), height, "page served");
        Ok(TxPage {
            top: page.new_top,
            txs,
            height,
        })
    }

    async fn enrich(&self, entries: &[ChainEntry]) -> Result<Vec<OutTx>, ExitError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let txids: Vec<TxId> = entries.iter().map(|e| e.txid).collect();
        let stored: HashMap<TxId, _> = self
            .store
            .find_transactions(&txids)
            .await?
            .into_iter()
            .map(|s| (s.txid, s))
            .collect();

        let mut block_hashes: Vec<Hash256> = Vec::new();
        for hash in stored.values().filter_map(|s| s.block) {
            if !block_hashes.contains(&hash) {
                block_hashes.push(hash);
            }
        }
        let blocks: HashMap<Hash256, BlockInfo> = self
            .store
            .find_blocks(&block_hashes)
            .await?
            .into_iter()
            .map(|b| (b.hash, b))
            .collect();

        entries
            .iter()
            .map(|entry| {
                let tx = stored.get(&entry.txid).ok_or_else(|| {
                    warn!(txid = %entry.txid, "chain entry missing from store");
                    ExitError::ServerError(format!("transaction {} not found in store", entry.txid))
                })?;
                let block = tx.block.and_then(|h| blocks.get(&h));
                Ok(OutTx::confirmed(tx, entry, block, self.config.network))
            })
            .collect()
    }

    /// Pending transactions touching the handle's accounts.
    pub async fn fetch_unconfirmed(&self, handle: &Handle) -> Result<UnconfirmedTxs, ExitError> {
        let data = self.cache.get(handle).await?;
        let txs = self
            .store
            .find_unconfirmed(&data.account_ids())
            .await?
            .iter()
            .map(|s| OutTx::unconfirmed(s, self.config.network))
            .collect();
        Ok(UnconfirmedTxs { txs })
    }

    /// Summary of the chain behind `handle`.
    pub async fn fetch_status(&self, handle: &Handle) -> Result<ChainStatus, ExitError> {
        let data = self.cache.get(handle).await?;
        let accounts = data
            .accounts()
            .iter()
            .map(|a| AccountSummary {
                id: a.id,
                address: encode_address(&a.id, self.config.network),
                tx_count: a.txs.len(),
            })
            .collect();
        Ok(ChainStatus {
            handle: handle.clone(),
            accounts,
            chain_length: data.len(),
            top: data.top(),
        })
    }

    pub async fn block_status(&self) -> Result<BlockStatus, ExitError> {
        let top = self.ledger.top_block().await?;
        Ok(BlockStatus {
            hash: top.hash,
            height: top.height,
        })
    }

    /// Relay a hex-encoded transaction to the ledger.
    pub async fn send_transaction(&self, hex_tx: &str) -> Result<SentTransaction, ExitError> {
        let tx = Transaction::from_hex(hex_tx)
            .map_err(|e| ExitError::InvalidTransaction(e.to_string()))?;
        let txid = self.ledger.submit_transaction(tx).await?;
        info!(txid = %txid, "transaction relayed");
        Ok(SentTransaction { txid })
    }

    /// Open a live session. Must be called from within a tokio runtime.
    pub fn open_session(&self) -> (Session, tokio::sync::mpsc::UnboundedReceiver<PushMessage>) {
        self.fanout.open_session()
    }

    /// Bind `handle` to `session` (if not already bound) and return the page
    /// after `locator`.
    pub async fn listen(
        &self,
        session: &Session,
        handle: &Handle,
        locator: &[TxId],
    ) -> Result<TxPage, ExitError> {
        let data = self.cache.get(handle).await?;
        session.listen(&data);
        self.page_of(&data, locator).await
    }
}

async fn compute_chain(
    store: Arc<dyn AccountStore>,
    ledger: Arc<dyn Ledger>,
    handle: Handle,
    ids: Vec<AccountId>,
    event_capacity: usize,
) -> ChainResult {
    // Subscribe first so nothing confirmed during the read is missed.
    let router = LiveUpdateRouter::prepare(ledger.as_ref(), &ids);
    let found = store.find_accounts(&ids).await.map_err(|e| {
        warn!(handle = %handle, error = %e, "chain build failed");
        ExitError::from(e)
    })?;

    let mut by_id: HashMap<AccountId, Account> = found.into_iter().map(|a| (a.id, a)).collect();
    let accounts: Vec<Account> = ids
        .iter()
        .map(|id| by_id.remove(id).unwrap_or_else(|| Account::placeholder(*id)))
        .collect();

    let data = Arc::new(ChainData::new(handle, accounts, event_capacity));
    router.attach(&data);
    info!(handle = %data.handle(), accounts = ids.len(), entries = data.len(), "chain built");
    Ok(data)
}
