//! Contracts for the external collaborators.
//!
//! - [`AccountStore`]: resolves accounts, transactions, and blocks by key
//! - [`Ledger`]: chain tip, per-account event streams, and transaction relay
//!
//! The exit node only reads through these traits; persistence, validation
//! and consensus live behind them.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::StoreError;
use crate::events::{AccountEvent, MempoolEvent, Subscription};
use crate::types::{Account, AccountId, BlockInfo, Hash256, StoredTransaction, Transaction, TxId, TxRef};

/// Read access to indexed ledger records.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Confirmed history of one account, in store order.
    async fn transaction_history(&self, id: &AccountId) -> Result<Vec<TxRef>, StoreError>;

    /// Accounts the store knows about among `ids`.
    ///
    /// Ids without history are omitted; callers create placeholders.
    /// Default implementation queries [`transaction_history`](Self::transaction_history)
    /// per id.
    async fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            let txs = self.transaction_history(id).await?;
            if !txs.is_empty() {
                accounts.push(Account { id: *id, txs });
            }
        }
        Ok(accounts)
    }

    /// Stored transactions among `txids`. Unknown ids are omitted.
    async fn find_transactions(&self, txids: &[TxId]) -> Result<Vec<StoredTransaction>, StoreError>;

    /// Block summaries among `hashes`. Unknown hashes are omitted.
    async fn find_blocks(&self, hashes: &[Hash256]) -> Result<Vec<BlockInfo>, StoreError>;

    /// Unconfirmed transactions touching any of `ids`.
    async fn find_unconfirmed(&self, ids: &[AccountId]) -> Result<Vec<StoredTransaction>, StoreError>;
}

/// Live view of the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current top block.
    async fn top_block(&self) -> Result<BlockInfo, StoreError>;

    /// Current top block height.
    ///
    /// Default implementation reads [`top_block`](Self::top_block).
    async fn current_height(&self) -> Result<u64, StoreError> {
        Ok(self.top_block().await?.height)
    }

    /// Relay a transaction to the network. Returns its id.
    async fn submit_transaction(&self, tx: Transaction) -> Result<TxId, StoreError>;

    /// Attach `sender` to confirmed add/revoke events for `account`.
    fn subscribe_chain(
        &self,
        account: AccountId,
        sender: mpsc::UnboundedSender<AccountEvent>,
    ) -> Subscription;

    /// Attach `sender` to unconfirmed notify/cancel events for `account`.
    fn subscribe_mempool(
        &self,
        account: AccountId,
        sender: mpsc::UnboundedSender<MempoolEvent>,
    ) -> Subscription;

    /// Ledger-wide stream of newly connected blocks.
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockInfo>;
}
