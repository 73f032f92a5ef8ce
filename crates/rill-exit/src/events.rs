//! Typed per-account subscription registry.
//!
//! Ledger implementations publish account-scoped events through an
//! [`EventRegistry`]. Subscribers attach an mpsc sender for one account and
//! get back a [`Subscription`] guard; dropping the guard detaches it. Senders
//! whose receiver has gone away are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::types::{AccountId, BlockInfo, StoredTransaction, TxId};

/// Confirmed-chain activity for one account.
#[derive(Clone, Debug)]
pub enum AccountEvent {
    /// A transaction touching the account was connected in `block`.
    TransactionAdded {
        tx: Arc<StoredTransaction>,
        block: BlockInfo,
        position: u32,
    },
    /// A previously connected transaction was revoked by a reorg.
    TransactionRevoked { txid: TxId },
}

/// Unconfirmed (mempool) activity for one account.
#[derive(Clone, Debug)]
pub enum MempoolEvent {
    Notify { tx: Arc<StoredTransaction> },
    Cancel { txid: TxId },
}

struct Subscriber<E> {
    id: u64,
    sender: mpsc::UnboundedSender<E>,
}

struct RegistryInner<E> {
    next_id: AtomicU64,
    subscribers: DashMap<AccountId, Vec<Subscriber<E>>>,
}

impl<E> RegistryInner<E> {
    fn detach(&self, account: &AccountId, id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(account) {
            subs.retain(|s| s.id != id);
        }
        self.subscribers.remove_if(account, |_, subs| subs.is_empty());
    }
}

/// Mapping from account id to the set of attached subscribers.
pub struct EventRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

impl<E> Default for EventRegistry<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventRegistry<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                subscribers: DashMap::new(),
            }),
        }
    }

    /// Attach `sender` to events for `account`.
    pub fn attach(&self, account: AccountId, sender: mpsc::UnboundedSender<E>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .entry(account)
            .or_default()
            .push(Subscriber { id, sender });

        let weak: Weak<RegistryInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.detach(&account, id);
                }
            })),
        }
    }

    /// Deliver `event` to every subscriber of `account`. Returns the number
    /// of subscribers reached.
    pub fn publish(&self, account: &AccountId, event: E) -> usize {
        let delivered = match self.inner.subscribers.get_mut(account) {
            Some(mut subs) => {
                subs.retain(|s| s.sender.send(event.clone()).is_ok());
                subs.len()
            }
            None => return 0,
        };
        if delivered == 0 {
            self.inner.subscribers.remove_if(account, |_, subs| subs.is_empty());
        }
        delivered
    }

    pub fn subscriber_count(&self, account: &AccountId) -> usize {
        self.inner
            .subscribers
            .get(account)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Subscribers across all accounts.
    pub fn total_subscribers(&self) -> usize {
        self.inner.subscribers.iter().map(|e| e.value().len()).sum()
    }
}

/// Guard for one attached subscriber. Detaches on drop.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
