//! Keeps cached chains current with ledger activity.
//!
//! A [`LiveUpdateRouter`] is prepared before the store is read: it attaches
//! one sender per account to the ledger's chain stream, all feeding a single
//! channel. Once the chain is built the router is attached to it and a task
//! applies deltas one at a time. Events that race the initial build are
//! harmless because a txid already in the chain is ignored.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::chain::{ChainData, ChainEvent};
use crate::events::{AccountEvent, Subscription};
use crate::traits::Ledger;
use crate::types::{AccountId, TxRef};

/// Ledger subscriptions for an account set, not yet bound to a chain.
pub struct LiveUpdateRouter {
    events: mpsc::UnboundedReceiver<AccountEvent>,
    subscriptions: Vec<Subscription>,
}

impl LiveUpdateRouter {
    /// Subscribe to chain activity for every id in `ids`.
    pub fn prepare(ledger: &dyn Ledger, ids: &[AccountId]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = ids
            .iter()
            .map(|id| ledger.subscribe_chain(*id, tx.clone()))
            .collect();
        Self {
            events: rx,
            subscriptions,
        }
    }

    /// Start applying deltas to `data`. The router lives as long as `data`.
    pub fn attach(self, data: &Arc<ChainData>) {
        let task = tokio::spawn(route(Arc::downgrade(data), self.events));
        data.set_live(LiveAttachment {
            task,
            _subscriptions: self.subscriptions,
        });
    }
}

/// Routing task and subscriptions owned by a chain. Dropping it stops the
/// task and detaches from the ledger.
pub struct LiveAttachment {
    task: JoinHandle<()>,
    _subscriptions: Vec<Subscription>,
}

impl Drop for LiveAttachment {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn route(data: Weak<ChainData>, mut events: mpsc::UnboundedReceiver<AccountEvent>) {
    while let Some(event) = events.recv().await {
        let Some(data) = data.upgrade() else {
            break;
        };
        apply(&data, event);
    }
}

/// Apply one ledger event to `data`, emitting the chain-level delta.
/// Returns `false` if the event changed nothing.
pub fn apply(data: &ChainData, event: AccountEvent) -> bool {
    match event {
        AccountEvent::TransactionAdded { tx, block, position } => {
            let r = TxRef {
                txid: tx.txid,
                height: block.height,
                position,
            };
            let Some(entry) = data.insert(r) else {
                return false;
            };
            debug!(handle = %data.handle(), txid = %entry.txid, height = entry.height, "chain entry appended");
            data.emit(ChainEvent::Appended { tx, entry, block });
            true
        }
        AccountEvent::TransactionRevoked { txid } => {
            if data.revoke(&txid).is_none() {
                return false;
            }
            debug!(handle = %data.handle(), txid = %txid, "chain entry revoked");
            data.emit(ChainEvent::Revoked { txid });
            true
        }
    }
}
