//! Push notifications for live client sessions.
//!
//! Each [`Session`] owns an outbound channel of [`PushMessage`]s. Listening on
//! a handle binds the handle's chain events and its accounts' mempool events
//! to that channel; every session also gets ledger-wide block announcements
//! from the moment it opens. Dropping the session releases everything it
//! attached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::address::Network;
use crate::chain::{ChainData, ChainEvent};
use crate::events::{MempoolEvent, Subscription};
use crate::render::OutTx;
use crate::traits::Ledger;
use crate::types::{Handle, Hash256, TxId};

/// Message pushed to a live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushMessage {
    TxAdd { handle: Handle, tx: Box<OutTx> },
    TxRevoke { handle: Handle, hash: TxId },
    TxNotify { handle: Handle, tx: Box<OutTx> },
    TxCancel { handle: Handle, hash: TxId },
    BlockAdd { top: Hash256, height: u64 },
}

impl PushMessage {
    /// Wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::TxAdd { .. } => "txAdd",
            PushMessage::TxRevoke { .. } => "txRevoke",
            PushMessage::TxNotify { .. } => "txNotify",
            PushMessage::TxCancel { .. } => "txCancel",
            PushMessage::BlockAdd { .. } => "blockAdd",
        }
    }
}

/// Opens sessions against one ledger.
#[derive(Clone)]
pub struct NotificationFanout {
    ledger: Arc<dyn Ledger>,
    network: Network,
    next_session: Arc<AtomicU64>,
}

impl NotificationFanout {
    pub fn new(ledger: Arc<dyn Ledger>, network: Network) -> Self {
        Self {
            ledger,
            network,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a session. Must be called from within a tokio runtime.
    pub fn open_session(&self) -> (Session, mpsc::UnboundedReceiver<PushMessage>) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        let blocks = tokio::spawn(forward_blocks(id, self.ledger.subscribe_blocks(), outbound.clone()));
        debug!(session = id, "live session opened");
        let session = Session {
            id,
            ledger: Arc::clone(&self.ledger),
            network: self.network,
            outbound,
            listeners: Mutex::new(HashMap::new()),
            blocks,
        };
        (session, rx)
    }
}

/// Tasks and subscriptions bound to one handle within a session.
struct Listener {
    tasks: Vec<JoinHandle<()>>,
    _subscriptions: Vec<Subscription>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One live client connection.
pub struct Session {
    id: u64,
    ledger: Arc<dyn Ledger>,
    network: Network,
    outbound: mpsc::UnboundedSender<PushMessage>,
    listeners: Mutex<HashMap<Handle, Listener>>,
    blocks: JoinHandle<()>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bind `data` to this session. Returns `false` if the handle was already
    /// bound, in which case nothing changes.
    pub fn listen(&self, data: &Arc<ChainData>) -> bool {
        let handle = data.handle().clone();
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&handle) {
            return false;
        }

        let pending: Pending = Arc::default();
        let chain_task = tokio::spawn(forward_chain(
            handle.clone(),
            data.subscribe(),
            self.outbound.clone(),
            self.network,
            Arc::clone(&pending),
        ));

        let (mempool_tx, mempool_rx) = mpsc::unbounded_channel();
        let subscriptions: Vec<Subscription> = data
            .account_ids()
            .into_iter()
            .map(|id| self.ledger.subscribe_mempool(id, mempool_tx.clone()))
            .collect();
        let mempool_task = tokio::spawn(forward_mempool(
            handle.clone(),
            mempool_rx,
            self.outbound.clone(),
            self.network,
            pending,
        ));

        debug!(session = self.id, handle = %handle, accounts = subscriptions.len(), "session listening");
        listeners.insert(
            handle,
            Listener {
                tasks: vec![chain_task, mempool_task],
                _subscriptions: subscriptions,
            },
        );
        true
    }

    /// Stop pushing events for `handle`. Returns `false` if it was not bound.
    pub fn unlisten(&self, handle: &Handle) -> bool {
        let removed = self.listeners.lock().remove(handle).is_some();
        if removed {
            debug!(session = self.id, handle = %handle, "session stopped listening");
        }
        removed
    }

    pub fn is_listening(&self, handle: &Handle) -> bool {
        self.listeners.lock().contains_key(handle)
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.listeners.lock().keys().cloned().collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.blocks.abort();
        self.listeners.lock().clear();
        debug!(session = self.id, "live session closed");
    }
}

async fn forward_blocks(
    session: u64,
    mut blocks: broadcast::Receiver<crate::types::BlockInfo>,
    outbound: mpsc::UnboundedSender<PushMessage>,
) {
    loop {
        match blocks.recv().await {
            Ok(block) => {
                let msg = PushMessage::BlockAdd {
                    top: block.hash,
                    height: block.height,
                };
                if outbound.send(msg).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(session, skipped = n, "block announcements lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Unconfirmed txids already pushed to a session for one handle.
type Pending = Arc<Mutex<HashSet<TxId>>>;

/// Cancellations remembered per listener to collapse the per-account copies
/// of one ledger event.
const RECENT_CANCELS: usize = 64;

async fn forward_chain(
    handle: Handle,
    mut events: broadcast::Receiver<ChainEvent>,
    outbound: mpsc::UnboundedSender<PushMessage>,
    network: Network,
    pending: Pending,
) {
    loop {
        let msg = match events.recv().await {
            Ok(ChainEvent::Appended { tx, entry, block }) => {
                pending.lock().remove(&tx.txid);
                PushMessage::TxAdd {
                    handle: handle.clone(),
                    tx: Box::new(OutTx::confirmed(&tx, &entry, Some(&block), network)),
                }
            }
            Ok(ChainEvent::Revoked { txid }) => PushMessage::TxRevoke {
                handle: handle.clone(),
                hash: txid,
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(handle = %handle, skipped = n, "chain events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if outbound.send(msg).is_err() {
            break;
        }
    }
}

async fn forward_mempool(
    handle: Handle,
    mut events: mpsc::UnboundedReceiver<MempoolEvent>,
    outbound: mpsc::UnboundedSender<PushMessage>,
    network: Network,
    pending: Pending,
) {
    // The ledger notifies once per touched account; push each change once.
    let mut recent_cancels: VecDeque<TxId> = VecDeque::with_capacity(RECENT_CANCELS);
    while let Some(event) = events.recv().await {
        let msg = match event {
            MempoolEvent::Notify { tx } => {
                if !pending.lock().insert(tx.txid) {
                    continue;
                }
                recent_cancels.retain(|t| *t != tx.txid);
                PushMessage::TxNotify {
                    handle: handle.clone(),
                    tx: Box::new(OutTx::unconfirmed(&tx, network)),
                }
            }
            MempoolEvent::Cancel { txid } => {
                let was_pending = pending.lock().remove(&txid);
                if !was_pending && recent_cancels.contains(&txid) {
                    continue;
                }
                if recent_cancels.len() == RECENT_CANCELS {
                    recent_cancels.pop_front();
                }
                recent_cancels.push_back(txid);
                PushMessage::TxCancel {
                    handle: handle.clone(),
                    hash: txid,
                }
            }
        };
        if outbound.send(msg).is_err() {
            break;
        }
    }
}
