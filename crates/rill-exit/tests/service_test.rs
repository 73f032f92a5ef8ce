//! End-to-end tests for the account chain service over the in-memory ledger.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rill_exit_lib::address::{encode_address, Network};
use rill_exit_lib::chain::link;
use rill_exit_lib::types::{
    Account, AccountId, BlockInfo, Handle, Hash256, OutPoint, StoredTransaction, Transaction, TxId,
    TxInput, TxOutput, TxRef,
};
use rill_exit_lib::{
    AccountChainService, AccountStore, ExitError, MemoryLedger, ServiceConfig, StoreError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn acct(seed: u8) -> AccountId {
    AccountId::from_bytes([seed; 32])
}

fn addr(seed: u8) -> String {
    encode_address(&acct(seed), Network::Mainnet)
}

/// Coinbase-style payment; `nonce` keeps txids unique.
fn pay(to: AccountId, value: u64, nonce: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: nonce.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value,
            pubkey_hash: to.0,
        }],
        lock_time: nonce,
    }
}

fn spend(prev: TxId, to: AccountId, nonce: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint { txid: prev, index: 0 },
            signature: vec![0; 64],
            public_key: vec![0; 32],
        }],
        outputs: vec![TxOutput {
            value: 1,
            pubkey_hash: to.0,
        }],
        lock_time: nonce,
    }
}

fn setup(config: ServiceConfig) -> (Arc<MemoryLedger>, AccountChainService) {
    let ledger = Arc::new(MemoryLedger::new());
    let service = AccountChainService::new(ledger.clone(), ledger.clone(), config);
    (ledger, service)
}

/// Connect empty blocks until the tip is at `height`.
fn advance_to(ledger: &MemoryLedger, height: u64) {
    while ledger.height() < height {
        let next = ledger.height() + 1;
        ledger.connect_block(vec![], next * 10).unwrap();
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Store wrapper that counts account lookups and can be switched to fail.
struct CountingStore {
    inner: Arc<MemoryLedger>,
    lookups: AtomicUsize,
    failing: AtomicBool,
}

impl CountingStore {
    fn new(inner: Arc<MemoryLedger>) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for CountingStore {
    async fn transaction_history(&self, id: &AccountId) -> Result<Vec<TxRef>, StoreError> {
        self.check()?;
        self.inner.transaction_history(id).await
    }

    async fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        // Give concurrent registrations a chance to race.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.check()?;
        self.inner.find_accounts(ids).await
    }

    async fn find_transactions(&self, txids: &[TxId]) -> Result<Vec<StoredTransaction>, StoreError> {
        self.check()?;
        self.inner.find_transactions(txids).await
    }

    async fn find_blocks(&self, hashes: &[Hash256]) -> Result<Vec<BlockInfo>, StoreError> {
        self.check()?;
        self.inner.find_blocks(hashes).await
    }

    async fn find_unconfirmed(&self, ids: &[AccountId]) -> Result<Vec<StoredTransaction>, StoreError> {
        self.check()?;
        self.inner.find_unconfirmed(ids).await
    }
}

fn counting_setup() -> (Arc<MemoryLedger>, Arc<CountingStore>, AccountChainService) {
    let ledger = Arc::new(MemoryLedger::new());
    let store = Arc::new(CountingStore::new(ledger.clone()));
    let service = AccountChainService::new(store.clone(), ledger.clone(), ServiceConfig::default());
    (ledger, store, service)
}

// ---------------------------------------------------------------------------
// Registration and chain construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_account_chain_is_ordered_and_linked() {
    let (ledger, service) = setup(ServiceConfig::default());
    let (a, b) = (acct(0xA), acct(0xB));

    advance_to(&ledger, 9);
    let a_tx = pay(a, 10, 1);
    let b_tx1 = pay(b, 20, 2);
    let b_tx2 = pay(b, 30, 3);
    let ids = [a_tx.txid().unwrap(), b_tx1.txid().unwrap(), b_tx2.txid().unwrap()];
    ledger.connect_block(vec![a_tx, b_tx1], 100).unwrap();
    ledger.connect_block(vec![b_tx2], 110).unwrap();

    let reg = service.register(&format!("{},{}", addr(0xA), addr(0xB))).unwrap();
    let page = service.fetch_page(&reg.handle, &[]).await.unwrap();

    assert_eq!(page.txs.len(), 3);
    assert_eq!(page.txs.iter().map(|t| t.hash).collect::<Vec<_>>(), ids.to_vec());
    assert_eq!(page.txs[0].chain_hash, Some(ids[0]));
    let h1 = link(&ids[0], &ids[1]);
    assert_eq!(page.txs[1].chain_hash, Some(h1));
    assert_eq!(page.txs[2].chain_hash, Some(link(&h1, &ids[2])));
    assert_eq!(page.top, link(&h1, &ids[2]));
    assert_eq!(page.height, 11);

    let heights: Vec<_> = page.txs.iter().map(|t| t.block.unwrap().height).collect();
    assert_eq!(heights, vec![10, 10, 11]);
    assert_eq!(page.txs[1].index, Some(1));
    assert_eq!(page.txs[2].timestamp, Some(110));
}

#[tokio::test]
async fn zero_history_registration_yields_empty_chain() {
    let (_ledger, service) = setup(ServiceConfig::default());
    let reg = service.register(&format!("{},{}", addr(1), addr(2))).unwrap();

    let page = service.fetch_page(&reg.handle, &[]).await.unwrap();
    assert!(page.txs.is_empty());
    assert_eq!(page.top, Hash256::ZERO);

    let status = service.fetch_status(&reg.handle).await.unwrap();
    assert_eq!(status.chain_length, 0);
    assert_eq!(status.accounts.len(), 2);
    assert!(status.accounts.iter().all(|a| a.tx_count == 0));
    assert_eq!(status.accounts[0].id, acct(1));
    assert_eq!(status.accounts[0].address, addr(1));
}

#[tokio::test]
async fn shared_transaction_appears_once() {
    let (ledger, service) = setup(ServiceConfig::default());
    let fund = pay(acct(1), 50, 0);
    let fund_id = fund.txid().unwrap();
    ledger.connect_block(vec![fund], 10).unwrap();
    ledger.connect_block(vec![spend(fund_id, acct(2), 1)], 20).unwrap();

    let reg = service.register(&format!("{},{}", addr(1), addr(2))).unwrap();
    let page = service.fetch_page(&reg.handle, &[]).await.unwrap();
    assert_eq!(page.txs.len(), 2);
}

#[tokio::test]
async fn invalid_and_empty_requests_are_rejected() {
    let (_ledger, service) = setup(ServiceConfig::default());
    let err = service.register(&format!("{},notanaddress", addr(1))).unwrap_err();
    assert_eq!(err.kind(), "InvalidKeys");
    assert_eq!(service.register(" , ").unwrap_err(), ExitError::NoKeys);
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn unknown_handle_is_reported_by_every_read() {
    let (_ledger, service) = setup(ServiceConfig::default());
    let handle: Handle = "ff".repeat(32).into();
    assert_eq!(
        service.fetch_page(&handle, &[]).await.unwrap_err().kind(),
        "UnknownHandle"
    );
    assert_eq!(
        service.fetch_unconfirmed(&handle).await.unwrap_err().kind(),
        "UnknownHandle"
    );
    assert_eq!(
        service.fetch_status(&handle).await.unwrap_err().kind(),
        "UnknownHandle"
    );
}

#[tokio::test]
async fn handles_follow_raw_request_by_default() {
    let (_ledger, service) = setup(ServiceConfig::default());
    let ab = service.register(&format!("{},{}", addr(1), addr(2))).unwrap();
    let ba = service.register(&format!("{},{}", addr(2), addr(1))).unwrap();
    let again = service.register(&format!("  {},{}\n", addr(1), addr(2))).unwrap();
    assert_ne!(ab.handle, ba.handle);
    assert_eq!(ab.handle, again.handle);
}

#[tokio::test]
async fn canonical_handles_ignore_order() {
    let (_ledger, service) = setup(ServiceConfig {
        canonical_handles: true,
        ..ServiceConfig::default()
    });
    let ab = service.register(&format!("{},{}", addr(1), addr(2))).unwrap();
    let ba = service.register(&format!("{}, {}", addr(2), addr(1))).unwrap();
    assert_eq!(ab.handle, ba.handle);
}

// ---------------------------------------------------------------------------
// Single flight and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_registrations_share_one_build() {
    let (ledger, store, service) = counting_setup();
    ledger.connect_block(vec![pay(acct(1), 5, 0)], 10).unwrap();
    let service = Arc::new(service);
    let raw = addr(1);

    let mut joins = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let raw = raw.clone();
        joins.push(tokio::spawn(async move {
            let reg = service.register(&raw).unwrap();
            service.chain(&reg.handle).await.unwrap()
        }));
    }
    let mut chains = Vec::new();
    for j in joins {
        chains.push(j.await.unwrap());
    }

    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    for c in &chains[1..] {
        assert!(Arc::ptr_eq(&chains[0], c));
    }
    assert_eq!(chains[0].len(), 1);
}

#[tokio::test]
async fn store_failure_is_sticky_until_recomputed() {
    let (_ledger, store, service) = counting_setup();
    store.failing.store(true, Ordering::SeqCst);

    let raw = addr(1);
    let reg = service.register(&raw).unwrap();
    let err = service.fetch_page(&reg.handle, &[]).await.unwrap_err();
    assert_eq!(err.kind(), "ServerError");
    assert!(err.to_string().contains("store offline"));

    store.failing.store(false, Ordering::SeqCst);
    // Still failed: no automatic retry, re-registering reuses the entry.
    service.register(&raw).unwrap();
    assert_eq!(
        service.fetch_status(&reg.handle).await.unwrap_err().kind(),
        "ServerError"
    );
    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

    assert!(service.recompute(&raw).unwrap());
    assert!(service.fetch_page(&reg.handle, &[]).await.is_ok());
    assert!(!service.recompute(&raw).unwrap());
}

#[tokio::test]
async fn fetch_failure_after_build_is_server_error() {
    let (ledger, store, service) = counting_setup();
    ledger.connect_block(vec![pay(acct(1), 5, 0)], 10).unwrap();
    let reg = service.register(&addr(1)).unwrap();
    service.chain(&reg.handle).await.unwrap();

    store.failing.store(true, Ordering::SeqCst);
    assert_eq!(
        service.fetch_page(&reg.handle, &[]).await.unwrap_err().kind(),
        "ServerError"
    );
    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(service.fetch_page(&reg.handle, &[]).await.unwrap().txs.len(), 1);
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paging_with_locators_covers_chain_once() {
    let (ledger, service) = setup(ServiceConfig {
        page_limit: 3,
        ..ServiceConfig::default()
    });
    let mut expected = Vec::new();
    for i in 0..10u64 {
        let tx = pay(acct(1), 1, i);
        expected.push(tx.txid().unwrap());
        ledger.connect_block(vec![tx], i).unwrap();
    }
    let reg = service.register(&addr(1)).unwrap();

    let mut seen = Vec::new();
    let mut locator: Vec<TxId> = Vec::new();
    loop {
        let page = service.fetch_page(&reg.handle, &locator).await.unwrap();
        assert!(page.txs.len() <= 3);
        if page.txs.is_empty() {
            break;
        }
        locator = page.txs.iter().map(|t| t.hash).collect();
        seen.extend(locator.iter().copied());
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn paging_with_top_as_locator_has_no_duplicates() {
    let (ledger, service) = setup(ServiceConfig {
        page_limit: 2,
        ..ServiceConfig::default()
    });
    let mut expected = Vec::new();
    for i in 0..4u64 {
        let tx = pay(acct(1), 1, i);
        expected.push(tx.txid().unwrap());
        ledger.connect_block(vec![tx], i).unwrap();
    }
    let reg = service.register(&addr(1)).unwrap();

    let first = service.fetch_page(&reg.handle, &[]).await.unwrap();
    let second = service.fetch_page(&reg.handle, &[first.top]).await.unwrap();
    let seen: Vec<TxId> = first.txs.iter().chain(&second.txs).map(|t| t.hash).collect();
    assert_eq!(seen, expected);

    let caught_up = service.fetch_page(&reg.handle, &[second.top]).await.unwrap();
    assert!(caught_up.txs.is_empty());
    assert_eq!(caught_up.top, second.top);
    assert_eq!(second.top, second.txs[1].chain_hash.unwrap());
}

#[tokio::test]
async fn unmatched_locator_restarts_from_beginning() {
    let (ledger, service) = setup(ServiceConfig::default());
    ledger.connect_block(vec![pay(acct(1), 1, 0)], 1).unwrap();
    let reg = service.register(&addr(1)).unwrap();
    let page = service
        .fetch_page(&reg.handle, &[Hash256([0xEE; 32])])
        .await
        .unwrap();
    assert_eq!(page.txs.len(), 1);
}

// ---------------------------------------------------------------------------
// Live updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_blocks_extend_cached_chain() {
    let (ledger, service) = setup(ServiceConfig::default());
    let first = pay(acct(1), 1, 0);
    let first_id = first.txid().unwrap();
    ledger.connect_block(vec![first], 1).unwrap();

    let reg = service.register(&addr(1)).unwrap();
    let data = service.chain(&reg.handle).await.unwrap();
    assert!(data.is_live());

    let next = pay(acct(1), 2, 1);
    let next_id = next.txid().unwrap();
    ledger.connect_block(vec![next], 2).unwrap();
    wait_until(|| data.len() == 2).await;

    let page = service.fetch_page(&reg.handle, &[first_id]).await.unwrap();
    assert_eq!(page.txs.len(), 1);
    assert_eq!(page.txs[0].hash, next_id);
    assert_eq!(page.txs[0].chain_hash, Some(link(&first_id, &next_id)));
    assert_eq!(page.top, link(&first_id, &next_id));
}

#[tokio::test]
async fn zero_history_account_picks_up_later_activity() {
    let (ledger, service) = setup(ServiceConfig::default());
    let reg = service.register(&addr(7)).unwrap();
    let data = service.chain(&reg.handle).await.unwrap();

    let tx = pay(acct(7), 3, 0);
    let txid = tx.txid().unwrap();
    ledger.connect_block(vec![tx], 5).unwrap();
    wait_until(|| data.len() == 1).await;
    assert_eq!(data.top(), txid);
}

#[tokio::test]
async fn transaction_touching_two_accounts_is_appended_once() {
    let (ledger, service) = setup(ServiceConfig::default());
    let fund = pay(acct(1), 50, 0);
    let fund_id = fund.txid().unwrap();
    ledger.connect_block(vec![fund], 1).unwrap();

    let reg = service.register(&format!("{},{}", addr(1), addr(2))).unwrap();
    let data = service.chain(&reg.handle).await.unwrap();
    let mut events = data.subscribe();

    ledger.connect_block(vec![spend(fund_id, acct(2), 1)], 2).unwrap();
    wait_until(|| data.len() == 2).await;
    // Both accounts were notified; only one delta is emitted.
    events.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(data.len(), 2);
}

#[tokio::test]
async fn revocation_marks_entry_and_relinks() {
    let (ledger, service) = setup(ServiceConfig::default());
    let txs: Vec<Transaction> = (0..3).map(|i| pay(acct(1), 1, i)).collect();
    let ids: Vec<TxId> = txs.iter().map(|t| t.txid().unwrap()).collect();
    for (i, tx) in txs.into_iter().enumerate() {
        ledger.connect_block(vec![tx], i as u64).unwrap();
    }
    let reg = service.register(&addr(1)).unwrap();
    let data = service.chain(&reg.handle).await.unwrap();

    ledger.revoke_transaction(&ids[1]).unwrap();
    wait_until(|| data.entries()[1].revoked).await;

    let page = service.fetch_page(&reg.handle, &[]).await.unwrap();
    assert_eq!(page.txs.len(), 3);
    assert!(page.txs[1].revoked);
    assert_eq!(page.txs[2].chain_hash, Some(link(&ids[0], &ids[2])));
    assert_eq!(page.top, link(&ids[0], &ids[2]));
}

// ---------------------------------------------------------------------------
// Unconfirmed, block status, relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unconfirmed_transactions_are_served_separately() {
    let (ledger, service) = setup(ServiceConfig::default());
    let reg = service.register(&addr(1)).unwrap();
    let txid = ledger.add_unconfirmed(pay(acct(1), 4, 9), 1_234).unwrap();
    ledger.add_unconfirmed(pay(acct(2), 4, 10), 1_235).unwrap();

    let pending = service.fetch_unconfirmed(&reg.handle).await.unwrap();
    assert_eq!(pending.txs.len(), 1);
    assert_eq!(pending.txs[0].hash, txid);
    assert_eq!(pending.txs[0].timestamp, Some(1_234));
    assert!(pending.txs[0].chain_hash.is_none());

    // Unconfirmed transactions never enter the chain.
    assert!(service.fetch_page(&reg.handle, &[]).await.unwrap().txs.is_empty());
}

#[tokio::test]
async fn block_status_reports_tip() {
    let (ledger, service) = setup(ServiceConfig::default());
    let info = ledger.connect_block(vec![], 42).unwrap();
    let status = service.block_status().await.unwrap();
    assert_eq!(status.hash, info.hash);
    assert_eq!(status.height, 1);
}

#[tokio::test]
async fn send_transaction_relays_to_mempool() {
    let (ledger, service) = setup(ServiceConfig::default());
    let tx = pay(acct(1), 9, 77);
    let expected = tx.txid().unwrap();
    let sent = service.send_transaction(&tx.to_hex().unwrap()).await.unwrap();
    assert_eq!(sent.txid, expected);
    assert_eq!(ledger.mempool_len(), 1);

    let err = service.send_transaction("zz").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidTransaction");
}
