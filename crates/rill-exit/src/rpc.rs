//! JSON-RPC server for the exit node.
//!
//! Uses jsonrpsee 0.24. Request methods map one to one onto
//! [`AccountChainService`]; `pubkeys_listen` opens a live session and
//! streams its push messages as `pubkeys_event` notifications, starting with
//! the first page of transactions.

use std::sync::Arc;

use jsonrpsee::core::{async_trait, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{PendingSubscriptionSink, SubscriptionMessage};
use serde::Serialize;
use tracing::debug;

use crate::error::ExitError;
use crate::service::{
    AccountChainService, BlockStatus, ChainStatus, Registration, SentTransaction, TxPage,
    UnconfirmedTxs,
};
use crate::types::{Handle, Hash256, TxId};

pub const INVALID_KEYS: i32 = -32001;
pub const NO_KEYS: i32 = -32002;
pub const UNKNOWN_HANDLE: i32 = -32003;
pub const SERVER_ERROR: i32 = -32004;
pub const INVALID_TRANSACTION: i32 = -32005;
pub const INVALID_PARAMS: i32 = -32602;

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Map a service error. The error kind travels in `data`.
pub fn exit_error(err: ExitError) -> ErrorObjectOwned {
    let code = match err {
        ExitError::InvalidKeys(_) => INVALID_KEYS,
        ExitError::NoKeys => NO_KEYS,
        ExitError::UnknownHandle(_) => UNKNOWN_HANDLE,
        ExitError::ServerError(_) => SERVER_ERROR,
        ExitError::InvalidTransaction(_) => INVALID_TRANSACTION,
    };
    ErrorObjectOwned::owned(code, err.to_string(), Some(err.kind()))
}

/// Parse the hex txids of a transaction locator.
pub fn parse_locator(locator: Option<Vec<String>>) -> Result<Vec<TxId>, ErrorObjectOwned> {
    locator
        .unwrap_or_default()
        .iter()
        .map(|h| {
            Hash256::from_hex(h)
                .ok_or_else(|| rpc_error(INVALID_PARAMS, &format!("invalid locator hash '{h}'")))
        })
        .collect()
}

/// First notification of a listen subscription.
#[derive(Serialize)]
struct PageMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    handle: &'a Handle,
    #[serde(flatten)]
    page: &'a TxPage,
}

/// The exit node JSON-RPC interface.
#[rpc(server)]
pub trait ExitRpc {
    /// Register a comma-separated set of addresses or account ids.
    #[method(name = "pubkeys_register")]
    async fn register(&self, keys: String) -> Result<Registration, ErrorObjectOwned>;

    /// Confirmed transactions after the given locator.
    #[method(name = "pubkeys_gettxs")]
    async fn get_txs(
        &self,
        handle: String,
        tx_locator: Option<Vec<String>>,
    ) -> Result<TxPage, ErrorObjectOwned>;

    #[method(name = "pubkeys_getunconfirmedtxs")]
    async fn get_unconfirmed_txs(&self, handle: String) -> Result<UnconfirmedTxs, ErrorObjectOwned>;

    #[method(name = "pubkeys_getinfo")]
    async fn get_info(&self, handle: String) -> Result<ChainStatus, ErrorObjectOwned>;

    /// Current top block.
    #[method(name = "block_status")]
    async fn block_status(&self) -> Result<BlockStatus, ErrorObjectOwned>;

    /// Relay a hex-encoded transaction.
    #[method(name = "tx_send")]
    async fn send_transaction(&self, tx: String) -> Result<SentTransaction, ErrorObjectOwned>;

    /// Stream live events for a registered handle.
    #[subscription(name = "pubkeys_listen" => "pubkeys_event", unsubscribe = "pubkeys_unlisten", item = serde_json::Value)]
    async fn listen(&self, handle: String, tx_locator: Option<Vec<String>>) -> SubscriptionResult;
}

/// Implementation of the exit node RPC server.
pub struct RpcServerImpl {
    service: Arc<AccountChainService>,
}

impl RpcServerImpl {
    pub fn new(service: Arc<AccountChainService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ExitRpcServer for RpcServerImpl {
    async fn register(&self, keys: String) -> Result<Registration, ErrorObjectOwned> {
        self.service.register(&keys).map_err(exit_error)
    }

    async fn get_txs(
        &self,
        handle: String,
        tx_locator: Option<Vec<String>>,
    ) -> Result<TxPage, ErrorObjectOwned> {
        let locator = parse_locator(tx_locator)?;
        self.service
            .fetch_page(&Handle::from(handle), &locator)
            .await
            .map_err(exit_error)
    }

    async fn get_unconfirmed_txs(&self, handle: String) -> Result<UnconfirmedTxs, ErrorObjectOwned> {
        self.service
            .fetch_unconfirmed(&Handle::from(handle))
            .await
            .map_err(exit_error)
    }

    async fn get_info(&self, handle: String) -> Result<ChainStatus, ErrorObjectOwned> {
        self.service
            .fetch_status(&Handle::from(handle))
            .await
            .map_err(exit_error)
    }

    async fn block_status(&self) -> Result<BlockStatus, ErrorObjectOwned> {
        self.service.block_status().await.map_err(exit_error)
    }

    async fn send_transaction(&self, tx: String) -> Result<SentTransaction, ErrorObjectOwned> {
        self.service.send_transaction(&tx).await.map_err(exit_error)
    }

    async fn listen(
        &self,
        pending: PendingSubscriptionSink,
        handle: String,
        tx_locator: Option<Vec<String>>,
    ) -> SubscriptionResult {
        let locator = match parse_locator(tx_locator) {
            Ok(locator) => locator,
            Err(e) => {
                pending.reject(e).await;
                return Ok(());
            }
        };
        let handle = Handle::from(handle);
        let (session, mut events) = self.service.open_session();
        let page = match self.service.listen(&session, &handle, &locator).await {
            Ok(page) => page,
            Err(e) => {
                pending.reject(exit_error(e)).await;
                return Ok(());
            }
        };

        let sink = pending.accept().await?;
        let first = PageMessage {
            kind: "page",
            handle: &handle,
            page: &page,
        };
        sink.send(SubscriptionMessage::from_json(&first)?).await?;

        loop {
            tokio::select! {
                _ = sink.closed() => break,
                msg = events.recv() => {
                    let Some(msg) = msg else { break };
                    sink.send(SubscriptionMessage::from_json(&msg)?).await?;
                }
            }
        }
        debug!(session = session.id(), handle = %handle, "listen subscription ended");
        Ok(())
    }
}

/// Start the JSON-RPC server on `addr`.
pub async fn start_rpc_server(
    addr: &str,
    service: Arc<AccountChainService>,
) -> std::io::Result<ServerHandle> {
    let server = Server::builder().build(addr).await?;

    let rpc_impl = RpcServerImpl::new(service);
    Ok(server.start(rpc_impl.into_rpc()))
}
