//! IPC command handlers.
//!
//! Each submodule implements the commands for one RPC category. The engine
//! is synchronous and may wait on SQLite locks, so every handler runs its
//! engine calls on the blocking pool through [`blocking`].

pub mod ledger;
pub mod payout;
pub mod referral;

use std::sync::{Arc, MutexGuard};

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::RpcError;
use crate::DaemonState;

pub(crate) type Result = std::result::Result<Value, RpcError>;

/// Deserialize handler params, mapping failures to INVALID_PARAMS.
pub(crate) fn parse<T: DeserializeOwned>(params: &Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params.clone()).map_err(|e| RpcError::invalid_params(&e.to_string()))
}

/// Run engine work on the blocking pool.
pub(crate) async fn blocking<T, F>(state: &Arc<DaemonState>, work: F) -> std::result::Result<T, RpcError>
where
    F: FnOnce(&DaemonState) -> std::result::Result<T, RpcError> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || work(&state))
        .await
        .map_err(|e| RpcError::internal_error(&format!("worker failed: {e}")))?
}

/// Lock the shared connection for calls that take it explicitly.
pub(crate) fn lock(state: &DaemonState) -> std::result::Result<MutexGuard<'_, Connection>, RpcError> {
    state
        .conn
        .lock()
        .map_err(|_| RpcError::internal_error("database connection lock poisoned"))
}
