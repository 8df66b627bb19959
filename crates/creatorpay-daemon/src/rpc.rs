//! JSON-RPC server over Unix socket.
//!
//! Listens on a Unix domain socket, accepts connections, and dispatches
//! newline-delimited JSON-RPC 2.0 calls to the command handlers. A
//! connection that calls `subscribe_events` additionally receives matching
//! daemon events as `event` notifications until it unsubscribes.

use std::path::PathBuf;
use std::sync::Arc;

use creatorpay_ledger::LedgerError;
use creatorpay_payout::PayoutError;
use creatorpay_referral::ReferralError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::events::{Event, EventFilter};
use crate::DaemonState;

/// JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request ID.
    pub id: serde_json::Value,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    /// JSON-RPC version.
    pub jsonrpc: String,
    /// Request ID.
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Server-initiated message without an id.
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RpcError {
    /// Stable error code.
    pub code: i32,
    /// Error name.
    pub message: String,
    /// Optional structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: serde_json::Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl RpcNotification {
    pub fn event(event: &Event) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "event".to_string(),
            params: serde_json::json!(event),
        }
    }
}

impl RpcError {
    fn new(code: i32, message: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data,
        }
    }

    fn detail(code: i32, message: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(code, message, Some(serde_json::json!({ "detail": detail.to_string() })))
    }

    // Standard JSON-RPC errors

    /// Parse error (-32700).
    pub fn parse_error() -> Self {
        Self::new(-32700, "PARSE_ERROR", None)
    }

    /// Invalid request (-32600).
    pub fn invalid_request() -> Self {
        Self::new(-32600, "INVALID_REQUEST", None)
    }

    /// Method not found (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, "METHOD_NOT_FOUND", Some(serde_json::json!({ "method": method })))
    }

    /// Invalid params (-32602).
    pub fn invalid_params(detail: &str) -> Self {
        Self::detail(-32602, "INVALID_PARAMS", detail)
    }

    /// Internal error (-32603).
    pub fn internal_error(detail: &str) -> Self {
        Self::detail(-32603, "INTERNAL_ERROR", detail)
    }

    // Domain errors

    /// Input rejected by the engine (-32020).
    pub fn validation(detail: impl std::fmt::Display) -> Self {
        Self::detail(-32020, "VALIDATION_FAILED", detail)
    }

    /// Unknown entity (-32021).
    pub fn not_found(detail: impl std::fmt::Display) -> Self {
        Self::detail(-32021, "NOT_FOUND", detail)
    }

    /// Another writer held the ledger too long (-32030).
    pub fn concurrency_conflict(attempts: u32) -> Self {
        Self::new(-32030, "CONCURRENCY_CONFLICT", Some(serde_json::json!({ "attempts": attempts })))
    }

    /// Ledger disagrees with itself; the creator is frozen (-32031).
    pub fn ledger_inconsistency(creator_id: &str, detail: &str) -> Self {
        Self::new(
            -32031,
            "LEDGER_INCONSISTENCY",
            Some(serde_json::json!({ "creator_id": creator_id, "detail": detail })),
        )
    }

    /// Requested more than is available (-32040).
    pub fn insufficient_balance(requested: impl std::fmt::Display, available: impl std::fmt::Display) -> Self {
        Self::new(
            -32040,
            "INSUFFICIENT_BALANCE",
            Some(serde_json::json!({
                "requested": requested.to_string(),
                "available": available.to_string(),
            })),
        )
    }

    /// Under the minimum payout (-32041).
    pub fn below_minimum(requested: impl std::fmt::Display, minimum: impl std::fmt::Display) -> Self {
        Self::new(
            -32041,
            "BELOW_MINIMUM",
            Some(serde_json::json!({
                "requested": requested.to_string(),
                "minimum": minimum.to_string(),
            })),
        )
    }

    /// Balance dropped between submission and approval (-32042).
    pub fn stale_balance(requested: impl std::fmt::Display, available: impl std::fmt::Display) -> Self {
        Self::new(
            -32042,
            "STALE_BALANCE",
            Some(serde_json::json!({
                "requested": requested.to_string(),
                "available": available.to_string(),
            })),
        )
    }

    /// The creator already has an open payout (-32043).
    pub fn active_request_exists(creator_id: &str) -> Self {
        Self::new(
            -32043,
            "ACTIVE_REQUEST_EXISTS",
            Some(serde_json::json!({ "creator_id": creator_id })),
        )
    }

    /// Operation not allowed in the request's status (-32044).
    pub fn invalid_transition(detail: impl std::fmt::Display) -> Self {
        Self::detail(-32044, "INVALID_TRANSITION", detail)
    }

    /// Payouts are halted for the creator (-32045).
    pub fn creator_frozen(creator_id: &str, reason: &str) -> Self {
        Self::new(
            -32045,
            "CREATOR_FROZEN",
            Some(serde_json::json!({ "creator_id": creator_id, "reason": reason })),
        )
    }

    /// The payment gateway refused the transfer (-32046).
    pub fn settlement_failure(class: &str, reason: &str) -> Self {
        Self::new(
            -32046,
            "EXTERNAL_SETTLEMENT_FAILURE",
            Some(serde_json::json!({ "class": class, "reason": reason })),
        )
    }
}

impl From<PayoutError> for RpcError {
    fn from(err: PayoutError) -> Self {
        match err {
            PayoutError::Validation(detail) => Self::validation(detail),
            PayoutError::InsufficientBalance { requested, available } => {
                Self::insufficient_balance(requested, available)
            }
            PayoutError::BelowMinimum { requested, minimum } => Self::below_minimum(requested, minimum),
            PayoutError::StaleBalance { requested, available } => {
                Self::stale_balance(requested, available)
            }
            PayoutError::ActiveRequestExists { creator_id } => {
                Self::active_request_exists(creator_id.as_str())
            }
            PayoutError::ConcurrencyConflict { attempts }
            | PayoutError::Db(creatorpay_db::DbError::Busy { attempts }) => {
                Self::concurrency_conflict(attempts)
            }
            PayoutError::ExternalSettlementFailure { class, reason } => {
                let class = match class {
                    creatorpay_payout::FailureClass::Transient => "transient",
                    creatorpay_payout::FailureClass::Permanent => "permanent",
                };
                Self::settlement_failure(class, &reason)
            }
            PayoutError::LedgerInconsistency { creator_id, detail } => {
                Self::ledger_inconsistency(creator_id.as_str(), &detail)
            }
            PayoutError::CreatorFrozen { creator_id, reason } => {
                Self::creator_frozen(creator_id.as_str(), &reason)
            }
            e @ PayoutError::InvalidTransition { .. } => Self::invalid_transition(e),
            PayoutError::NotFound(detail) => Self::not_found(detail),
            PayoutError::Ledger(e) => e.into(),
            e => Self::internal_error(&e.to_string()),
        }
    }
}

impl From<LedgerError> for RpcError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(detail) => Self::validation(detail),
            LedgerError::LedgerInconsistency { creator_id, detail } => {
                Self::ledger_inconsistency(creator_id.as_str(), &detail)
            }
            LedgerError::ConcurrencyConflict { attempts }
            | LedgerError::Db(creatorpay_db::DbError::Busy { attempts }) => {
                Self::concurrency_conflict(attempts)
            }
            LedgerError::Commission(e) => Self::validation(e),
            LedgerError::Referral(e) => e.into(),
            LedgerError::Db(creatorpay_db::DbError::NotFound(detail)) => Self::not_found(detail),
            e => Self::internal_error(&e.to_string()),
        }
    }
}

impl From<ReferralError> for RpcError {
    fn from(err: ReferralError) -> Self {
        match err {
            ReferralError::Validation(detail) | ReferralError::Configuration(detail) => {
                Self::validation(detail)
            }
            ReferralError::NotFound(detail) => Self::not_found(detail),
            ReferralError::Db(creatorpay_db::DbError::NotFound(detail)) => Self::not_found(detail),
            e => Self::internal_error(&e.to_string()),
        }
    }
}

/// The RPC server.
pub struct RpcServer {
    state: Arc<DaemonState>,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(state: Arc<DaemonState>, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    /// Run the server, accepting connections.
    pub async fn run(&self) -> anyhow::Result<()> {
        // Remove stale socket file
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPC server listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

enum Step {
    Line(usize),
    Event(Result<Event, RecvError>),
}

/// Handle a single client connection.
async fn handle_connection(
    state: Arc<DaemonState>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut subscription: Option<Subscription> = None;

    loop {
        // `read_line` keeps partial input in `line` when the event branch
        // wins, so the buffer is only cleared after a full request.
        let step = match subscription.as_mut() {
            None => Step::Line(reader.read_line(&mut line).await?),
            Some(sub) => tokio::select! {
                read = reader.read_line(&mut line) => Step::Line(read?),
                received = sub.receiver.recv() => Step::Event(received),
            },
        };

        match step {
            Step::Line(0) => break,
            Step::Line(_) => {}
            Step::Event(Ok(event)) => {
                if subscription.as_ref().is_some_and(|sub| sub.filter.matches(&event)) {
                    write_message(&mut writer, &RpcNotification::event(&event)).await?;
                }
                continue;
            }
            Step::Event(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "event subscriber lagged");
                continue;
            }
            Step::Event(Err(RecvError::Closed)) => {
                subscription = None;
                continue;
            }
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) if request.jsonrpc != "2.0" => {
                RpcResponse::error(request.id, RpcError::invalid_request())
            }
            Ok(request) => match request.method.as_str() {
                "subscribe_events" => {
                    let filter = if request.params.is_null() {
                        Ok(EventFilter::default())
                    } else {
                        serde_json::from_value::<EventFilter>(request.params.clone())
                    };
                    match filter {
                        Ok(filter) => {
                            subscription = Some(Subscription {
                                receiver: state.event_bus.subscribe(),
                                filter,
                            });
                            RpcResponse::success(request.id, serde_json::json!({ "subscribed": true }))
                        }
                        Err(e) => RpcResponse::error(request.id, RpcError::invalid_params(&e.to_string())),
                    }
                }
                "unsubscribe_events" => {
                    let was_subscribed = subscription.take().is_some();
                    RpcResponse::success(
                        request.id,
                        serde_json::json!({ "unsubscribed": was_subscribed }),
                    )
                }
                _ => dispatch_request(state.clone(), request).await,
            },
            Err(_) => RpcResponse::error(serde_json::Value::Null, RpcError::parse_error()),
        };
        line.clear();

        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Dispatch a JSON-RPC request to the appropriate command handler.
pub async fn dispatch_request(state: Arc<DaemonState>, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    let method = request.method.as_str();
    let params = &request.params;

    debug!("Dispatching RPC method: {}", method);

    let result = match method {
        // Ledger
        "post_event" => commands::ledger::post_event(&state, params).await,
        "get_balance" => commands::ledger::get_balance(&state, params).await,
        "list_entries" => commands::ledger::list_entries(&state, params).await,
        "append_correction" => commands::ledger::append_correction(&state, params).await,
        "sum_entries" => commands::ledger::sum_entries(&state, params).await,
        "reconcile_ledger" => commands::ledger::reconcile_ledger(&state, params).await,
        "list_anomalies" => commands::ledger::list_anomalies(&state, params).await,
        "unfreeze_creator" => commands::ledger::unfreeze_creator(&state, params).await,

        // Payouts
        "submit_payout" => commands::payout::submit_payout(&state, params).await,
        "decide_payout" => commands::payout::decide_payout(&state, params).await,
        "dispatch_payout" => commands::payout::dispatch_payout(&state, params).await,
        "settle_payout" => commands::payout::settle_payout(&state, params).await,
        "cancel_payout" => commands::payout::cancel_payout(&state, params).await,
        "get_payout" => commands::payout::get_payout(&state, params).await,
        "list_payouts" => commands::payout::list_payouts(&state, params).await,
        "get_payout_audit" => commands::payout::get_payout_audit(&state, params).await,
        "reconcile_stale_payouts" => commands::payout::reconcile_stale_payouts(&state).await,

        // Referrals
        "register_referral_code" => commands::referral::register_referral_code(&state, params).await,
        "generate_referral_code" => commands::referral::generate_referral_code(&state, params).await,
        "bind_referral" => commands::referral::bind_referral(&state, params).await,
        "resolve_referrer" => commands::referral::resolve_referrer(&state, params).await,
        "effective_tier" => commands::referral::effective_tier(&state, params).await,
        "referrer_stats" => commands::referral::referrer_stats(&state, params).await,
        "set_account_active" => commands::referral::set_account_active(&state, params).await,
        "get_referral_tiers" => commands::referral::get_referral_tiers(&state).await,
        "set_referral_tiers" => commands::referral::set_referral_tiers(&state, params).await,
        "upsert_bonus_rule" => commands::referral::upsert_bonus_rule(&state, params).await,
        "list_bonus_rules" => commands::referral::list_bonus_rules(&state).await,

        // Daemon
        "get_daemon_status" => Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "events_emitted": state.event_bus.sequence(),
        })),
        "shutdown" => {
            let _ = state.shutdown_tx.send(());
            Ok(serde_json::json!({ "stopping": true }))
        }

        _ => Err(RpcError::method_not_found(method)),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(err) => RpcResponse::error(id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use creatorpay_types::UserId;
    use rust_decimal_macros::dec;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixStream;

    fn request(method: &str, params: serde_json::Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: serde_json::json!(1),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_rpc_error_codes() {
        let err = RpcError::insufficient_balance(dec!(20), dec!(12.50));
        assert_eq!(err.code, -32040);
        assert_eq!(
            err.data,
            Some(serde_json::json!({"requested": "20", "available": "12.50"}))
        );

        let err = RpcError::from(PayoutError::ActiveRequestExists {
            creator_id: UserId::from("c1"),
        });
        assert_eq!(err.code, -32043);
        assert_eq!(err.message, "ACTIVE_REQUEST_EXISTS");

        let err = RpcError::from(PayoutError::NotFound("payout request 9".to_string()));
        assert_eq!(err.code, -32021);

        let busy = RpcError::from(PayoutError::Db(creatorpay_db::DbError::Busy { attempts: 4 }));
        assert_eq!(busy.code, RpcError::concurrency_conflict(4).code);

        let err = RpcError::method_not_found("unknown");
        assert_eq!(err.code, -32601);
    }

    #[test]
    fn test_rpc_response_shapes() {
        let ok = RpcResponse::success(serde_json::json!(1), serde_json::json!({"available": "1"}));
        let json = serde_json::to_value(&ok).expect("serialize");
        assert!(json.get("result").is_some());
        assert!(json.get("error").is_none());

        let err = RpcResponse::error(serde_json::json!(1), RpcError::internal_error("test"));
        let json = serde_json::to_value(&err).expect("serialize");
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let state = test_support::state();
        let response = dispatch_request(state, request("mint_money", serde_json::json!({}))).await;
        assert_eq!(response.error.map(|e| e.code), Some(-32601));
    }

    #[tokio::test]
    async fn test_socket_round_trip_with_events() {
        let state = test_support::state();
        let socket_path = std::env::temp_dir().join(format!(
            "creatorpay-rpc-test-{}.sock",
            std::process::id()
        ));
        let server = RpcServer::new(state.clone(), socket_path.clone());
        let server_task = tokio::spawn(async move { server.run().await });

        let mut stream = None;
        for _ in 0..50 {
            match UnixStream::connect(&socket_path).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let (reader, mut writer) = stream.expect("connect").into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"subscribe_events\",\"params\":{\"categories\":[\"ledger\"]}}\n")
            .await
            .expect("write");
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");
        assert_eq!(reply["result"]["subscribed"], true);

        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"post_event\",\"params\":{\"source\":\"tip\",\"gross_amount\":\"100.00\",\"creator_id\":\"c1\",\"occurred_at\":5}}\n")
            .await
            .expect("write");

        // The notification and the response may arrive in either order.
        let mut saw_event = false;
        let mut saw_response = false;
        for _ in 0..2 {
            let message: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.expect("read").expect("line"))
                    .expect("json");
            if message["method"] == "event" {
                assert_eq!(message["params"]["event_type"], "RevenuePosted");
                saw_event = true;
            } else {
                assert_eq!(message["id"], 2);
                assert_eq!(message["result"]["entry_ids"].as_array().map(Vec::len), Some(1));
                saw_response = true;
            }
        }
        assert!(saw_event && saw_response);

        writer.write_all(b"not json\n").await.expect("write");
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");
        assert_eq!(reply["error"]["code"], -32700);

        server_task.abort();
        let _ = std::fs::remove_file(&socket_path);
    }
}
