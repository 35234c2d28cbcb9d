//! `rippled` WebSocket API client
//!
//! One session at a time. A reader task routes responses to waiting requests
//! by `id` and turns `ledgerClosed` stream messages into ledger fetches; a
//! fetcher task loads each closed ledger in arrival order and emits it as a
//! [`NetworkSignal::LedgerClosed`].

use super::{classify_engine_result, LedgerClient, NetworkSignal, SubmitOutcome};
use crate::{
    types::{AccountAddress, ClosedLedger, LedgerTransaction, SignedBlob, TxHash},
    Error, Result,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Response to a command
#[derive(Debug)]
enum RpcResponse {
    Success(Value),
    Failure { error: String, message: Option<String> },
}

impl RpcResponse {
    fn from_message(message: &Value) -> Self {
        if message.get("status").and_then(Value::as_str) == Some("success") {
            return RpcResponse::Success(message.get("result").cloned().unwrap_or(Value::Null));
        }

        RpcResponse::Failure {
            error: message
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: message
                .get("error_message")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn into_result(self, command: &str) -> Result<Value> {
        match self {
            RpcResponse::Success(result) => Ok(result),
            RpcResponse::Failure { error, message } => Err(Error::Network(format!(
                "{} failed: {} {}",
                command,
                error,
                message.unwrap_or_default()
            ))),
        }
    }
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Request/response correlation over one session
#[derive(Clone)]
struct RequestChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingRequests,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl RequestChannel {
    async fn call(&self, mut command: Value) -> Result<RpcResponse> {
        let name = command
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        command["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self
            .outgoing
            .send(Message::Text(command.to_string().into()))
            .is_err()
        {
            self.pending.lock().remove(&id);
            return Err(Error::NotConnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Network(format!("Session closed during {}", name))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout {
                    seconds: self.timeout.as_secs(),
                    operation: name,
                })
            }
        }
    }
}

struct Session {
    server: String,
    requests: RequestChannel,
    tasks: Vec<JoinHandle<()>>,
}

/// WebSocket client for `rippled` servers
pub struct WebSocketClient {
    request_timeout: Duration,
    next_id: Arc<AtomicU64>,
    session: Mutex<Option<Session>>,
}

impl WebSocketClient {
    /// Create a client with a per-request timeout
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
            session: Mutex::new(None),
        }
    }

    fn requests(&self) -> Result<RequestChannel> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.requests.clone())
            .ok_or(Error::NotConnected)
    }

    /// Read loop of one session
    async fn read_loop<S>(
        mut read: S,
        pending: PendingRequests,
        outgoing: mpsc::UnboundedSender<Message>,
        closed_ledgers: mpsc::UnboundedSender<u64>,
        signals: mpsc::Sender<NetworkSignal>,
    ) where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let end_signal = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message = match parse_message(text.as_str()) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring unparseable message");
                            continue;
                        }
                    };

                    if let Some(id) = message.get("id").and_then(Value::as_u64) {
                        if let Some(waiter) = pending.lock().remove(&id) {
                            let _ = waiter.send(RpcResponse::from_message(&message));
                        }
                        continue;
                    }

                    if message.get("type").and_then(Value::as_str) == Some("ledgerClosed") {
                        match message.get("ledger_index").and_then(json_u64) {
                            Some(ledger_index) => {
                                let _ = closed_ledgers.send(ledger_index);
                            }
                            None => tracing::warn!("ledgerClosed message without ledger_index"),
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = outgoing.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => break NetworkSignal::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => break NetworkSignal::Error(e.to_string()),
            }
        };

        // Fail outstanding requests
        pending.lock().clear();
        let _ = signals.send(end_signal).await;
    }

    /// Loads closed ledgers one at a time, in announcement order
    async fn fetch_loop(
        requests: RequestChannel,
        mut closed_ledgers: mpsc::UnboundedReceiver<u64>,
        signals: mpsc::Sender<NetworkSignal>,
    ) {
        while let Some(ledger_index) = closed_ledgers.recv().await {
            match fetch_ledger_with(&requests, ledger_index).await {
                Ok(Some(ledger)) => {
                    if signals.send(NetworkSignal::LedgerClosed(ledger)).await.is_err() {
                        break;
                    }
                }
                // The manager backfills it when the next ledger arrives
                Ok(None) => tracing::warn!(ledger_index, "Closed ledger not available"),
                Err(e) => {
                    let _ = signals
                        .send(NetworkSignal::Error(format!(
                            "Failed to fetch ledger {}: {}",
                            ledger_index, e
                        )))
                        .await;
                    break;
                }
            }
        }
    }
}

impl Default for WebSocketClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl LedgerClient for WebSocketClient {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, server: &str, signals: mpsc::Sender<NetworkSignal>) -> Result<()> {
        self.disconnect().await;

        let (ws_stream, _) = tokio::time::timeout(self.request_timeout, connect_async(server))
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.request_timeout.as_secs(),
                operation: format!("connect {}", server),
            })??;

        let (mut write, read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel::<u64>();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        let requests = RequestChannel {
            outgoing: outgoing.clone(),
            pending: pending.clone(),
            next_id: self.next_id.clone(),
            timeout: self.request_timeout,
        };

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(Self::read_loop(
            read,
            pending,
            outgoing,
            closed_tx,
            signals.clone(),
        ));

        let fetcher = tokio::spawn(Self::fetch_loop(requests.clone(), closed_rx, signals));

        let mut session = Session {
            server: server.to_string(),
            requests,
            tasks: vec![reader, fetcher, writer],
        };

        let subscribed = session
            .requests
            .call(json!({ "command": "subscribe", "streams": ["ledger"] }))
            .await
            .and_then(|response| response.into_result("subscribe"));

        if let Err(e) = subscribed {
            for task in session.tasks.drain(..) {
                task.abort();
            }
            return Err(e);
        }

        tracing::debug!(server = %server, "Subscribed to ledger stream");
        *self.session.lock() = Some(session);
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = session.requests.outgoing.send(Message::Close(None));
            // Reader and fetcher stop here; the writer drains the close frame
            for task in session.tasks.iter().take(2) {
                task.abort();
            }
            tracing::debug!(server = %session.server, "Session closed");
        }
    }

    async fn submit(&self, blob: &SignedBlob) -> Result<SubmitOutcome> {
        let requests = self.requests()?;
        let result = requests
            .call(json!({ "command": "submit", "tx_blob": blob.to_hex() }))
            .await?
            .into_result("submit")?;

        let code = result
            .get("engine_result")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Network("submit response without engine_result".to_string()))?;

        Ok(classify_engine_result(code))
    }

    async fn fetch_ledger(&self, ledger_index: u64) -> Result<Option<ClosedLedger>> {
        let requests = self.requests()?;
        fetch_ledger_with(&requests, ledger_index).await
    }
}

async fn fetch_ledger_with(
    requests: &RequestChannel,
    ledger_index: u64,
) -> Result<Option<ClosedLedger>> {
    let response = requests
        .call(json!({
            "command": "ledger",
            "ledger_index": ledger_index,
            "transactions": true,
            "expand": true,
        }))
        .await?;

    match response {
        RpcResponse::Failure { error, .. } if error == "lgrNotFound" => Ok(None),
        other => parse_ledger(&other.into_result("ledger")?, ledger_index).map(Some),
    }
}

/// Numbers arrive either as JSON numbers or as decimal strings
fn parse_message(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

fn json_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn malformed(what: &str) -> Error {
    Error::Network(format!("Malformed ledger response: {}", what))
}

/// Parse the `result` of a `ledger` command
fn parse_ledger(result: &Value, requested_index: u64) -> Result<ClosedLedger> {
    let ledger = result.get("ledger").ok_or_else(|| malformed("missing ledger"))?;

    let ledger_index = ledger
        .get("ledger_index")
        .and_then(json_u64)
        .unwrap_or(requested_index);

    let ledger_hash = ledger
        .get("ledger_hash")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut transactions = ledger
        .get("transactions")
        .and_then(Value::as_array)
        .map(|txs| txs.iter().map(parse_transaction).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();

    transactions.sort_by_key(|tx| tx.transaction_index);

    Ok(ClosedLedger {
        ledger_index,
        ledger_hash,
        transactions,
    })
}

/// Parse one expanded transaction with its metadata
fn parse_transaction(tx: &Value) -> Result<LedgerTransaction> {
    let hash = tx
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("transaction without hash"))?;
    let hash = TxHash::parse(hash)?;

    let account = tx
        .get("Account")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("transaction without Account"))?;

    let meta = tx
        .get("metaData")
        .or_else(|| tx.get("meta"))
        .ok_or_else(|| malformed("transaction without metadata"))?;

    let transaction_index = meta
        .get("TransactionIndex")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("metadata without TransactionIndex"))?;

    let mut affected = BTreeSet::new();
    affected.insert(account.to_string());
    if let Some(destination) = tx.get("Destination").and_then(Value::as_str) {
        affected.insert(destination.to_string());
    }

    for node in meta
        .get("AffectedNodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(inner) = ["CreatedNode", "ModifiedNode", "DeletedNode"]
            .iter()
            .find_map(|kind| node.get(*kind))
        else {
            continue;
        };

        if inner.get("LedgerEntryType").and_then(Value::as_str) != Some("AccountRoot") {
            continue;
        }

        let node_account = ["FinalFields", "NewFields"]
            .iter()
            .find_map(|fields| inner.get(*fields)?.get("Account")?.as_str());
        if let Some(node_account) = node_account {
            affected.insert(node_account.to_string());
        }
    }

    Ok(LedgerTransaction {
        hash,
        transaction_index: u32::try_from(transaction_index)
            .map_err(|_| malformed("TransactionIndex out of range"))?,
        account: AccountAddress::new(account),
        sequence: tx
            .get("Sequence")
            .and_then(Value::as_u64)
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0),
        transaction_type: tx
            .get("TransactionType")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        result: meta
            .get("TransactionResult")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        affected_accounts: affected.into_iter().map(AccountAddress::new).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACC_A: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const ACC_B: &str = "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY";
    const ACC_C: &str = "rN7n7otQDd6FczFgLdSqtcsAUxDkw6fzRH";

    #[test]
    fn test_parse_message() {
        let message = parse_message(r#"{"type":"ledgerClosed","ledger_index":7}"#).unwrap();
        assert_eq!(message.get("ledger_index").and_then(json_u64), Some(7));
        assert!(matches!(parse_message("{not json"), Err(Error::Json(_))));
    }

    fn payment(hash_digit: char, index: u64) -> Value {
        json!({
            "hash": hash_digit.to_string().repeat(64),
            "Account": ACC_A,
            "Destination": ACC_B,
            "Sequence": 7,
            "TransactionType": "Payment",
            "metaData": {
                "TransactionIndex": index,
                "TransactionResult": "tesSUCCESS",
                "AffectedNodes": [
                    { "ModifiedNode": {
                        "LedgerEntryType": "AccountRoot",
                        "FinalFields": { "Account": ACC_C }
                    }},
                    { "ModifiedNode": {
                        "LedgerEntryType": "RippleState",
                        "FinalFields": { "Balance": "1" }
                    }}
                ]
            }
        })
    }

    #[test]
    fn test_parse_transaction() {
        let tx = parse_transaction(&payment('a', 3)).unwrap();
        assert_eq!(tx.hash.as_str(), "A".repeat(64));
        assert_eq!(tx.transaction_index, 3);
        assert_eq!(tx.sequence, 7);
        assert_eq!(tx.result, "tesSUCCESS");

        let affected: Vec<&str> = tx.affected_accounts.iter().map(|a| a.as_str()).collect();
        assert_eq!(affected.len(), 3);
        assert!(affected.contains(&ACC_A));
        assert!(affected.contains(&ACC_B));
        assert!(affected.contains(&ACC_C));
    }

    #[test]
    fn test_parse_ledger_sorts_by_index() {
        let result = json!({
            "ledger": {
                "ledger_index": "1000",
                "ledger_hash": "ABCD",
                "transactions": [payment('b', 5), payment('c', 1)]
            },
            "validated": true
        });

        let ledger = parse_ledger(&result, 1000).unwrap();
        assert_eq!(ledger.ledger_index, 1000);
        assert_eq!(ledger.ledger_hash.as_deref(), Some("ABCD"));
        let indices: Vec<u32> = ledger.transactions.iter().map(|t| t.transaction_index).collect();
        assert_eq!(indices, vec![1, 5]);
    }

    #[test]
    fn test_parse_transaction_requires_metadata() {
        let mut tx = payment('d', 0);
        tx.as_object_mut().unwrap().remove("metaData");
        assert!(parse_transaction(&tx).is_err());
    }

    #[test]
    fn test_rpc_response_classification() {
        let ok = RpcResponse::from_message(&json!({
            "id": 1, "status": "success", "result": { "engine_result": "tesSUCCESS" }
        }));
        assert!(matches!(ok, RpcResponse::Success(_)));

        let failed = RpcResponse::from_message(&json!({
            "id": 2, "status": "error", "error": "lgrNotFound", "error_message": "ledgerNotFound"
        }));
        match failed {
            RpcResponse::Failure { error, .. } => assert_eq!(error, "lgrNotFound"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_without_session() {
        let client = WebSocketClient::default();
        let blob = SignedBlob::from_bytes(vec![1]);
        assert!(matches!(client.submit(&blob).await, Err(Error::NotConnected)));
        assert!(matches!(client.fetch_ledger(1).await, Err(Error::NotConnected)));
        client.disconnect().await;
    }
}
