//! Connection manager for the ledger network
//!
//! A single dispatcher task owns the connection state machine and delivers
//! closed ledgers to subscribers; everything else talks to it through a
//! cloneable [`ConnectionManager`] handle.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   ┌────────────────────┐
//! │ ConnectionManager  │   │   session task     │
//! │ (Clone, façade)    │   │ connect + forward  │
//! └─────────┬──────────┘   └─────────┬──────────┘
//!           │                        │ Connected / Signal{epoch}
//!           │ mpsc::channel (bounded)│
//!           ▼                        ▼
//! ┌──────────────────────────────────────────────┐
//! │            Dispatcher (single task)          │
//! │  state machine, gap backfill, delivery       │
//! │  ──► RecordIngestor ──► SubmissionTracker    │
//! └──────┬─────────────────────────────┬─────────┘
//!        │ watch<ConnectionStatus>     │ broadcast<LifecycleEvent>
//!        ▼                             ▼
//! ```
//!
//! Every session carries an epoch. Messages from an older session are
//! dropped, so a torn-down session can never move the state machine.

use crate::{
    config::NetworkConfig,
    metrics::Metrics,
    network::{LedgerClient, NetworkSignal, SubmitOutcome},
    retry::RetryPolicy,
    types::{ClosedLedger, ConnectionState, ConnectionStatus, LedgerGap, SignedBlob},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Lifecycle notifications published by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Connection state changed
    StateChanged(ConnectionStatus),
    /// A ledger was delivered to every subscriber
    LedgerClosed {
        /// Ledger index
        ledger_index: u64,
    },
    /// Ledgers were missed
    GapDetected {
        /// First missing ledger
        from: u64,
        /// Last missing ledger
        to: u64,
        /// Whether every missing ledger was backfilled
        resolved: bool,
    },
}

/// Consumer of closed ledgers
#[async_trait]
pub trait LedgerSubscriber: Send + Sync {
    /// Subscriber name (for logs)
    fn name(&self) -> &str;

    /// Called once per ledger, in strictly increasing index order
    ///
    /// `gap` is set when ledgers before this one were missed and could not
    /// be backfilled.
    async fn on_ledger_closed(&self, ledger: &ClosedLedger, gap: Option<&LedgerGap>) -> Result<()>;

    /// Called on every transition into `Confirmed`
    async fn on_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Message sent to the dispatcher
enum DispatcherMessage {
    /// Open a session unless one is open or opening
    Connect {
        budget: Option<u32>,
        response: Option<oneshot::Sender<Result<()>>>,
    },

    /// Tear down the session and stop reconnecting
    Disconnect { response: oneshot::Sender<()> },

    /// Session task reached a server
    Connected { epoch: u64, server: String },

    /// Session task exhausted its budget
    ConnectFailed { epoch: u64, attempts: u32 },

    /// Signal from the network, tagged with its session
    Signal { epoch: u64, signal: NetworkSignal },

    /// Reconnect timer fired
    Reconnect { epoch: u64 },

    /// Stop the dispatcher
    Shutdown,
}

/// Handle to the connection dispatcher
#[derive(Clone)]
pub struct ConnectionManager {
    sender: mpsc::Sender<DispatcherMessage>,
    client: Arc<dyn LedgerClient>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<LifecycleEvent>,
    startup_budget: u32,
}

impl ConnectionManager {
    async fn send(&self, message: DispatcherMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::Concurrency("Dispatcher mailbox closed".to_string()))
    }

    /// Start connecting in the background; no-op if a session is open or opening
    pub async fn connect(&self) -> Result<()> {
        self.send(DispatcherMessage::Connect {
            budget: None,
            response: None,
        })
        .await
    }

    /// Connect with the startup retry budget and wait for a session
    ///
    /// Fails with [`Error::NoReachableServers`] once every server was tried
    /// `startup_retry_budget` times.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::Connect {
            budget: Some(self.startup_budget),
            response: Some(tx),
        })
        .await?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Tear down the session; disables automatic reconnection
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::Disconnect { response: tx })
            .await?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Status updates
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Connected or Confirmed
    pub fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    /// Lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Submit a signed blob over the current session
    pub async fn submit(&self, blob: &SignedBlob) -> Result<SubmitOutcome> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.client.submit(blob).await
    }

    /// Disconnect and stop the dispatcher
    pub async fn shutdown(&self) -> Result<()> {
        self.send(DispatcherMessage::Shutdown).await
    }
}

/// Connection state machine and ledger delivery (single task)
pub struct Dispatcher {
    config: NetworkConfig,
    client: Arc<dyn LedgerClient>,
    mailbox: mpsc::Receiver<DispatcherMessage>,
    mailbox_tx: mpsc::Sender<DispatcherMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<LifecycleEvent>,
    subscribers: Vec<Arc<dyn LedgerSubscriber>>,
    policy: RetryPolicy,
    metrics: Metrics,
    epoch: u64,
    want_connected: bool,
    consecutive_failures: u32,
    last_ledger_index: Option<u64>,
    session_task: Option<JoinHandle<()>>,
    session_budget: Option<u32>,
    startup_waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Create a connection manager and its (not yet running) dispatcher
///
/// `last_ledger_index` is the last ledger already processed, so that a gap
/// spanning a restart is detected.
pub fn channel(
    config: &NetworkConfig,
    client: Arc<dyn LedgerClient>,
    metrics: Metrics,
    last_ledger_index: Option<u64>,
) -> (ConnectionManager, Dispatcher) {
    let (mailbox_tx, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(ConnectionStatus {
        last_ledger_index,
        ..ConnectionStatus::default()
    });

    let manager = ConnectionManager {
        sender: mailbox_tx.clone(),
        client: client.clone(),
        status: status_rx,
        events: events.clone(),
        startup_budget: config.startup_retry_budget.max(1),
    };

    let dispatcher = Dispatcher {
        config: config.clone(),
        client,
        mailbox,
        mailbox_tx,
        status_tx,
        events,
        subscribers: Vec::new(),
        policy: RetryPolicy::from_config(config),
        metrics,
        epoch: 0,
        want_connected: false,
        consecutive_failures: 0,
        last_ledger_index,
        session_task: None,
        session_budget: None,
        startup_waiters: Vec::new(),
    };

    (manager, dispatcher)
}

impl Dispatcher {
    /// Add a ledger subscriber; delivery follows registration order
    pub fn register(&mut self, subscriber: Arc<dyn LedgerSubscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "Ledger subscriber registered");
        self.subscribers.push(subscriber);
    }

    /// Spawn the dispatcher task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the dispatcher event loop
    pub async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                DispatcherMessage::Shutdown => {
                    self.want_connected = false;
                    self.teardown(ConnectionState::Disconnected).await;
                    self.fail_waiters(|| Error::NotConnected);
                    break;
                }
                message => self.handle_message(message).await,
            }
        }

        tracing::info!("Connection dispatcher stopped");
    }

    async fn handle_message(&mut self, message: DispatcherMessage) {
        match message {
            DispatcherMessage::Connect { budget, response } => {
                self.want_connected = true;
                match self.state() {
                    ConnectionState::Connected | ConnectionState::Confirmed => {
                        if let Some(response) = response {
                            let _ = response.send(Ok(()));
                        }
                    }
                    ConnectionState::Connecting => {
                        self.startup_waiters.extend(response);
                        if budget.is_some() && self.session_budget.is_none() {
                            // An unbounded session would never report failure
                            tracing::debug!("Restarting connection attempts with the startup budget");
                            self.begin_session(budget);
                        } else {
                            tracing::debug!("Connect requested while connecting");
                        }
                    }
                    ConnectionState::Disconnected | ConnectionState::Errored => {
                        self.startup_waiters.extend(response);
                        self.begin_session(budget);
                    }
                }
            }

            DispatcherMessage::Disconnect { response } => {
                self.want_connected = false;
                self.teardown(ConnectionState::Disconnected).await;
                self.fail_waiters(|| Error::NotConnected);
                tracing::info!("Disconnected from ledger network");
                let _ = response.send(());
            }

            DispatcherMessage::Connected { epoch, server } => {
                if epoch != self.epoch {
                    return;
                }
                tracing::info!(server = %server, "Connected to ledger server at {}", server);
                tracing::info!("Waiting for confirmation of ledger connection");
                self.set_state(ConnectionState::Connected, Some(server));
                for waiter in self.startup_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }

            DispatcherMessage::ConnectFailed { epoch, attempts } => {
                if epoch != self.epoch {
                    return;
                }
                tracing::error!(attempts, "No reachable ledger servers");
                self.want_connected = false;
                self.session_task = None;
                self.set_state(ConnectionState::Disconnected, None);
                self.fail_waiters(|| Error::NoReachableServers { attempts });
            }

            DispatcherMessage::Signal { epoch, signal } => {
                if epoch != self.epoch {
                    tracing::trace!(epoch, current = self.epoch, "Dropping stale signal");
                    return;
                }
                self.handle_signal(signal).await;
            }

            DispatcherMessage::Reconnect { epoch } => {
                if epoch == self.epoch && self.want_connected {
                    self.begin_session(None);
                }
            }

            DispatcherMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    async fn handle_signal(&mut self, signal: NetworkSignal) {
        match signal {
            NetworkSignal::LedgerClosed(ledger) => {
                let confirmed_now = self.state() == ConnectionState::Connected;
                if confirmed_now {
                    self.consecutive_failures = 0;
                    let server = self.status_tx.borrow().server.clone();
                    self.set_state(ConnectionState::Confirmed, server);
                    tracing::info!(ledger_index = ledger.ledger_index, "gateway ready");
                }

                if let Err(e) = self.process_ledger(ledger).await {
                    tracing::error!(error = %e, "Ledger delivery failed; dropping session");
                    self.end_session(ConnectionState::Errored).await;
                    return;
                }

                if confirmed_now {
                    for subscriber in &self.subscribers {
                        if let Err(e) = subscriber.on_ready().await {
                            tracing::error!(
                                subscriber = subscriber.name(),
                                error = %e,
                                "Ready handler failed"
                            );
                        }
                    }
                }
            }
            NetworkSignal::Disconnected => {
                tracing::warn!("Ledger server closed the connection");
                self.end_session(ConnectionState::Disconnected).await;
            }
            NetworkSignal::Error(message) => {
                tracing::warn!(error = %message, "Ledger connection error");
                self.end_session(ConnectionState::Errored).await;
            }
        }
    }

    /// Deliver a ledger, backfilling any gap before it
    ///
    /// On error the failed ledger is left unprocessed, so the next delivered
    /// ledger backfills it.
    async fn process_ledger(&mut self, ledger: ClosedLedger) -> Result<()> {
        let mut unresolved = None;

        if let Some(last) = self.last_ledger_index {
            if ledger.ledger_index <= last {
                tracing::debug!(
                    ledger_index = ledger.ledger_index,
                    last_ledger_index = last,
                    "Dropping already processed ledger"
                );
                return Ok(());
            }

            if ledger.ledger_index > last + 1 {
                let gap = LedgerGap {
                    from: last + 1,
                    to: ledger.ledger_index - 1,
                };
                tracing::warn!(from = gap.from, to = gap.to, "Ledger gap detected");
                unresolved = self.backfill(&gap).await?;

                let _ = self.events.send(LifecycleEvent::GapDetected {
                    from: gap.from,
                    to: gap.to,
                    resolved: unresolved.is_none(),
                });

                if let Some(remaining) = &unresolved {
                    self.metrics.gaps_unresolved.inc();
                    tracing::warn!(
                        from = remaining.from,
                        to = remaining.to,
                        "Ledger gap could not be backfilled"
                    );
                }
            }
        }

        if let Err(e) = self.deliver(&ledger, unresolved.as_ref()).await {
            if self.last_ledger_index.is_none() {
                self.last_ledger_index = Some(ledger.ledger_index.saturating_sub(1));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Fetch and deliver missing ledgers; returns what is left unresolved
    async fn backfill(&mut self, gap: &LedgerGap) -> Result<Option<LedgerGap>> {
        if gap.len() > self.config.max_backfill_ledgers {
            return Ok(Some(gap.clone()));
        }

        for ledger_index in gap.range() {
            match self.client.fetch_ledger(ledger_index).await {
                Ok(Some(missing)) => {
                    self.metrics.ledgers_backfilled.inc();
                    self.deliver(&missing, None).await?;
                }
                Ok(None) => {
                    tracing::warn!(ledger_index, "Ledger no longer available for backfill");
                    return Ok(Some(LedgerGap {
                        from: ledger_index,
                        to: gap.to,
                    }));
                }
                Err(e) => {
                    tracing::warn!(ledger_index, error = %e, "Backfill fetch failed");
                    return Ok(Some(LedgerGap {
                        from: ledger_index,
                        to: gap.to,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Hand a ledger to every subscriber; stops at the first failure
    /// without marking the ledger processed
    async fn deliver(&mut self, ledger: &ClosedLedger, gap: Option<&LedgerGap>) -> Result<()> {
        let timer = self.metrics.ledger_processing.start_timer();

        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.on_ledger_closed(ledger, gap).await {
                tracing::error!(
                    subscriber = subscriber.name(),
                    ledger_index = ledger.ledger_index,
                    error = %e,
                    "Ledger subscriber failed"
                );
                timer.stop_and_discard();
                return Err(e);
            }
        }

        timer.observe_duration();
        self.metrics.ledgers_processed.inc();
        self.last_ledger_index = Some(ledger.ledger_index);
        self.status_tx
            .send_modify(|status| status.last_ledger_index = Some(ledger.ledger_index));

        let _ = self.events.send(LifecycleEvent::LedgerClosed {
            ledger_index: ledger.ledger_index,
        });
        Ok(())
    }

    /// Spawn a session task for a fresh epoch
    fn begin_session(&mut self, budget: Option<u32>) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        self.epoch += 1;
        self.session_budget = budget;
        self.set_state(ConnectionState::Connecting, None);

        let session = SessionTask {
            epoch: self.epoch,
            servers: self.config.servers.clone(),
            client: self.client.clone(),
            policy: self.policy.clone(),
            budget,
            mailbox: self.mailbox_tx.clone(),
            metrics: self.metrics.clone(),
            signal_capacity: self.config.mailbox_capacity.max(1),
        };
        self.session_task = Some(tokio::spawn(session.run()));
    }

    /// Drop the session after a failure and schedule a reconnect
    async fn end_session(&mut self, state: ConnectionState) {
        self.teardown(state).await;

        if !self.want_connected {
            return;
        }

        let delay = self.policy.delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.metrics.reconnect_attempts.inc();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let epoch = self.epoch;
        let mailbox = self.mailbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(DispatcherMessage::Reconnect { epoch }).await;
        });
    }

    async fn teardown(&mut self, state: ConnectionState) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        self.epoch += 1;
        self.client.disconnect().await;
        self.set_state(state, None);
    }

    fn fail_waiters(&mut self, error: impl Fn() -> Error) {
        for waiter in self.startup_waiters.drain(..) {
            let _ = waiter.send(Err(error()));
        }
    }

    fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    fn set_state(&mut self, state: ConnectionState, server: Option<String>) {
        let changed = self.status_tx.send_if_modified(|status| {
            let changed = status.state != state || status.server != server;
            status.state = state;
            status.server = server;
            changed
        });

        if changed {
            self.metrics.set_connection_state(state);
            let snapshot = self.status_tx.borrow().clone();
            tracing::debug!(state = %snapshot.state, "Connection state changed");
            let _ = self.events.send(LifecycleEvent::StateChanged(snapshot));
        }
    }
}

/// Connects to the first reachable server, then forwards its signals
struct SessionTask {
    epoch: u64,
    servers: Vec<String>,
    client: Arc<dyn LedgerClient>,
    policy: RetryPolicy,
    budget: Option<u32>,
    mailbox: mpsc::Sender<DispatcherMessage>,
    metrics: Metrics,
    signal_capacity: usize,
}

impl SessionTask {
    async fn run(self) {
        let mut failures: u32 = 0;
        let mut rounds: u32 = 0;

        loop {
            for server in &self.servers {
                tracing::info!(server = %server, "Attempting to connect");
                let (signals_tx, signals) = mpsc::channel(self.signal_capacity);

                match self.client.connect(server, signals_tx).await {
                    Ok(()) => {
                        self.forward(server.clone(), signals).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "Connection attempt failed");
                        self.metrics.reconnect_attempts.inc();
                        tokio::time::sleep(self.policy.delay(failures)).await;
                        failures = failures.saturating_add(1);
                    }
                }
            }

            rounds += 1;
            if self.budget.is_some_and(|budget| rounds >= budget) {
                let _ = self
                    .mailbox
                    .send(DispatcherMessage::ConnectFailed {
                        epoch: self.epoch,
                        attempts: rounds,
                    })
                    .await;
                return;
            }
        }
    }

    async fn forward(&self, server: String, mut signals: mpsc::Receiver<NetworkSignal>) {
        let connected = DispatcherMessage::Connected {
            epoch: self.epoch,
            server,
        };
        if self.mailbox.send(connected).await.is_err() {
            return;
        }

        while let Some(signal) = signals.recv().await {
            let message = DispatcherMessage::Signal {
                epoch: self.epoch,
                signal,
            };
            if self.mailbox.send(message).await.is_err() {
                return;
            }
        }

        // Session ended without telling us; stale if already handled
        let _ = self
            .mailbox
            .send(DispatcherMessage::Signal {
                epoch: self.epoch,
                signal: NetworkSignal::Disconnected,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Recorder {
        ledgers: Mutex<Vec<(u64, Option<LedgerGap>)>>,
        ready: Mutex<u32>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ledgers: Mutex::new(Vec::new()),
                ready: Mutex::new(0),
            })
        }

        fn indices(&self) -> Vec<u64> {
            self.ledgers.lock().iter().map(|(i, _)| *i).collect()
        }
    }

    #[async_trait]
    impl LedgerSubscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_ledger_closed(&self, ledger: &ClosedLedger, gap: Option<&LedgerGap>) -> Result<()> {
            self.ledgers.lock().push((ledger.ledger_index, gap.cloned()));
            Ok(())
        }

        async fn on_ready(&self) -> Result<()> {
            *self.ready.lock() += 1;
            Ok(())
        }
    }

    /// Fails the first delivery of one ledger
    struct FailOnce {
        ledger_index: u64,
        failed: AtomicBool,
    }

    #[async_trait]
    impl LedgerSubscriber for FailOnce {
        fn name(&self) -> &str {
            "fail-once"
        }

        async fn on_ledger_closed(&self, ledger: &ClosedLedger, _gap: Option<&LedgerGap>) -> Result<()> {
            if ledger.ledger_index == self.ledger_index && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(Error::Storage("write stalled".to_string()));
            }
            Ok(())
        }
    }

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            servers: vec!["ws://primary".to_string(), "ws://secondary".to_string()],
            startup_retry_budget: 2,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            jitter_factor: 0.0,
            max_backfill_ledgers: 4,
            ..NetworkConfig::default()
        }
    }

    fn setup(
        network: Arc<MemoryNetwork>,
        last: Option<u64>,
    ) -> (ConnectionManager, Arc<Recorder>, JoinHandle<()>) {
        let (manager, mut dispatcher) =
            channel(&test_config(), network, Metrics::new().unwrap(), last);
        let recorder = Recorder::new();
        dispatcher.register(recorder.clone());
        (manager, recorder, dispatcher.spawn())
    }

    async fn wait_for(manager: &ConnectionManager, f: impl FnMut(&ConnectionStatus) -> bool) {
        let mut rx = manager.watch_status();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
    }

    /// Consume events until the state machine enters `state`
    async fn next_state(events: &mut broadcast::Receiver<LifecycleEvent>, state: ConnectionState) {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::StateChanged(status)) if status.state == state => return,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for state");
    }

    #[tokio::test]
    async fn test_start_then_confirm_on_ledger_close() {
        let network = Arc::new(MemoryNetwork::new(100));
        let (manager, recorder, handle) = setup(network.clone(), None);

        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        manager.start().await.unwrap();
        assert_eq!(manager.status().state, ConnectionState::Connected);
        assert_eq!(manager.status().server.as_deref(), Some("ws://primary"));

        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.state == ConnectionState::Confirmed).await;
        wait_for(&manager, |s| s.last_ledger_index == Some(100)).await;

        assert_eq!(recorder.indices(), vec![100]);
        assert_eq!(*recorder.ready.lock(), 1);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let network = Arc::new(MemoryNetwork::new(1));
        let (manager, _recorder, handle) = setup(network.clone(), None);

        manager.start().await.unwrap();
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        manager.start().await.unwrap();

        assert_eq!(network.connect_attempts(), 1);
        assert!(manager.is_connected());

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_unreachable() {
        let network = Arc::new(MemoryNetwork::new(1));
        network.set_reachable(false);
        let (manager, _recorder, handle) = setup(network, None);

        match manager.start().await {
            Err(Error::NoReachableServers { attempts }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_disconnect() {
        let network = Arc::new(MemoryNetwork::new(1));
        let (manager, recorder, handle) = setup(network.clone(), None);

        manager.start().await.unwrap();
        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.state == ConnectionState::Confirmed).await;

        network.drop_connection().await;
        wait_for(&manager, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(network.connect_attempts(), 2);

        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.state == ConnectionState::Confirmed).await;
        assert_eq!(recorder.indices(), vec![1, 2]);
        assert_eq!(*recorder.ready.lock(), 2);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_moves_to_errored_then_reconnects() {
        let network = Arc::new(MemoryNetwork::new(1));
        let (manager, _recorder, handle) = setup(network.clone(), None);
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        network.emit_error("socket reset").await;

        next_state(&mut events, ConnectionState::Errored).await;
        next_state(&mut events, ConnectionState::Connecting).await;
        next_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(network.connect_attempts(), 2);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnection() {
        let network = Arc::new(MemoryNetwork::new(1));
        let (manager, _recorder, handle) = setup(network.clone(), None);

        manager.start().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(network.connect_attempts(), 1);
        assert!(network.current_server().is_none());
        assert!(matches!(
            manager.submit(&SignedBlob::from_bytes(vec![1])).await,
            Err(Error::NotConnected)
        ));

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_ledgers_are_dropped() {
        let network = Arc::new(MemoryNetwork::new(9));
        // Ledger 10 already processed before a restart
        let (manager, recorder, handle) = setup(network.clone(), Some(10));

        manager.start().await.unwrap();
        network.close_ledger(vec![]).await;
        network.close_ledger(vec![]).await;
        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.last_ledger_index == Some(11)).await;

        assert_eq!(recorder.indices(), vec![11]);
        assert_eq!(manager.status().state, ConnectionState::Confirmed);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gap_is_backfilled_in_order() {
        let network = Arc::new(MemoryNetwork::new(100));
        let (manager, recorder, handle) = setup(network.clone(), None);
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        network.close_ledger(vec![]).await;
        network.skip_ledger(vec![]);
        network.skip_ledger(vec![]);
        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.last_ledger_index == Some(103)).await;

        assert_eq!(recorder.indices(), vec![100, 101, 102, 103]);
        assert!(recorder.ledgers.lock().iter().all(|(_, gap)| gap.is_none()));

        let mut gap_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::GapDetected { .. } = event {
                gap_events.push(event);
            }
        }
        assert_eq!(
            gap_events,
            vec![LifecycleEvent::GapDetected {
                from: 101,
                to: 102,
                resolved: true
            }]
        );

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_gap_is_reported() {
        let network = Arc::new(MemoryNetwork::new(100));
        let (manager, recorder, handle) = setup(network.clone(), None);

        manager.start().await.unwrap();
        network.close_ledger(vec![]).await;
        let missing = network.skip_ledger(vec![]);
        network.prune(missing);
        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.last_ledger_index == Some(102)).await;

        let ledgers = recorder.ledgers.lock().clone();
        assert_eq!(ledgers.len(), 2);
        assert_eq!(ledgers[1], (102, Some(LedgerGap { from: 101, to: 101 })));

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_bounds_an_open_ended_connect() {
        let network = Arc::new(MemoryNetwork::new(1));
        network.set_reachable(false);
        let (manager, _recorder, handle) = setup(network, None);

        manager.connect().await.unwrap();
        let started = tokio::time::timeout(Duration::from_secs(5), manager.start())
            .await
            .expect("start did not give up");
        assert!(matches!(started, Err(Error::NoReachableServers { attempts: 2 })));
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_after_reconnect() {
        let network = Arc::new(MemoryNetwork::new(1));
        let (manager, mut dispatcher) =
            channel(&test_config(), network.clone(), Metrics::new().unwrap(), None);
        dispatcher.register(Arc::new(FailOnce {
            ledger_index: 1,
            failed: AtomicBool::new(false),
        }));
        let recorder = Recorder::new();
        dispatcher.register(recorder.clone());
        let handle = dispatcher.spawn();
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        network.close_ledger(vec![]).await;

        next_state(&mut events, ConnectionState::Errored).await;
        next_state(&mut events, ConnectionState::Connected).await;
        assert!(recorder.indices().is_empty());
        assert_eq!(manager.status().last_ledger_index, None);
        assert_eq!(*recorder.ready.lock(), 0);

        network.close_ledger(vec![]).await;
        wait_for(&manager, |s| s.last_ledger_index == Some(2)).await;

        assert_eq!(recorder.indices(), vec![1, 2]);
        assert_eq!(*recorder.ready.lock(), 1);

        manager.shutdown().await.unwrap();
        handle.await.unwrap();
    }
}
