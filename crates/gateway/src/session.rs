use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ibkr_bridge_core::{Gateway, GatewayConfig, GatewayError, GatewayRequest, GatewayResponse};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::collector::{Collected, ResponseCollector};
use crate::protocol::*;

/// Lifecycle of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Point-in-time view of the session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub state: SessionState,
    pub server_version: Option<String>,
    pub managed_accounts: Vec<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

type PendingReply = oneshot::Sender<Result<GatewayResponse, GatewayError>>;

/// One outstanding request awaiting its terminal event.
struct Pending {
    collector: ResponseCollector,
    reply: PendingReply,
}

/// State shared between callers and the reader task.
struct Shared {
    status: RwLock<SessionStatus>,
    /// Bumped on every successful connect; reader tasks only act on their own epoch.
    epoch: AtomicU64,
    pending: Mutex<HashMap<i64, Pending>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<i64, Pending>> {
        // A poisoned table still holds valid senders; keep routing.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        self.status
            .read()
            .map(|status| status.state)
            .unwrap_or(SessionState::Disconnected)
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut status);
    }

    fn touch(&self) {
        self.update_status(|status| status.last_activity = Some(Utc::now()));
    }

    /// Route one inbound event to its pending request.
    fn route(&self, epoch: u64, msg: InboundMessage) {
        self.touch();
        match msg {
            InboundMessage::Disconnected { reason } => {
                let reason = reason.unwrap_or_else(|| "gateway closed the session".to_string());
                self.mark_dropped(epoch, &reason);
            }
            InboundMessage::Error {
                req_id: None,
                code,
                message,
            } => {
                if CONNECTIVITY_LOST_CODES.contains(&code) {
                    self.mark_dropped(epoch, &format!("{} ({})", message, code));
                } else {
                    debug!(code, "Gateway notice: {}", message);
                }
            }
            InboundMessage::Error {
                req_id: Some(req_id),
                code,
                message,
            } => {
                if let Some(pending) = self.pending().remove(&req_id) {
                    let _ = pending.reply.send(Err(GatewayError::Protocol { code, message }));
                } else {
                    debug!(req_id, code, "Error for unknown request: {}", message);
                }
            }
            InboundMessage::Connected { .. } => {
                warn!("Ignoring repeated handshake message");
            }
            event => {
                let Some(req_id) = event.req_id() else {
                    return;
                };
                let mut table = self.pending();
                let Some(pending) = table.get_mut(&req_id) else {
                    // Late events for timed-out requests land here
                    debug!(req_id, "Event for unknown request dropped");
                    return;
                };
                match pending.collector.accept(event) {
                    Collected::Pending => {}
                    Collected::Complete(response) => {
                        if let Some(pending) = table.remove(&req_id) {
                            let _ = pending.reply.send(Ok(response));
                        }
                    }
                    Collected::Unexpected => {
                        warn!(req_id, "Event does not match the outstanding request");
                    }
                }
            }
        }
    }

    /// Move to `Reconnecting` and fail everything in flight.
    fn mark_dropped(&self, epoch: u64, reason: &str) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let was_connected = self.state() == SessionState::Connected;
        if was_connected {
            warn!("Gateway connection lost: {}", reason);
            self.update_status(|status| status.state = SessionState::Reconnecting);
        }
        self.fail_all(reason);
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending
                .reply
                .send(Err(GatewayError::ConnectionLost(reason.to_string())));
        }
    }
}

/// The live link, guarded by the connect mutex.
#[derive(Default)]
struct Link {
    writer: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    last_failure: Option<String>,
}

/// The single persistent session to IB Gateway / TWS.
///
/// Connection is lazy: the first `send` connects. A dropped connection is
/// re-established on the next request, never by a background loop. Only one
/// connect attempt runs at a time; callers queued behind an attempt share its
/// outcome instead of starting their own.
pub struct GatewaySession {
    config: GatewayConfig,
    readonly: bool,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Link>,
    connect_attempts: AtomicU64,
    next_req_id: AtomicI64,
}

impl GatewaySession {
    pub fn new(config: GatewayConfig, readonly: bool) -> Self {
        let status = SessionStatus {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id,
            state: SessionState::Disconnected,
            server_version: None,
            managed_accounts: Vec::new(),
            last_activity: None,
        };
        Self {
            config,
            readonly,
            shared: Arc::new(Shared {
                status: RwLock::new(status),
                epoch: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
            link: tokio::sync::Mutex::new(Link::default()),
            connect_attempts: AtomicU64::new(0),
            next_req_id: AtomicI64::new(1),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared
            .status
            .read()
            .map(|status| status.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending().len()
    }

    /// Connect to the gateway. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let mut link = self.link.lock().await;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.connect_locked(&mut link).await
    }

    /// Make sure the session is usable, attempting at most one connect.
    pub async fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        let observed = self.connect_attempts.load(Ordering::SeqCst);
        let mut link = self.link.lock().await;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        if self.connect_attempts.load(Ordering::SeqCst) != observed {
            // An attempt finished while we waited. Share its failure; if it
            // succeeded and the link dropped since, fall through and retry.
            if let Some(reason) = link.last_failure.clone() {
                return Err(GatewayError::Unavailable(reason));
            }
        }
        self.connect_locked(&mut link).await
    }

    async fn connect_locked(&self, link: &mut Link) -> Result<(), GatewayError> {
        let previous = self.state();
        if previous != SessionState::Reconnecting {
            self.shared
                .update_status(|status| status.state = SessionState::Connecting);
        }

        let addr = self.config.address();
        info!(
            "Connecting to IB Gateway at {} (clientId={}, readonly={})",
            addr, self.config.client_id, self.readonly
        );

        let outcome = timeout(self.config.timeout(), self.handshake(&addr)).await;
        // Counts finished attempts, so callers queued behind this one see it move
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        match outcome {
            Ok(Ok((reader, writer, server_version, managed_accounts))) => {
                if let Some(task) = link.reader_task.take() {
                    task.abort();
                }
                let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    server_version = %server_version,
                    "Connected to IB Gateway. Managed accounts: {:?}",
                    managed_accounts
                );
                self.shared.update_status(|status| {
                    status.state = SessionState::Connected;
                    status.server_version = Some(server_version);
                    status.managed_accounts = managed_accounts;
                    status.last_activity = Some(Utc::now());
                });
                link.writer = Some(writer);
                link.reader_task = Some(tokio::spawn(read_loop(
                    reader,
                    Arc::clone(&self.shared),
                    epoch,
                )));
                link.last_failure = None;
                Ok(())
            }
            Ok(Err(err)) => Err(self.connect_failed(link, previous, err.to_string())),
            Err(_) => Err(self.connect_failed(
                link,
                previous,
                format!(
                    "handshake with {} timed out after {}s",
                    addr,
                    self.config.timeout().as_secs()
                ),
            )),
        }
    }

    fn connect_failed(&self, link: &mut Link, previous: SessionState, reason: String) -> GatewayError {
        warn!("IB Gateway connect failed: {}", reason);
        link.writer = None;
        link.last_failure = Some(reason.clone());
        let next = if previous == SessionState::Reconnecting {
            SessionState::Reconnecting
        } else {
            SessionState::Disconnected
        };
        self.shared.update_status(|status| status.state = next);
        GatewayError::Unavailable(reason)
    }

    async fn handshake(
        &self,
        addr: &str,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, String, Vec<String>), GatewayError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("TCP connect to {} failed: {}", addr, e)))?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &OutboundMessage::Hello {
                client_id: self.config.client_id,
                readonly: self.readonly,
            },
        )
        .await
        .map_err(|e| GatewayError::Unavailable(format!("Handshake write failed: {}", e)))?;

        match read_frame::<_, InboundMessage>(&mut reader).await {
            Ok(InboundMessage::Connected {
                server_version,
                managed_accounts,
            }) => Ok((reader, writer, server_version, managed_accounts)),
            Ok(InboundMessage::Error { code, message, .. }) => Err(GatewayError::Unavailable(
                format!("Gateway rejected handshake ({}): {}", code, message),
            )),
            Ok(_) => Err(GatewayError::Unavailable(
                "Unexpected initial message".to_string(),
            )),
            Err(e) => Err(GatewayError::Unavailable(format!("Handshake read failed: {}", e))),
        }
    }

    /// Tear the session down. Pending requests fail immediately.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(mut writer) = link.writer.take() {
            let _ = write_frame(&mut writer, &OutboundMessage::Goodbye).await;
            let _ = writer.shutdown().await;
        }
        if let Some(task) = link.reader_task.take() {
            task.abort();
        }
        // Retire the epoch so a late reader cannot touch the next session
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared
            .update_status(|status| status.state = SessionState::Disconnected);
        self.shared.fail_all("session closed");
        info!("Disconnected from IB Gateway");
    }

    async fn write(&self, msg: &OutboundMessage) -> Result<(), GatewayError> {
        let mut link = self.link.lock().await;
        let writer = link
            .writer
            .as_mut()
            .ok_or_else(|| GatewayError::ConnectionLost("Not connected".to_string()))?;
        if let Err(e) = write_frame(writer, msg).await {
            link.writer = None;
            let reason = format!("Write error: {}", e);
            self.shared
                .mark_dropped(self.shared.epoch.load(Ordering::SeqCst), &reason);
            return Err(GatewayError::ConnectionLost(reason));
        }
        self.shared.touch();
        Ok(())
    }

    /// Issue one request and wait for its correlated response.
    pub async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.ensure_connected().await?;

        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(
            req_id,
            Pending {
                collector: ResponseCollector::for_request(&request),
                reply: tx,
            },
        );
        let _entry = PendingEntry {
            shared: &self.shared,
            req_id,
        };
        debug!(req_id, request = request.label(), "Sending gateway request");

        let window = self.config.timeout();
        let exchange = async {
            self.write(&OutboundMessage::for_request(req_id, &request))
                .await?;
            rx.await.unwrap_or_else(|_| {
                Err(GatewayError::ConnectionLost("session closed".to_string()))
            })
        };

        let result = match timeout(window, exchange).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                req_id,
                after: window,
            }),
        };
        result
    }
}

/// Removes a request's pending entry when its exchange ends, including
/// when the caller drops the `send` future before a reply arrives.
struct PendingEntry<'a> {
    shared: &'a Shared,
    req_id: i64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.req_id);
    }
}

#[async_trait]
impl Gateway for GatewaySession {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        GatewaySession::send(self, request).await
    }

    fn managed_accounts(&self) -> Vec<String> {
        self.status().managed_accounts
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Some(task) = self.link.get_mut().reader_task.take() {
            task.abort();
        }
    }
}

/// Reads frames until the connection ends, routing each to its request.
async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, epoch: u64) {
    loop {
        match read_frame::<_, InboundMessage>(&mut reader).await {
            Ok(msg) => shared.route(epoch, msg),
            Err(ProtocolError::Malformed(e)) => {
                warn!("Skipping malformed gateway frame: {}", e);
            }
            Err(e) => {
                shared.mark_dropped(epoch, &format!("Read error: {}", e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ibkr_bridge_core::{ContractSpec, Position};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// How the fake gateway behaves.
    #[derive(Clone, Copy)]
    enum Script {
        /// Answer every request normally.
        Answer,
        /// Never answer.
        Silent,
        /// Close the socket on the first request.
        Hangup,
        /// Delay the `connected` reply, then answer.
        SlowHandshake,
        /// Delay, then refuse the handshake.
        SlowReject,
        /// Announce a session close on the first request.
        Disconnect,
        /// Report lost connectivity (1100) on the first request.
        ConnectivityLost,
        /// Send an undecodable frame before each answer.
        Garbage,
    }

    /// Spawn a fake gateway; returns its port.
    async fn fake_gateway(script: Script, accept_limit: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for _ in 0..accept_limit {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(stream, script));
            }
        });
        port
    }

    async fn serve_connection(stream: TcpStream, script: Script) {
        let (mut reader, mut writer) = stream.into_split();
        let hello: OutboundMessage = read_frame(&mut reader).await.unwrap();
        assert!(matches!(hello, OutboundMessage::Hello { client_id: 7, .. }));

        if matches!(script, Script::SlowHandshake | Script::SlowReject) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if let Script::SlowReject = script {
            write_frame(
                &mut writer,
                &InboundMessage::Error {
                    req_id: None,
                    code: 502,
                    message: "Couldn't connect to TWS".into(),
                },
            )
            .await
            .unwrap();
            return;
        }
        write_frame(
            &mut writer,
            &InboundMessage::Connected {
                server_version: "176".into(),
                managed_accounts: vec!["U1".into()],
            },
        )
        .await
        .unwrap();

        let script = match script {
            Script::SlowHandshake => Script::Answer,
            other => other,
        };
        while let Ok(msg) = read_frame::<_, OutboundMessage>(&mut reader).await {
            match (script, msg) {
                (Script::Silent, _) => {}
                (Script::Hangup, _) => return,
                (Script::Disconnect, _) => {
                    write_frame(
                        &mut writer,
                        &InboundMessage::Disconnected {
                            reason: Some("gateway restarting".into()),
                        },
                    )
                    .await
                    .unwrap();
                }
                (Script::ConnectivityLost, _) => {
                    write_frame(
                        &mut writer,
                        &InboundMessage::Error {
                            req_id: None,
                            code: 1100,
                            message: "Connectivity between IB and TWS has been lost".into(),
                        },
                    )
                    .await
                    .unwrap();
                }
                (Script::Garbage, OutboundMessage::Positions { req_id }) => {
                    writer.write_all(&frame_message(b"{not json")).await.unwrap();
                    answer_positions(&mut writer, req_id).await;
                }
                (Script::Answer, OutboundMessage::Positions { req_id }) => {
                    answer_positions(&mut writer, req_id).await;
                }
                (Script::Answer, OutboundMessage::HistoricalData { req_id, .. }) => {
                    write_frame(
                        &mut writer,
                        &InboundMessage::Error {
                            req_id: Some(req_id),
                            code: 162,
                            message: "HMDS query returned no data".into(),
                        },
                    )
                    .await
                    .unwrap();
                }
                (Script::Answer, OutboundMessage::MarketSnapshot { req_id, .. }) => {
                    // Answer snapshots out of order relative to other traffic
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    for (field, value) in [(TickField::Bid, dec!(10)), (TickField::Ask, dec!(12))] {
                        write_frame(
                            &mut writer,
                            &InboundMessage::TickPrice {
                                req_id,
                                field,
                                value,
                            },
                        )
                        .await
                        .unwrap();
                    }
                    write_frame(&mut writer, &InboundMessage::SnapshotEnd { req_id })
                        .await
                        .unwrap();
                }
                (_, OutboundMessage::Goodbye) => return,
                _ => {}
            }
        }
    }

    async fn answer_positions(writer: &mut OwnedWriteHalf, req_id: i64) {
        let position = Position {
            account: "U1".into(),
            symbol: "AAPL".into(),
            sec_type: Some("STK".into()),
            currency: Some("USD".into()),
            exchange: Some("NASDAQ".into()),
            con_id: Some(265598),
            position: dec!(100),
            avg_cost: Some(dec!(150.25)),
        };
        write_frame(writer, &InboundMessage::Position { req_id, position })
            .await
            .unwrap();
        write_frame(writer, &InboundMessage::PositionEnd { req_id })
            .await
            .unwrap();
    }

    fn spawn_sends(
        session: &Arc<GatewaySession>,
        count: usize,
    ) -> Vec<JoinHandle<Result<GatewayResponse, GatewayError>>> {
        (0..count)
            .map(|_| {
                let session = Arc::clone(session);
                tokio::spawn(async move { session.send(GatewayRequest::Positions).await })
            })
            .collect()
    }

    fn config(port: u16, timeout_secs: u64) -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".into(),
            port,
            client_id: 7,
            timeout_secs,
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_records_accounts() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = GatewaySession::new(config(port, 2), true);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.managed_accounts(), vec!["U1".to_string()]);
        assert_eq!(session.status().server_version.as_deref(), Some("176"));
    }

    #[tokio::test]
    async fn test_send_collects_correlated_events() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = GatewaySession::new(config(port, 2), false);

        match session.send(GatewayRequest::Positions).await.unwrap() {
            GatewayResponse::Positions(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].symbol, "AAPL");
            }
            other => panic!("Expected positions, got {:?}", other),
        }
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_responses() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = Arc::new(GatewaySession::new(config(port, 2), false));

        let snapshot = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .send(GatewayRequest::MarketSnapshot {
                        contract: ContractSpec::stock("AAPL"),
                        generic_ticks: String::new(),
                    })
                    .await
            })
        };
        let positions = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send(GatewayRequest::Positions).await })
        };

        assert!(matches!(
            positions.await.unwrap(),
            Ok(GatewayResponse::Positions(_))
        ));
        match snapshot.await.unwrap() {
            Ok(GatewayResponse::Snapshot(snap)) => assert_eq!(snap.mid, Some(dec!(11))),
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gateway_error_payload_is_protocol_error() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = GatewaySession::new(config(port, 2), false);

        let result = session
            .send(GatewayRequest::HistoricalData {
                contract: ContractSpec::new("ES", "CONTFUT", "CME", "USD"),
                end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
                duration: "1 Y".into(),
                bar_size: "1 day".into(),
                what_to_show: "TRADES".into(),
                use_rth: true,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Protocol { code: 162, .. })));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_pending_entry() {
        let port = fake_gateway(Script::Silent, 1).await;
        let session = GatewaySession::new(config(port, 1), false);

        let result = session.send(GatewayRequest::Positions).await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(session.in_flight(), 0);
        // Timeouts do not drop the session
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_unavailable_and_retried_next_request() {
        let session = GatewaySession::new(config(unused_port(), 1), false);

        let first = session.send(GatewayRequest::Positions).await;
        assert!(matches!(first, Err(GatewayError::Unavailable(_))));
        assert_eq!(session.state(), SessionState::Disconnected);

        let second = session.send(GatewayRequest::Positions).await;
        assert!(matches!(second, Err(GatewayError::Unavailable(_))));
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_in_flight_then_reconnects() {
        let port = fake_gateway(Script::Hangup, 2).await;
        let session = GatewaySession::new(config(port, 2), false);

        let result = session.send(GatewayRequest::Positions).await;
        assert!(matches!(result, Err(GatewayError::ConnectionLost(_))));
        assert_eq!(session.state(), SessionState::Reconnecting);

        // Next request performs exactly one reconnect
        let _ = session.send(GatewayRequest::Positions).await;
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_returns_to_disconnected() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = GatewaySession::new(config(port, 2), false);
        session.connect().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_send_leaves_no_pending_entry() {
        let port = fake_gateway(Script::Silent, 1).await;
        let session = Arc::new(GatewaySession::new(config(port, 5), false));
        session.connect().await.unwrap();

        let mut calls = spawn_sends(&session, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.in_flight(), 1);

        let call = calls.remove(0);
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queued_callers_share_one_connect() {
        let port = fake_gateway(Script::SlowHandshake, 4).await;
        let session = Arc::new(GatewaySession::new(config(port, 2), false));

        for call in spawn_sends(&session, 4) {
            assert!(matches!(call.await.unwrap(), Ok(GatewayResponse::Positions(_))));
        }
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_callers_share_a_failed_connect() {
        let port = fake_gateway(Script::SlowReject, 4).await;
        let session = Arc::new(GatewaySession::new(config(port, 2), false));

        for call in spawn_sends(&session, 4) {
            match call.await.unwrap() {
                Err(GatewayError::Unavailable(reason)) => assert!(reason.contains("502")),
                other => panic!("Expected unavailable, got {:?}", other),
            }
        }
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_waiter_reconnects_when_finished_attempt_did_not_fail() {
        let port = fake_gateway(Script::Answer, 1).await;
        let session = Arc::new(GatewaySession::new(config(port, 2), false));

        let link = session.link.lock().await;
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.ensure_connected().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // An attempt completes without recording a failure while the waiter is queued
        session.connect_attempts.fetch_add(1, Ordering::SeqCst);
        drop(link);

        waiter.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnected_frame_fails_in_flight_and_marks_reconnecting() {
        let port = fake_gateway(Script::Disconnect, 1).await;
        let session = GatewaySession::new(config(port, 2), false);

        match session.send(GatewayRequest::Positions).await {
            Err(GatewayError::ConnectionLost(reason)) => assert!(reason.contains("restarting")),
            other => panic!("Expected connection lost, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_connectivity_lost_code_fails_in_flight() {
        let port = fake_gateway(Script::ConnectivityLost, 1).await;
        let session = GatewaySession::new(config(port, 2), false);

        match session.send(GatewayRequest::Positions).await {
            Err(GatewayError::ConnectionLost(reason)) => assert!(reason.contains("1100")),
            other => panic!("Expected connection lost, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let port = fake_gateway(Script::Garbage, 1).await;
        let session = GatewaySession::new(config(port, 2), false);

        match session.send(GatewayRequest::Positions).await.unwrap() {
            GatewayResponse::Positions(rows) => assert_eq!(rows.len(), 1),
            other => panic!("Expected positions, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.connect_attempts.load(Ordering::SeqCst), 1);
    }
}
