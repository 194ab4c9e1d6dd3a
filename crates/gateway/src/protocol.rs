use chrono::{DateTime, NaiveDate, Utc};
use ibkr_bridge_core::{
    AccountPnl, AccountValue, ContractDetail, ContractSpec, GatewayRequest, OptionChain, Position,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from the gateway.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Gateway error codes signalling that connectivity to IB servers was lost.
pub const CONNECTIVITY_LOST_CODES: [i32; 2] = [1100, 1300];

/// Messages sent from the bridge TO the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Opening handshake.
    #[serde(rename = "hello")]
    Hello { client_id: i32, readonly: bool },
    /// Request historical bars.
    #[serde(rename = "historical_data")]
    HistoricalData {
        req_id: i64,
        contract: ContractSpec,
        end: NaiveDate,
        duration: String,
        bar_size: String,
        what_to_show: String,
        use_rth: bool,
    },
    /// Request all positions visible to this client.
    #[serde(rename = "positions")]
    Positions { req_id: i64 },
    /// Request account values.
    #[serde(rename = "account_summary")]
    AccountSummary {
        req_id: i64,
        account: Option<String>,
    },
    /// Request account-level PnL.
    #[serde(rename = "pnl")]
    Pnl { req_id: i64, account: String },
    /// Request contract details.
    #[serde(rename = "contract_details")]
    ContractDetails { req_id: i64, contract: ContractSpec },
    /// Request option chain parameters for an underlying.
    #[serde(rename = "option_chain")]
    OptionChain {
        req_id: i64,
        underlying: ContractSpec,
    },
    /// Request a one-shot market data snapshot.
    #[serde(rename = "market_snapshot")]
    MarketSnapshot {
        req_id: i64,
        contract: ContractSpec,
        generic_ticks: String,
    },
    /// Orderly close.
    #[serde(rename = "goodbye")]
    Goodbye,
}

impl OutboundMessage {
    /// Tag a gateway request with its correlation id.
    pub fn for_request(req_id: i64, request: &GatewayRequest) -> Self {
        match request.clone() {
            GatewayRequest::HistoricalData {
                contract,
                end,
                duration,
                bar_size,
                what_to_show,
                use_rth,
            } => OutboundMessage::HistoricalData {
                req_id,
                contract,
                end,
                duration,
                bar_size,
                what_to_show,
                use_rth,
            },
            GatewayRequest::Positions => OutboundMessage::Positions { req_id },
            GatewayRequest::AccountSummary { account } => {
                OutboundMessage::AccountSummary { req_id, account }
            }
            GatewayRequest::Pnl { account } => OutboundMessage::Pnl { req_id, account },
            GatewayRequest::ContractDetails { contract } => {
                OutboundMessage::ContractDetails { req_id, contract }
            }
            GatewayRequest::OptionChain { underlying } => {
                OutboundMessage::OptionChain { req_id, underlying }
            }
            GatewayRequest::MarketSnapshot {
                contract,
                generic_ticks,
            } => OutboundMessage::MarketSnapshot {
                req_id,
                contract,
                generic_ticks,
            },
        }
    }
}

/// Tick fields carried by `tick_price` / `tick_size` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickField {
    Bid,
    Ask,
    Last,
    Volume,
    CallVolume,
    PutVolume,
    CallOpenInterest,
    PutOpenInterest,
    ImpliedVolatility,
    #[serde(other)]
    Other,
}

/// Messages received FROM the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        server_version: String,
        #[serde(default)]
        managed_accounts: Vec<String>,
    },
    /// One historical bar.
    #[serde(rename = "historical_bar")]
    HistoricalBar {
        req_id: i64,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        #[serde(default)]
        volume: Decimal,
    },
    #[serde(rename = "historical_data_end")]
    HistoricalDataEnd { req_id: i64 },
    /// One position row.
    #[serde(rename = "position")]
    Position { req_id: i64, position: Position },
    #[serde(rename = "position_end")]
    PositionEnd { req_id: i64 },
    /// One account tag/value pair.
    #[serde(rename = "account_value")]
    AccountValue { req_id: i64, value: AccountValue },
    #[serde(rename = "account_summary_end")]
    AccountSummaryEnd { req_id: i64 },
    /// Account PnL (terminal, no end marker).
    #[serde(rename = "pnl")]
    Pnl { req_id: i64, pnl: AccountPnl },
    #[serde(rename = "contract_detail")]
    ContractDetail { req_id: i64, detail: ContractDetail },
    #[serde(rename = "contract_details_end")]
    ContractDetailsEnd { req_id: i64 },
    /// Option chain parameters for one exchange.
    #[serde(rename = "option_chain")]
    OptionChain { req_id: i64, chain: OptionChain },
    /// Terminal event carrying the qualified underlying.
    #[serde(rename = "option_chain_end")]
    OptionChainEnd {
        req_id: i64,
        underlying: String,
        con_id: i64,
    },
    #[serde(rename = "tick_price")]
    TickPrice {
        req_id: i64,
        field: TickField,
        value: Decimal,
    },
    #[serde(rename = "tick_size")]
    TickSize {
        req_id: i64,
        field: TickField,
        value: Decimal,
    },
    /// Model greeks for an option contract.
    #[serde(rename = "option_computation")]
    OptionComputation {
        req_id: i64,
        implied_vol: Option<f64>,
        delta: Option<f64>,
        gamma: Option<f64>,
        theta: Option<f64>,
        vega: Option<f64>,
    },
    #[serde(rename = "snapshot_end")]
    SnapshotEnd { req_id: i64 },
    /// Error message; `req_id` is absent for session-level notices.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        req_id: Option<i64>,
        code: i32,
        message: String,
    },
    /// The gateway is closing the session.
    #[serde(rename = "disconnected")]
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl InboundMessage {
    /// Correlation id this event belongs to, if any.
    pub fn req_id(&self) -> Option<i64> {
        match self {
            InboundMessage::HistoricalBar { req_id, .. }
            | InboundMessage::HistoricalDataEnd { req_id }
            | InboundMessage::Position { req_id, .. }
            | InboundMessage::PositionEnd { req_id }
            | InboundMessage::AccountValue { req_id, .. }
            | InboundMessage::AccountSummaryEnd { req_id }
            | InboundMessage::Pnl { req_id, .. }
            | InboundMessage::ContractDetail { req_id, .. }
            | InboundMessage::ContractDetailsEnd { req_id }
            | InboundMessage::OptionChain { req_id, .. }
            | InboundMessage::OptionChainEnd { req_id, .. }
            | InboundMessage::TickPrice { req_id, .. }
            | InboundMessage::TickSize { req_id, .. }
            | InboundMessage::OptionComputation { req_id, .. }
            | InboundMessage::SnapshotEnd { req_id } => Some(*req_id),
            InboundMessage::Error { req_id, .. } => *req_id,
            InboundMessage::Connected { .. } | InboundMessage::Disconnected { .. } => None,
        }
    }
}

/// Errors while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Serialize and write one framed message.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(msg)?;
    writer.write_all(&frame_message(&json)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and deserialize one framed message.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
