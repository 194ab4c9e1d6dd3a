use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::models::*;

// ---------------------------------------------------------------------------
// Gateway exchanges
// ---------------------------------------------------------------------------

/// One outbound query against the brokerage gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayRequest {
    HistoricalData {
        contract: ContractSpec,
        end: NaiveDate,
        /// Gateway duration string, e.g. `"2 Y"`.
        duration: String,
        bar_size: String,
        what_to_show: String,
        use_rth: bool,
    },
    Positions,
    AccountSummary {
        account: Option<String>,
    },
    Pnl {
        account: String,
    },
    ContractDetails {
        contract: ContractSpec,
    },
    OptionChain {
        underlying: ContractSpec,
    },
    MarketSnapshot {
        contract: ContractSpec,
        /// Comma-separated generic tick list.
        generic_ticks: String,
    },
}

impl GatewayRequest {
    pub fn label(&self) -> &'static str {
        match self {
            GatewayRequest::HistoricalData { .. } => "historical_data",
            GatewayRequest::Positions => "positions",
            GatewayRequest::AccountSummary { .. } => "account_summary",
            GatewayRequest::Pnl { .. } => "pnl",
            GatewayRequest::ContractDetails { .. } => "contract_details",
            GatewayRequest::OptionChain { .. } => "option_chain",
            GatewayRequest::MarketSnapshot { .. } => "market_snapshot",
        }
    }
}

/// The collected result of one gateway exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum GatewayResponse {
    Bars(Vec<Bar>),
    Positions(Vec<Position>),
    AccountValues(Vec<AccountValue>),
    Pnl(AccountPnl),
    ContractDetails(Vec<ContractDetail>),
    OptionChains(OptionChainSet),
    Snapshot(MarketSnapshot),
}

impl GatewayResponse {
    pub fn label(&self) -> &'static str {
        match self {
            GatewayResponse::Bars(_) => "bars",
            GatewayResponse::Positions(_) => "positions",
            GatewayResponse::AccountValues(_) => "account_values",
            GatewayResponse::Pnl(_) => "pnl",
            GatewayResponse::ContractDetails(_) => "contract_details",
            GatewayResponse::OptionChains(_) => "option_chains",
            GatewayResponse::Snapshot(_) => "snapshot",
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway Trait
// ---------------------------------------------------------------------------

/// A request/response channel to the brokerage gateway.
///
/// The live implementation is the persistent gateway session; tests swap in
/// scripted gateways to observe how often the network would be touched.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run one logical exchange, collecting all correlated events.
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    /// Accounts announced by the gateway at handshake (empty if unknown).
    fn managed_accounts(&self) -> Vec<String> {
        Vec::new()
    }
}
