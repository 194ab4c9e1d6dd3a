pub mod account;
pub mod contract;
pub mod market_data;
pub mod option_prices;
pub mod positions;
pub mod snapshot;

use chrono::NaiveDate;
use ibkr_bridge_core::*;
use ibkr_bridge_policy::AccessPolicy;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;

/// Generic ticks requested for option snapshots (volume, open interest, implied vol).
pub const OPTION_GENERIC_TICKS: &str = "100,101,106";

/// Name, description and JSON schema advertised for a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Payload produced by a tool handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub payload: Value,
    /// False when part of the request failed; such output is not cached.
    pub complete: bool,
}

impl ToolOutput {
    pub fn complete(payload: Value) -> Self {
        Self {
            payload,
            complete: true,
        }
    }

    pub fn partial(payload: Value) -> Self {
        Self {
            payload,
            complete: false,
        }
    }
}

/// What a handler may touch while executing.
pub struct ToolContext<'a> {
    pub gateway: &'a Arc<dyn Gateway>,
    pub policy: &'a AccessPolicy,
    pub today: NaiveDate,
}

pub fn definition(kind: ToolKind) -> ToolDefinition {
    match kind {
        ToolKind::MarketData => market_data::definition(),
        ToolKind::Positions => positions::definition(),
        ToolKind::AccountSummary => account::definition(),
        ToolKind::ContractLookup => contract::definition(),
        ToolKind::OptionPrices => option_prices::definition(),
        ToolKind::Snapshot => snapshot::definition(),
    }
}

pub fn definitions() -> Vec<ToolDefinition> {
    ToolKind::ALL.into_iter().map(definition).collect()
}

/// Validate and normalize raw tool arguments.
pub fn parse(kind: ToolKind, raw: Value, today: NaiveDate) -> Result<ToolRequest, ToolError> {
    let request = match kind {
        ToolKind::MarketData => ToolRequest::MarketData(market_data::parse(raw, today)?),
        ToolKind::Positions => ToolRequest::Positions(positions::parse(raw)?),
        ToolKind::AccountSummary => ToolRequest::AccountSummary(account::parse(raw)?),
        ToolKind::ContractLookup => ToolRequest::ContractLookup(contract::parse(raw)?),
        ToolKind::OptionPrices => ToolRequest::OptionPrices(option_prices::parse(raw)?),
        ToolKind::Snapshot => ToolRequest::Snapshot(snapshot::parse(raw)?),
    };
    Ok(request)
}

/// Run the gateway exchange(s) for a validated request.
pub async fn execute(ctx: &ToolContext<'_>, request: &ToolRequest) -> Result<ToolOutput, ToolError> {
    match request {
        ToolRequest::MarketData(p) => market_data::execute(ctx, p).await,
        ToolRequest::Positions(p) => positions::execute(ctx, p).await,
        ToolRequest::AccountSummary(p) => account::execute(ctx, p).await,
        ToolRequest::ContractLookup(p) => contract::execute(ctx, p).await,
        ToolRequest::OptionPrices(p) => option_prices::execute(ctx, p).await,
        ToolRequest::Snapshot(p) => snapshot::execute(ctx, p).await,
    }
}

/// Deserialize tool arguments; absent arguments read as `{}`.
pub(crate) fn from_raw<T: DeserializeOwned>(raw: Value) -> Result<T, ToolError> {
    let raw = match raw {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(raw).map_err(|e| ToolError::invalid(e.to_string()))
}

/// Trimmed, non-empty text field.
pub(crate) fn required_text(field: &str, value: &str) -> Result<String, ToolError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Trimmed optional text; blank reads as absent.
pub(crate) fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Decimal from a JSON number or numeric string.
pub(crate) fn decimal_from_json(field: &str, value: &Value) -> Result<Decimal, ToolError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(ToolError::invalid(format!("{} must be a number", field))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ToolError::invalid(format!("{} is not a valid number: {}", field, text)))
}

/// The gateway answered with a different response shape than requested.
pub(crate) fn unexpected(expected: &str, got: &GatewayResponse) -> ToolError {
    ToolError::GatewayProtocolError {
        code: 0,
        message: format!("Expected {} response, got {}", expected, got.label()),
    }
}
