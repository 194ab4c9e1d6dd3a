use ibkr_bridge_core::*;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    from_raw, required_text, unexpected, ToolContext, ToolDefinition, ToolOutput,
    OPTION_GENERIC_TICKS,
};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::Snapshot.name(),
        description: "Snapshot the latest quote for any security.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string"},
                "sec_type": {"type": "string", "default": "STK"},
                "exchange": {"type": "string", "default": "SMART"},
                "currency": {"type": "string", "default": "USD"}
            },
            "required": ["symbol"],
            "additionalProperties": false
        }),
    }
}

fn default_sec_type() -> String {
    "STK".to_string()
}

fn default_exchange() -> String {
    "SMART".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    symbol: String,
    #[serde(default = "default_sec_type")]
    sec_type: String,
    #[serde(default = "default_exchange")]
    exchange: String,
    #[serde(default = "default_currency")]
    currency: String,
}

pub fn parse(raw: Value) -> Result<SnapshotParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;
    Ok(SnapshotParams {
        contract: ContractSpec::new(
            &required_text("symbol", &raw.symbol)?,
            &required_text("sec_type", &raw.sec_type)?,
            &required_text("exchange", &raw.exchange)?,
            &required_text("currency", &raw.currency)?,
        ),
    })
}

/// Generic tick list for a contract's snapshot request.
pub fn generic_ticks(contract: &ContractSpec) -> String {
    if contract.is_option() {
        OPTION_GENERIC_TICKS.to_string()
    } else {
        String::new()
    }
}

/// One snapshot exchange; an empty snapshot counts as a timeout.
pub async fn fetch_snapshot(
    ctx: &ToolContext<'_>,
    contract: &ContractSpec,
) -> Result<MarketSnapshot, ToolError> {
    request_snapshot(ctx.gateway.as_ref(), contract).await
}

pub(crate) async fn request_snapshot(
    gateway: &dyn Gateway,
    contract: &ContractSpec,
) -> Result<MarketSnapshot, ToolError> {
    let request = GatewayRequest::MarketSnapshot {
        contract: contract.clone(),
        generic_ticks: generic_ticks(contract),
    };
    let snapshot = match gateway.send(request).await? {
        GatewayResponse::Snapshot(snapshot) => snapshot,
        other => return Err(unexpected("snapshot", &other)),
    };
    if !snapshot.has_data() {
        return Err(ToolError::GatewayTimeout(format!(
            "No market data received for {}",
            contract.symbol
        )));
    }
    Ok(snapshot)
}

pub async fn execute(ctx: &ToolContext<'_>, params: &SnapshotParams) -> Result<ToolOutput, ToolError> {
    let snapshot = fetch_snapshot(ctx, &params.contract).await?;
    Ok(ToolOutput::complete(json!({
        "symbol": params.contract.symbol,
        "sec_type": params.contract.sec_type,
        "snapshot": snapshot,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::*;
    use ibkr_bridge_policy::AccessPolicy;
    use rust_decimal_macros::dec;

    #[test]
    fn test_option_contracts_request_option_ticks() {
        let mut spec = ContractSpec::stock("AAPL");
        assert_eq!(generic_ticks(&spec), "");
        spec.sec_type = "OPT".into();
        assert_eq!(generic_ticks(&spec), "100,101,106");
    }

    #[tokio::test]
    async fn test_snapshot_payload() {
        let gateway = ScriptedGateway::new(|_| {
            Ok(GatewayResponse::Snapshot(MarketSnapshot {
                bid: Some(dec!(189.50)),
                ask: Some(dec!(189.60)),
                mid: Some(dec!(189.55)),
                ..Default::default()
            }))
        });
        let request = ToolRequest::Snapshot(parse(json!({"symbol": "aapl"})).unwrap());
        let output = run(gateway, AccessPolicy::default(), &request).await.unwrap();
        assert_eq!(output.payload["symbol"], "AAPL");
        assert_eq!(output.payload["sec_type"], "STK");
        assert_eq!(output.payload["snapshot"]["mid"], "189.55");
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_timeout() {
        let gateway = ScriptedGateway::new(|_| Ok(GatewayResponse::Snapshot(MarketSnapshot::default())));
        let request = ToolRequest::Snapshot(parse(json!({"symbol": "AAPL"})).unwrap());
        let err = run(gateway, AccessPolicy::default(), &request).await.unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::GatewayTimeout);
    }
}
