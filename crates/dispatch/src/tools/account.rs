use ibkr_bridge_core::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;

use super::{from_raw, optional_text, unexpected, ToolContext, ToolDefinition, ToolOutput};

/// Gateway tags reported in the summary, with their output keys.
const SUMMARY_TAGS: [(&str, &str); 8] = [
    ("NetLiquidation", "net_liquidation"),
    ("TotalCashValue", "total_cash_value"),
    ("BuyingPower", "buying_power"),
    ("GrossPositionValue", "gross_position_value"),
    ("MaintMarginReq", "maint_margin_req"),
    ("AvailableFunds", "available_funds"),
    ("ExcessLiquidity", "excess_liquidity"),
    ("SMA", "sma"),
];

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::AccountSummary.name(),
        description: "Fetch IBKR account summary metrics (USD).",
        input_schema: json!({
            "type": "object",
            "properties": {
                "account_id": {"type": "string"}
            },
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    #[serde(default)]
    account_id: Option<String>,
}

pub fn parse(raw: Value) -> Result<AccountSummaryParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;
    Ok(AccountSummaryParams {
        account_id: optional_text(raw.account_id),
    })
}

/// Keep USD values of known tags belonging to `account`.
fn summarize(values: &[AccountValue], account: Option<&str>) -> Map<String, Value> {
    let mut summary = Map::new();
    for value in values {
        if let (Some(wanted), Some(owner)) = (account, value.account.as_deref()) {
            if !owner.is_empty() && owner != wanted {
                continue;
            }
        }
        if value.currency.as_deref() != Some("USD") {
            continue;
        }
        let Some((_, key)) = SUMMARY_TAGS.iter().find(|(tag, _)| *tag == value.tag) else {
            continue;
        };
        if let Ok(amount) = Decimal::from_str(value.value.trim()) {
            summary.insert(key.to_string(), json!(amount));
        }
    }
    summary
}

pub async fn execute(ctx: &ToolContext<'_>, params: &AccountSummaryParams) -> Result<ToolOutput, ToolError> {
    let request = GatewayRequest::AccountSummary {
        account: params.account_id.clone(),
    };
    let values = match ctx.gateway.send(request).await? {
        GatewayResponse::AccountValues(values) => values,
        other => return Err(unexpected("account values", &other)),
    };

    Ok(ToolOutput::complete(json!({
        "account_id": params.account_id,
        "account_summary": summarize(&values, params.account_id.as_deref()),
    })))
}
