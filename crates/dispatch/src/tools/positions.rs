use ibkr_bridge_core::*;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{from_raw, optional_text, unexpected, ToolContext, ToolDefinition, ToolOutput};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::Positions.name(),
        description: "Fetch current IBKR positions and optionally account-level PnL.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "account_id": {"type": "string"},
                "include_pnl": {"type": "boolean", "default": false}
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
    #[serde(default)]
    include_pnl: bool,
}

pub fn parse(raw: Value) -> Result<PositionsParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;
    Ok(PositionsParams {
        account_id: optional_text(raw.account_id),
        include_pnl: raw.include_pnl,
    })
}

/// PnL needs a concrete account; fall back to the gateway's only visible one.
fn pnl_account(ctx: &ToolContext<'_>, requested: Option<&str>) -> Result<String, ToolError> {
    if let Some(account) = requested {
        return Ok(account.to_string());
    }
    let visible: Vec<String> = ctx
        .gateway
        .managed_accounts()
        .into_iter()
        .filter(|a| ctx.policy.is_account_visible(a))
        .collect();
    match visible.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(ToolError::invalid("include_pnl requires account_id; no account is known")),
        many => Err(ToolError::invalid(format!(
            "Multiple accounts available ({}); specify account_id",
            many.join(", ")
        ))),
    }
}

pub async fn execute(ctx: &ToolContext<'_>, params: &PositionsParams) -> Result<ToolOutput, ToolError> {
    let rows = match ctx.gateway.send(GatewayRequest::Positions).await? {
        GatewayResponse::Positions(rows) => rows,
        other => return Err(unexpected("positions", &other)),
    };

    let mut rows = match &params.account_id {
        Some(account) => rows.into_iter().filter(|p| &p.account == account).collect(),
        None => ctx.policy.visible_positions(rows),
    };
    rows.sort_by(|a, b| a.account.cmp(&b.account).then_with(|| a.symbol.cmp(&b.symbol)));

    let mut payload = json!({
        "count": rows.len(),
        "positions": rows,
    });

    if params.include_pnl {
        let account = pnl_account(ctx, params.account_id.as_deref())?;
        let pnl = match ctx.gateway.send(GatewayRequest::Pnl { account }).await? {
            GatewayResponse::Pnl(pnl) => pnl,
            other => return Err(unexpected("pnl", &other)),
        };
        payload["pnl"] = json!(pnl);
    }

    Ok(ToolOutput::complete(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::*;
    use ibkr_bridge_policy::AccessPolicy;
    use rust_decimal_macros::dec;

    fn position(account: &str, symbol: &str) -> Position {
        Position {
            account: account.into(),
            symbol: symbol.into(),
            sec_type: Some("STK".into()),
            currency: Some("USD".into()),
            exchange: Some("SMART".into()),
            con_id: None,
            position: dec!(10),
            avg_cost: Some(dec!(100)),
        }
    }

    fn book(request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        match request {
            GatewayRequest::Positions => Ok(GatewayResponse::Positions(vec![
                position("U2", "MSFT"),
                position("U1", "TSLA"),
                position("U1", "AAPL"),
            ])),
            GatewayRequest::Pnl { account } => Ok(GatewayResponse::Pnl(AccountPnl {
                account_id: account.clone(),
                daily_pnl: Some(dec!(125.5)),
                unrealized_pnl: None,
                realized_pnl: Some(dec!(0)),
            })),
            _ => unreachable!(),
        }
    }

    fn whitelist(accounts: &[&str]) -> AccessPolicy {
        AccessPolicy::new(&PolicyConfig {
            readonly: false,
            authorized_accounts: accounts.iter().map(|a| a.to_string()).collect(),
        })
    }

    fn request(account: Option<&str>, include_pnl: bool) -> ToolRequest {
        ToolRequest::Positions(PositionsParams {
            account_id: account.map(str::to_string),
            include_pnl,
        })
    }

    #[test]
    fn test_parse_blank_account_is_none() {
        let parsed = parse(json!({"account_id": "  "})).unwrap();
        assert_eq!(parsed.account_id, None);
        assert!(!parsed.include_pnl);
        assert!(parse(json!({"account": "U1"})).is_err());
    }

    #[tokio::test]
    async fn test_positions_sorted_and_filtered_to_whitelist() {
        let gateway = ScriptedGateway::new(book);
        let output = run(gateway, whitelist(&["U1"]), &request(None, false))
            .await
            .unwrap();

        assert_eq!(output.payload["count"], 2);
        assert_eq!(output.payload["positions"][0]["symbol"], "AAPL");
        assert_eq!(output.payload["positions"][1]["symbol"], "TSLA");
        assert!(output.payload.get("pnl").is_none());
    }

    #[tokio::test]
    async fn test_explicit_account_filters_rows() {
        let gateway = ScriptedGateway::new(book);
        let output = run(gateway, AccessPolicy::default(), &request(Some("U2"), false))
            .await
            .unwrap();
        assert_eq!(output.payload["count"], 1);
        assert_eq!(output.payload["positions"][0]["account"], "U2");
    }

    #[tokio::test]
    async fn test_include_pnl_issues_second_exchange() {
        let gateway = ScriptedGateway::new(book);
        let output = run(gateway.clone(), AccessPolicy::default(), &request(Some("U1"), true))
            .await
            .unwrap();

        assert_eq!(gateway.calls(), 2);
        assert_eq!(output.payload["pnl"]["account_id"], "U1");
        assert_eq!(output.payload["pnl"]["daily_pnl"], "125.5");
    }

    #[tokio::test]
    async fn test_pnl_account_from_single_managed_account() {
        let gateway = ScriptedGateway::with_accounts(&["U9"], book);
        let output = run(gateway, AccessPolicy::default(), &request(None, true))
            .await
            .unwrap();
        assert_eq!(output.payload["pnl"]["account_id"], "U9");
    }

    #[tokio::test]
    async fn test_pnl_without_known_account_is_invalid() {
        let gateway = ScriptedGateway::with_accounts(&["U1", "U2"], book);
        let err = run(gateway, AccessPolicy::default(), &request(None, true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::InvalidParameters);
    }
}
