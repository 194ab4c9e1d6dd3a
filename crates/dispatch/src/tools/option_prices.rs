use ibkr_bridge_core::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use super::snapshot::request_snapshot;
use super::{decimal_from_json, from_raw, required_text, ToolContext, ToolDefinition, ToolOutput};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::OptionPrices.name(),
        description: "Fetch live option quotes and greeks for a list of strikes.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string"},
                "expiry": {"type": "string", "description": "YYYYMMDD or YYYYMM"},
                "strikes": {"type": "array", "items": {"type": "number"}, "minItems": 1},
                "right": {"type": "string", "enum": ["P", "C"], "default": "P"}
            },
            "required": ["symbol", "expiry", "strikes"],
            "additionalProperties": false
        }),
    }
}

fn default_right() -> String {
    "P".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    symbol: String,
    expiry: String,
    strikes: Vec<Value>,
    #[serde(default = "default_right")]
    right: String,
}

pub fn parse(raw: Value) -> Result<OptionPricesParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;
    let symbol = required_text("symbol", &raw.symbol)?.to_ascii_uppercase();

    let expiry = required_text("expiry", &raw.expiry)?;
    if !matches!(expiry.len(), 6 | 8) || !expiry.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ToolError::invalid(format!(
            "expiry must be YYYYMMDD or YYYYMM, got {}",
            expiry
        )));
    }

    let right = OptionRight::parse(&raw.right)
        .ok_or_else(|| ToolError::invalid(format!("right must be P or C, got {}", raw.right)))?;

    if raw.strikes.is_empty() {
        return Err(ToolError::invalid("strikes must not be empty"));
    }
    let mut strikes = raw
        .strikes
        .iter()
        .map(|value| decimal_from_json("strikes", value).map(|d| d.normalize()))
        .collect::<Result<Vec<Decimal>, ToolError>>()?;
    if let Some(bad) = strikes.iter().find(|s| **s <= Decimal::ZERO) {
        return Err(ToolError::invalid(format!("strikes must be positive, got {}", bad)));
    }
    strikes.sort();
    strikes.dedup();

    Ok(OptionPricesParams {
        symbol,
        expiry,
        strikes,
        right,
    })
}

/// Whether a failed strike should abort the whole call.
fn is_fatal(err: &ToolError) -> bool {
    !matches!(
        err,
        ToolError::GatewayTimeout(_) | ToolError::GatewayProtocolError { .. }
    )
}

pub async fn execute(ctx: &ToolContext<'_>, params: &OptionPricesParams) -> Result<ToolOutput, ToolError> {
    let mut tasks = JoinSet::new();
    for strike in &params.strikes {
        let gateway = Arc::clone(ctx.gateway);
        let contract = ContractSpec::option(&params.symbol, &params.expiry, *strike, params.right);
        let strike = *strike;
        tasks.spawn(async move { (strike, request_snapshot(gateway.as_ref(), &contract).await) });
    }

    // Strikes already in flight run to completion; each is bounded by its own timeout
    let mut outcomes = Vec::with_capacity(params.strikes.len());
    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        let (strike, outcome) = joined
            .map_err(|e| ToolError::GatewayUnavailable(format!("strike task failed: {}", e)))?;
        if let Err(err) = &outcome {
            if is_fatal(err) && fatal.is_none() {
                fatal = Some(err.clone());
            }
        }
        outcomes.push((strike, outcome));
    }
    if let Some(err) = fatal {
        return Err(err);
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut prices = Map::new();
    let mut first_error = None;
    let mut failed = 0;
    for (strike, outcome) in outcomes {
        let entry = match outcome {
            Ok(snapshot) => json!(snapshot),
            Err(err) => {
                debug!(symbol = %params.symbol, strike = %strike, error = %err, "Strike failed");
                failed += 1;
                let entry = json!({"error": err.to_string(), "kind": err.kind()});
                first_error.get_or_insert(err);
                entry
            }
        };
        prices.insert(strike.to_string(), entry);
    }

    if failed == params.strikes.len() {
        if let Some(err) = first_error {
            return Err(err);
        }
    }

    let payload = json!({
        "symbol": params.symbol,
        "expiry": params.expiry,
        "right": params.right,
        "prices": prices,
    });
    if failed > 0 {
        Ok(ToolOutput::partial(payload))
    } else {
        Ok(ToolOutput::complete(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::*;
    use async_trait::async_trait;
    use ibkr_bridge_policy::AccessPolicy;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn quote(bid: Decimal, ask: Decimal, mid: Decimal) -> GatewayResponse {
        GatewayResponse::Snapshot(MarketSnapshot {
            bid: Some(bid),
            ask: Some(ask),
            mid: Some(mid),
            implied_vol: Some(0.21),
            ..Default::default()
        })
    }

    fn strike_of(request: &GatewayRequest) -> Decimal {
        match request {
            GatewayRequest::MarketSnapshot { contract, generic_ticks } => {
                assert_eq!(generic_ticks, "100,101,106");
                contract.strike.unwrap_or_default()
            }
            _ => unreachable!(),
        }
    }

    fn prices_request(strikes: Value) -> ToolRequest {
        ToolRequest::OptionPrices(
            parse(json!({"symbol": "spy", "expiry": "20240621", "strikes": strikes})).unwrap(),
        )
    }

    #[test]
    fn test_parse_sorts_and_dedups_strikes() {
        let parsed = parse(json!({
            "symbol": "spy",
            "expiry": "20240621",
            "strikes": [455, "450", 450.0, 452.5],
            "right": "call"
        }))
        .unwrap();
        assert_eq!(parsed.symbol, "SPY");
        assert_eq!(parsed.strikes, vec![dec!(450), dec!(452.5), dec!(455)]);
        assert_eq!(parsed.right, OptionRight::Call);
    }

    #[test]
    fn test_parse_rejects_bad_inputs() {
        let base = |patch: Value| {
            let mut raw = json!({"symbol": "SPY", "expiry": "20240621", "strikes": [450]});
            for (k, v) in patch.as_object().unwrap() {
                raw[k] = v.clone();
            }
            parse(raw)
        };
        assert!(base(json!({"expiry": "2024-06-21"})).is_err());
        assert!(base(json!({"expiry": "202406"})).is_ok());
        assert!(base(json!({"strikes": []})).is_err());
        assert!(base(json!({"strikes": [-5]})).is_err());
        assert!(base(json!({"right": "X"})).is_err());
    }

    #[tokio::test]
    async fn test_one_exchange_per_strike() {
        let gateway = ScriptedGateway::new(|request| {
            if strike_of(request) == dec!(450) {
                Ok(quote(dec!(4.5), dec!(4.6), dec!(4.55)))
            } else {
                Ok(quote(dec!(6.1), dec!(6.3), dec!(6.2)))
            }
        });
        let output = run(gateway.clone(), AccessPolicy::default(), &prices_request(json!([450, 455])))
            .await
            .unwrap();

        assert_eq!(gateway.calls(), 2);
        assert!(output.complete);
        assert_eq!(output.payload["right"], "P");
        assert_eq!(output.payload["prices"]["450"]["bid"], "4.5");
        assert_eq!(output.payload["prices"]["455"]["ask"], "6.3");
    }

    #[tokio::test]
    async fn test_failed_strike_becomes_entry() {
        let gateway = ScriptedGateway::new(|request| {
            if strike_of(request) == dec!(455) {
                Ok(GatewayResponse::Snapshot(MarketSnapshot::default()))
            } else {
                Ok(quote(dec!(4.5), dec!(4.6), dec!(4.55)))
            }
        });
        let output = run(gateway, AccessPolicy::default(), &prices_request(json!([450, 455])))
            .await
            .unwrap();

        assert!(!output.complete);
        assert_eq!(output.payload["prices"]["450"]["mid"], "4.55");
        assert_eq!(output.payload["prices"]["455"]["kind"], "gateway_timeout");
    }

    #[tokio::test]
    async fn test_all_strikes_failing_returns_first_error() {
        let gateway = ScriptedGateway::new(|_| {
            Err(GatewayError::Protocol {
                code: 200,
                message: "No security definition".into(),
            })
        });
        let err = run(gateway, AccessPolicy::default(), &prices_request(json!([450, 455])))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::GatewayProtocolError);
    }

    #[tokio::test]
    async fn test_unavailable_gateway_fails_call() {
        let gateway = ScriptedGateway::new(|request| {
            if strike_of(request) == dec!(450) {
                Err(GatewayError::Unavailable("refused".into()))
            } else {
                Ok(quote(dec!(4.5), dec!(4.6), dec!(4.55)))
            }
        });
        let err = run(gateway, AccessPolicy::default(), &prices_request(json!([450, 455])))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::GatewayUnavailable);
    }

    /// Refuses strike 450 at once; answers the others after a delay.
    #[derive(Default)]
    struct SlowStrikes {
        answered: AtomicUsize,
    }

    #[async_trait]
    impl Gateway for SlowStrikes {
        async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
            if strike_of(&request) == dec!(450) {
                return Err(GatewayError::Unavailable("refused".into()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.answered.fetch_add(1, Ordering::SeqCst);
            Ok(quote(dec!(6.1), dec!(6.3), dec!(6.2)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_strike_lets_other_strikes_finish() {
        let slow = Arc::new(SlowStrikes::default());
        let gateway: Arc<dyn Gateway> = slow.clone();
        let policy = AccessPolicy::default();
        let ctx = ToolContext {
            gateway: &gateway,
            policy: &policy,
            today: today(),
        };
        let params = parse(json!({"symbol": "SPY", "expiry": "20240621", "strikes": [450, 455, 460]}))
            .unwrap();

        let err = execute(&ctx, &params).await.unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::GatewayUnavailable);
        assert_eq!(slow.answered.load(Ordering::SeqCst), 2);
    }
}
