use chrono::{Days, NaiveDate};
use ibkr_bridge_core::*;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{from_raw, optional_text, unexpected, ToolContext, ToolDefinition, ToolOutput};
use crate::profiles::{self, InstrumentProfile};

/// Default lookback when no start date is given.
const DEFAULT_LOOKBACK_DAYS: u64 = 730;

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::MarketData.name(),
        description: "Fetch historical close series from IBKR Gateway for one or more symbols.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbols": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                "instrument_type": {"type": "string", "enum": ["stock", "futures", "fx", "bond", "option"]},
                "start_date": {"type": "string", "format": "date", "description": "YYYY-MM-DD; defaults to two years before end_date"},
                "end_date": {"type": "string", "format": "date", "description": "YYYY-MM-DD; defaults to today"},
                "bar_size": {"type": "string", "description": "e.g. \"1 day\", \"1 month\""},
                "what_to_show": {"type": "string", "description": "TRADES, MIDPOINT, BID or ASK"},
                "contract_identity": {
                    "type": "object",
                    "properties": {
                        "con_id": {"type": "integer"},
                        "exchange": {"type": "string"}
                    },
                    "additionalProperties": false
                }
            },
            "required": ["symbols", "instrument_type"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    symbols: Vec<String>,
    instrument_type: String,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    bar_size: Option<String>,
    #[serde(default)]
    what_to_show: Option<String>,
    #[serde(default)]
    contract_identity: Option<ContractIdentity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContractIdentity {
    #[serde(default)]
    con_id: Option<i64>,
    #[serde(default)]
    exchange: Option<String>,
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, ToolError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ToolError::invalid(format!("{} must be YYYY-MM-DD, got '{}'", field, raw)))
}

pub fn parse(raw: Value, today: NaiveDate) -> Result<MarketDataParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;

    let mut symbols: Vec<String> = raw
        .symbols
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    symbols.sort();
    symbols.dedup();
    if symbols.is_empty() {
        return Err(ToolError::invalid("symbols must contain at least one symbol"));
    }

    let instrument_type = profiles::parse_instrument_type(&raw.instrument_type).ok_or_else(|| {
        ToolError::invalid(format!(
            "Unsupported instrument_type '{}'; expected stock, futures, fx, bond or option",
            raw.instrument_type
        ))
    })?;

    let end_date = match optional_text(raw.end_date) {
        Some(end) => parse_date("end_date", &end)?,
        None => today,
    };
    let start_date = match optional_text(raw.start_date) {
        Some(start) => parse_date("start_date", &start)?,
        None => end_date
            .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
            .ok_or_else(|| ToolError::invalid("end_date is out of range"))?,
    };
    if start_date > end_date {
        return Err(ToolError::invalid(format!(
            "start_date {} is after end_date {}",
            start_date, end_date
        )));
    }

    let identity = raw.contract_identity.unwrap_or_default();
    let exchange = optional_text(identity.exchange).map(|e| e.to_ascii_uppercase());

    // Reject unresolvable symbols before anything else runs
    for symbol in &symbols {
        profiles::resolve_contract(symbol, instrument_type, identity.con_id, exchange.as_deref())?;
    }

    Ok(MarketDataParams {
        symbols,
        instrument_type,
        start_date,
        end_date,
        bar_size: optional_text(raw.bar_size)
            .map(|b| b.split_whitespace().collect::<Vec<_>>().join(" ")),
        what_to_show: optional_text(raw.what_to_show).map(|w| w.to_ascii_uppercase()),
        con_id: identity.con_id,
        exchange,
    })
}

/// Walk the data source chain until one returns bars.
///
/// Protocol errors move on to the next source. An empty answer from any
/// source is a successful empty series; otherwise the last error is returned.
async fn fetch_bars(
    ctx: &ToolContext<'_>,
    contract: &ContractSpec,
    chain: &[String],
    end: NaiveDate,
    duration: &str,
    bar_size: &str,
    use_rth: bool,
) -> Result<Vec<Bar>, ToolError> {
    let mut last_error: Option<ToolError> = None;
    let mut saw_empty = false;
    for source in chain {
        let request = GatewayRequest::HistoricalData {
            contract: contract.clone(),
            end,
            duration: duration.to_string(),
            bar_size: bar_size.to_string(),
            what_to_show: source.clone(),
            use_rth,
        };
        match ctx.gateway.send(request).await {
            Ok(GatewayResponse::Bars(bars)) if !bars.is_empty() => return Ok(bars),
            Ok(GatewayResponse::Bars(_)) => {
                debug!(symbol = %contract.symbol, source = %source, "No bars returned");
                saw_empty = true;
            }
            Ok(other) => return Err(unexpected("bars", &other)),
            Err(err @ GatewayError::Protocol { .. }) => {
                warn!(symbol = %contract.symbol, source = %source, "Historical data failed: {}", err);
                last_error = Some(err.into());
            }
            Err(err) => return Err(err.into()),
        }
    }
    match last_error {
        Some(err) if !saw_empty => Err(err),
        _ => Ok(Vec::new()),
    }
}

/// Reduce bars to a `date -> close` series inside `[start, end]`.
/// Monthly bars are labelled by month end; later bars win on collisions.
fn close_series(bars: &[Bar], bar_size: &str, start: NaiveDate, end: NaiveDate) -> BTreeMap<NaiveDate, Decimal> {
    let monthly = bar_size.to_ascii_lowercase().contains("month");
    let mut series = BTreeMap::new();
    for bar in bars {
        let date = bar.timestamp.date_naive();
        let label = if monthly { profiles::month_end(date) } else { date };
        series.insert(label, bar.close);
    }
    series.retain(|date, _| *date >= start && *date <= end);
    series
}

fn series_json(series: &BTreeMap<NaiveDate, Decimal>) -> Value {
    let (Some((first, _)), Some((last, _))) = (series.first_key_value(), series.last_key_value()) else {
        return json!({"bars": 0, "data": {}});
    };
    let data: Map<String, Value> = series
        .iter()
        .map(|(date, close)| (date.to_string(), json!(close.round_dp(6).normalize())))
        .collect();
    json!({
        "bars": series.len(),
        "start": first.to_string(),
        "end": last.to_string(),
        "data": data,
    })
}

pub async fn execute(ctx: &ToolContext<'_>, params: &MarketDataParams) -> Result<ToolOutput, ToolError> {
    let profile = InstrumentProfile::for_type(params.instrument_type);
    let bar_size = params
        .bar_size
        .clone()
        .unwrap_or_else(|| profile.bar_size.to_string());
    let chain: Vec<String> = match &params.what_to_show {
        Some(source) => vec![source.clone()],
        None => profile
            .what_to_show_chain
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    let request_end = if profile.extend_to_today {
        ctx.today.max(params.end_date)
    } else {
        params.end_date
    };
    let duration = profiles::duration_string(params.start_date, request_end);

    let mut results = Map::new();
    let mut failures = Vec::new();
    for symbol in &params.symbols {
        let contract = profiles::resolve_contract(
            symbol,
            params.instrument_type,
            params.con_id,
            params.exchange.as_deref(),
        )?;
        let fetched = fetch_bars(
            ctx,
            &contract,
            &chain,
            request_end,
            &duration,
            &bar_size,
            profile.use_rth,
        )
        .await;
        match fetched {
            Ok(bars) => {
                let series = close_series(&bars, &bar_size, params.start_date, params.end_date);
                results.insert(symbol.clone(), series_json(&series));
            }
            Err(err @ ToolError::GatewayUnavailable(_)) => return Err(err),
            Err(err) => {
                results.insert(
                    symbol.clone(),
                    json!({"bars": 0, "data": {}, "error": err.to_string()}),
                );
                failures.push(err);
            }
        }
    }

    if failures.len() == params.symbols.len() {
        if let Some(err) = failures.pop() {
            return Err(err);
        }
    }

    let payload = json!({
        "instrument_type": params.instrument_type.as_str(),
        "results": results,
    });
    if failures.is_empty() {
        Ok(ToolOutput::complete(payload))
    } else {
        Ok(ToolOutput::partial(payload))
    }
}
