use chrono::{Datelike, Months, NaiveDate};
use ibkr_bridge_core::{ContractSpec, InstrumentType, OptionRight, ToolError};
use rust_decimal::Decimal;

/// Historical data request shape for one instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentProfile {
    pub instrument_type: InstrumentType,
    /// Data sources tried in order until one returns bars.
    pub what_to_show_chain: &'static [&'static str],
    pub bar_size: &'static str,
    pub use_rth: bool,
    /// Request through today so the continuous contract's latest bars are included.
    pub extend_to_today: bool,
}

const QUOTE_CHAIN: &[&str] = &["MIDPOINT", "BID", "ASK"];
const TRADES_CHAIN: &[&str] = &["TRADES"];

impl InstrumentProfile {
    pub fn for_type(instrument_type: InstrumentType) -> Self {
        match instrument_type {
            InstrumentType::Stock => Self {
                instrument_type,
                what_to_show_chain: TRADES_CHAIN,
                bar_size: "1 day",
                use_rth: true,
                extend_to_today: false,
            },
            InstrumentType::Futures => Self {
                instrument_type,
                what_to_show_chain: TRADES_CHAIN,
                bar_size: "1 month",
                use_rth: true,
                extend_to_today: true,
            },
            InstrumentType::Fx => Self {
                instrument_type,
                what_to_show_chain: QUOTE_CHAIN,
                bar_size: "1 day",
                use_rth: false,
                extend_to_today: false,
            },
            InstrumentType::Bond | InstrumentType::Option => Self {
                instrument_type,
                what_to_show_chain: QUOTE_CHAIN,
                bar_size: "1 day",
                use_rth: true,
                extend_to_today: false,
            },
        }
    }
}

/// Parse a user-supplied instrument type.
pub fn parse_instrument_type(raw: &str) -> Option<InstrumentType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "stock" | "stk" | "equity" => Some(InstrumentType::Stock),
        "futures" | "future" | "fut" => Some(InstrumentType::Futures),
        "fx" | "forex" | "cash" => Some(InstrumentType::Fx),
        "bond" => Some(InstrumentType::Bond),
        "option" | "opt" => Some(InstrumentType::Option),
        _ => None,
    }
}

/// Listing exchange and currency of common futures roots.
pub fn futures_exchange(root: &str) -> Option<(&'static str, &'static str)> {
    let meta = match root {
        "ES" | "MES" | "NQ" | "MNQ" | "RTY" | "M2K" | "6E" | "6J" | "6B" | "6A" | "6C" | "6S"
        | "HE" | "LE" | "GF" => ("CME", "USD"),
        "YM" | "MYM" | "ZB" | "UB" | "ZN" | "ZF" | "ZT" | "ZC" | "ZS" | "ZW" | "ZL" | "ZM" => {
            ("CBOT", "USD")
        }
        "CL" | "MCL" | "NG" | "RB" | "HO" | "PL" | "PA" => ("NYMEX", "USD"),
        "GC" | "MGC" | "SI" | "SIL" | "HG" => ("COMEX", "USD"),
        "VX" => ("CFE", "USD"),
        "FESX" | "FDAX" | "FGBL" | "FGBM" | "FGBS" => ("EUREX", "EUR"),
        _ => return None,
    };
    Some(meta)
}

/// Build the gateway contract for one market data symbol.
pub fn resolve_contract(
    symbol: &str,
    instrument_type: InstrumentType,
    con_id: Option<i64>,
    exchange: Option<&str>,
) -> Result<ContractSpec, ToolError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    match instrument_type {
        InstrumentType::Stock => {
            Ok(ContractSpec::new(&symbol, "STK", exchange.unwrap_or("SMART"), "USD").with_con_id(con_id))
        }
        InstrumentType::Futures => {
            let (listed, currency) = match (exchange, futures_exchange(&symbol)) {
                (Some(exchange), known) => (exchange, known.map_or("USD", |(_, c)| c)),
                (None, Some(known)) => known,
                (None, None) => {
                    return Err(ToolError::invalid(format!(
                        "No futures exchange known for '{}'; pass contract_identity.exchange",
                        symbol
                    )))
                }
            };
            Ok(ContractSpec::new(&symbol, "CONTFUT", listed, currency).with_con_id(con_id))
        }
        InstrumentType::Fx => {
            let (base, quote) = normalize_fx_pair(&symbol)
                .ok_or_else(|| ToolError::invalid(format!("Invalid FX symbol '{}'", symbol)))?;
            Ok(ContractSpec::new(&base, "CASH", "IDEALPRO", &quote))
        }
        InstrumentType::Bond => {
            let con_id = con_id.ok_or_else(|| {
                ToolError::invalid("Bond pricing requires contract_identity.con_id")
            })?;
            Ok(ContractSpec::new(&symbol, "BOND", exchange.unwrap_or("SMART"), "USD")
                .with_con_id(Some(con_id)))
        }
        InstrumentType::Option => {
            if con_id.is_some() {
                return Ok(ContractSpec::new(&symbol, "OPT", exchange.unwrap_or("SMART"), "USD")
                    .with_con_id(con_id));
            }
            parse_occ_symbol(&symbol).ok_or_else(|| {
                ToolError::invalid(format!(
                    "Option '{}' needs contract_identity.con_id or an OCC symbol like SPY240621P00450000",
                    symbol
                ))
            })
        }
    }
}

/// Accept `EUR.USD`, `EUR/USD` or `EURUSD`.
fn normalize_fx_pair(raw: &str) -> Option<(String, String)> {
    let pair: String = raw
        .chars()
        .filter(|c| !matches!(c, '.' | '/'))
        .collect();
    if pair.len() != 6 || !pair.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((pair[..3].to_string(), pair[3..].to_string()))
}

/// Parse an OCC option symbol: root, `YYMMDD`, right, strike × 1000.
fn parse_occ_symbol(raw: &str) -> Option<ContractSpec> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if !compact.is_ascii() {
        return None;
    }
    let root_len = compact.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    if root_len == 0 || root_len > 6 {
        return None;
    }
    let (root, rest) = compact.split_at(root_len);
    if rest.len() < 8 {
        return None;
    }
    let (date, rest) = rest.split_at(6);
    let (right, strike) = rest.split_at(1);
    if !date.chars().all(|c| c.is_ascii_digit())
        || strike.is_empty()
        || !strike.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let right = OptionRight::parse(right)?;
    let strike = Decimal::new(strike.parse::<i64>().ok()?, 3);
    Some(ContractSpec::option(root, &format!("20{}", date), strike, right))
}

/// Gateway duration covering `[start, end]`, rounded up to whole years.
pub fn duration_string(start: NaiveDate, end: NaiveDate) -> String {
    if end <= start {
        return "1 Y".to_string();
    }
    let mut years = end.year() - start.year();
    let anniversary = u32::try_from(years)
        .ok()
        .and_then(|y| start.checked_add_months(Months::new(y * 12)));
    if anniversary.map_or(true, |anniversary| end > anniversary) {
        years += 1;
    }
    format!("{} Y", years.max(1))
}

/// Last calendar day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    date.with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}
