use ibkr_bridge_core::{
    AccountValue, Bar, ContractDetail, GatewayRequest, GatewayResponse, MarketSnapshot,
    OptionChain, OptionChainSet, OptionRight, Position,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::protocol::{InboundMessage, TickField};

/// Outcome of feeding one event into a collector.
#[derive(Debug)]
pub enum Collected {
    /// More events are expected.
    Pending,
    /// The terminal event arrived.
    Complete(GatewayResponse),
    /// The event does not belong to this kind of exchange.
    Unexpected,
}

/// Accumulates the correlated events of one outstanding request.
#[derive(Debug)]
pub enum ResponseCollector {
    Bars { symbol: String, bars: Vec<Bar> },
    Positions(Vec<Position>),
    AccountValues(Vec<AccountValue>),
    Pnl,
    ContractDetails(Vec<ContractDetail>),
    OptionChains(Vec<OptionChain>),
    Snapshot(SnapshotBuilder),
}

impl ResponseCollector {
    pub fn for_request(request: &GatewayRequest) -> Self {
        match request {
            GatewayRequest::HistoricalData { contract, .. } => ResponseCollector::Bars {
                symbol: contract.symbol.clone(),
                bars: Vec::new(),
            },
            GatewayRequest::Positions => ResponseCollector::Positions(Vec::new()),
            GatewayRequest::AccountSummary { .. } => ResponseCollector::AccountValues(Vec::new()),
            GatewayRequest::Pnl { .. } => ResponseCollector::Pnl,
            GatewayRequest::ContractDetails { .. } => {
                ResponseCollector::ContractDetails(Vec::new())
            }
            GatewayRequest::OptionChain { .. } => ResponseCollector::OptionChains(Vec::new()),
            GatewayRequest::MarketSnapshot { contract, .. } => {
                let option_right = if contract.is_option() {
                    contract.right
                } else {
                    None
                };
                ResponseCollector::Snapshot(SnapshotBuilder::new(
                    contract.is_option(),
                    option_right,
                ))
            }
        }
    }

    pub fn accept(&mut self, event: InboundMessage) -> Collected {
        match (self, event) {
            (
                ResponseCollector::Bars { symbol, bars },
                InboundMessage::HistoricalBar {
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    ..
                },
            ) => {
                bars.push(Bar {
                    instrument: symbol.clone(),
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
                Collected::Pending
            }
            (ResponseCollector::Bars { bars, .. }, InboundMessage::HistoricalDataEnd { .. }) => {
                bars.sort_by_key(|bar| bar.timestamp);
                Collected::Complete(GatewayResponse::Bars(std::mem::take(bars)))
            }
            (ResponseCollector::Positions(rows), InboundMessage::Position { position, .. }) => {
                rows.push(position);
                Collected::Pending
            }
            (ResponseCollector::Positions(rows), InboundMessage::PositionEnd { .. }) => {
                Collected::Complete(GatewayResponse::Positions(std::mem::take(rows)))
            }
            (ResponseCollector::AccountValues(values), InboundMessage::AccountValue { value, .. }) => {
                values.push(value);
                Collected::Pending
            }
            (ResponseCollector::AccountValues(values), InboundMessage::AccountSummaryEnd { .. }) => {
                Collected::Complete(GatewayResponse::AccountValues(std::mem::take(values)))
            }
            (ResponseCollector::Pnl, InboundMessage::Pnl { pnl, .. }) => {
                Collected::Complete(GatewayResponse::Pnl(pnl))
            }
            (ResponseCollector::ContractDetails(details), InboundMessage::ContractDetail { detail, .. }) => {
                details.push(detail);
                Collected::Pending
            }
            (ResponseCollector::ContractDetails(details), InboundMessage::ContractDetailsEnd { .. }) => {
                Collected::Complete(GatewayResponse::ContractDetails(std::mem::take(details)))
            }
            (ResponseCollector::OptionChains(chains), InboundMessage::OptionChain { chain, .. }) => {
                chains.push(chain.normalized());
                Collected::Pending
            }
            (
                ResponseCollector::OptionChains(chains),
                InboundMessage::OptionChainEnd {
                    underlying, con_id, ..
                },
            ) => Collected::Complete(GatewayResponse::OptionChains(OptionChainSet {
                underlying: underlying.to_ascii_uppercase(),
                con_id,
                chains: std::mem::take(chains),
            })),
            (ResponseCollector::Snapshot(builder), InboundMessage::TickPrice { field, value, .. })
            | (ResponseCollector::Snapshot(builder), InboundMessage::TickSize { field, value, .. }) => {
                builder.apply_tick(field, value);
                Collected::Pending
            }
            (
                ResponseCollector::Snapshot(builder),
                InboundMessage::OptionComputation {
                    implied_vol,
                    delta,
                    gamma,
                    theta,
                    vega,
                    ..
                },
            ) => {
                builder.apply_greeks(implied_vol, delta, gamma, theta, vega);
                Collected::Pending
            }
            (ResponseCollector::Snapshot(builder), InboundMessage::SnapshotEnd { .. }) => {
                Collected::Complete(GatewayResponse::Snapshot(builder.finish()))
            }
            _ => Collected::Unexpected,
        }
    }
}

/// Assembles a `MarketSnapshot` from individual tick events.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    is_option: bool,
    right: Option<OptionRight>,
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    last: Option<Decimal>,
    volume: Option<i64>,
    call_volume: Option<i64>,
    put_volume: Option<i64>,
    call_open_interest: Option<i64>,
    put_open_interest: Option<i64>,
    tick_implied_vol: Option<f64>,
    model_implied_vol: Option<f64>,
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
}

impl SnapshotBuilder {
    pub fn new(is_option: bool, right: Option<OptionRight>) -> Self {
        Self {
            is_option,
            right,
            ..Default::default()
        }
    }

    fn apply_tick(&mut self, field: TickField, value: Decimal) {
        // The gateway reports -1 for "no value"
        if value.is_sign_negative() && field != TickField::Last {
            return;
        }
        let as_int = value.trunc().to_i64();
        match field {
            TickField::Bid => self.bid = Some(value),
            TickField::Ask => self.ask = Some(value),
            TickField::Last => self.last = Some(value),
            TickField::Volume => self.volume = as_int,
            TickField::CallVolume => self.call_volume = as_int,
            TickField::PutVolume => self.put_volume = as_int,
            TickField::CallOpenInterest => self.call_open_interest = as_int,
            TickField::PutOpenInterest => self.put_open_interest = as_int,
            TickField::ImpliedVolatility => self.tick_implied_vol = value.to_f64(),
            TickField::Other => {}
        }
    }

    fn apply_greeks(
        &mut self,
        implied_vol: Option<f64>,
        delta: Option<f64>,
        gamma: Option<f64>,
        theta: Option<f64>,
        vega: Option<f64>,
    ) {
        self.model_implied_vol = finite(implied_vol).or(self.model_implied_vol);
        self.delta = finite(delta).or(self.delta);
        self.gamma = finite(gamma).or(self.gamma);
        self.theta = finite(theta).or(self.theta);
        self.vega = finite(vega).or(self.vega);
    }

    /// Option volume and open interest prefer the side matching the right.
    fn option_side(&self, call: Option<i64>, put: Option<i64>) -> Option<i64> {
        match self.right {
            Some(OptionRight::Call) => call.or(put),
            _ => put.or(call),
        }
    }

    pub fn finish(&self) -> MarketSnapshot {
        let mid = match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        };
        let (volume, open_interest) = if self.is_option {
            (
                self.option_side(self.call_volume, self.put_volume),
                self.option_side(self.call_open_interest, self.put_open_interest),
            )
        } else {
            (self.volume, None)
        };

        MarketSnapshot {
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            mid,
            volume,
            open_interest,
            implied_vol: self.model_implied_vol.or(self.tick_implied_vol),
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
        }
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use ibkr_bridge_core::ContractSpec;
    use rust_decimal_macros::dec;

    fn bar_event(day: u32, close: Decimal) -> InboundMessage {
        InboundMessage::HistoricalBar {
            req_id: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(10),
        }
    }

    #[test]
    fn test_bars_collected_in_time_order() {
        let request = GatewayRequest::HistoricalData {
            contract: ContractSpec::new("ES", "CONTFUT", "CME", "USD"),
            end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            duration: "1 Y".into(),
            bar_size: "1 day".into(),
            what_to_show: "TRADES".into(),
            use_rth: true,
        };
        let mut collector = ResponseCollector::for_request(&request);
        assert!(matches!(collector.accept(bar_event(5, dec!(5010))), Collected::Pending));
        assert!(matches!(collector.accept(bar_event(4, dec!(5000))), Collected::Pending));

        match collector.accept(InboundMessage::HistoricalDataEnd { req_id: 1 }) {
            Collected::Complete(GatewayResponse::Bars(bars)) => {
                assert_eq!(bars.len(), 2);
                assert_eq!(bars[0].close, dec!(5000));
                assert_eq!(bars[0].instrument, "ES");
            }
            other => panic!("Expected bars, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_event_is_unexpected() {
        let mut collector = ResponseCollector::for_request(&GatewayRequest::Positions);
        assert!(matches!(
            collector.accept(InboundMessage::SnapshotEnd { req_id: 1 }),
            Collected::Unexpected
        ));
    }

    #[test]
    fn test_stock_snapshot_computes_mid_and_skips_sentinels() {
        let mut builder = SnapshotBuilder::new(false, None);
        builder.apply_tick(TickField::Bid, dec!(189.50));
        builder.apply_tick(TickField::Ask, dec!(189.60));
        builder.apply_tick(TickField::Volume, dec!(-1));
        builder.apply_tick(TickField::Volume, dec!(1200));
        let snapshot = builder.finish();
        assert_eq!(snapshot.mid, Some(dec!(189.55)));
        assert_eq!(snapshot.volume, Some(1200));
        assert_eq!(snapshot.open_interest, None);
    }

    #[test]
    fn test_option_snapshot_prefers_matching_side() {
        let mut builder = SnapshotBuilder::new(true, Some(OptionRight::Put));
        builder.apply_tick(TickField::CallVolume, dec!(50));
        builder.apply_tick(TickField::PutVolume, dec!(70));
        builder.apply_tick(TickField::CallOpenInterest, dec!(900));
        builder.apply_tick(TickField::ImpliedVolatility, dec!(0.25));
        builder.apply_greeks(Some(0.22), Some(-0.4), Some(0.01), Some(f64::NAN), None);
        let snapshot = builder.finish();
        assert_eq!(snapshot.volume, Some(70));
        // No put open interest, falls back to the call side
        assert_eq!(snapshot.open_interest, Some(900));
        assert_eq!(snapshot.implied_vol, Some(0.22));
        assert_eq!(snapshot.theta, None);
    }

    #[test]
    fn test_option_chain_end_carries_underlying() {
        let mut collector = ResponseCollector::for_request(&GatewayRequest::OptionChain {
            underlying: ContractSpec::stock("SPY"),
        });
        let chain = OptionChain {
            exchange: Some("SMART".into()),
            expirations: vec!["20250221".into(), "20250117".into()],
            strikes: vec![dec!(455), dec!(450)],
            multiplier: Some("100".into()),
        };
        assert!(matches!(
            collector.accept(InboundMessage::OptionChain { req_id: 1, chain }),
            Collected::Pending
        ));
        match collector.accept(InboundMessage::OptionChainEnd {
            req_id: 1,
            underlying: "spy".into(),
            con_id: 756733,
        }) {
            Collected::Complete(GatewayResponse::OptionChains(set)) => {
                assert_eq!(set.underlying, "SPY");
                assert_eq!(set.con_id, 756733);
                assert_eq!(set.chains[0].expirations[0], "20250117");
                assert_eq!(set.chains[0].strikes[0], dec!(450));
            }
            other => panic!("Expected option chains, got {:?}", other),
        }
    }
}
