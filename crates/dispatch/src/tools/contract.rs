use ibkr_bridge_core::*;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{from_raw, required_text, unexpected, ToolContext, ToolDefinition, ToolOutput};

/// Code the gateway uses when a contract cannot be resolved.
const NO_SECURITY_DEFINITION: i32 = 200;

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::ContractLookup.name(),
        description: "Fetch contract details or option chain metadata from IBKR.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string"},
                "sec_type": {"type": "string", "default": "STK"},
                "info_type": {"type": "string", "enum": ["details", "option_chain"], "default": "details"},
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

fn default_info_type() -> ContractInfoType {
    ContractInfoType::Details
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParams {
    symbol: String,
    #[serde(default = "default_sec_type")]
    sec_type: String,
    #[serde(default = "default_info_type")]
    info_type: ContractInfoType,
    #[serde(default = "default_exchange")]
    exchange: String,
    #[serde(default = "default_currency")]
    currency: String,
}

pub fn parse(raw: Value) -> Result<ContractLookupParams, ToolError> {
    let raw: RawParams = from_raw(raw)?;
    let contract = ContractSpec::new(
        &required_text("symbol", &raw.symbol)?,
        &required_text("sec_type", &raw.sec_type)?,
        &required_text("exchange", &raw.exchange)?,
        &required_text("currency", &raw.currency)?,
    );
    if raw.info_type == ContractInfoType::OptionChain
        && !matches!(contract.sec_type.as_str(), "STK" | "FUT")
    {
        return Err(ToolError::invalid(format!(
            "option_chain supports STK or FUT underlyings, got {}",
            contract.sec_type
        )));
    }
    Ok(ContractLookupParams {
        contract,
        info_type: raw.info_type,
    })
}

pub async fn execute(ctx: &ToolContext<'_>, params: &ContractLookupParams) -> Result<ToolOutput, ToolError> {
    match params.info_type {
        ContractInfoType::Details => {
            let request = GatewayRequest::ContractDetails {
                contract: params.contract.clone(),
            };
            let details = match ctx.gateway.send(request).await? {
                GatewayResponse::ContractDetails(details) => details,
                other => return Err(unexpected("contract details", &other)),
            };
            if details.is_empty() {
                return Err(ToolError::GatewayProtocolError {
                    code: NO_SECURITY_DEFINITION,
                    message: format!(
                        "No security definition has been found for {} {}",
                        params.contract.sec_type, params.contract.symbol
                    ),
                });
            }
            Ok(ToolOutput::complete(json!({
                "info_type": "details",
                "symbol": params.contract.symbol,
                "contracts": details,
            })))
        }
        ContractInfoType::OptionChain => {
            let request = GatewayRequest::OptionChain {
                underlying: params.contract.clone(),
            };
            let mut set = match ctx.gateway.send(request).await? {
                GatewayResponse::OptionChains(set) => set,
                other => return Err(unexpected("option chains", &other)),
            };
            set.chains = set.chains.into_iter().map(OptionChain::normalized).collect();
            Ok(ToolOutput::complete(json!({
                "info_type": "option_chain",
                "chain": set,
            })))
        }
    }
}
