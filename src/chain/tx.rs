//! Vote transaction construction and the broadcast primitive.
//!
//! The vote is wrapped in a legacy-amino `StdTx`: the canonical sign-doc is
//! serialized with alphabetically ordered keys, hashed with sha256 and
//! signed with the feeder's secp256k1 key, then posted in sync mode.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;

use crate::chain::keyring::Signer;
use crate::chain::ChainClientError;

pub const VOTE_MSG_TYPE: &str = "oracle/MsgAggregateExchangeRateVote";

/// Local view of the feeder account. `sequence` is advanced optimistically
/// on every successful broadcast; any failure raises `should_reset` so the
/// next broadcast re-queries the chain.
#[derive(Debug, Default, Clone)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
    pub should_reset: bool,
}

/// The one message this process ever broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MsgAggregateExchangeRateVote {
    pub exchange_rates: String,
    pub feeder: String,
    pub validator: String,
}

/// Node response to a sync-mode broadcast. `code != 0` means the node
/// rejected the transaction even though the POST itself succeeded.
#[derive(Debug, Clone, Default)]
pub struct TxResponse {
    pub txhash: String,
    pub code: u32,
    pub raw_log: String,
}

/// The broadcast primitive the voting loop ultimately calls. The production
/// implementation signs and posts; tests substitute a recorder.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(
        &self,
        account: &AccountInfo,
        msg: &MsgAggregateExchangeRateVote,
    ) -> Result<TxResponse, ChainClientError>;
}

// Field order below is the canonical (alphabetical) amino JSON order; serde
// serializes struct fields in declaration order.

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Coin {
    pub amount: String,
    pub denom: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StdFee {
    pub amount: Vec<Coin>,
    pub gas: String,
}

#[derive(Debug, Serialize)]
struct AminoMsg<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    value: &'a MsgAggregateExchangeRateVote,
}

#[derive(Debug, Serialize)]
struct StdSignDoc<'a> {
    account_number: String,
    chain_id: &'a str,
    fee: &'a StdFee,
    memo: &'a str,
    msgs: Vec<AminoMsg<'a>>,
    sequence: String,
}

/// Parse a gas-prices string such as `0.025ukii`.
pub(crate) fn parse_gas_prices(gas_prices: &str) -> Result<(Decimal, String), ChainClientError> {
    let split = gas_prices
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| {
            ChainClientError::Config(format!("gas prices {gas_prices:?} are missing a denom"))
        })?;
    let (amount, denom) = gas_prices.split_at(split);
    let price = Decimal::from_str_exact(amount)
        .map_err(|e| ChainClientError::Config(format!("invalid gas prices {gas_prices:?}: {e}")))?;
    Ok((price, denom.to_string()))
}

/// fee = ceil(gas price x gas limit), denominated in the gas-price denom.
pub(crate) fn compute_fee(gas_prices: &str, gas_limit: u64) -> Result<StdFee, ChainClientError> {
    let (price, denom) = parse_gas_prices(gas_prices)?;
    let amount = (price * Decimal::from(gas_limit)).ceil();
    Ok(StdFee {
        amount: vec![Coin {
            amount: amount.normalize().to_string(),
            denom,
        }],
        gas: gas_limit.to_string(),
    })
}

/// Signs votes with the local key and posts them to the chain API in sync
/// mode.
pub struct RpcBroadcaster {
    http: reqwest::Client,
    api_endpoint: String,
    chain_id: String,
    fee: StdFee,
    signer: Signer,
}

impl RpcBroadcaster {
    pub fn new(
        http: reqwest::Client,
        api_endpoint: String,
        chain_id: String,
        gas_prices: &str,
        gas_limit: u64,
        signer: Signer,
    ) -> Result<Self, ChainClientError> {
        Ok(Self {
            http,
            api_endpoint,
            chain_id,
            fee: compute_fee(gas_prices, gas_limit)?,
            signer,
        })
    }

    fn sign_doc_bytes(
        &self,
        account: &AccountInfo,
        msg: &MsgAggregateExchangeRateVote,
    ) -> Result<Vec<u8>, ChainClientError> {
        let doc = StdSignDoc {
            account_number: account.account_number.to_string(),
            chain_id: &self.chain_id,
            fee: &self.fee,
            memo: "",
            msgs: vec![AminoMsg {
                msg_type: VOTE_MSG_TYPE,
                value: msg,
            }],
            sequence: account.sequence.to_string(),
        };
        serde_json::to_vec(&doc)
            .map_err(|e| ChainClientError::Broadcast(format!("failed to encode sign doc: {e}")))
    }
}

#[async_trait]
impl Broadcaster for RpcBroadcaster {
    async fn broadcast(
        &self,
        account: &AccountInfo,
        msg: &MsgAggregateExchangeRateVote,
    ) -> Result<TxResponse, ChainClientError> {
        let sign_bytes = self.sign_doc_bytes(account, msg)?;
        let (signature, pub_key) = self.signer.sign(&sign_bytes);

        let body = json!({
            "tx": {
                "msg": [{"type": VOTE_MSG_TYPE, "value": msg}],
                "fee": self.fee,
                "signatures": [{
                    "pub_key": {"type": "tendermint/PubKeySecp256k1", "value": pub_key},
                    "signature": signature,
                }],
                "memo": "",
            },
            "mode": "sync",
        });

        let response = self
            .http
            .post(format!("{}/txs", self.api_endpoint))
            .json(&body)
            .send()
            .await?;
        let value: serde_json::Value = response.json().await?;

        Ok(TxResponse {
            txhash: value["txhash"].as_str().unwrap_or_default().to_string(),
            code: value["code"].as_u64().unwrap_or(0) as u32,
            raw_log: value["raw_log"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gas_prices() {
        let (price, denom) = parse_gas_prices("0.025ukii").unwrap();
        assert_eq!(price, Decimal::from_str_exact("0.025").unwrap());
        assert_eq!(denom, "ukii");

        assert!(parse_gas_prices("0.025").is_err());
    }

    #[test]
    fn test_compute_fee_rounds_up() {
        let fee = compute_fee("0.025ukii", 200_000).unwrap();
        assert_eq!(fee.amount[0].amount, "5000");
        assert_eq!(fee.amount[0].denom, "ukii");
        assert_eq!(fee.gas, "200000");

        let fee = compute_fee("0.0251ukii", 100).unwrap();
        assert_eq!(fee.amount[0].amount, "3");
    }

    #[test]
    fn test_sign_doc_has_canonical_key_order() {
        let fee = compute_fee("0.025ukii", 200_000).unwrap();
        let vote_msg = MsgAggregateExchangeRateVote {
            exchange_rates: "1.100000000000000000uusdt".to_string(),
            feeder: "kii1feeder".to_string(),
            validator: "kiivaloper1validator".to_string(),
        };
        let doc = StdSignDoc {
            account_number: "7".to_string(),
            chain_id: "testchain-1",
            fee: &fee,
            memo: "",
            msgs: vec![AminoMsg {
                msg_type: VOTE_MSG_TYPE,
                value: &vote_msg,
            }],
            sequence: "5".to_string(),
        };

        let rendered = serde_json::to_string(&doc).unwrap();
        let expected = concat!(
            r#"{"account_number":"7","chain_id":"testchain-1","#,
            r#""fee":{"amount":[{"amount":"5000","denom":"ukii"}],"gas":"200000"},"#,
            r#""memo":"","msgs":[{"type":"oracle/MsgAggregateExchangeRateVote","#,
            r#""value":{"exchange_rates":"1.100000000000000000uusdt","#,
            r#""feeder":"kii1feeder","validator":"kiivaloper1validator"}}],"sequence":"5"}"#
        );
        assert_eq!(rendered, expected);
    }
}
