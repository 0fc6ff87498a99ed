//! Chain client adapter.
//!
//! Owns every interaction with the chain node: queries against the chain
//! API (oracle params, validator jail state, feeder account), the height
//! tracker subscription and the vote broadcast with its account-sequence
//! bookkeeping.

pub mod height;
pub mod keyring;
pub mod tx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::chain::keyring::Signer;
use crate::chain::tx::{
    AccountInfo, Broadcaster, MsgAggregateExchangeRateVote, RpcBroadcaster, TxResponse,
};
use crate::config::Config;

/// Attempts made to reach the node while the process starts up.
const STARTUP_RETRIES: u32 = 5;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ChainClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("chain query failed: {0}")]
    Query(String),
    #[error("received error response code {code} from broadcast tx: {raw_log}")]
    NonZeroCode { code: u32, raw_log: String },
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("keyring: {0}")]
    Keyring(String),
    #[error("height subscription: {0}")]
    HeightSubscription(String),
    #[error("invalid chain configuration: {0}")]
    Config(String),
}

/// Mirrored parameters of the on-chain oracle module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleParams {
    pub vote_period: u64,
    pub whitelist: Vec<String>,
}

/// The chain operations the voting loop depends on. A trait so the tick
/// logic can be exercised against a recording double.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn oracle_params(&self) -> Result<OracleParams, ChainClientError>;
    async fn validator_jailed(&self) -> Result<bool, ChainClientError>;
    async fn broadcast_vote(
        &self,
        msg: MsgAggregateExchangeRateVote,
    ) -> Result<TxResponse, ChainClientError>;
    fn feeder_address(&self) -> &str;
    fn validator_address(&self) -> &str;
}

pub struct ChainClient {
    http: reqwest::Client,
    api_endpoint: String,
    feeder_address: String,
    validator_address: String,
    account: Mutex<AccountInfo>,
    broadcaster: Box<dyn Broadcaster>,
}

impl ChainClient {
    /// Construct the client and start the height tracker, retrying for a few
    /// seconds while the node comes up. Returns the receiving end of the
    /// single-slot height channel alongside the client.
    pub async fn connect(
        cfg: &Config,
        signer: Signer,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<i64>), ChainClientError> {
        let mut last_err = None;
        for attempt in 1..=STARTUP_RETRIES {
            match Self::new(cfg, signer.clone(), cancel.clone()).await {
                Ok(ok) => return Ok(ok),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "failed to create chain client");
                    last_err = Some(e);
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn new(
        cfg: &Config,
        signer: Signer,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<i64>), ChainClientError> {
        let timeout = cfg
            .rpc_timeout_duration()
            .map_err(|e| ChainClientError::Config(e.to_string()))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        let api_endpoint = cfg.rpc.grpc_endpoint.trim_end_matches('/').to_string();
        let tmrpc_endpoint = cfg.rpc.tmrpc_endpoint.trim_end_matches('/').to_string();

        let initial_height = chain_height(&http, &tmrpc_endpoint).await?;

        let broadcaster = RpcBroadcaster::new(
            http.clone(),
            api_endpoint.clone(),
            cfg.account.chain_id.clone(),
            &cfg.gas.gas_prices,
            cfg.gas.gas_limit,
            signer,
        )?;

        let (height_tx, height_rx) = mpsc::channel(1);
        height::start_height_updater(&tmrpc_endpoint, initial_height, height_tx, cancel)?;

        let client = Arc::new(Self {
            http,
            api_endpoint,
            feeder_address: cfg.account.address.clone(),
            validator_address: cfg.account.validator.clone(),
            account: Mutex::new(AccountInfo::default()),
            broadcaster: Box::new(broadcaster),
        });
        Ok((client, height_rx))
    }

    async fn query(&self, path: &str) -> Result<serde_json::Value, ChainClientError> {
        let url = format!("{}{path}", self.api_endpoint);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ChainClientError::Query(format!(
                "{path} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Feeder account number and current sequence from the auth module.
    async fn account_number_sequence(&self) -> Result<(u64, u64), ChainClientError> {
        let body = self
            .query(&format!(
                "/cosmos/auth/v1beta1/accounts/{}",
                self.feeder_address
            ))
            .await?;
        let account = &body["account"];
        let number = parse_u64_field(&account["account_number"])
            .ok_or_else(|| ChainClientError::Query("account missing account_number".into()))?;
        let sequence = parse_u64_field(&account["sequence"])
            .ok_or_else(|| ChainClientError::Query("account missing sequence".into()))?;
        Ok((number, sequence))
    }
}

async fn chain_height(
    http: &reqwest::Client,
    tmrpc_endpoint: &str,
) -> Result<i64, ChainClientError> {
    let url = format!("{tmrpc_endpoint}/status");
    let body: serde_json::Value = http.get(&url).send().await?.json().await?;
    body["result"]["sync_info"]["latest_block_height"]
        .as_str()
        .and_then(|height| height.parse().ok())
        .ok_or_else(|| ChainClientError::Query("status missing latest_block_height".into()))
}

fn parse_u64_field(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[async_trait]
impl ChainBackend for ChainClient {
    async fn oracle_params(&self) -> Result<OracleParams, ChainClientError> {
        let body = self.query("/oracle/v1beta1/params").await?;
        let params = &body["params"];
        let vote_period = parse_u64_field(&params["vote_period"])
            .ok_or_else(|| ChainClientError::Query("params missing vote_period".into()))?;
        let whitelist = params["whitelist"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry["name"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(OracleParams {
            vote_period,
            whitelist,
        })
    }

    async fn validator_jailed(&self) -> Result<bool, ChainClientError> {
        let body = self
            .query(&format!(
                "/cosmos/staking/v1beta1/validators/{}",
                self.validator_address
            ))
            .await?;
        body["validator"]["jailed"]
            .as_bool()
            .ok_or_else(|| ChainClientError::Query("validator missing jailed flag".into()))
    }

    /// Broadcast one vote with the current account sequence. The sequence is
    /// queried from the chain on first use and whenever a previous broadcast
    /// failed; it only advances on success.
    async fn broadcast_vote(
        &self,
        msg: MsgAggregateExchangeRateVote,
    ) -> Result<TxResponse, ChainClientError> {
        let mut account = self.account.lock().await;
        if account.sequence == 0 || account.should_reset {
            let (number, sequence) = self.account_number_sequence().await?;
            tracing::info!(account_number = number, sequence, "reset account sequence");
            account.account_number = number;
            account.sequence = sequence;
            account.should_reset = false;
        }

        tracing::info!(sequence = account.sequence, "broadcasting vote");
        match self.broadcaster.broadcast(&account, &msg).await {
            Ok(response) if response.code != 0 => {
                account.should_reset = true;
                Err(ChainClientError::NonZeroCode {
                    code: response.code,
                    raw_log: response.raw_log,
                })
            }
            Ok(response) => {
                account.sequence += 1;
                Ok(response)
            }
            Err(e) => {
                account.should_reset = true;
                Err(e)
            }
        }
    }

    fn feeder_address(&self) -> &str {
        &self.feeder_address
    }

    fn validator_address(&self) -> &str {
        &self.validator_address
    }
}
