//! Access to the external settlement ledger.
//!
//! The ledger executes fills of maker-signed limit orders. It is authoritative
//! and idempotent per order hash; this side only submits fills and reads back
//! remaining amounts and balances.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info};

use crate::errors::SettlementError;

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// The order struct the ledger's `fillOrder` takes, field for field.
///
/// 256-bit integers travel as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerOrder {
    #[serde(deserialize_with = "uint")]
    pub salt: String,
    pub maker_asset: String,
    pub taker_asset: String,
    pub maker: String,
    pub receiver: String,
    pub allowed_sender: String,
    #[serde(deserialize_with = "uint")]
    pub making_amount: String,
    #[serde(deserialize_with = "uint")]
    pub taking_amount: String,
    #[serde(deserialize_with = "uint")]
    pub offsets: String,
    pub interactions: String,
}

/// The order as the maker signed it; the ledger-only fields may be absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields {
    #[serde(deserialize_with = "uint")]
    salt: String,
    maker_asset: String,
    taker_asset: String,
    maker: String,
    #[serde(default)]
    receiver: Option<String>,
    #[serde(deserialize_with = "uint")]
    making_amount: String,
    #[serde(deserialize_with = "uint")]
    taking_amount: String,
}

impl From<SignedFields> for LedgerOrder {
    fn from(o: SignedFields) -> Self {
        LedgerOrder {
            salt: o.salt,
            maker_asset: o.maker_asset,
            taker_asset: o.taker_asset,
            maker: o.maker,
            receiver: o.receiver.unwrap_or_else(|| ZERO_ADDRESS.to_string()),
            // anyone may fill
            allowed_sender: ZERO_ADDRESS.to_string(),
            making_amount: o.making_amount,
            taking_amount: o.taking_amount,
            offsets: "0".to_string(),
            interactions: "0x".to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UintRepr {
    Text(String),
    Number(u64),
}

fn uint<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match UintRepr::deserialize(d)? {
        UintRepr::Text(s) => s,
        UintRepr::Number(n) => n.to_string(),
    })
}

/// Compact signature: `r` and `vs = s | ((v - 27) << 255)`, both 0x-prefixed 32-byte hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactSignature {
    pub r: String,
    pub vs: String,
}

impl CompactSignature {
    /// Compacts a 65-byte `r || s || v` signature. `v` may be 0/1 or 27/28.
    pub fn from_rsv(sig: &[u8]) -> Result<Self, SettlementError> {
        if sig.len() != 65 {
            return Err(SettlementError::InvalidPayload(format!(
                "signature must be 65 bytes, got {}",
                sig.len()
            )));
        }
        let v = match sig[64] {
            v @ (27 | 28) => v - 27,
            v @ (0 | 1) => v,
            v => {
                return Err(SettlementError::InvalidPayload(format!(
                    "invalid recovery id {v}"
                )));
            }
        };
        let mut vs = [0u8; 32];
        vs.copy_from_slice(&sig[32..64]);
        if v == 1 {
            vs[0] |= 0x80;
        }
        Ok(CompactSignature {
            r: format!("0x{}", hex::encode(&sig[..32])),
            vs: format!("0x{}", hex::encode(vs)),
        })
    }
}

/// A maker-signed order, ready to be filled on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedOrder {
    pub order_hash: Option<String>,
    pub order: LedgerOrder,
    pub signature: CompactSignature,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    order: SignedFields,
    signature: String,
    #[serde(default)]
    full_order: Option<LedgerOrder>,
    #[serde(default)]
    order_hash: Option<String>,
}

impl SignedOrder {
    /// Decodes an order payload: JSON `{order, signature, fullOrder?, orderHash?}`.
    ///
    /// Without `fullOrder` the ledger order is rebuilt from the signed fields.
    pub fn decode(payload: &[u8]) -> Result<Self, SettlementError> {
        let env: Envelope = serde_json::from_slice(payload)
            .map_err(|e| SettlementError::InvalidPayload(e.to_string()))?;
        let raw_sig = hex::decode(env.signature.trim_start_matches("0x"))
            .map_err(|e| SettlementError::InvalidPayload(format!("signature: {e}")))?;
        let signature = CompactSignature::from_rsv(&raw_sig)?;
        let order = match env.full_order {
            Some(full) => full,
            None => {
                debug!(maker = %env.order.maker, "no ledger order in payload, rebuilding from signed fields");
                LedgerOrder::from(env.order)
            }
        };
        if order.maker.is_empty() {
            return Err(SettlementError::InvalidPayload("missing maker".into()));
        }
        Ok(SignedOrder {
            order_hash: env.order_hash,
            order,
            signature,
        })
    }

    /// The on-ledger maker address embedded in the signed order.
    pub fn maker(&self) -> &str {
        &self.order.maker
    }

    /// Key the ledger tracks remaining amounts by.
    pub fn identifier(&self) -> &str {
        self.order_hash.as_deref().unwrap_or(&self.order.salt)
    }
}

/// Everything the settlement side needs from the external ledger.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Fills `amount` (in the maker's taking asset, smallest units) of `order`.
    /// Returns the ledger's transaction reference.
    async fn submit_fill(&self, order: &SignedOrder, amount: u128)
    -> Result<String, SettlementError>;

    /// Unfilled amount of the order, for diagnostics.
    async fn query_remaining(&self, order_id: &str) -> Result<u128, SettlementError>;

    /// Spendable balance of `address`, for operational alerting.
    async fn balance_of(&self, address: &str) -> Result<u128, SettlementError>;
}

// ---- HTTP relayer ---------------------------------------------------------

#[derive(Serialize)]
struct FillRequest<'a> {
    order: &'a LedgerOrder,
    r: &'a str,
    vs: &'a str,
    amount: String,
    taker_traits: &'static str,
}

#[derive(Deserialize)]
struct FillResponse {
    tx_hash: String,
}

#[derive(Deserialize)]
struct AmountResponse {
    #[serde(deserialize_with = "uint")]
    amount: String,
}

#[derive(Deserialize, Default)]
struct RelayerError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// JSON client for a ledger relayer that signs and broadcasts fills.
///
/// Routes: `POST /fills`, `GET /orders/{id}/remaining`, `GET /balances/{address}`.
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_amount(&self, path: &str) -> Result<u128, SettlementError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(network)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.json::<RelayerError>().await.unwrap_or_default();
            return Err(classify(status, body.code.as_deref(), &body.error));
        }
        let body = resp.json::<AmountResponse>().await.map_err(network)?;
        parse_amount(&body.amount)
    }
}

fn network(e: reqwest::Error) -> SettlementError {
    SettlementError::Network(e.to_string())
}

fn parse_amount(s: &str) -> Result<u128, SettlementError> {
    s.parse()
        .map_err(|_| SettlementError::InvalidPayload(format!("bad amount `{s}` from ledger")))
}

/// Maps a relayer failure onto the settlement error taxonomy.
pub fn classify(status: StatusCode, code: Option<&str>, message: &str) -> SettlementError {
    let lower = message.to_ascii_lowercase();
    if code == Some("insufficient_funds") || lower.contains("insufficient funds") {
        return SettlementError::InsufficientFunds(message.to_string());
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return SettlementError::Network(format!("{status}: {message}"));
    }
    // nonce and allowance races clear up on their own
    let retryable = lower.contains("nonce") || lower.contains("allowance");
    SettlementError::Revert {
        reason: message.to_string(),
        retryable,
    }
}

#[async_trait]
impl LedgerGateway for HttpLedger {
    async fn submit_fill(
        &self,
        order: &SignedOrder,
        amount: u128,
    ) -> Result<String, SettlementError> {
        let req = FillRequest {
            order: &order.order,
            r: &order.signature.r,
            vs: &order.signature.vs,
            amount: amount.to_string(),
            taker_traits: "0",
        };
        let resp = self
            .client
            .post(format!("{}/fills", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(network)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.json::<RelayerError>().await.unwrap_or_default();
            return Err(classify(status, body.code.as_deref(), &body.error));
        }
        let body = resp.json::<FillResponse>().await.map_err(network)?;
        info!(tx = %body.tx_hash, maker = %order.maker(), amount = %amount, "fill confirmed");
        Ok(body.tx_hash)
    }

    async fn query_remaining(&self, order_id: &str) -> Result<u128, SettlementError> {
        self.get_amount(&format!("/orders/{order_id}/remaining"))
            .await
    }

    async fn balance_of(&self, address: &str) -> Result<u128, SettlementError> {
        self.get_amount(&format!("/balances/{address}")).await
    }
}

// ---- in-process ledger ----------------------------------------------------

#[derive(Default)]
struct SimulatedState {
    remaining: HashMap<String, u128>,
    filled: HashMap<String, u128>,
    balances: HashMap<String, u128>,
    scripted: VecDeque<SettlementError>,
    next_tx: u64,
}

/// In-process ledger with per-order remaining amounts and scripted failures.
///
/// Orders it has not been told about have unlimited remaining amount.
#[derive(Default)]
pub struct SimulatedLedger {
    state: Mutex<SimulatedState>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fill takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `times` fills fail with `error`.
    pub fn fail_next(&self, times: usize, error: SettlementError) {
        let mut state = self.state();
        for _ in 0..times {
            state.scripted.push_back(error.clone());
        }
    }

    pub fn set_remaining(&self, order_id: &str, amount: u128) {
        self.state().remaining.insert(order_id.to_string(), amount);
    }

    pub fn set_balance(&self, address: &str, amount: u128) {
        self.state()
            .balances
            .insert(address.to_ascii_lowercase(), amount);
    }

    /// Number of `submit_fill` calls so far, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn filled(&self, order_id: &str) -> u128 {
        self.state().filled.get(order_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn submit_fill(
        &self,
        order: &SignedOrder,
        amount: u128,
    ) -> Result<String, SettlementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        let id = order.identifier().to_string();
        if let Some(left) = state.remaining.get_mut(&id) {
            if amount > *left {
                return Err(SettlementError::Revert {
                    reason: format!("fill of {amount} exceeds remaining {left}"),
                    retryable: false,
                });
            }
            *left -= amount;
        }
        *state.filled.entry(id).or_default() += amount;
        state.next_tx += 1;
        Ok(format!("0x{:064x}", state.next_tx))
    }

    async fn query_remaining(&self, order_id: &str) -> Result<u128, SettlementError> {
        Ok(self
            .state()
            .remaining
            .get(order_id)
            .copied()
            .unwrap_or(u128::MAX))
    }

    async fn balance_of(&self, address: &str) -> Result<u128, SettlementError> {
        Ok(self
            .state()
            .balances
            .get(&address.to_ascii_lowercase())
            .copied()
            .unwrap_or(0))
    }
}
