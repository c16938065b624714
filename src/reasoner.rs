//! Cost-gated threat reasoning.
//!
//! The reasoner sits behind the deterministic filter and adds three layers
//! of deduplication before any LLM call goes out: block-level, context-hash
//! and per-liquidation event keys. The LLM is only ever consulted for a
//! state it has not already judged.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    filter::AnomalySignal,
    llm::LlmClient,
    observer::Snapshot,
    types::{BlockNumber, Confidence},
};

/// Threat label produced by the reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatKind {
    Natural,
    FlashLoanAttack,
    OracleManipulation,
    Sandwich,
    UnknownAnomaly,
}

impl ThreatKind {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "NATURAL" => Some(ThreatKind::Natural),
            "FLASH_LOAN_ATTACK" => Some(ThreatKind::FlashLoanAttack),
            "ORACLE_MANIPULATION" => Some(ThreatKind::OracleManipulation),
            "SANDWICH" => Some(ThreatKind::Sandwich),
            "UNKNOWN_ANOMALY" => Some(ThreatKind::UnknownAnomaly),
            _ => None,
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatKind::Natural => "NATURAL",
            ThreatKind::FlashLoanAttack => "FLASH_LOAN_ATTACK",
            ThreatKind::OracleManipulation => "ORACLE_MANIPULATION",
            ThreatKind::Sandwich => "SANDWICH",
            ThreatKind::UnknownAnomaly => "UNKNOWN_ANOMALY",
        };
        f.write_str(name)
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    DeterministicSkip,
    DedupSkip,
    Llm,
}

/// Structured output of the reasoning stage.
///
/// Invariant: when `source` is a skip, the kind is NATURAL and the
/// confidence is zero.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub kind: ThreatKind,
    pub confidence: Confidence,
    pub explanation: String,
    pub evidence: Vec<String>,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn deterministic_skip() -> Self {
        Self {
            kind: ThreatKind::Natural,
            confidence: Confidence::ZERO,
            explanation: "no anomalies detected in deterministic checks".to_string(),
            evidence: Vec::new(),
            source: ClassificationSource::DeterministicSkip,
        }
    }

    fn dedup_skip(explanation: &str) -> Self {
        Self {
            kind: ThreatKind::Natural,
            confidence: Confidence::ZERO,
            explanation: explanation.to_string(),
            evidence: Vec::new(),
            source: ClassificationSource::DedupSkip,
        }
    }

    fn unavailable() -> Self {
        Self {
            kind: ThreatKind::UnknownAnomaly,
            confidence: Confidence::from_f64(0.5),
            explanation: "LLM unavailable".to_string(),
            evidence: Vec::new(),
            source: ClassificationSource::Llm,
        }
    }

    fn parse_failure(detail: String) -> Self {
        Self {
            kind: ThreatKind::UnknownAnomaly,
            confidence: Confidence::from_f64(0.5),
            explanation: "parse failure".to_string(),
            evidence: vec![detail],
            source: ClassificationSource::Llm,
        }
    }

    pub fn is_threat(&self) -> bool {
        self.kind != ThreatKind::Natural
    }
}

/// Insertion-ordered set of analyzed event keys with bounded capacity;
/// the oldest key is evicted when full.
struct AnalyzedEvents {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl AnalyzedEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            set: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

const SYSTEM_PROMPT: &str = "You are a DeFi security analyst. Your only task is to analyze \
blockchain market data and detect price-manipulation attacks against a lending protocol.

Attack patterns:
- FLASH_LOAN_ATTACK: large single-block price moves that recover within one or two blocks, \
multiple large swaps in one block, liquidations during the dip, AMM price far from the oracle.
- ORACLE_MANIPULATION: oracle price far from the AMM spot, multiple oracle updates in one \
block, oracle moves inconsistent with trading activity.
- SANDWICH: a victim swap wedged between two attacker swaps in the same block, with the \
price reverting immediately after.
- UNKNOWN_ANOMALY: clearly abnormal state that fits none of the above.
- NATURAL: ordinary volatility consistent with observed volume.

Rules:
- Respond with ONLY valid JSON. No markdown fences, no prose outside the JSON.
- confidence is a number between 0.0 and 1.0.
- evidence lists at most 5 specific data points.

Required output format:
{\"classification\": \"NATURAL\" | \"FLASH_LOAN_ATTACK\" | \"ORACLE_MANIPULATION\" | \
\"SANDWICH\" | \"UNKNOWN_ANOMALY\", \"confidence\": <number>, \"explanation\": \"<string>\", \
\"evidence\": [\"<string>\", ...]}";

/// LLM-backed classifier with call deduplication.
///
/// The dedup caches are process-local and reset on restart. Nothing
/// outside the reasoner mutates them.
pub struct Reasoner {
    llm: Arc<dyn LlmClient>,
    call_timeout: Duration,
    last_llm_block: Option<BlockNumber>,
    last_context_hash: Option<[u8; 16]>,
    analyzed_events: AnalyzedEvents,
    llm_calls: u64,
}

impl Reasoner {
    pub fn new(llm: Arc<dyn LlmClient>, call_timeout: Duration, analyzed_capacity: usize) -> Self {
        Self {
            llm,
            call_timeout,
            last_llm_block: None,
            last_context_hash: None,
            analyzed_events: AnalyzedEvents::new(analyzed_capacity),
            llm_calls: 0,
        }
    }

    /// Total LLM calls issued since startup.
    pub fn llm_calls(&self) -> u64 {
        self.llm_calls
    }

    /// Classifies an anomalous snapshot, consulting the LLM only when no
    /// dedup layer short-circuits.
    pub async fn classify(&mut self, snapshot: &Snapshot, signal: AnomalySignal) -> Classification {
        if self.last_llm_block == Some(snapshot.block) {
            return Classification::dedup_skip("same block already analyzed");
        }

        let context = build_context(snapshot, signal);
        let digest = digest128(&context);
        if self.last_context_hash == Some(digest) {
            return Classification::dedup_skip("identical context already analyzed");
        }

        // Liquidation events each get one shot at the LLM. The keys are
        // committed only once a reply parses, so a malformed reply leaves
        // the event retryable next block.
        let mut pending_keys = Vec::new();
        if signal == AnomalySignal::UnfairLiquidation {
            let keys: Vec<String> = snapshot
                .liquidations
                .iter()
                .map(|liq| format!("liq:{:#x}:{}", liq.user, liq.block))
                .collect();
            if !keys.is_empty() && keys.iter().all(|key| self.analyzed_events.contains(key)) {
                return Classification::dedup_skip("liquidation already analyzed");
            }
            pending_keys = keys;
        }

        let prompt = format!(
            "{SYSTEM_PROMPT}\n\nCURRENT MARKET DATA:\n{}\n\nAnalyze this data for potential \
             manipulation attacks. Respond with JSON only.",
            serde_json::to_string_pretty(&context).unwrap_or_default()
        );

        self.llm_calls += 1;
        info!(
            block = %snapshot.block,
            %signal,
            total_llm_calls = self.llm_calls,
            "invoking llm"
        );

        let started = Instant::now();
        let reply = tokio::time::timeout(self.call_timeout, self.llm.complete(&prompt)).await;
        let elapsed = started.elapsed();

        let text = match reply {
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "llm call timed out");
                return Classification::unavailable();
            }
            Ok(Err(err)) => {
                warn!("llm transport failure: {err}");
                return Classification::unavailable();
            }
            Ok(Ok(text)) => text,
        };

        // A reply was obtained: commit block and context dedup whether or
        // not it parses, so a malformed answer cannot cause a retry storm.
        self.last_llm_block = Some(snapshot.block);
        self.last_context_hash = Some(digest);

        match parse_assessment(&text) {
            Ok(classification) => {
                for key in pending_keys {
                    self.analyzed_events.insert(key);
                }
                info!(
                    kind = %classification.kind,
                    confidence = %classification.confidence,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "threat assessment completed"
                );
                classification
            }
            Err(detail) => {
                warn!("llm reply did not parse: {detail}");
                Classification::parse_failure(detail)
            }
        }
    }
}

/// Deterministic analysis context. `serde_json`'s map keeps keys sorted,
/// so equal states always hash equally.
fn build_context(snapshot: &Snapshot, signal: AnomalySignal) -> serde_json::Value {
    json!({
        "market_state": {
            "block_number": snapshot.block.into_inner(),
            "oracle_price_usd": snapshot.oracle_price,
            "amm_spot_price_usd": snapshot.amm_spot_price,
            "price_deviation_pct": snapshot.deviation,
            "amm_paused": snapshot.flags.amm_paused,
            "vault_paused": snapshot.flags.vault_paused,
            "liquidations_blocked": snapshot.flags.liquidations_blocked,
        },
        "activity": {
            "swaps_in_block": snapshot.swaps_in_block,
            "oracle_updates_in_block": snapshot.oracle_updates_in_block,
            "liquidations_seen": snapshot.liquidations.len(),
        },
        "signal": signal,
        "recent_prices_usd": snapshot.recent_prices,
    })
}

fn digest128(context: &serde_json::Value) -> [u8; 16] {
    let serialized = serde_json::to_vec(context).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&digest[..16]);
    truncated
}

#[derive(serde::Deserialize)]
struct RawAssessment {
    classification: String,
    confidence: f64,
    explanation: String,
    #[serde(default)]
    evidence: Vec<serde_json::Value>,
}

fn parse_assessment(text: &str) -> Result<Classification, String> {
    let cleaned = strip_fences(text);
    let raw: RawAssessment =
        serde_json::from_str(cleaned).map_err(|err| format!("invalid json: {err}"))?;

    // Unknown labels degrade to UNKNOWN_ANOMALY instead of failing.
    let kind = ThreatKind::from_label(raw.classification.trim()).unwrap_or(ThreatKind::UnknownAnomaly);

    let evidence: Vec<String> = raw
        .evidence
        .into_iter()
        .take(5)
        .map(|item| match item {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect();

    Ok(Classification {
        kind,
        confidence: Confidence::from_f64(raw.confidence),
        explanation: raw.explanation,
        evidence,
        source: ClassificationSource::Llm,
    })
}

fn strip_fences(text: &str) -> &str {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}
