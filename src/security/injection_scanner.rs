//! Prompt-injection scanner for inbound content.
//!
//! Two stages:
//! 1. **Pattern scan** — tiered regex lists produce a [`ThreatLevel`] and a
//!    sanitized copy with suspicious regions wrapped in quarantine markers.
//! 2. **Deep scan** (optional) — a second opinion from a classification
//!    model, used by the orchestrator to confirm HIGH verdicts before
//!    blocking. A deep-scan failure keeps the HIGH verdict (fail closed).
//!
//! Verdicts are cached in an LRU keyed by content hash, so repeated
//! deliveries of the same payload (retries, multi-device echo) scan once.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

const CACHE_SIZE: usize = 256;

pub const QUARANTINE_OPEN: &str = "[external content quarantined] ";
pub const QUARANTINE_CLOSE: &str = " [/external content quarantined]";

// ─── ThreatLevel ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

// ─── ScanResult ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub threat_level: ThreatLevel,
    /// Source patterns of every match, for logging and the system error event.
    pub matched_patterns: Vec<String>,
    /// Content with each suspicious region wrapped in quarantine markers.
    /// Identical to the input when nothing matched.
    pub sanitized_content: String,
}

impl ScanResult {
    fn clean(content: &str) -> Self {
        Self {
            threat_level: ThreatLevel::None,
            matched_patterns: Vec::new(),
            sanitized_content: content.to_owned(),
        }
    }
}

// ─── DeepScanner ──────────────────────────────────────────────────────────────

/// Second-stage classification, typically backed by a small fast model.
#[async_trait]
pub trait DeepScanner: Send + Sync {
    /// Returns `true` when the content is a genuine injection attempt.
    async fn classify(&self, content: &str, source: &str) -> Result<bool, String>;
}

// ─── Pattern tiers ────────────────────────────────────────────────────────────

const HIGH_PATTERNS: &[&str] = &[
    r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|above)\s+(?:instructions|directions|prompts)",
    r"(?i)disregard\s+(?:your|all|previous|the)\s+(?:instructions|system\s+prompt|rules)",
    r"(?i)(?:reveal|show|print|repeat)\s+(?:your\s+)?(?:system\s+prompt|initial\s+instructions|hidden\s+instructions)",
    r"(?i)you\s+are\s+now\s+(?:in\s+)?(?:developer\s+mode|dan|jailbreak|unrestricted)",
    r"(?i)new\s+instructions\s*:",
    r"(?i)begin\s+system\s+prompt",
    r"(?i)act\s+as\s+if\s+you\s+have\s+no\s+(?:restrictions|rules|guidelines)",
];

const MEDIUM_PATTERNS: &[&str] = &[
    r"(?i)do\s+not\s+tell\s+(?:the\s+)?(?:user|owner|anyone)",
    r"(?i)(?:send|forward|upload|post)\s+.{0,40}?(?:password|credential|api[\s_-]?key|secret|token)",
    r"(?i)this\s+is\s+(?:your|an?)\s+(?:system|admin|root)\s+(?:message|override|instruction)",
    r"(?i)<\s*/?\s*(?:system|assistant)\s*>",
];

const LOW_PATTERNS: &[&str] = &[
    r"(?i)pretend\s+(?:to\s+be|you\s+are)",
    r"(?i)\bhypothetically\b.{0,60}?\b(?:restrictions|rules|guidelines)\b",
];

// ─── InjectionScanner ─────────────────────────────────────────────────────────

pub struct InjectionScanner {
    high: Vec<Regex>,
    medium: Vec<Regex>,
    low: Vec<Regex>,
    deep: Option<Arc<dyn DeepScanner>>,
    cache: Mutex<LruCache<[u8; 32], (ThreatLevel, Vec<String>, String)>>,
}

impl InjectionScanner {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };
        let cache_size = NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            high: compile(HIGH_PATTERNS),
            medium: compile(MEDIUM_PATTERNS),
            low: compile(LOW_PATTERNS),
            deep: None,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Attach the deep-scan classifier used to confirm HIGH verdicts.
    pub fn with_deep_scanner(mut self, deep: Arc<dyn DeepScanner>) -> Self {
        self.deep = Some(deep);
        self
    }

    /// Pattern-scan `content`. `source` only affects logging.
    pub async fn scan(&self, content: &str, source: &str) -> ScanResult {
        if content.is_empty() {
            return ScanResult::clean(content);
        }

        let key: [u8; 32] = Sha256::digest(content.as_bytes()).into();
        if let Some((level, patterns, sanitized)) = self.cache.lock().await.get(&key).cloned() {
            return ScanResult {
                threat_level: level,
                matched_patterns: patterns,
                sanitized_content: sanitized,
            };
        }

        let mut level = ThreatLevel::None;
        let mut matched = Vec::new();
        let mut spans: Vec<(usize, usize)> = Vec::new();

        for (tier_level, tier) in [
            (ThreatLevel::High, &self.high),
            (ThreatLevel::Medium, &self.medium),
            (ThreatLevel::Low, &self.low),
        ] {
            for re in tier {
                let mut any = false;
                for m in re.find_iter(content) {
                    any = true;
                    spans.push((m.start(), m.end()));
                }
                if any {
                    matched.push(re.as_str().to_owned());
                    level = level.max(tier_level);
                }
            }
        }

        let result = if level == ThreatLevel::None {
            ScanResult::clean(content)
        } else {
            log::warn!("injection scan: {level:?} threat from {source} ({} patterns)", matched.len());
            ScanResult {
                threat_level: level,
                matched_patterns: matched,
                sanitized_content: quarantine(content, spans),
            }
        };

        self.cache.lock().await.put(
            key,
            (
                result.threat_level,
                result.matched_patterns.clone(),
                result.sanitized_content.clone(),
            ),
        );
        result
    }

    /// Confirm or downgrade a HIGH verdict with the deep classifier.
    ///
    /// Without a classifier, or when it errors, the original result stands
    /// (fail closed). A negative classification downgrades to MEDIUM so the
    /// content still flows sanitized rather than blocked.
    pub async fn deep_scan(&self, content: &str, source: &str, prior: ScanResult) -> ScanResult {
        let Some(deep) = self.deep.as_ref() else {
            return prior;
        };
        match deep.classify(content, source).await {
            Ok(true) => prior,
            Ok(false) => ScanResult {
                threat_level: ThreatLevel::Medium,
                ..prior
            },
            Err(e) => {
                log::error!("deep scan failed, keeping {:?} verdict: {e}", prior.threat_level);
                prior
            }
        }
    }
}

impl Default for InjectionScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap each matched span (merged where overlapping) in quarantine markers.
fn quarantine(content: &str, mut spans: Vec<(usize, usize)>) -> String {
    if spans.is_empty() {
        return content.to_owned();
    }
    spans.sort();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut out = String::with_capacity(content.len() + merged.len() * 48);
    let mut cursor = 0;
    for (start, end) in merged {
        out.push_str(&content[cursor..start]);
        out.push_str(QUARANTINE_OPEN);
        out.push_str(&content[start..end]);
        out.push_str(QUARANTINE_CLOSE);
        cursor = end;
    }
    out.push_str(&content[cursor..]);
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────
