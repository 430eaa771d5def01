//! Deterministic backend scoring.
//!
//! The selector sums independent weighted signals per backend: continuity with the preferred
//! backend, content-shape bonuses for matching strengths, reliability from running metrics and
//! a capped latency penalty. Backends that are disabled or over their rate limit never win.

use serde::{Deserialize, Serialize};

use crate::metrics::BackendMetrics;
use crate::types::CapabilityDescriptor;

/// Score reported for candidates that cannot be selected.
pub const INELIGIBLE_SCORE: f64 = -1.0;

/// Tunable weights for [`ModelSelector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub continuity: f64,
    pub code: f64,
    pub creative: f64,
    pub analytical: f64,
    pub real_time: f64,
    pub long_content: f64,
    pub short_content: f64,
    /// Multiplied by the backend's success rate.
    pub reliability: f64,
    /// Penalty per second of average latency.
    pub latency_per_second: f64,
    pub max_latency_penalty: f64,
    /// Requests at least this many characters long count as long content.
    pub long_content_chars: usize,
    /// Requests at most this many characters long count as short content.
    pub short_content_chars: usize,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            continuity: 10.0,
            code: 20.0,
            creative: 15.0,
            analytical: 15.0,
            real_time: 10.0,
            long_content: 10.0,
            short_content: 5.0,
            reliability: 30.0,
            latency_per_second: 5.0,
            max_latency_penalty: 20.0,
            long_content_chars: 4_000,
            short_content_chars: 200,
        }
    }
}

/// Shape of the request text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSignal {
    Code,
    Creative,
    Analytical,
    RealTime,
    LongContent,
    ShortContent,
}

const CODE_CUES: &[&str] = &[
    "```", "fn ", "function", "class ", "def ", "import ", "compile", "debug", "refactor",
    "stack trace", "code",
];
const CREATIVE_CUES: &[&str] = &["story", "poem", "creative", "imagine", "write a", "lyrics"];
const ANALYTICAL_CUES: &[&str] = &[
    "analyze", "analyse", "compare", "evaluate", "explain why", "trade-off", "reason",
    "pros and cons",
];
const REAL_TIME_CUES: &[&str] = &["latest", "today", "current", "news", "right now", "this week"];

impl ContentSignal {
    /// Signals present in `text`, in declaration order.
    pub fn detect(text: &str, weights: &ScoringWeights) -> Vec<ContentSignal> {
        let lower = text.to_lowercase();
        let has_any = |cues: &[&str]| cues.iter().any(|cue| lower.contains(cue));
        let length = text.chars().count();

        let mut signals = Vec::new();
        if has_any(CODE_CUES) {
            signals.push(Self::Code);
        }
        if has_any(CREATIVE_CUES) {
            signals.push(Self::Creative);
        }
        if has_any(ANALYTICAL_CUES) {
            signals.push(Self::Analytical);
        }
        if has_any(REAL_TIME_CUES) {
            signals.push(Self::RealTime);
        }
        if length >= weights.long_content_chars {
            signals.push(Self::LongContent);
        } else if length <= weights.short_content_chars {
            signals.push(Self::ShortContent);
        }
        signals
    }

    /// Substrings of a capability strength that mark a backend as good at this signal.
    pub fn strength_keywords(self) -> &'static [&'static str] {
        match self {
            Self::Code => &["code", "programming", "debug"],
            Self::Creative => &["creative", "writing", "story"],
            Self::Analytical => &["analy", "reasoning", "math"],
            Self::RealTime => &["real-time", "realtime", "current", "search"],
            Self::LongContent => &["long", "document", "large context"],
            Self::ShortContent => &["fast", "quick", "concise", "speed"],
        }
    }

    fn weight(self, weights: &ScoringWeights) -> f64 {
        match self {
            Self::Code => weights.code,
            Self::Creative => weights.creative,
            Self::Analytical => weights.analytical,
            Self::RealTime => weights.real_time,
            Self::LongContent => weights.long_content,
            Self::ShortContent => weights.short_content,
        }
    }
}

/// Selector view of one registered backend.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub id: &'a str,
    pub enabled: bool,
    pub admissible: bool,
    pub capabilities: &'a CapabilityDescriptor,
    pub metrics: BackendMetrics,
}

impl Candidate<'_> {
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.admissible
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub id: String,
    pub score: f64,
}

/// Heuristic scorer choosing one backend per request.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    weights: ScoringWeights,
}

impl ModelSelector {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    fn score(
        &self,
        signals: &[ContentSignal],
        preferred: Option<&str>,
        candidate: &Candidate<'_>,
    ) -> f64 {
        if !candidate.is_eligible() {
            return INELIGIBLE_SCORE;
        }
        let weights = &self.weights;
        let mut score = 0.0;

        if preferred == Some(candidate.id) {
            score += weights.continuity;
        }
        for signal in signals {
            if candidate.capabilities.has_strength(signal.strength_keywords()) {
                score += signal.weight(weights);
            }
        }
        score += candidate.metrics.success_rate() * weights.reliability;

        let latency_seconds = candidate.metrics.average_latency_ms / 1_000.0;
        score -= (latency_seconds * weights.latency_per_second).min(weights.max_latency_penalty);
        score
    }

    /// Scores every candidate in registration order; ineligible ones read [`INELIGIBLE_SCORE`].
    pub fn rank(
        &self,
        request_text: &str,
        preferred: Option<&str>,
        candidates: &[Candidate<'_>],
    ) -> Vec<ScoredCandidate> {
        let signals = ContentSignal::detect(request_text, &self.weights);
        candidates
            .iter()
            .map(|candidate| ScoredCandidate {
                id: candidate.id.to_string(),
                score: self.score(&signals, preferred, candidate),
            })
            .collect()
    }

    /// Highest-scoring eligible backend; the earliest registered wins ties.
    pub fn select(
        &self,
        request_text: &str,
        preferred: Option<&str>,
        candidates: &[Candidate<'_>],
    ) -> Option<String> {
        let signals = ContentSignal::detect(request_text, &self.weights);
        let mut best: Option<(&str, f64)> = None;
        for candidate in candidates.iter().filter(|c| c.is_eligible()) {
            let score = self.score(&signals, preferred, candidate);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((candidate.id, score));
            }
        }
        best.map(|(id, _)| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(strengths: &[&str]) -> CapabilityDescriptor {
        CapabilityDescriptor {
            strengths: strengths.iter().map(|s| s.to_string()).collect(),
            ..CapabilityDescriptor::default()
        }
    }

    fn candidate<'a>(id: &'a str, caps: &'a CapabilityDescriptor) -> Candidate<'a> {
        Candidate {
            id,
            enabled: true,
            admissible: true,
            capabilities: caps,
            metrics: BackendMetrics::default(),
        }
    }

    #[test]
    fn detects_content_shapes() {
        let weights = ScoringWeights::default();
        let signals = ContentSignal::detect("Please refactor this ```rust fn main() {}```", &weights);
        assert_eq!(signals, vec![ContentSignal::Code, ContentSignal::ShortContent]);

        let long = "analyze ".repeat(600);
        let signals = ContentSignal::detect(&long, &weights);
        assert!(signals.contains(&ContentSignal::Analytical));
        assert!(signals.contains(&ContentSignal::LongContent));
    }

    #[test]
    fn strengths_attract_matching_requests() {
        let general = caps(&["general chat"]);
        let coder = caps(&["Code generation"]);
        let candidates = [candidate("general", &general), candidate("coder", &coder)];
        let selector = ModelSelector::default();

        assert_eq!(
            selector.select("debug this function", None, &candidates),
            Some("coder".to_string())
        );
        assert_eq!(
            selector.select("hello", None, &candidates),
            Some("general".to_string()),
            "ties go to the first registered backend"
        );
        assert_eq!(
            selector.select("hello", Some("coder"), &candidates),
            Some("coder".to_string())
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let a = caps(&["creative writing"]);
        let b = caps(&["reasoning", "fast"]);
        let mut slow = candidate("b", &b);
        slow.metrics.total_requests = 4;
        slow.metrics.successful_requests = 3;
        slow.metrics.average_latency_ms = 1_800.0;
        let candidates = [candidate("a", &a), slow];
        let selector = ModelSelector::default();

        let first = selector.select("write a story and compare endings", Some("b"), &candidates);
        for _ in 0..50 {
            assert_eq!(
                selector.select("write a story and compare endings", Some("b"), &candidates),
                first
            );
        }
    }

    #[test]
    fn ineligible_backends_never_win() {
        let strong = caps(&["code", "creative", "reasoning", "search", "fast"]);
        let plain = caps(&[]);
        let long = "x".repeat(5_000);
        let texts = ["hello", "fix this code", "latest news analysis", long.as_str()];

        for (enabled, admissible) in [(false, true), (true, false), (false, false)] {
            let mut star = candidate("star", &strong);
            star.enabled = enabled;
            star.admissible = admissible;
            let candidates = [star, candidate("plain", &plain)];
            let selector = ModelSelector::default();

            for text in texts {
                assert_eq!(
                    selector.select(text, Some("star"), &candidates),
                    Some("plain".to_string())
                );
                let ranked = selector.rank(text, Some("star"), &candidates);
                assert_eq!(ranked[0].score, INELIGIBLE_SCORE);
            }
        }
    }

    #[test]
    fn eligible_backend_wins_even_with_negative_score() {
        let plain = caps(&[]);
        let mut weak = candidate("weak", &plain);
        weak.metrics.total_requests = 10;
        weak.metrics.failed_requests = 10;
        weak.metrics.average_latency_ms = 60_000.0;
        let mut off = candidate("off", &plain);
        off.enabled = false;

        let selector = ModelSelector::default();
        assert_eq!(selector.select("hi", None, &[off, weak]), Some("weak".to_string()));
    }

    #[test]
    fn no_eligible_backend_yields_none() {
        let plain = caps(&[]);
        let mut off = candidate("off", &plain);
        off.enabled = false;
        assert_eq!(ModelSelector::default().select("hi", None, &[off]), None);
    }

    #[test]
    fn latency_penalty_is_capped() {
        let plain = caps(&[]);
        let mut slow = candidate("slow", &plain);
        slow.metrics.total_requests = 1;
        slow.metrics.successful_requests = 1;
        slow.metrics.average_latency_ms = 3_600_000.0;
        let weights = ScoringWeights::default();
        let ranked = ModelSelector::new(weights.clone()).rank("hi", None, &[slow]);
        assert_eq!(
            ranked[0].score,
            weights.reliability - weights.max_latency_penalty
        );
    }
}
