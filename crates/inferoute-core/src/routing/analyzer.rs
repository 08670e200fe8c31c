//! Request analyzer
//!
//! Derives task features from a prompt: complexity, category, intent flags
//! and a token estimate. Analysis never fails; unusable input degrades to
//! defaults and the `degraded` flag is set.
//!
//! ## Complexity
//!
//! Sum of four independently capped sub-scores, clamped to [0, 1]:
//!
//! | sub-score        | rule                                   | cap |
//! |------------------|----------------------------------------|-----|
//! | length           | words / 500 × 0.3                      | 0.3 |
//! | keyword density  | 0.1 per distinct complexity keyword    | 0.3 |
//! | questions        | 0.05 per `?`                           | 0.2 |
//! | cues             | 0.1 multi-step cue + 0.1 context cue   | 0.2 |
//!
//! ## Token estimate
//!
//! `ceil(chars / 4)`: one token per four characters.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::types::{PreferenceSnapshot, RequestAnalysis, RouteContext, TaskCategory};

/// Characters per estimated token
pub const CHARS_PER_TOKEN: usize = 4;

/// Hint value used when the caller gives none (or an unusable one)
pub const DEFAULT_HINT: f64 = 0.5;

const LENGTH_CAP: f64 = 0.3;
const KEYWORD_CAP: f64 = 0.3;
const QUESTION_CAP: f64 = 0.2;
const CUE_CAP: f64 = 0.2;

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "architecture",
    "algorithm",
    "optimize",
    "design",
    "implement",
    "compare",
    "evaluate",
    "prove",
    "refactor",
    "distributed",
    "concurrency",
    "tradeoff",
    "trade-off",
    "performance",
    "scalability",
    "security",
];

fn rule(pattern: &str) -> Regex {
    // Patterns are compile-time constants covered by tests.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid analyzer pattern {pattern}: {e}"))
}

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?m)```|^\s*(fn|def|class|function|impl|struct|import|#include|public|const|let)\s+\w|[;{}]\s*$|=>|->\s*\w")
});

static MULTI_STEP_CUE: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(first|then|finally|step by step|step 1|after that)\b|\bnext,")
});

static CONTEXT_CUE: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(given|based on|in the context|previous|above|as mentioned)\b")
});

static CREATIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(story|poem|poetry|creative|imagine|fiction|lyrics|song|novel|narrative|haiku|screenplay)\b")
});

static REASONING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(why|reason|reasoning|prove|proof|explain|logic|logical|deduce|infer|solve|calculate|step by step)\b")
});

static REVIEW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(review|audit|critique|refactor|bug|bugs|debug|lint|code smell)\b")
});

static CODE_MENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(code|function|class|method|script|program|api|module|pull request|diff|snippet|endpoint|query)\b")
});

static GENERATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(write|implement|generate|create|build|code up)\b")
});

static TRANSLATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\btranslat(e|ion|ing)\b|\b(into|to) (english|spanish|french|german|italian|portuguese|chinese|japanese|korean|russian|arabic|hindi)\b")
});

static RESEARCH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(research|sources|literature|survey|papers|citations?|references|state of the art)\b")
});

static STRICT_REASONING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(prove|proof|deduce|solve|calculate|logic|puzzle|riddle|step by step|equation)\b")
});

static ANALYSIS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b(analy[sz]e|analysis|compare|comparison|evaluate|assess|summari[sz]e|breakdown|insights?|pros and cons)\b")
});

static CONVERSATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)^\s*(hi|hello|hey|thanks|thank you|good (morning|afternoon|evening)|how are you)\b")
});

/// Flags computed before classification
#[derive(Debug, Clone, Copy)]
struct IntentFlags {
    has_code: bool,
    creative: bool,
    reasoning: bool,
}

/// Derives a [`RequestAnalysis`] from a prompt and its context
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestAnalyzer;

impl RequestAnalyzer {
    /// Create a new analyzer
    pub fn new() -> Self {
        Self
    }

    /// Analyze a prompt.
    ///
    /// `preferences` is the caller's preference profile, read but never modified.
    pub fn analyze(
        &self,
        prompt: &str,
        context: &RouteContext,
        preferences: Option<PreferenceSnapshot>,
    ) -> RequestAnalysis {
        let mut degraded = prompt.trim().is_empty();

        let flags = IntentFlags {
            has_code: CODE_PATTERN.is_match(prompt),
            creative: CREATIVE_PATTERN.is_match(prompt),
            reasoning: REASONING_PATTERN.is_match(prompt),
        };

        let (urgency, urgency_ok) = resolve_hint(context.urgency);
        let (quality, quality_ok) = resolve_hint(context.quality);
        let (budget, budget_ok) = resolve_hint(context.budget);
        degraded |= !(urgency_ok && quality_ok && budget_ok);

        let estimated_tokens = estimate_tokens(prompt);
        let token_budget = context
            .max_tokens
            .unwrap_or_else(|| estimated_tokens.saturating_mul(2));

        let analysis = RequestAnalysis {
            complexity: complexity_score(prompt),
            category: classify(prompt, flags),
            urgency,
            quality,
            budget,
            has_code: flags.has_code,
            creative_intent: flags.creative,
            reasoning_intent: flags.reasoning,
            estimated_tokens,
            token_budget,
            preferences,
            degraded,
        };

        if degraded {
            debug!(
                category = %analysis.category,
                "Analysis degraded, defaults substituted for unusable input"
            );
        }

        analysis
    }
}

/// Approximate token count for a piece of text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Bounded complexity score in [0, 1]
pub fn complexity_score(prompt: &str) -> f64 {
    let lower = prompt.to_lowercase();
    let word_count = lower.split_whitespace().count();

    let length = (word_count as f64 / 500.0 * LENGTH_CAP).min(LENGTH_CAP);

    let keyword_hits = COMPLEXITY_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count();
    let keywords = (keyword_hits as f64 * 0.1).min(KEYWORD_CAP);

    let questions = (lower.matches('?').count() as f64 * 0.05).min(QUESTION_CAP);

    let mut cues: f64 = 0.0;
    if MULTI_STEP_CUE.is_match(&lower) {
        cues += 0.1;
    }
    if CONTEXT_CUE.is_match(&lower) {
        cues += 0.1;
    }
    let cues = cues.min(CUE_CAP);

    (length + keywords + questions + cues).clamp(0.0, 1.0)
}

/// Ordered classification rules; the first match wins.
///
/// 1. code review: review vocabulary together with code or talk of code
/// 2. code generation: code present, or a request to write code
/// 3. translation
/// 4. creative writing
/// 5. research
/// 6. reasoning
/// 7. analysis
/// 8. conversation
/// 9. general (fallback)
fn classify(prompt: &str, flags: IntentFlags) -> TaskCategory {
    let mentions_code = CODE_MENTION_PATTERN.is_match(prompt);

    if REVIEW_PATTERN.is_match(prompt) && (flags.has_code || mentions_code) {
        return TaskCategory::CodeReview;
    }
    if flags.has_code || (GENERATE_PATTERN.is_match(prompt) && mentions_code) {
        return TaskCategory::CodeGeneration;
    }
    if TRANSLATION_PATTERN.is_match(prompt) {
        return TaskCategory::Translation;
    }
    if flags.creative {
        return TaskCategory::CreativeWriting;
    }
    if RESEARCH_PATTERN.is_match(prompt) {
        return TaskCategory::Research;
    }
    if STRICT_REASONING_PATTERN.is_match(prompt) {
        return TaskCategory::Reasoning;
    }
    if ANALYSIS_PATTERN.is_match(prompt) {
        return TaskCategory::Analysis;
    }
    if CONVERSATION_PATTERN.is_match(prompt) {
        return TaskCategory::Conversation;
    }
    TaskCategory::General
}

/// Clamp a hint into [0, 1]; missing hints are fine, non-finite ones degrade
fn resolve_hint(hint: Option<f64>) -> (f64, bool) {
    match hint {
        None => (DEFAULT_HINT, true),
        Some(v) if v.is_finite() => (v.clamp(0.0, 1.0), true),
        Some(_) => (DEFAULT_HINT, false),
    }
}
