//! Deterministic signal classification and noise gating.
//!
//! `fast` produces the 5-tuple from regex and keyword tables in well under
//! a millisecond. `refine` is the optional LLM second pass whose result a
//! session attaches later; its failures are ignored by design.

use std::sync::OnceLock;

use osa_domain::signal::{Mode, Signal};
use osa_providers::{CallOptions, ProviderRouter};
use regex::Regex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keyword tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BUILD_WORDS: &[&str] = &[
    "build", "create", "implement", "write", "add", "make", "generate", "scaffold", "design",
];
const EXECUTE_WORDS: &[&str] = &[
    "run", "execute", "deploy", "start", "stop", "restart", "install", "launch", "trigger",
];
const MAINTAIN_WORDS: &[&str] = &[
    "fix", "update", "upgrade", "refactor", "clean", "migrate", "patch", "rename", "repair",
];
const ANALYZE_WORDS: &[&str] = &[
    "analyze", "analyse", "review", "explain", "investigate", "compare", "summarize", "debug",
    "why", "how", "what", "check",
];

const CODE_MARKERS: &[&str] = &[
    "```", "fn ", "def ", "class ", "import ", "error:", "panic", "traceback", "stack trace",
];
const OPS_MARKERS: &[&str] = &[
    "server", "deploy", "container", "docker", "cron", "service", "database", "backup",
];

fn greeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(hi|hello|hey|yo|sup|good (morning|afternoon|evening|night))[.!\s]*$",
        )
        .expect("valid regex")
    })
}

fn thanks_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(thanks|thank you|thx|ty|cheers)[.!\s]*$").expect("valid regex")
    })
}

fn filler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(ok|okay|k|cool|nice|great|lol|haha|sure|yep|yeah|no|nope)[.!\s]*$")
            .expect("valid regex")
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fast classifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn contains_word(lower: &str, words: &[&str]) -> bool {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| words.contains(&token))
}

/// Deterministic classification of an inbound message.
pub fn fast(message: &str, channel: &str) -> Signal {
    let trimmed = message.trim();
    let lower = trimmed.to_lowercase();

    if trimmed.is_empty()
        || greeting_re().is_match(trimmed)
        || thanks_re().is_match(trimmed)
        || filler_re().is_match(trimmed)
    {
        return Signal::converse().with_weight(0.1);
    }

    let is_question = trimmed.ends_with('?')
        || lower.starts_with("what")
        || lower.starts_with("why")
        || lower.starts_with("how")
        || lower.starts_with("who")
        || lower.starts_with("when")
        || lower.starts_with("where");

    // Questions read as analysis even when they mention action verbs
    // ("why is the deploy failing?").
    let mode = if is_question {
        Mode::Analyze
    } else if contains_word(&lower, BUILD_WORDS) {
        Mode::Build
    } else if contains_word(&lower, EXECUTE_WORDS) {
        Mode::Execute
    } else if contains_word(&lower, MAINTAIN_WORDS) {
        Mode::Maintain
    } else if contains_word(&lower, ANALYZE_WORDS) {
        Mode::Analyze
    } else {
        Mode::Converse
    };

    let kind = if is_question {
        "question"
    } else if matches!(mode, Mode::Build | Mode::Execute | Mode::Maintain) {
        "request"
    } else {
        "general"
    };

    let genre = if CODE_MARKERS.iter().any(|m| lower.contains(m)) {
        "code"
    } else if OPS_MARKERS.iter().any(|m| lower.contains(m)) {
        "ops"
    } else {
        "chat"
    };

    let format = if trimmed.contains("```") || trimmed.contains('`') {
        "markdown"
    } else {
        "text"
    };

    let mut weight: f32 = match mode {
        Mode::Converse => 0.3,
        Mode::Analyze => 0.6,
        Mode::Maintain => 0.7,
        Mode::Build => 0.8,
        Mode::Execute => 0.85,
    };
    if trimmed.len() > 200 {
        weight += 0.1;
    }
    if channel == "heartbeat" {
        // Scheduled work is always actionable.
        weight = weight.max(0.8);
    }

    Signal {
        mode,
        genre: genre.into(),
        kind: kind.into(),
        format: format.into(),
        weight: weight.clamp(0.0, 1.0),
    }
}

/// LLM refinement of a fast signal. Callers spawn this in the background
/// and attach the result to the session when it lands; errors are
/// swallowed by the caller.
pub async fn refine(router: &ProviderRouter, message: &str) -> osa_domain::Result<Signal> {
    let prompt = format!(
        "Classify this message. Respond with strict JSON only:\n\
         {{\"mode\": \"analyze|build|execute|maintain|converse\", \"genre\": \"...\", \
         \"type\": \"...\", \"format\": \"...\", \"weight\": 0.0}}\n\nMESSAGE:\n{message}"
    );
    let opts = CallOptions {
        json_mode: true,
        max_tokens: Some(200),
        temperature: Some(0.0),
        ..Default::default()
    };
    let resp = router
        .chat(&[osa_domain::message::Message::user(prompt)], &[], &opts)
        .await?;
    let signal: Signal = serde_json::from_str(resp.content.trim())?;
    Ok(signal)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Noise filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseReason {
    Empty,
    TooShort,
    PatternMatch,
    LowWeight,
}

impl NoiseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoiseReason::Empty => "empty",
            NoiseReason::TooShort => "too_short",
            NoiseReason::PatternMatch => "pattern_match",
            NoiseReason::LowWeight => "low_weight",
        }
    }
}

#[derive(Debug, Clone)]
pub enum NoiseVerdict {
    Noise { reason: NoiseReason, ack: String },
    Signal { weight: f32 },
}

/// Gate low-value inputs before they reach the LLM. Noise still gets
/// persisted and acknowledged with a canned reply.
pub fn filter(message: &str, signal: &Signal) -> NoiseVerdict {
    let trimmed = message.trim();

    if trimmed.is_empty() {
        return NoiseVerdict::Noise {
            reason: NoiseReason::Empty,
            ack: String::new(),
        };
    }
    if trimmed.chars().count() < 3 && trimmed.parse::<f64>().is_err() {
        return NoiseVerdict::Noise {
            reason: NoiseReason::TooShort,
            ack: "👍".into(),
        };
    }
    if thanks_re().is_match(trimmed) {
        return NoiseVerdict::Noise {
            reason: NoiseReason::PatternMatch,
            ack: "👍".into(),
        };
    }
    if greeting_re().is_match(trimmed) {
        return NoiseVerdict::Noise {
            reason: NoiseReason::PatternMatch,
            ack: "Got it.".into(),
        };
    }
    if filler_re().is_match(trimmed) {
        return NoiseVerdict::Noise {
            reason: NoiseReason::PatternMatch,
            ack: "Noted.".into(),
        };
    }
    if signal.weight < 0.2 {
        return NoiseVerdict::Noise {
            reason: NoiseReason::LowWeight,
            ack: "Noted.".into(),
        };
    }

    NoiseVerdict::Signal {
        weight: signal.weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requests_classify_build() {
        let s = fast("please implement a parser for this format", "cli");
        assert_eq!(s.mode, Mode::Build);
        assert_eq!(s.kind, "request");
        assert!(s.weight >= 0.75);
    }

    #[test]
    fn questions_classify_analyze() {
        let s = fast("why is the deploy failing?", "cli");
        assert_eq!(s.mode, Mode::Analyze);
        assert_eq!(s.kind, "question");
    }

    #[test]
    fn code_genre_detected() {
        let s = fast("fix this:\n```\nfn main() {}\n```", "cli");
        assert_eq!(s.genre, "code");
        assert_eq!(s.format, "markdown");
    }

    #[test]
    fn greetings_are_low_weight_converse() {
        let s = fast("hey!", "cli");
        assert_eq!(s.mode, Mode::Converse);
        assert!(s.weight <= 0.2);
    }

    #[test]
    fn heartbeat_channel_floors_weight() {
        let s = fast("tidy the downloads folder", "heartbeat");
        assert!(s.weight >= 0.8);
    }

    #[test]
    fn classification_is_fast() {
        let msg = "implement a web scraper that stores results in sqlite ".repeat(20);
        let start = std::time::Instant::now();
        for _ in 0..100 {
            fast(&msg, "cli");
        }
        // 100 classifications well under 100ms leaves huge margin on CI.
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn noise_empty_and_short() {
        let sig = Signal::converse();
        assert!(matches!(
            filter("", &sig),
            NoiseVerdict::Noise { reason: NoiseReason::Empty, .. }
        ));
        match filter("ok", &sig) {
            // "ok" hits the filler pattern before the length check matters.
            NoiseVerdict::Noise { reason, .. } => {
                assert!(matches!(
                    reason,
                    NoiseReason::PatternMatch | NoiseReason::TooShort
                ));
            }
            other => panic!("expected noise, got {other:?}"),
        }
    }

    #[test]
    fn thanks_gets_thumbs_up() {
        let sig = fast("thanks", "cli");
        match filter("thanks", &sig) {
            NoiseVerdict::Noise { reason, ack } => {
                assert_eq!(reason, NoiseReason::PatternMatch);
                assert_eq!(ack, "👍");
            }
            other => panic!("expected noise, got {other:?}"),
        }
    }

    #[test]
    fn real_requests_pass_through() {
        let msg = "deploy the staging branch and run the smoke tests";
        let sig = fast(msg, "cli");
        assert!(matches!(filter(msg, &sig), NoiseVerdict::Signal { .. }));
    }

    #[test]
    fn low_weight_signal_is_noise() {
        let sig = Signal::converse().with_weight(0.1);
        assert!(matches!(
            filter("hmm interesting stuff here really", &sig),
            NoiseVerdict::Noise { reason: NoiseReason::LowWeight, .. }
        ));
    }
}
