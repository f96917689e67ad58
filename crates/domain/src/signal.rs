use serde::{Deserialize, Serialize};

/// Coarse intent of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Analyze,
    Build,
    Execute,
    Maintain,
    Converse,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Analyze => "analyze",
            Mode::Build => "build",
            Mode::Execute => "execute",
            Mode::Maintain => "maintain",
            Mode::Converse => "converse",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 5-tuple classification of an inbound message. Produced by the fast
/// deterministic classifier and optionally refined later by an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub mode: Mode,
    pub genre: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    /// Salience in `[0, 1]`; drives noise gating and plan-mode triggering.
    pub weight: f32,
}

impl Signal {
    /// Low-weight conversational default, used when nothing else matches.
    pub fn converse() -> Self {
        Self {
            mode: Mode::Converse,
            genre: "chat".into(),
            kind: "general".into(),
            format: "text".into(),
            weight: 0.3,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_serializes_type_field() {
        let s = Signal::converse();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"type\":\"general\""));
        assert!(json.contains("\"mode\":\"converse\""));
    }

    #[test]
    fn weight_is_clamped() {
        let s = Signal::converse().with_weight(1.7);
        assert_eq!(s.weight, 1.0);
        let s = Signal::converse().with_weight(-0.2);
        assert_eq!(s.weight, 0.0);
    }
}
