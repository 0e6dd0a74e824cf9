//! Translation directions and the immutable direction → prompt/voice table.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Languages ────────────────────────────────────────────────────

/// Languages the interpreter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LanguageCode {
    En,
    Th,
}

impl LanguageCode {
    /// Human-readable language name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Th => "Thai",
        }
    }
}

// ── Direction ────────────────────────────────────────────────────

/// Ordered (source, target) language pair of a conversation turn.
///
/// Exactly one direction is active at a time; the turn machine carries it
/// inside `Listening(Direction)` so two simultaneous captures are
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Direction {
    #[serde(rename = "en-th", alias = "A-B")]
    EnToTh,
    #[serde(rename = "th-en", alias = "B-A")]
    ThToEn,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::EnToTh, Direction::ThToEn];

    pub fn source(self) -> LanguageCode {
        match self {
            Self::EnToTh => LanguageCode::En,
            Self::ThToEn => LanguageCode::Th,
        }
    }

    pub fn target(self) -> LanguageCode {
        match self {
            Self::EnToTh => LanguageCode::Th,
            Self::ThToEn => LanguageCode::En,
        }
    }

    /// Wire name used by the `set_direction` control message.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnToTh => "en-th",
            Self::ThToEn => "th-en",
        }
    }

    /// Parse a wire name (`en-th`, `th-en`, or the generic `A-B` / `B-A`).
    pub fn from_str_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "en-th" | "a-b" => Some(Self::EnToTh),
            "th-en" | "b-a" => Some(Self::ThToEn),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::EnToTh => 0,
            Self::ThToEn => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Direction table ──────────────────────────────────────────────

/// Prompt and default voice bound to one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionProfile {
    pub instructions: String,
    pub default_voice: String,
}

/// Immutable direction → (system prompt, default voice) lookup.
///
/// Built once at startup from config and shared by `Arc` with every
/// session and relay pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionTable {
    profiles: [DirectionProfile; 2],
}

impl DirectionTable {
    pub fn new(en_th: DirectionProfile, th_en: DirectionProfile) -> Self {
        Self {
            profiles: [en_th, th_en],
        }
    }

    /// Table with the built-in prompts and the given default voices.
    pub fn with_voices(en_th_voice: &str, th_en_voice: &str) -> Self {
        Self::new(
            DirectionProfile {
                instructions: build_system_prompt(Direction::EnToTh),
                default_voice: en_th_voice.to_string(),
            },
            DirectionProfile {
                instructions: build_system_prompt(Direction::ThToEn),
                default_voice: th_en_voice.to_string(),
            },
        )
    }

    fn profile(&self, direction: Direction) -> &DirectionProfile {
        &self.profiles[direction.index()]
    }

    pub fn instructions(&self, direction: Direction) -> &str {
        &self.profile(direction).instructions
    }

    pub fn default_voice(&self, direction: Direction) -> &str {
        &self.profile(direction).default_voice
    }
}

impl Default for DirectionTable {
    fn default() -> Self {
        Self::with_voices("shimmer", "alloy")
    }
}

/// Built-in interpreter prompt for one direction.
pub fn build_system_prompt(direction: Direction) -> String {
    let source = direction.source().display_name();
    let target = direction.target().display_name();
    let register = match direction.target() {
        LanguageCode::Th => {
            " Use polite Thai with the appropriate particles (ครับ/ค่ะ) matching a neutral speaker."
        }
        LanguageCode::En => " Use natural, conversational English.",
    };

    format!(
        "You are a live interpreter. The user speaks {source}. Translate everything the user says \
         into {target} and speak only the translation.{register} Preserve the speaker's tone and intent. \
         Never answer questions yourself, never explain, never add commentary. Just speak the \
         translated words immediately."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_languages() {
        assert_eq!(Direction::EnToTh.source(), LanguageCode::En);
        assert_eq!(Direction::EnToTh.target(), LanguageCode::Th);
        assert_eq!(Direction::ThToEn.source(), LanguageCode::Th);
        assert_eq!(Direction::ThToEn.target(), LanguageCode::En);
    }

    #[test]
    fn direction_wire_names_and_aliases() {
        assert_eq!(
            serde_json::to_string(&Direction::EnToTh).unwrap(),
            "\"en-th\""
        );
        let d: Direction = serde_json::from_str("\"B-A\"").unwrap();
        assert_eq!(d, Direction::ThToEn);
        let d: Direction = serde_json::from_str("\"th-en\"").unwrap();
        assert_eq!(d, Direction::ThToEn);

        assert_eq!(Direction::from_str_code(" EN-TH "), Some(Direction::EnToTh));
        assert_eq!(Direction::from_str_code("a-b"), Some(Direction::EnToTh));
        assert_eq!(Direction::from_str_code("en-ja"), None);
    }

    #[test]
    fn prompt_names_both_languages_in_order() {
        let prompt = build_system_prompt(Direction::EnToTh);
        assert!(prompt.contains("The user speaks English"));
        assert!(prompt.contains("into Thai"));

        let prompt = build_system_prompt(Direction::ThToEn);
        assert!(prompt.contains("The user speaks Thai"));
        assert!(prompt.contains("into English"));
    }

    #[test]
    fn table_lookup_is_per_direction() {
        let table = DirectionTable::with_voices("coral", "verse");
        assert_eq!(table.default_voice(Direction::EnToTh), "coral");
        assert_eq!(table.default_voice(Direction::ThToEn), "verse");
        assert_ne!(
            table.instructions(Direction::EnToTh),
            table.instructions(Direction::ThToEn)
        );
    }
}
