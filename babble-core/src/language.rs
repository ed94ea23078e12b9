//! Closed set of languages the client can display and translate into.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A language supported by the translation pipeline.
///
/// Serialized by its English display name ("Spanish"), which is how the
/// remote profile store records preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum SupportedLanguage {
    #[default]
    English,
    Spanish,
    French,
    German,
    Italian,
    Portuguese,
    Russian,
    Chinese,
    Japanese,
    Korean,
    Arabic,
    Hindi,
}

impl SupportedLanguage {
    /// Every supported language, in display order.
    pub const ALL: [SupportedLanguage; 12] = [
        Self::English,
        Self::Spanish,
        Self::French,
        Self::German,
        Self::Italian,
        Self::Portuguese,
        Self::Russian,
        Self::Chinese,
        Self::Japanese,
        Self::Korean,
        Self::Arabic,
        Self::Hindi,
    ];

    /// English display name, as stored in user profiles.
    pub fn name(&self) -> &'static str {
        match self {
            Self::English => "English",
            Self::Spanish => "Spanish",
            Self::French => "French",
            Self::German => "German",
            Self::Italian => "Italian",
            Self::Portuguese => "Portuguese",
            Self::Russian => "Russian",
            Self::Chinese => "Chinese",
            Self::Japanese => "Japanese",
            Self::Korean => "Korean",
            Self::Arabic => "Arabic",
            Self::Hindi => "Hindi",
        }
    }

    /// ISO 639-1 code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Spanish => "es",
            Self::French => "fr",
            Self::German => "de",
            Self::Italian => "it",
            Self::Portuguese => "pt",
            Self::Russian => "ru",
            Self::Chinese => "zh",
            Self::Japanese => "ja",
            Self::Korean => "ko",
            Self::Arabic => "ar",
            Self::Hindi => "hi",
        }
    }

    /// Look up a language by display name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|lang| lang.name().eq_ignore_ascii_case(name))
    }

    /// Look up a language by ISO code or locale tag ("es", "es-MX", "pt_BR").
    pub fn from_code(code: &str) -> Option<Self> {
        let primary = code
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or_default();
        Self::ALL
            .into_iter()
            .find(|lang| lang.code().eq_ignore_ascii_case(primary))
    }

    /// Accept either a display name or a code/locale tag.
    pub fn parse_lenient(value: &str) -> Option<Self> {
        Self::from_name(value).or_else(|| Self::from_code(value))
    }
}

impl std::fmt::Display for SupportedLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error parsing a SupportedLanguage from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageParseError(pub String);

impl std::fmt::Display for LanguageParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for LanguageParseError {}

impl FromStr for SupportedLanguage {
    type Err = LanguageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s).ok_or_else(|| LanguageParseError(s.to_string()))
    }
}
