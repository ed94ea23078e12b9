//! Babble Language - Preferences, Detection and Translation
//!
//! Resolves which language each user reads in, detects the language of
//! incoming text and translates messages into it. Every remote call is
//! cached and degrades rather than failing the UI.

pub mod detection;
pub mod preference;
pub mod profile;
pub mod strategy;
pub mod translation;

pub use detection::{DetectionRequest, LanguageDetector};
pub use preference::{LanguagePreferenceResolver, PreferenceCache, ResolveOptions};
pub use profile::{
    DataSourceProfileStore, LocaleProvider, ProfileStore, StaticLocaleProvider,
    PREFERRED_LANGUAGE_FIELD,
};
pub use strategy::{
    CacheStrategy, DeviceStrategy, FallbackChain, PreferenceStrategy, RemoteStrategy,
    StrategyOutcome,
};
pub use translation::{TranslationKey, TranslationOutcome, TranslationService, CONTEXT_MESSAGES};
