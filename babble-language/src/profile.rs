//! Where preferences come from: the remote user profile and the device.

use std::sync::Arc;

use async_trait::async_trait;
use babble_core::{BabbleResult, SupportedLanguage};
use babble_realtime::ReactiveDataSource;
use serde_json::json;

/// Profile document field holding the preferred language name.
pub const PREFERRED_LANGUAGE_FIELD: &str = "preferredLanguage";

/// Remote storage of per-user language preferences.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The stored preference exactly as recorded, which may be outside the
    /// supported set. `Ok(None)` when the user has none.
    async fn read_language(&self, user_id: &str) -> BabbleResult<Option<String>>;

    async fn write_language(&self, user_id: &str, language: SupportedLanguage) -> BabbleResult<()>;
}

/// [`ProfileStore`] over user documents at `users/{uid}`.
pub struct DataSourceProfileStore {
    source: Arc<dyn ReactiveDataSource>,
}

impl DataSourceProfileStore {
    pub fn new(source: Arc<dyn ReactiveDataSource>) -> Self {
        Self { source }
    }

    fn path(user_id: &str) -> String {
        format!("users/{user_id}")
    }
}

impl std::fmt::Debug for DataSourceProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceProfileStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ProfileStore for DataSourceProfileStore {
    async fn read_language(&self, user_id: &str) -> BabbleResult<Option<String>> {
        let document = self.source.get(&Self::path(user_id)).await?;
        Ok(document
            .as_ref()
            .and_then(|doc| doc.get(PREFERRED_LANGUAGE_FIELD))
            .and_then(|value| value.as_str())
            .map(str::to_string))
    }

    async fn write_language(&self, user_id: &str, language: SupportedLanguage) -> BabbleResult<()> {
        self.source
            .update(
                &Self::path(user_id),
                json!({ PREFERRED_LANGUAGE_FIELD: language.name() }),
            )
            .await
    }
}

/// The device's locale, e.g. `"es-MX"`.
pub trait LocaleProvider: Send + Sync {
    fn device_locale(&self) -> Option<String>;
}

/// A fixed locale, for tests and for platforms that report it once at
/// startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticLocaleProvider {
    locale: Option<String>,
}

impl StaticLocaleProvider {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: Some(locale.into()),
        }
    }

    /// A device that reports no locale.
    pub fn unknown() -> Self {
        Self { locale: None }
    }
}

impl LocaleProvider for StaticLocaleProvider {
    fn device_locale(&self) -> Option<String> {
        self.locale.clone()
    }
}
