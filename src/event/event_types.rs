//! Well-known event names exchanged between the shell and its modules.
//!
//! The bus itself is keyed by plain strings so modules can define their own
//! events; these are the names the shell agrees on with every module.

/// Shell-wide event names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum EventType {
    // Auth
    #[strum(serialize = "auth:login")]
    AuthLogin,
    #[strum(serialize = "auth:logout")]
    AuthLogout,
    #[strum(serialize = "auth:token:refresh")]
    AuthTokenRefresh,

    // Navigation
    #[strum(serialize = "nav:change")]
    NavChange,

    // Data
    #[strum(serialize = "data:updated")]
    DataUpdated,
    #[strum(serialize = "data:sync")]
    DataSync,

    // Module lifecycle
    #[strum(serialize = "module:ready")]
    ModuleReady,
    #[strum(serialize = "module:error")]
    ModuleError,

    #[strum(serialize = "theme:change")]
    ThemeChange,
    #[strum(serialize = "language:change")]
    LanguageChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}
