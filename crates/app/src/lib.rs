pub mod bootstrap;
pub mod settings;

pub use bootstrap::{file_store_from_settings, initialize_backend};
pub use settings::{ModelSettings, ProviderSettings, SettingsError, SettingsStore};
