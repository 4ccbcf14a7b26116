use std::sync::Arc;

use visor_files::{FileStore, HttpFileStore, MemoryFileStore};
use visor_llm::{ChatBackend, DEFAULT_OPENAI_MODEL, ProviderConfig, create_backend};

use crate::settings::{DEFAULT_ENDPOINT, ProviderSettings};

/// Builds the assistant backend from persisted settings, falling back to the
/// environment when settings are absent or unusable.
///
/// Returns the backend (if any), the model id to use, and a user-facing
/// error string when construction failed.
pub fn initialize_backend(
    settings: &ProviderSettings,
) -> (Option<Arc<dyn ChatBackend>>, String, Option<String>) {
    let default_model_from_settings = settings.default_model_name();

    if settings.is_valid() {
        match backend_from_settings(settings) {
            Ok((backend, model_id)) => {
                tracing::info!("initialized backend from persisted settings");
                return (backend, model_id, None);
            }
            Err(error) => {
                tracing::warn!(
                    "failed to create backend from persisted settings, falling back: {}",
                    error
                );
            }
        }
    }

    let (backend, environment_model_id, backend_error) = backend_from_environment();
    if backend.is_some() {
        (backend, environment_model_id, backend_error)
    } else {
        (backend, default_model_from_settings, backend_error)
    }
}

fn backend_from_settings(
    settings: &ProviderSettings,
) -> Result<(Option<Arc<dyn ChatBackend>>, String), visor_llm::BackendError> {
    let model_id = settings.default_model_name();

    let Some(config) = settings.to_provider_config() else {
        return Ok((None, model_id));
    };

    match create_backend(config) {
        Ok(backend) => Ok((Some(backend), model_id)),
        Err(error) => Err(error),
    }
}

fn backend_from_environment() -> (Option<Arc<dyn ChatBackend>>, String, Option<String>) {
    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let Some(api_key) = api_key else {
        return (None, DEFAULT_OPENAI_MODEL.to_string(), None);
    };

    let model_id = std::env::var("OPENAI_MODEL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());

    let endpoint =
        std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

    let config = ProviderConfig::new("openai", api_key, endpoint, Some(model_id.clone()));

    match create_backend(config) {
        Ok(backend) => (Some(backend), model_id, None),
        Err(error) => {
            tracing::error!("failed to initialize backend adapter: {error}");
            (None, model_id, Some(format!("Backend error: {}", error)))
        }
    }
}

/// Builds the file storage collaborator from settings.
///
/// Without an upload endpoint the in-memory store stands in, so the chat
/// core keeps working while producing references nothing external resolves.
pub fn file_store_from_settings(settings: &ProviderSettings) -> Arc<dyn FileStore> {
    if settings.upload_endpoint.is_empty() {
        tracing::warn!("no upload endpoint configured; using the in-memory file store");
        return Arc::new(MemoryFileStore::new());
    }

    let mut store = HttpFileStore::new(&settings.upload_endpoint);
    if !settings.api_key.trim().is_empty() {
        store = store.with_api_token(&settings.api_key);
    }
    Arc::new(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_without_a_key_yield_no_backend_but_keep_the_model() {
        let settings = ProviderSettings {
            models: vec![crate::settings::ModelSettings {
                model_name: "gpt-4o".to_string(),
                max_tokens: None,
            }],
            ..ProviderSettings::default()
        };

        let (backend, model_id) = backend_from_settings(&settings).expect("no key is not an error");
        assert!(backend.is_none());
        assert_eq!(model_id, "gpt-4o");
    }

    #[test]
    fn a_configured_key_builds_the_rig_backend() {
        let settings = ProviderSettings {
            api_key: "sk-test".to_string(),
            ..ProviderSettings::default()
        };

        let (backend, model_id) = backend_from_settings(&settings).expect("backend builds");
        let backend = backend.expect("backend present");
        assert_eq!(backend.id(), "openai");
        assert_eq!(model_id, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn an_unsupported_provider_id_is_reported() {
        let settings = ProviderSettings {
            provider_id: "mystery".to_string(),
            api_key: "sk-test".to_string(),
            ..ProviderSettings::default()
        };

        let error = backend_from_settings(&settings)
            .err()
            .expect("unknown provider must fail");
        assert!(matches!(
            error,
            visor_llm::BackendError::UnsupportedProvider { .. }
        ));
    }

    #[test]
    fn an_empty_upload_endpoint_selects_the_memory_store() {
        let store = file_store_from_settings(&ProviderSettings::default());
        // Nothing to assert on the trait object beyond its existence; the
        // memory store's behavior is covered in visor-files.
        let _ = store;
    }
}
