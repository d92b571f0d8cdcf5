//! Host state shared between the CLI commands and the engine's tool handlers.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use voxline_core::{ApplicationDraft, ApplicationSink};

use crate::settings::AppSettings;
use crate::storage::{ApplicationInput, ApplicationStore};

pub struct AppState {
    pub settings: AppSettings,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Local encrypted SQLite storage.
    pub store: Arc<ApplicationStore>,
    /// Id of the session currently open, stamped onto new records.
    pub current_session: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(settings: AppSettings, settings_path: PathBuf, store: ApplicationStore) -> Self {
        Self {
            settings,
            settings_path,
            store: Arc::new(store),
            current_session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn application_sink(&self) -> Arc<StoreSink> {
        Arc::new(StoreSink {
            store: Arc::clone(&self.store),
            current_session: Arc::clone(&self.current_session),
        })
    }
}

/// Persists `submit_application` results into the local store.
pub struct StoreSink {
    store: Arc<ApplicationStore>,
    current_session: Arc<RwLock<Option<String>>>,
}

impl ApplicationSink for StoreSink {
    fn record(&self, draft: &ApplicationDraft) -> anyhow::Result<String> {
        self.store
            .insert_application(ApplicationInput {
                session_id: self.current_session.read().clone(),
                qualification_status: draft.qualification_status.to_string(),
                reasoning: draft.reasoning.clone(),
            })
            .map_err(anyhow::Error::msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxline_core::QualificationStatus;

    #[test]
    fn sink_stamps_current_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApplicationStore::new(dir.path().join("apps.db")).unwrap();
        let state = AppState::new(
            AppSettings::default(),
            dir.path().join("settings.json"),
            store,
        );
        *state.current_session.write() = Some("session-42".into());

        let id = state
            .application_sink()
            .record(&ApplicationDraft {
                qualification_status: QualificationStatus::QualifiedReferral,
                reasoning: "needs legal aid".into(),
            })
            .unwrap();

        let items = state.store.list_applications(5).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].session_id.as_deref(), Some("session-42"));
        assert_eq!(items[0].qualification_status, "QUALIFIED_REFERRAL");
    }
}
