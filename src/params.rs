//! Saved parameter history: the trained model, every EM iteration and the
//! settings it came from, as one JSON document.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::em_training_session::EmTrainingSession;
use crate::error::{LinkageError, Result};
use crate::linker::Linker;
use crate::model::{CoreModelSettings, Settings};

const KEYS: [&str; 4] = ["current_params", "historical_params", "settings", "settings_original"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterHistory {
    pub current_params: CoreModelSettings,
    pub historical_params: Vec<CoreModelSettings>,
    pub settings: Settings,
    pub settings_original: Settings,
}

impl ParameterHistory {
    /// Snapshot a trained session alongside the linker's current and original settings.
    pub fn from_session(session: &EmTrainingSession, linker: &Linker) -> Self {
        Self {
            current_params: session.core_model_settings().clone(),
            historical_params: session.history().to_vec(),
            settings: linker.settings().clone(),
            settings_original: linker.settings_original().clone(),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a saved document. Anything other than exactly the four expected
    /// top-level keys is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        let keys: BTreeSet<&str> = match &value {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => BTreeSet::new(),
        };
        if keys != KEYS.into_iter().collect() {
            return Err(LinkageError::config(format!(
                "saved parameter history seems to be corrupted: expected keys {KEYS:?}, found {keys:?}"
            )));
        }
        let mut history: ParameterHistory = serde_json::from_value(value)
            .map_err(|e| LinkageError::config(format!("saved parameter history seems to be corrupted: {e}")))?;
        history.settings = history.settings.completed()?;
        history.settings_original = history.settings_original.completed()?;
        Ok(history)
    }

    /// Write pretty JSON to `path`, refusing to replace an existing file
    /// unless `overwrite` is set.
    pub fn save_to_json_file(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(LinkageError::config(format!(
                "the path {} already exists; pass overwrite to replace it",
                path.display()
            )));
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        info!(path = %path.display(), iterations = self.historical_params.len(), "saved parameter history");
        Ok(())
    }

    pub fn load_from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_value(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparison, LinkType};
    use serde_json::json;

    fn history() -> ParameterHistory {
        let settings = Settings::new(LinkType::DedupeOnly, vec![Comparison::exact_match("dob")]).unwrap();
        let core = settings.core_model_settings().with_default_probabilities();
        ParameterHistory {
            current_params: core.clone(),
            historical_params: vec![core],
            settings: settings.clone(),
            settings_original: settings,
        }
    }

    #[test]
    fn extra_or_missing_keys_are_rejected() {
        let mut value = history().to_value().unwrap();
        value.as_object_mut().unwrap().insert("extra".into(), json!(1));
        let err = ParameterHistory::from_value(value).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("corrupted"));

        let mut value = history().to_value().unwrap();
        value.as_object_mut().unwrap().remove("settings_original");
        assert!(ParameterHistory::from_value(value).unwrap_err().is_config());

        assert!(ParameterHistory::from_value(json!([1, 2])).unwrap_err().is_config());
    }

    #[test]
    fn file_round_trip_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let original = history();
        original.save_to_json_file(&path, false).unwrap();

        let err = original.save_to_json_file(&path, false).unwrap_err();
        assert!(err.is_config());
        original.save_to_json_file(&path, true).unwrap();

        let loaded = ParameterHistory::load_from_json_file(&path).unwrap();
        assert_eq!(loaded, original);
    }
}
