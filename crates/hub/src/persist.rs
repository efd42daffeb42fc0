//! JSON persistence for the hub's collections.
//!
//! Each collection lives in its own pretty-printed file in the data
//! directory, loaded at startup and rewritten on every mutating admin
//! action. A missing file reads as the collection's default.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use hearth_domain::Result;

pub const RULES_FILE: &str = "rules.json";
pub const SCHEDULE_FILE: &str = "schedule.json";
pub const SAVEDSTATE_FILE: &str = "savedstate.json";

pub fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_domain::SavedStateStore;

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: SavedStateStore = load_json(&dir.path().join(SAVEDSTATE_FILE)).unwrap();
        assert!(store.all().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/values.json");
        save_json(&path, &vec![1u32, 2, 3]).unwrap();
        let back: Vec<u32> = load_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json::<Vec<u32>>(&path).is_err());
    }
}
