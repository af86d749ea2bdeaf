//! Named waveform library.
//!
//! Stored as a JSON object mapping names to `[[f,f,f,f],[s,s,s,s]]` lists.
//! A missing file is created with the built-in set on first start.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::IteratorRandom;
use tracing::info;

use dglab_core::{DgLabError, DgLabResult, PulseOperation};

const BUILTIN_PULSES: &str = include_str!("builtin-pulses.json");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PulseLibrary {
    pulses: BTreeMap<String, Vec<PulseOperation>>,
}

impl PulseLibrary {
    /// The waveforms the DG-Lab App ships with.
    pub fn builtin() -> DgLabResult<Self> {
        Self::from_json(BUILTIN_PULSES)
    }

    pub fn from_json(text: &str) -> DgLabResult<Self> {
        let pulses: BTreeMap<String, Vec<PulseOperation>> = serde_json::from_str(text)?;
        if let Some((name, _)) = pulses.iter().find(|(_, ops)| ops.is_empty()) {
            return Err(DgLabError::Config(format!("pulse {name:?} has no segments")));
        }
        Ok(Self { pulses })
    }

    /// Read the library at `path`, writing the built-ins there if absent.
    pub fn load_or_init(path: &Path) -> DgLabResult<Self> {
        if path.is_file() {
            let text = std::fs::read_to_string(path)?;
            let library = Self::from_json(&text)?;
            info!(path = %path.display(), count = library.len(), "loaded pulse library");
            return Ok(library);
        }

        let library = Self::builtin()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, library.to_json()?)?;
        info!(path = %path.display(), "pulse library not found, wrote built-in waveforms");
        Ok(library)
    }

    pub fn to_json(&self) -> DgLabResult<String> {
        Ok(serde_json::to_string_pretty(&self.pulses)?)
    }

    pub fn get(&self, name: &str) -> Option<&[PulseOperation]> {
        self.pulses.get(name).map(Vec::as_slice)
    }

    /// Names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pulses.keys().map(String::as_str)
    }

    pub fn random(&self) -> Option<(&str, &[PulseOperation])> {
        self.pulses
            .iter()
            .choose(&mut rand::thread_rng())
            .map(|(name, ops)| (name.as_str(), ops.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse() {
        let library = PulseLibrary::builtin().unwrap();
        assert_eq!(library.len(), 16);
        assert_eq!(library.get("breath").unwrap().len(), 11);
        assert_eq!(
            library.get("heartbeat").unwrap()[0],
            PulseOperation::new([110; 4], [100; 4])
        );
        let names: Vec<&str> = library.names().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn empty_waveform_rejected() {
        assert!(PulseLibrary::from_json(r#"{"flat": []}"#).is_err());
    }

    #[test]
    fn random_pick_is_a_member() {
        let library = PulseLibrary::builtin().unwrap();
        let (name, ops) = library.random().unwrap();
        assert_eq!(library.get(name), Some(ops));
        assert!(PulseLibrary::default().random().is_none());
    }

    #[test]
    fn init_writes_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pulses.json");
        let first = PulseLibrary::load_or_init(&path).unwrap();
        assert!(path.is_file());

        std::fs::write(&path, r#"{"custom": [[[10,10,10,10],[0,50,100,50]]]}"#).unwrap();
        let second = PulseLibrary::load_or_init(&path).unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(second.names().collect::<Vec<_>>(), vec!["custom"]);
    }
}
