//! Named static offsets loaded from JSON
//!
//! Lets extensions look up host locations by name instead of hard-coding
//! them, so a host update only needs a new `offsets.json`:
//!
//! ```json
//! {
//!     "offsets": {
//!         "PlayerCharacter::vtable": "0x52A1A30",
//!         "g_gameSettings": 86712320
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use earlyhook_engine::RelocationManager;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading or querying offsets
#[derive(Debug, Error)]
pub enum OffsetsError {
    #[error("Failed to read offsets file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse offsets JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Offset not found: {0}")]
    NotFound(String),

    #[error("Invalid value for offset {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// An offset written either as a number or as a hex/decimal string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OffsetValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct OffsetsFile {
    #[serde(default)]
    offsets: HashMap<String, OffsetValue>,
}

/// Loaded offset table
#[derive(Debug, Default, Clone)]
pub struct Offsets {
    offsets: HashMap<String, usize>,
}

impl Offsets {
    /// Load offsets from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, OffsetsError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load offsets from a JSON string
    pub fn load_from_str(json: &str) -> Result<Self, OffsetsError> {
        let raw: OffsetsFile = serde_json::from_str(json)?;

        let offsets = raw
            .offsets
            .into_iter()
            .map(|(name, value)| {
                let offset = parse_value(&name, value)?;
                Ok((name, offset))
            })
            .collect::<Result<HashMap<_, _>, OffsetsError>>()?;

        tracing::info!("Loaded {} offsets", offsets.len());
        Ok(Self { offsets })
    }

    /// Static offset by name
    pub fn get(&self, name: &str) -> Result<usize, OffsetsError> {
        self.offsets
            .get(name)
            .copied()
            .ok_or_else(|| OffsetsError::NotFound(name.to_string()))
    }

    /// Runtime address of a named offset
    pub fn resolve(&self, name: &str, relocs: &RelocationManager) -> Result<usize, OffsetsError> {
        Ok(relocs.resolve(self.get(name)?))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

fn parse_value(name: &str, value: OffsetValue) -> Result<usize, OffsetsError> {
    let invalid = |value: String| OffsetsError::InvalidValue {
        name: name.to_string(),
        value,
    };

    match value {
        OffsetValue::Number(n) => usize::try_from(n).map_err(|_| invalid(n.to_string())),
        OffsetValue::Text(text) => {
            let trimmed = text.trim();
            let parsed = match trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                Some(hex) => usize::from_str_radix(hex, 16),
                None => trimmed.parse::<usize>(),
            };
            parsed.map_err(|_| invalid(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_numbers_and_hex() {
        let json = r#"{
            "offsets": {
                "vtable": "0x4D2",
                "settings": 1234,
                "decimal": "42"
            }
        }"#;

        let offsets = Offsets::load_from_str(json).unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets.get("vtable").unwrap(), 0x4D2);
        assert_eq!(offsets.get("settings").unwrap(), 1234);
        assert_eq!(offsets.get("decimal").unwrap(), 42);
    }

    #[test]
    fn test_resolve_through_relocations() {
        let offsets = Offsets::load_from_str(r#"{"offsets": {"Foo": "0x100"}}"#).unwrap();
        let relocs = RelocationManager::new(0x1_4000_0000);
        assert_eq!(offsets.resolve("Foo", &relocs).unwrap(), 0x1_4000_0100);
    }

    #[test]
    fn test_errors() {
        let offsets = Offsets::load_from_str(r#"{"offsets": {}}"#).unwrap();
        assert!(offsets.is_empty());
        assert!(matches!(offsets.get("missing"), Err(OffsetsError::NotFound(_))));

        assert!(matches!(
            Offsets::load_from_str(r#"{"offsets": {"bad": "0xZZ"}}"#),
            Err(OffsetsError::InvalidValue { .. })
        ));
        assert!(matches!(
            Offsets::load_from_str("not json"),
            Err(OffsetsError::Parse(_))
        ));
        assert!(matches!(
            Offsets::load_from_file("/nonexistent/offsets.json"),
            Err(OffsetsError::Io(_))
        ));
    }
}
