use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::label::LABEL_SEPARATOR;

const RANDOM_NAME_DIGITS: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("display name must not be empty")]
    Empty,
    #[error("display name must not contain the sequence '-<>-'")]
    ContainsSeparator,
    #[error("display name '{0}' is already taken")]
    Taken(String),
}

/// Human-facing peer name. Doubles as the signaling address of a device, so it
/// ends up inside channel labels and must never carry the label separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayName(String);

impl DisplayName {
    pub fn parse(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }
        if trimmed.contains(LABEL_SEPARATOR) {
            return Err(ValidationError::ContainsSeparator);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Zero-padded five digit name, the default handed to a fresh device.
    /// Uniqueness is the identity service's job; callers retry on `Taken`.
    pub fn random() -> Self {
        let upper = 10u32.pow(RANDOM_NAME_DIGITS as u32);
        let n = rand::thread_rng().gen_range(0..upper);
        Self(format!("{n:0width$}", width = RANDOM_NAME_DIGITS))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DisplayName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DisplayName> for String {
    fn from(value: DisplayName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub display_name: DisplayName,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, display_name: DisplayName) -> Self {
        Self {
            id: id.into(),
            display_name,
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string(), DisplayName::random())
    }

    pub fn rename(&mut self, display_name: DisplayName) {
        self.display_name = display_name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_names() {
        assert_eq!(DisplayName::parse(""), Err(ValidationError::Empty));
        assert_eq!(DisplayName::parse("   "), Err(ValidationError::Empty));
    }

    #[test]
    fn rejects_separator() {
        assert_eq!(
            DisplayName::parse("alice-<>-bob"),
            Err(ValidationError::ContainsSeparator)
        );
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let name = DisplayName::parse("  alice ").expect("valid name");
        assert_eq!(name.as_str(), "alice");
    }

    #[test]
    fn random_names_are_five_digits() {
        for _ in 0..32 {
            let name = DisplayName::random();
            assert_eq!(name.as_str().len(), 5);
            assert!(name.as_str().chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn deserializing_validates() {
        let err = serde_json::from_str::<DisplayName>("\"a-<>-b\"");
        assert!(err.is_err());
        let ok: DisplayName = serde_json::from_str("\"carol\"").expect("valid");
        assert_eq!(ok.as_str(), "carol");
    }
}
