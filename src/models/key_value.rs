//! Small persisted key-value records. The one consumer here is the
//! per-group redirect counter capping redirect fan-out.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValueDataType {
    RegistrationRedirectCount,
}

impl fmt::Display for KeyValueDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistrationRedirectCount => write!(f, "registration_redirect_count"),
        }
    }
}

impl std::str::FromStr for KeyValueDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration_redirect_count" => Ok(Self::RegistrationRedirectCount),
            _ => Err(format!("Invalid key-value data type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueData {
    pub data_type: KeyValueDataType,
    pub key: String,
    pub value: Option<String>,
}

impl KeyValueData {
    /// Redirect counts start at 1: the original registration itself is the
    /// first member of the group. Absent or unparseable values read as 1.
    pub fn registration_redirect_count(&self) -> u32 {
        self.value
            .as_deref()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1)
    }

    pub fn set_registration_redirect_count(&mut self, count: u32) {
        self.value = Some(count.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_count_defaults_to_one() {
        let mut record = KeyValueData {
            data_type: KeyValueDataType::RegistrationRedirectCount,
            key: "group-key".to_string(),
            value: None,
        };
        assert_eq!(record.registration_redirect_count(), 1);

        record.value = Some("not-a-number".to_string());
        assert_eq!(record.registration_redirect_count(), 1);

        record.set_registration_redirect_count(17);
        assert_eq!(record.registration_redirect_count(), 17);
        assert_eq!(record.value.as_deref(), Some("17"));
    }
}
