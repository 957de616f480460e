use serde::{Deserialize, Serialize};

/// A mutation applied uniformly to every record in a fan-out target set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsIncrement {
    pub field_key: String,
    pub delta: i64,
}

impl AnalyticsIncrement {
    pub fn new(field_key: impl Into<String>, delta: i64) -> Self {
        Self {
            field_key: field_key.into(),
            delta,
        }
    }
}
