//! Conflict handling switches shared by the store and the tile publisher

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::LayerError;

/// What to do when the target of a create already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistsPolicy {
    #[default]
    Fail,
    Replace,
    Ignore,
}

/// What to do when the target of a delete does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    #[default]
    Fail,
    Ignore,
}

impl FromStr for ExistsPolicy {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(ExistsPolicy::Fail),
            "replace" => Ok(ExistsPolicy::Replace),
            "ignore" => Ok(ExistsPolicy::Ignore),
            other => Err(LayerError::validation(format!(
                "Unknown error_handle '{}'. Expected 'fail', 'replace' or 'ignore'.",
                other
            ))),
        }
    }
}

impl FromStr for MissingPolicy {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(MissingPolicy::Fail),
            "ignore" => Ok(MissingPolicy::Ignore),
            other => Err(LayerError::validation(format!(
                "Unknown error_handle '{}'. Expected 'fail' or 'ignore'.",
                other
            ))),
        }
    }
}
