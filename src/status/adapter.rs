//! Translate failures into status log updates

use serde_json::{Map, Value};
use std::path::Path;

use super::codes;
use crate::error::{ErrorKind, LayerError};
use crate::models::StatusUpdate;

/// Terminal status code for an error kind
pub fn status_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::NotFound => {
            codes::FAILED_VALIDATION
        }
        ErrorKind::Upstream => codes::FAILED_UPSTREAM,
    }
}

/// Redacted snapshot of a call's arguments
///
/// Null and empty values are dropped and files are reduced to their base
/// names, so file contents and staging paths never reach the log.
pub fn debug_metadata<P: AsRef<Path>>(params: &Value, files: &[P]) -> Value {
    let mut snapshot = Map::new();
    if let Value::Object(map) = params {
        for (key, value) in map {
            if let Some(value) = clean_value(value) {
                snapshot.insert(key.clone(), value);
            }
        }
    }
    if !files.is_empty() {
        let names = files
            .iter()
            .map(|file| {
                let path = file.as_ref();
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned())
            })
            .map(Value::String)
            .collect();
        snapshot.insert("files".to_string(), Value::Array(names));
    }
    Value::Object(snapshot)
}

fn clean_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| clean_value(v).map(|v| (k.clone(), v)))
                .collect();
            (!cleaned.is_empty()).then_some(Value::Object(cleaned))
        }
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Terminal update recording a failure
pub fn failure_update(error: &LayerError, metadata: Value) -> StatusUpdate {
    StatusUpdate::append(error.message.clone())
        .status(status_for(error.kind))
        .metadata(metadata)
}

/// Non-terminal update recording a failed attempt that will be retried
pub fn retry_update(error: &LayerError, attempt: u32, metadata: Value) -> StatusUpdate {
    StatusUpdate::append(format!(
        "Attempt {} failed: {}. Retrying",
        attempt,
        error.message.trim_end_matches('.')
    ))
    .metadata(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_debug_metadata_redacts_files() {
        let params = json!({
            "layer": "barrios",
            "error_handle": "replace",
            "metadata": {"project": null, "province": "Chaco"},
            "ids": []
        });
        let files = [PathBuf::from("/var/tmp/staging/abc/0000_barrios.kml")];
        let snapshot = debug_metadata(&params, &files);

        assert_eq!(
            snapshot,
            json!({
                "layer": "barrios",
                "error_handle": "replace",
                "metadata": {"province": "Chaco"},
                "files": ["0000_barrios.kml"]
            })
        );
    }

    #[test]
    fn test_failure_update_by_kind() {
        let update = failure_update(&LayerError::conflict("Layer exists."), json!({}));
        assert_eq!(update.status, Some(codes::FAILED_VALIDATION));

        let update = failure_update(&LayerError::upstream("Timed out."), json!({}));
        assert_eq!(update.status, Some(codes::FAILED_UPSTREAM));
        assert_eq!(update.message_append.as_deref(), Some("Timed out."));
    }

    #[test]
    fn test_retry_update_keeps_log_open() {
        let update = retry_update(&LayerError::upstream("Timed out."), 1, json!({}));
        assert!(update.status.is_none());
        assert_eq!(
            update.message_append.as_deref(),
            Some("Attempt 1 failed: Timed out. Retrying")
        );
    }
}
