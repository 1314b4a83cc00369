//! Layer, batch and geometry entities

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::RepairReport;

/// A named, published collection of batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Origin of an ingestion event
///
/// Every field is optional. The Spanish aliases are the field names used by
/// the upload forms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, alias = "obra", skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, alias = "operatoria", skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, alias = "provincia", skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, alias = "departamento", skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, alias = "municipio", skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    #[serde(default, alias = "localidad", skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, alias = "estado", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, alias = "descripcion", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "cantidad", skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, alias = "categoria", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, alias = "ente", skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    #[serde(default, alias = "fuente", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Provenance {
    /// Column values in storage order
    pub fn columns(&self) -> [Option<&str>; 12] {
        [
            self.project.as_deref(),
            self.program.as_deref(),
            self.province.as_deref(),
            self.department.as_deref(),
            self.municipality.as_deref(),
            self.locality.as_deref(),
            self.state.as_deref(),
            self.description.as_deref(),
            self.quantity.as_deref(),
            self.category.as_deref(),
            self.agency.as_deref(),
            self.source.as_deref(),
        ]
    }

    /// Rebuild from column values in storage order
    pub fn from_columns(columns: [Option<String>; 12]) -> Self {
        let [
            project,
            program,
            province,
            department,
            municipality,
            locality,
            state,
            description,
            quantity,
            category,
            agency,
            source,
        ] = columns;
        Self {
            project,
            program,
            province,
            department,
            municipality,
            locality,
            state,
            description,
            quantity,
            category,
            agency,
            source,
        }
    }
}

/// Caller-supplied description of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(flatten)]
    pub provenance: Provenance,
    /// Free-form fields that have no provenance column
    #[serde(default, alias = "json", skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl BatchMetadata {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// One parsed feature ready to be inserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGeometry {
    /// EWKT carrying the source SRID, always 3-D
    pub geometry: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// A batch built from boundary files, not yet persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewBatch {
    pub metadata: BatchMetadata,
    pub geometries: Vec<NewGeometry>,
    pub report: RepairReport,
}

impl NewBatch {
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }
}

/// A persisted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub layer_id: Option<i64>,
    /// Name of the owning layer, when attached
    pub layer: Option<String>,
    pub metadata: BatchMetadata,
    pub geometry_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Client-facing projection
    pub fn record(&self, offset: FixedOffset) -> BatchRecord {
        BatchRecord {
            id: self.id,
            layer: self.layer.clone(),
            geometries: self.geometry_count,
            provenance: self.metadata.provenance.clone(),
            json: self.metadata.extra.clone().filter(|v| !is_empty_value(v)),
            timestamp: format_timestamp(self.created_at, offset),
        }
    }
}

/// Client-facing projection of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    pub geometries: u64,
    #[serde(flatten)]
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    pub timestamp: String,
}

/// A persisted geometry as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    pub id: i64,
    pub batch_id: Option<i64>,
    /// EWKT in the deployment SRID
    pub geometry: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// Render a timestamp for clients, e.g. `2024-05-01 09:30:00 (UTC-03:00)`.
pub fn format_timestamp(at: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = at.with_timezone(&offset);
    format!("{} (UTC{})", local.format("%Y-%m-%d %H:%M:%S"), offset)
}

pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_metadata_accepts_form_aliases() {
        let metadata: BatchMetadata = serde_json::from_value(json!({
            "obra": "Acueducto Norte",
            "provincia": "Chaco",
            "json": {"lote": 4}
        }))
        .unwrap();
        assert_eq!(metadata.provenance.project.as_deref(), Some("Acueducto Norte"));
        assert_eq!(metadata.provenance.province.as_deref(), Some("Chaco"));
        assert_eq!(metadata.extra, Some(json!({"lote": 4})));
    }

    #[test]
    fn test_provenance_columns_round_trip() {
        let provenance = Provenance {
            project: Some("p".into()),
            source: Some("s".into()),
            ..Default::default()
        };
        let columns = provenance.columns().map(|c| c.map(str::to_string));
        assert_eq!(Provenance::from_columns(columns), provenance);
    }

    #[test]
    fn test_batch_record_omits_empty_fields() {
        let batch = Batch {
            id: 3,
            layer_id: Some(1),
            layer: Some("barrios".into()),
            metadata: BatchMetadata::new(Provenance {
                category: Some("vivienda".into()),
                ..Default::default()
            })
            .with_extra(json!({})),
            geometry_count: 12,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        };
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        let value = serde_json::to_value(batch.record(offset)).unwrap();

        assert_eq!(value["geometries"], 12);
        assert_eq!(value["category"], "vivienda");
        assert_eq!(value["timestamp"], "2024-05-01 09:30:00 (UTC-03:00)");
        assert!(value.get("json").is_none());
        assert!(value.get("project").is_none());
    }
}
