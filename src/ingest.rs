//! Batch generation
//!
//! Drains the parser for each boundary file in turn and collects every row
//! into one [`NewBatch`]. Nothing touches the store here: a failure in any
//! file fails the whole call, so the caller persists all rows or none.

use crate::error::LayerResult;
use crate::geometry::{BoundaryFile, BoundarySource, ErrorPolicy, ParsedRow};
use crate::models::{BatchMetadata, NewBatch, NewGeometry};

/// Build one batch from all `sources`
pub async fn generate_batch(
    sources: &[BoundarySource],
    metadata: BatchMetadata,
    policy: ErrorPolicy,
    chunk_size: usize,
) -> LayerResult<NewBatch> {
    let mut batch = NewBatch {
        metadata,
        ..Default::default()
    };

    for source in sources {
        let file = match BoundaryFile::open(source, policy).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(file = %source.name(), error = %e, "Boundary file rejected");
                return Err(e);
            }
        };
        let name = file.name().to_string();
        let features = file.feature_count();
        batch.report.merge(file.report());

        let before = batch.len();
        for chunk in file.chunks(chunk_size) {
            let chunk = chunk.inspect_err(|e| {
                tracing::warn!(file = %name, error = %e, "Boundary file rejected");
            })?;
            batch
                .geometries
                .extend(chunk.rows.into_iter().map(new_geometry));
        }
        tracing::info!(
            file = %name,
            features,
            rows = batch.len() - before,
            "Boundary file parsed"
        );
    }

    Ok(batch)
}

fn new_geometry(row: ParsedRow) -> NewGeometry {
    NewGeometry {
        geometry: row.geometry,
        name: row.name,
        description: row.description,
        metadata: (!row.properties.is_empty()).then_some(row.properties),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RING_RETRY_HINT};
    use crate::models::Provenance;

    const FOLDERS: &str = r#"<kml><Document><name>limites</name>
        <Placemark><name>A</name><Point><coordinates>-58.4,-34.6</coordinates></Point></Placemark>
        <Folder><name>norte</name>
          <Placemark><name>B</name><Point><coordinates>-58.5,-34.5</coordinates></Point></Placemark>
          <Placemark><name>C</name>
            <ExtendedData><Data name="Codigo"><value>42</value></Data></ExtendedData>
            <LineString><coordinates>0,0 1,1</coordinates></LineString>
          </Placemark>
        </Folder></Document></kml>"#;

    const SHORT_RING: &str = r#"<kml><Document><Placemark><name>P</name><Polygon><outerBoundaryIs>
        <LinearRing><coordinates>0,0 1,1</coordinates></LinearRing>
        </outerBoundaryIs></Polygon></Placemark></Document></kml>"#;

    fn bytes(name: &str, kml: &str) -> BoundarySource {
        BoundarySource::Bytes {
            name: name.to_string(),
            data: kml.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_rows_cover_every_feature_of_every_file() {
        let sources = vec![bytes("a.kml", FOLDERS), bytes("b.kml", FOLDERS)];
        let metadata = BatchMetadata::new(Provenance {
            project: Some("Acueducto".into()),
            ..Default::default()
        });

        let batch = generate_batch(&sources, metadata.clone(), ErrorPolicy::Fail, 2)
            .await
            .unwrap();
        assert_eq!(batch.len(), 6);
        assert_eq!(batch.metadata, metadata);
        assert!(batch.geometries.iter().all(|g| g.geometry.starts_with("SRID=4326;")));

        let c = &batch.geometries[2];
        assert_eq!(c.name.as_deref(), Some("C"));
        assert_eq!(c.metadata.as_ref().unwrap()["codigo"], "42");
        assert!(batch.geometries[0].metadata.is_none());
    }

    #[tokio::test]
    async fn test_one_bad_file_fails_the_batch() {
        let sources = vec![bytes("a.kml", FOLDERS), bytes("b.kml", SHORT_RING)];
        let err = generate_batch(&sources, BatchMetadata::default(), ErrorPolicy::Fail, 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.ends_with(RING_RETRY_HINT));
    }

    #[tokio::test]
    async fn test_replace_pads_short_ring() {
        let sources = vec![bytes("p.kml", SHORT_RING)];
        let batch = generate_batch(&sources, BatchMetadata::default(), ErrorPolicy::Replace, 50)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.report.padded, 1);
        assert_eq!(
            batch.geometries[0].geometry,
            "SRID=4326;POLYGON Z ((0 0 0, 1 1 0, 1 1 0, 1 1 0, 0 0 0))"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_validation_error() {
        let sources = vec![BoundarySource::Path("/nonexistent/limits.kml".into())];
        let err = generate_batch(&sources, BatchMetadata::default(), ErrorPolicy::Fail, 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.message, "File /nonexistent/limits.kml doesn't exist.");
    }
}
