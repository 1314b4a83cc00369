//! End-to-end layer lifecycle tests against the in-memory store and publisher

use std::sync::Arc;

use geolayer_sdk::error::ErrorKind;
use geolayer_sdk::geometry::{BoundarySource, ErrorPolicy};
use geolayer_sdk::jobs::{JobContext, JobKind, RetryPolicy, Staging};
use geolayer_sdk::lifecycle::Orchestrator;
use geolayer_sdk::models::{BatchMetadata, MissingPolicy, Provenance, StatusUpdate};
use geolayer_sdk::publish::{MemoryPublisher, TilePublisher};
use geolayer_sdk::status::{Tracker, TrackerConfig, codes};
use geolayer_sdk::store::{MemoryStore, SpatialStore};
use tempfile::{TempDir, tempdir};

const TWO_POINT_RING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Lotes</name>
    <Placemark>
      <name>Lote 12</name>
      <description>Manzana B</description>
      <Polygon>
        <outerBoundaryIs>
          <LinearRing>
            <coordinates>-58.44,-34.60 -58.43,-34.61</coordinates>
          </LinearRing>
        </outerBoundaryIs>
      </Polygon>
    </Placemark>
  </Document>
</kml>"#;

const FOLDERS: &str = r#"<kml><Document>
  <Placemark><name>Plaza</name><Point><coordinates>-60.1,-27.4,12</coordinates></Point></Placemark>
  <Folder><name>Rutas</name>
    <Placemark><name>RN16</name><LineString><coordinates>-60,-27 -61,-26.5</coordinates></LineString></Placemark>
    <Placemark><name>RN11</name><LineString><coordinates>-59,-27 -59.2,-28</coordinates></LineString></Placemark>
  </Folder>
</Document></kml>"#;

struct Harness {
    _staging: TempDir,
    store: Arc<MemoryStore>,
    publisher: Arc<MemoryPublisher>,
    context: JobContext,
}

fn harness() -> Harness {
    let staging = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(4326));
    let publisher = Arc::new(MemoryPublisher::new());
    let orchestrator = Orchestrator::new(store.clone(), publisher.clone());
    let context = JobContext::new(
        orchestrator,
        Staging::new(staging.path()),
        TrackerConfig::default(),
        RetryPolicy::immediate(2),
    );
    Harness {
        _staging: staging,
        store,
        publisher,
        context,
    }
}

fn upload(name: &str, kml: &str) -> BoundarySource {
    BoundarySource::Bytes {
        name: name.to_string(),
        data: kml.as_bytes().to_vec(),
    }
}

fn create(layer: &str, error_handle: ErrorPolicy) -> JobKind {
    JobKind::Create {
        layer: layer.to_string(),
        metadata: BatchMetadata::new(Provenance {
            project: Some("Loteo social".into()),
            province: Some("Buenos Aires".into()),
            ..Default::default()
        }),
        error_handle,
    }
}

#[tokio::test]
async fn test_two_point_ring_with_replace_is_published() {
    let h = harness();
    let job = h
        .context
        .accept(create("lotes", ErrorPolicy::Replace), &[upload("lotes.kml", TWO_POINT_RING)])
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();

    assert_eq!(log.status, codes::SUCCESS);
    assert!(log.message.as_deref().unwrap().contains("Geoserver layer created."));
    assert!(h.store.get_layer("lotes").await.unwrap().is_some());
    assert!(h.publisher.layer_exists("lotes").await.unwrap());

    let batch_id = log.batch_id.unwrap();
    let geometries = h.store.list_geometries(batch_id).await.unwrap();
    assert_eq!(geometries.len(), 1);
    let ewkt = &geometries[0].geometry;
    assert!(ewkt.starts_with("SRID=4326;POLYGON Z (("));
    let ring = ewkt
        .trim_start_matches("SRID=4326;POLYGON Z ((")
        .trim_end_matches("))");
    assert!(ring.split(", ").count() >= 4);
    assert!(ring.split(", ").all(|xyz| xyz.split(' ').count() == 3));
    assert_eq!(geometries[0].name.as_deref(), Some("Lote 12"));
}

#[tokio::test]
async fn test_two_point_ring_with_fail_is_rejected_with_hint() {
    let h = harness();
    let job = h
        .context
        .accept(create("lotes", ErrorPolicy::Fail), &[upload("lotes.kml", TWO_POINT_RING)])
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();

    assert_eq!(log.status, codes::FAILED_VALIDATION);
    assert!(log.message.as_deref().unwrap().contains("replace"));
    assert!(h.store.list_layers().await.unwrap().is_empty());
    assert!(!h.publisher.layer_exists("lotes").await.unwrap());
}

#[tokio::test]
async fn test_geometry_count_matches_features_and_reads_back_3d() {
    let h = harness();
    let job = h
        .context
        .accept(
            JobKind::IngestBatch {
                metadata: BatchMetadata::default(),
                error_handle: ErrorPolicy::Fail,
            },
            &[upload("a.kml", FOLDERS), upload("b.kml", FOLDERS)],
        )
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();
    assert_eq!(log.status, codes::SUCCESS);

    let geometries = h.store.list_geometries(log.batch_id.unwrap()).await.unwrap();
    assert_eq!(geometries.len(), 6);
    assert!(geometries.iter().all(|g| g.geometry.starts_with("SRID=4326;")));
    assert!(geometries.iter().all(|g| g.geometry.contains(" Z (")));
    assert!(geometries.iter().any(|g| g.geometry == "SRID=4326;POINT Z (-60.1 -27.4 12)"));
}

#[tokio::test]
async fn test_create_twice_conflicts_and_keeps_one_layer() {
    let h = harness();
    for expected in [codes::SUCCESS, codes::FAILED_VALIDATION] {
        let job = h
            .context
            .accept(create("rutas", ErrorPolicy::Fail), &[upload("rutas.kml", FOLDERS)])
            .await
            .unwrap();
        let log = h.context.run(&job).await.unwrap();
        assert_eq!(log.status, expected);
    }

    assert_eq!(h.store.list_layers().await.unwrap(), vec!["rutas".to_string()]);
    assert_eq!(h.store.count_layer_geometries("rutas").await.unwrap(), 3);
}

#[tokio::test]
async fn test_delete_unknown_layer_fails_or_is_ignored() {
    let h = harness();
    let delete = |error_handle| JobKind::Delete {
        layer: "fantasma".to_string(),
        delete_geometries: true,
        error_handle,
    };

    let job = h.context.accept(delete(MissingPolicy::Fail), &[]).await.unwrap();
    let log = h.context.run(&job).await.unwrap();
    assert_eq!(log.status, codes::FAILED_VALIDATION);
    assert!(
        log.message
            .as_deref()
            .unwrap()
            .ends_with("Layer fantasma doesn't exist on Postgis nor Geoserver.")
    );

    let job = h.context.accept(delete(MissingPolicy::Ignore), &[]).await.unwrap();
    let log = h.context.run(&job).await.unwrap();
    assert_eq!(log.status, codes::SUCCESS);
}

#[tokio::test]
async fn test_append_to_unpublished_layer_writes_nothing() {
    let h = harness();
    h.store.get_or_create_layer("solo_postgis").await.unwrap();

    let job = h
        .context
        .accept(
            JobKind::Append {
                layer: "solo_postgis".to_string(),
                metadata: BatchMetadata::default(),
                error_handle: ErrorPolicy::Replace,
            },
            &[upload("rutas.kml", FOLDERS)],
        )
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();

    assert_eq!(log.status, codes::FAILED_VALIDATION);
    assert!(log.batch_id.is_none());
    assert_eq!(h.store.count_layer_geometries("solo_postgis").await.unwrap(), 0);
}

#[tokio::test]
async fn test_full_lifecycle_narrative() {
    let h = harness();
    let job = h
        .context
        .accept(create("rutas", ErrorPolicy::Fail), &[upload("rutas.kml", FOLDERS)])
        .await
        .unwrap();
    h.context.run(&job).await.unwrap();

    let job = h
        .context
        .accept(
            JobKind::Append {
                layer: "rutas".to_string(),
                metadata: BatchMetadata::default(),
                error_handle: ErrorPolicy::Fail,
            },
            &[upload("mas_rutas.kml", FOLDERS)],
        )
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();
    assert_eq!(log.status, codes::SUCCESS);
    assert_eq!(
        log.message.as_deref(),
        Some("Received. Processing. PostGIS KML ingested. Geoserver layer updated. Success.")
    );
    assert_eq!(h.store.count_layer_geometries("rutas").await.unwrap(), 6);

    let job = h
        .context
        .accept(
            JobKind::Delete {
                layer: "rutas".to_string(),
                delete_geometries: true,
                error_handle: MissingPolicy::Fail,
            },
            &[],
        )
        .await
        .unwrap();
    let log = h.context.run(&job).await.unwrap();
    assert_eq!(log.status, codes::SUCCESS);
    assert!(h.store.list_views().await.unwrap().is_empty());
    assert!(h.store.get_layer("rutas").await.unwrap().is_none());
    assert!(!h.publisher.layer_exists("rutas").await.unwrap());
}

#[tokio::test]
async fn test_status_message_is_append_only() {
    let h = harness();
    let store: Arc<dyn SpatialStore> = h.store.clone();
    let mut tracker = Tracker::received(store.clone(), TrackerConfig::default(), "test", None)
        .await
        .unwrap();
    tracker.append("A.").await.unwrap();
    tracker.append("B.").await.unwrap();
    tracker
        .keep_track(StatusUpdate::append("Success").status(codes::SUCCESS))
        .await
        .unwrap();

    let record = Tracker::load(store, TrackerConfig::default(), tracker.id().unwrap())
        .await
        .unwrap()
        .record()
        .await
        .unwrap();
    assert_eq!(record.message.as_deref(), Some("Received. A. B. Success."));
    assert_eq!(record.status, codes::SUCCESS);
}

#[tokio::test]
async fn test_store_outage_is_upstream() {
    let h = harness();
    let orchestrator = h.context.orchestrator().clone();
    h.store.set_offline(true);

    let store: Arc<dyn SpatialStore> = h.store.clone();
    let err = Tracker::received(store, TrackerConfig::default(), "layer/create", None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::Upstream);
    assert!(!orchestrator.health_check().await.store);
}
