//! Boundary file parsing
//!
//! A boundary file goes through three stages:
//!
//! 1. **Ring repair** ([`rings`]) rewrites degenerate `<LinearRing>` elements
//!    on the XML event stream according to an [`ErrorPolicy`].
//! 2. **Structure** ([`kml`]) collects placemarks into sub-layers, one per
//!    `<Folder>` plus a leading one for placemarks at document level.
//! 3. **Rows** ([`ChunkReader`]) normalize each placemark into a 3-D EWKT row,
//!    lazily, in chunks bounded by the configured chunk size.

pub mod kml;
pub mod rings;
pub mod wkt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{LayerError, LayerResult};

pub use kml::{Placemark, SubLayer};
pub use rings::{RepairReport, repair_linear_rings};
pub use wkt::{KML_SRID, to_ewkt};

/// Default number of rows per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// How degenerate linear rings (fewer than 4 coordinates) are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Leave the document untouched and let validation reject it
    Fail,
    /// Pad by repeating the last coordinate until four exist
    #[default]
    Replace,
    /// Remove the ring element
    Drop,
}

impl FromStr for ErrorPolicy {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(ErrorPolicy::Fail),
            "replace" => Ok(ErrorPolicy::Replace),
            "drop" => Ok(ErrorPolicy::Drop),
            other => Err(LayerError::validation(format!(
                "Unknown error_handle '{}'. Expected 'fail', 'replace' or 'drop'.",
                other
            ))),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Fail => write!(f, "fail"),
            ErrorPolicy::Replace => write!(f, "replace"),
            ErrorPolicy::Drop => write!(f, "drop"),
        }
    }
}

/// A single coordinate tuple; `z` is absent for 2-D input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Geometry tree read from a placemark
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// A ring used directly as a placemark geometry
    LinearRing(Vec<Coord>),
    Polygon {
        exterior: Vec<Coord>,
        interiors: Vec<Vec<Coord>>,
    },
    Multi(Vec<Geometry>),
}

impl Geometry {
    /// Number of leaf geometries
    pub fn part_count(&self) -> usize {
        match self {
            Geometry::Multi(parts) => parts.iter().map(Geometry::part_count).sum(),
            _ => 1,
        }
    }
}

/// Where a boundary file comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundarySource {
    Path(PathBuf),
    Url(String),
    Bytes { name: String, data: Vec<u8> },
}

impl BoundarySource {
    /// Interpret a CLI/form argument: `http(s)://` is remote, anything else a path
    pub fn parse(value: &str) -> Self {
        let lowered = value.trim().to_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            BoundarySource::Url(value.trim().to_string())
        } else {
            BoundarySource::Path(PathBuf::from(value))
        }
    }

    /// Short name used in messages
    pub fn name(&self) -> String {
        match self {
            BoundarySource::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            BoundarySource::Url(url) => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(url.as_str())
                .to_string(),
            BoundarySource::Bytes { name, .. } => name.clone(),
        }
    }

    /// Fetch the raw document
    pub async fn read(&self) -> LayerResult<Vec<u8>> {
        match self {
            BoundarySource::Path(path) => match tokio::fs::read(path).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                    LayerError::validation(format!("File {} doesn't exist.", path.display())),
                ),
                Err(e) => Err(e.into()),
            },
            BoundarySource::Url(url) => {
                tracing::info!(url = %url, "Downloading boundary file");
                let response = reqwest::get(url.as_str()).await?.error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
            BoundarySource::Bytes { data, .. } => Ok(data.clone()),
        }
    }
}

impl From<PathBuf> for BoundarySource {
    fn from(path: PathBuf) -> Self {
        BoundarySource::Path(path)
    }
}

/// One normalized placemark
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// EWKT tagged with the source SRID, always 3-D
    pub geometry: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// `ExtendedData` values keyed by lower-cased name
    pub properties: Map<String, Value>,
    /// Sub-layer the placemark was read from
    pub sublayer: Arc<str>,
}

/// At most `chunk_size` rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryChunk {
    pub rows: Vec<ParsedRow>,
}

impl GeometryChunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A parsed, repaired boundary file
#[derive(Debug, Clone)]
pub struct BoundaryFile {
    name: String,
    layers: Vec<SubLayer>,
    report: RepairReport,
}

impl BoundaryFile {
    /// Read, repair and parse a boundary file
    pub async fn open(source: &BoundarySource, policy: ErrorPolicy) -> LayerResult<Self> {
        let data = source.read().await?;
        Self::parse(&source.name(), &data, policy)
    }

    /// Repair and parse an in-memory document
    pub fn parse(name: &str, data: &[u8], policy: ErrorPolicy) -> LayerResult<Self> {
        let text = std::str::from_utf8(data).map_err(|e| {
            LayerError::validation(format!("File {} is not valid UTF-8: {}", name, e))
        })?;

        let (repaired, report) = repair_linear_rings(text, policy)?;
        if report.touched() {
            tracing::warn!(
                file = name,
                padded = report.padded,
                dropped = report.dropped,
                policy = %policy,
                "Repaired degenerate linear rings"
            );
        }

        let layers = kml::parse_document(&repaired)?;
        Ok(Self {
            name: name.to_string(),
            layers,
            report,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report(&self) -> RepairReport {
        self.report
    }

    /// Sub-layer names in discovery order
    pub fn sublayer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name.as_str()).collect()
    }

    /// Placemarks across all sub-layers, including ones without geometry
    pub fn feature_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.placemarks.len()).sum()
    }

    /// Consume the file into a chunked row reader
    pub fn chunks(self, chunk_size: usize) -> ChunkReader {
        ChunkReader::new(self.layers, chunk_size)
    }
}

type PlacemarkIter = Box<dyn Iterator<Item = (Arc<str>, Placemark)> + Send>;

/// Lazy, finite, non-restartable reader of row chunks
///
/// Sub-layers are concatenated, so a chunk may span several of them. The
/// reader stops after the first error.
pub struct ChunkReader {
    placemarks: PlacemarkIter,
    chunk_size: usize,
    failed: bool,
}

impl ChunkReader {
    pub fn new(layers: Vec<SubLayer>, chunk_size: usize) -> Self {
        let placemarks = layers.into_iter().flat_map(|layer| {
            let name: Arc<str> = Arc::from(layer.name);
            layer
                .placemarks
                .into_iter()
                .map(move |placemark| (name.clone(), placemark))
        });
        Self {
            placemarks: Box::new(placemarks),
            chunk_size: chunk_size.max(1),
            failed: false,
        }
    }
}

impl Iterator for ChunkReader {
    type Item = LayerResult<GeometryChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let mut rows = Vec::with_capacity(self.chunk_size);
        while rows.len() < self.chunk_size {
            let Some((sublayer, placemark)) = self.placemarks.next() else {
                break;
            };
            match to_row(sublayer, placemark) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        if rows.is_empty() {
            None
        } else {
            Some(Ok(GeometryChunk { rows }))
        }
    }
}

impl std::iter::FusedIterator for ChunkReader {}

fn to_row(sublayer: Arc<str>, placemark: Placemark) -> LayerResult<Option<ParsedRow>> {
    let Some(geometry) = placemark.geometry else {
        tracing::warn!(
            sublayer = %sublayer,
            placemark = placemark.name.as_deref().unwrap_or_default(),
            "Skipping placemark without geometry"
        );
        return Ok(None);
    };

    let geometry = wkt::normalize(geometry).map_err(|e| {
        let label = placemark
            .name
            .as_deref()
            .map(|name| format!("Placemark '{}': ", name))
            .unwrap_or_default();
        LayerError::new(e.kind, format!("{}{}", label, e.message))
    })?;

    Ok(Some(ParsedRow {
        geometry: to_ewkt(&geometry, KML_SRID),
        name: placemark.name,
        description: placemark.description,
        properties: placemark.properties,
        sublayer,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon_placemark(name: &str) -> String {
        format!(
            "<Placemark><name>{}</name><Polygon><outerBoundaryIs><LinearRing>\
             <coordinates>0,0 1,0 1,1 0,0</coordinates>\
             </LinearRing></outerBoundaryIs></Polygon></Placemark>",
            name
        )
    }

    fn document(root: usize, folders: &[usize]) -> String {
        let mut kml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><kml xmlns="http://www.opengis.net/kml/2.2"><Document><name>doc</name>"#,
        );
        for i in 0..root {
            kml.push_str(&polygon_placemark(&format!("root-{}", i)));
        }
        for (f, count) in folders.iter().enumerate() {
            kml.push_str(&format!("<Folder><name>folder-{}</name>", f));
            for i in 0..*count {
                kml.push_str(&polygon_placemark(&format!("f{}-{}", f, i)));
            }
            kml.push_str("</Folder>");
        }
        kml.push_str("</Document></kml>");
        kml
    }

    #[test]
    fn test_error_policy_from_str() {
        assert_eq!("DROP".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Drop);
        assert!("skip".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn test_boundary_source_parse() {
        assert_eq!(
            BoundarySource::parse("https://example.org/a/limits.kml"),
            BoundarySource::Url("https://example.org/a/limits.kml".into())
        );
        assert_eq!(
            BoundarySource::parse("https://example.org/a/limits.kml").name(),
            "limits.kml"
        );
        assert_eq!(
            BoundarySource::parse("/tmp/x/limits.kml"),
            BoundarySource::Path(PathBuf::from("/tmp/x/limits.kml"))
        );
    }

    #[test]
    fn test_chunks_span_sublayers() {
        let file =
            BoundaryFile::parse("a.kml", document(3, &[4, 2]).as_bytes(), ErrorPolicy::Fail)
                .unwrap();
        assert_eq!(file.sublayer_names(), vec!["doc", "folder-0", "folder-1"]);
        assert_eq!(file.feature_count(), 9);

        let chunks: Vec<GeometryChunk> = file
            .chunks(4)
            .collect::<LayerResult<Vec<_>>>()
            .unwrap();
        let sizes: Vec<usize> = chunks.iter().map(GeometryChunk::len).collect();
        assert_eq!(sizes, vec![4, 4, 1]);

        // Second chunk starts in folder-0 and ends in folder-1.
        assert_eq!(&*chunks[1].rows[0].sublayer, "folder-0");
        assert_eq!(&*chunks[1].rows[3].sublayer, "folder-1");
    }

    #[test]
    fn test_rows_are_3d_ewkt() {
        let file =
            BoundaryFile::parse("a.kml", document(1, &[]).as_bytes(), ErrorPolicy::Fail).unwrap();
        let chunk = file.chunks(DEFAULT_CHUNK_SIZE).next().unwrap().unwrap();
        assert_eq!(
            chunk.rows[0].geometry,
            "SRID=4326;POLYGON Z ((0 0 0, 1 0 0, 1 1 0, 0 0 0))"
        );
        assert_eq!(chunk.rows[0].name.as_deref(), Some("root-0"));
    }

    #[test]
    fn test_reader_stops_after_error() {
        let kml = r#"<kml><Document>
            <Placemark><name>bad</name><LineString><coordinates>1,1</coordinates></LineString></Placemark>
            <Placemark><name>good</name><Point><coordinates>1,1</coordinates></Point></Placemark>
        </Document></kml>"#;
        let file = BoundaryFile::parse("a.kml", kml.as_bytes(), ErrorPolicy::Fail).unwrap();
        let mut reader = file.chunks(10);

        let err = reader.next().unwrap().unwrap_err();
        assert!(err.message.starts_with("Placemark 'bad': "));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_validation_error() {
        let err = BoundaryFile::parse("a.kml", &[0xff, 0xfe, 0x00], ErrorPolicy::Fail).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
