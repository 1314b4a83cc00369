//! KML document structure
//!
//! Each `<Folder>` is a sub-layer. Placemarks outside any folder form a
//! leading sub-layer named after the `<Document>`. Nested folders are
//! flattened; a placemark belongs to its innermost folder.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

use super::{Coord, Geometry};
use crate::error::{LayerError, LayerResult};

/// Name used for the leading sub-layer when the document has none
pub const DEFAULT_DOCUMENT_NAME: &str = "Document";

/// Placemarks read from one folder, or from the document root
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubLayer {
    pub name: String,
    pub placemarks: Vec<Placemark>,
}

/// A KML feature before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placemark {
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Map<String, Value>,
    /// `None` when the placemark had no geometry, or all of it was dropped
    pub geometry: Option<Geometry>,
}

/// Open geometry element
#[derive(Debug)]
enum Frame {
    Point(Vec<Coord>),
    LineString(Vec<Coord>),
    LinearRing(Vec<Coord>),
    Polygon {
        exterior: Option<Vec<Coord>>,
        interiors: Vec<Vec<Coord>>,
        inner: bool,
    },
    Multi(Vec<Geometry>),
}

#[derive(Default)]
struct Parser {
    document_name: Option<String>,
    root: Vec<Placemark>,
    folders: Vec<SubLayer>,
    folder_stack: Vec<usize>,
    placemark: Option<Placemark>,
    frames: Vec<Frame>,
    path: Vec<String>,
    text: String,
    data_key: Option<String>,
}

/// Parse a (repaired) KML document into sub-layers in discovery order
pub fn parse_document(document: &str) -> LayerResult<Vec<SubLayer>> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut parser = Parser::default();
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => parser.start(&e),
            Event::Empty(e) => {
                parser.start(&e);
                let name = local_name(&e);
                parser.end(&name)?;
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                parser.end(&name)?;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| LayerError::validation(format!("Malformed KML document: {}", e)))?;
                parser.text.push_str(&text);
            }
            Event::CData(data) => {
                parser.text.push_str(&String::from_utf8_lossy(&data));
            }
            _ => {}
        }
    }

    Ok(parser.finish())
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

impl Parser {
    fn start(&mut self, e: &BytesStart<'_>) {
        let name = local_name(e);
        self.text.clear();

        match name.as_str() {
            "Folder" => {
                self.folders.push(SubLayer {
                    name: format!("Layer #{}", self.folders.len()),
                    placemarks: Vec::new(),
                });
                self.folder_stack.push(self.folders.len() - 1);
            }
            "Placemark" => self.placemark = Some(Placemark::default()),
            "Point" if self.placemark.is_some() => self.frames.push(Frame::Point(Vec::new())),
            "LineString" if self.placemark.is_some() => {
                self.frames.push(Frame::LineString(Vec::new()))
            }
            "LinearRing" if self.placemark.is_some() => {
                self.frames.push(Frame::LinearRing(Vec::new()))
            }
            "Polygon" if self.placemark.is_some() => self.frames.push(Frame::Polygon {
                exterior: None,
                interiors: Vec::new(),
                inner: false,
            }),
            "MultiGeometry" if self.placemark.is_some() => {
                self.frames.push(Frame::Multi(Vec::new()))
            }
            "outerBoundaryIs" | "innerBoundaryIs" => {
                if let Some(Frame::Polygon { inner, .. }) = self.frames.last_mut() {
                    *inner = name == "innerBoundaryIs";
                }
            }
            "Data" | "SimpleData" => {
                self.data_key = e
                    .try_get_attribute("name")
                    .ok()
                    .flatten()
                    .map(|attr| String::from_utf8_lossy(&attr.value).to_lowercase());
            }
            _ => {}
        }

        self.path.push(name);
    }

    fn end(&mut self, name: &str) -> LayerResult<()> {
        let parent = self
            .path
            .len()
            .checked_sub(2)
            .and_then(|i| self.path.get(i))
            .cloned()
            .unwrap_or_default();
        let text = std::mem::take(&mut self.text);
        let value = text.trim();

        match name {
            "name" => match parent.as_str() {
                "Placemark" => {
                    if let Some(placemark) = self.placemark.as_mut() {
                        placemark.name = non_empty(value);
                    }
                }
                "Folder" => {
                    if let (Some(&index), Some(name)) = (self.folder_stack.last(), non_empty(value))
                    {
                        self.folders[index].name = name;
                    }
                }
                "Document" => self.document_name = non_empty(value),
                _ => {}
            },
            "description" if parent == "Placemark" => {
                if let Some(placemark) = self.placemark.as_mut() {
                    placemark.description = non_empty(value);
                }
            }
            "value" if parent == "Data" => self.insert_property(value),
            "SimpleData" => self.insert_property(value),
            "coordinates" => {
                let coords = parse_coordinates(value)?;
                match self.frames.last_mut() {
                    Some(Frame::Point(c)) | Some(Frame::LineString(c)) | Some(Frame::LinearRing(c)) => {
                        c.extend(coords)
                    }
                    _ => {}
                }
            }
            "Point" | "LineString" | "LinearRing" | "Polygon" | "MultiGeometry"
                if self.placemark.is_some() =>
            {
                self.close_geometry();
            }
            "Placemark" => {
                if let Some(placemark) = self.placemark.take() {
                    match self.folder_stack.last() {
                        Some(&index) => self.folders[index].placemarks.push(placemark),
                        None => self.root.push(placemark),
                    }
                }
                self.frames.clear();
            }
            "Folder" => {
                self.folder_stack.pop();
            }
            _ => {}
        }

        self.path.pop();
        Ok(())
    }

    fn insert_property(&mut self, value: &str) {
        if let (Some(placemark), Some(key)) = (self.placemark.as_mut(), self.data_key.clone()) {
            placemark
                .properties
                .insert(key, Value::String(value.to_string()));
        }
    }

    fn close_geometry(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };

        // A ring inside a polygon is a boundary, not a geometry of its own.
        if let Frame::LinearRing(ring) = &frame
            && let Some(Frame::Polygon {
                exterior,
                interiors,
                inner,
            }) = self.frames.last_mut()
        {
            if ring.is_empty() {
                return;
            }
            if *inner {
                interiors.push(ring.clone());
            } else {
                *exterior = Some(ring.clone());
            }
            return;
        }

        let geometry = match frame {
            Frame::Point(coords) => coords.first().copied().map(Geometry::Point),
            Frame::LineString(coords) => (!coords.is_empty()).then_some(Geometry::LineString(coords)),
            Frame::LinearRing(coords) => (!coords.is_empty()).then_some(Geometry::LinearRing(coords)),
            Frame::Polygon {
                exterior,
                interiors,
                ..
            } => exterior.map(|exterior| Geometry::Polygon {
                exterior,
                interiors,
            }),
            Frame::Multi(parts) => (!parts.is_empty()).then_some(Geometry::Multi(parts)),
        };

        let Some(geometry) = geometry else {
            return;
        };
        match self.frames.last_mut() {
            Some(Frame::Multi(parts)) => parts.push(geometry),
            _ => {
                if let Some(placemark) = self.placemark.as_mut() {
                    placemark.geometry = Some(geometry);
                }
            }
        }
    }

    fn finish(self) -> Vec<SubLayer> {
        let mut layers = Vec::with_capacity(self.folders.len() + 1);
        if !self.root.is_empty() {
            layers.push(SubLayer {
                name: self
                    .document_name
                    .unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string()),
                placemarks: self.root,
            });
        }
        layers.extend(self.folders);
        layers
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a KML `<coordinates>` body: whitespace separated `x,y[,z]` tuples
pub fn parse_coordinates(text: &str) -> LayerResult<Vec<Coord>> {
    text.split_whitespace()
        .map(|tuple| {
            let parts: Vec<&str> = tuple.split(',').collect();
            let parsed: Option<Vec<f64>> = parts.iter().map(|p| p.parse::<f64>().ok()).collect();
            match parsed.as_deref() {
                Some([x, y]) => Ok(Coord::xy(*x, *y)),
                Some([x, y, z]) => Ok(Coord::xyz(*x, *y, *z)),
                _ => Err(LayerError::malformed_geometry(format!(
                    "Invalid coordinate '{}'.",
                    tuple
                ))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Barrios</name>
    <Placemark>
      <name>Centro</name>
      <description><![CDATA[<b>Zona</b> centro]]></description>
      <ExtendedData>
        <Data name="Manzanas"><value>12</value></Data>
        <SchemaData schemaUrl="#s"><SimpleData name="CODIGO">C-1</SimpleData></SchemaData>
      </ExtendedData>
      <Polygon>
        <outerBoundaryIs><LinearRing><coordinates>0,0 4,0 4,4 0,4 0,0</coordinates></LinearRing></outerBoundaryIs>
        <innerBoundaryIs><LinearRing><coordinates>1,1 2,1 2,2 1,1</coordinates></LinearRing></innerBoundaryIs>
      </Polygon>
    </Placemark>
    <Folder>
      <name>Rutas</name>
      <Placemark>
        <name>RN 11</name>
        <LineString><coordinates>-59,-27,10 -59.5,-28,12</coordinates></LineString>
      </Placemark>
      <Folder>
        <name>Hitos</name>
        <Placemark><Point><coordinates>-58,-27</coordinates></Point></Placemark>
      </Folder>
      <Placemark>
        <name>Multi</name>
        <MultiGeometry>
          <Point><coordinates>1,2</coordinates></Point>
          <Point><coordinates>3,4</coordinates></Point>
        </MultiGeometry>
      </Placemark>
    </Folder>
  </Document>
</kml>"##;

    #[test]
    fn test_sublayers_in_discovery_order() {
        let layers = parse_document(SAMPLE).unwrap();
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Barrios", "Rutas", "Hitos"]);
        assert_eq!(layers[0].placemarks.len(), 1);
        assert_eq!(layers[1].placemarks.len(), 2);
        assert_eq!(layers[2].placemarks.len(), 1);
    }

    #[test]
    fn test_placemark_columns() {
        let layers = parse_document(SAMPLE).unwrap();
        let centro = &layers[0].placemarks[0];
        assert_eq!(centro.name.as_deref(), Some("Centro"));
        assert_eq!(centro.description.as_deref(), Some("<b>Zona</b> centro"));
        assert_eq!(centro.properties["manzanas"], "12");
        assert_eq!(centro.properties["codigo"], "C-1");

        match centro.geometry.as_ref().unwrap() {
            Geometry::Polygon {
                exterior,
                interiors,
            } => {
                assert_eq!(exterior.len(), 5);
                assert_eq!(interiors.len(), 1);
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_multigeometry_and_3d_coordinates() {
        let layers = parse_document(SAMPLE).unwrap();
        let route = layers[1].placemarks[0].geometry.as_ref().unwrap();
        assert_eq!(
            route,
            &Geometry::LineString(vec![
                Coord::xyz(-59.0, -27.0, 10.0),
                Coord::xyz(-59.5, -28.0, 12.0)
            ])
        );

        let multi = layers[1].placemarks[1].geometry.as_ref().unwrap();
        assert_eq!(multi.part_count(), 2);
    }

    #[test]
    fn test_polygon_without_exterior_is_empty() {
        let doc = "<kml><Document><Placemark><Polygon><outerBoundaryIs></outerBoundaryIs></Polygon></Placemark></Document></kml>";
        let layers = parse_document(doc).unwrap();
        assert_eq!(layers[0].name, DEFAULT_DOCUMENT_NAME);
        assert!(layers[0].placemarks[0].geometry.is_none());
    }

    #[test]
    fn test_invalid_coordinate() {
        let err = parse_coordinates("1,2 a,b").unwrap_err();
        assert!(err.message.contains("Invalid coordinate 'a,b'."));
        assert!(err.message.ends_with(crate::error::RING_RETRY_HINT));
    }
}
