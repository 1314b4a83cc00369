//! Linear ring repair on the raw KML event stream
//!
//! Rings with fewer than four coordinate tuples are rejected by the geometry
//! engine. Under [`ErrorPolicy::Replace`] they are padded by repeating the
//! last tuple; under [`ErrorPolicy::Drop`] the `<LinearRing>` element is
//! removed. A ring without any coordinates is removed under both policies.
//! [`ErrorPolicy::Fail`] returns the document untouched.

use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};

use super::ErrorPolicy;
use crate::error::{LayerError, LayerResult};

/// Minimum number of tuples in a valid ring
pub const MIN_RING_POINTS: usize = 4;

/// What ring repair changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub padded: usize,
    pub dropped: usize,
}

impl RepairReport {
    pub fn touched(&self) -> bool {
        self.padded > 0 || self.dropped > 0
    }

    pub fn merge(&mut self, other: RepairReport) {
        self.padded += other.padded;
        self.dropped += other.dropped;
    }
}

/// Rewrite degenerate linear rings according to `policy`
pub fn repair_linear_rings(
    document: &str,
    policy: ErrorPolicy,
) -> LayerResult<(String, RepairReport)> {
    let mut report = RepairReport::default();
    if policy == ErrorPolicy::Fail {
        return Ok((document.to_string(), report));
    }

    let mut reader = Reader::from_str(document);
    let mut writer = Writer::new(Vec::with_capacity(document.len()));
    let mut ring: Vec<Event<'static>> = Vec::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event()?;
        if matches!(event, Event::Eof) {
            break;
        }

        let opens = matches!(&event, Event::Start(e) if e.local_name().as_ref() == b"LinearRing");
        let closes = matches!(&event, Event::End(e) if e.local_name().as_ref() == b"LinearRing");
        let empty_ring =
            matches!(&event, Event::Empty(e) if e.local_name().as_ref() == b"LinearRing");

        if depth > 0 {
            ring.push(event.into_owned());
            if opens {
                depth += 1;
            } else if closes {
                depth -= 1;
                if depth == 0 {
                    let buffered = std::mem::take(&mut ring);
                    if let Some(events) = repair_ring(buffered, policy, &mut report)? {
                        for event in events {
                            write(&mut writer, event)?;
                        }
                    }
                }
            }
            continue;
        }

        if opens {
            depth = 1;
            ring.push(event.into_owned());
        } else if empty_ring {
            report.dropped += 1;
        } else {
            write(&mut writer, event)?;
        }
    }

    let bytes = writer.into_inner();
    let repaired = String::from_utf8(bytes)
        .map_err(|e| LayerError::validation(format!("Malformed KML document: {}", e)))?;
    Ok((repaired, report))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> LayerResult<()> {
    writer
        .write_event(event)
        .map_err(|e| LayerError::upstream(format!("Failed to rewrite KML document: {}", e)))
}

/// Decide the fate of one buffered `<LinearRing>` element.
///
/// Returns `None` when the ring must be removed.
fn repair_ring(
    mut events: Vec<Event<'static>>,
    policy: ErrorPolicy,
    report: &mut RepairReport,
) -> LayerResult<Option<Vec<Event<'static>>>> {
    let mut tuples: Vec<String> = Vec::new();
    let mut text_slots: Vec<usize> = Vec::new();
    let mut in_coordinates = false;

    for (index, event) in events.iter().enumerate() {
        match event {
            Event::Start(e) if e.local_name().as_ref() == b"coordinates" => in_coordinates = true,
            Event::End(e) if e.local_name().as_ref() == b"coordinates" => in_coordinates = false,
            Event::Text(text) if in_coordinates => {
                let text = text
                    .unescape()
                    .map_err(|e| LayerError::validation(format!("Malformed KML document: {}", e)))?;
                tuples.extend(text.split_whitespace().map(str::to_string));
                text_slots.push(index);
            }
            Event::CData(data) if in_coordinates => {
                let text = String::from_utf8_lossy(data).into_owned();
                tuples.extend(text.split_whitespace().map(str::to_string));
                text_slots.push(index);
            }
            _ => {}
        }
    }

    if tuples.is_empty() {
        report.dropped += 1;
        return Ok(None);
    }
    if tuples.len() >= MIN_RING_POINTS {
        return Ok(Some(events));
    }

    match policy {
        ErrorPolicy::Drop => {
            report.dropped += 1;
            Ok(None)
        }
        ErrorPolicy::Replace => {
            let last = tuples.last().cloned().unwrap_or_default();
            while tuples.len() < MIN_RING_POINTS {
                tuples.push(last.clone());
            }
            let padded = tuples.join(" ");

            // The first text node carries the whole padded list, any others are emptied.
            for (n, slot) in text_slots.into_iter().enumerate() {
                let content = if n == 0 { padded.as_str() } else { "" };
                events[slot] = Event::Text(BytesText::new(content).into_owned());
            }
            report.padded += 1;
            Ok(Some(events))
        }
        ErrorPolicy::Fail => Ok(Some(events)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEGENERATE: &str = r#"<kml><Document><Placemark><Polygon><outerBoundaryIs><LinearRing><coordinates>-58.1,-34.2 -58.3,-34.4</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark></Document></kml>"#;

    #[test]
    fn test_fail_leaves_document_untouched() {
        let (out, report) = repair_linear_rings(DEGENERATE, ErrorPolicy::Fail).unwrap();
        assert_eq!(out, DEGENERATE);
        assert!(!report.touched());
    }

    #[test]
    fn test_replace_pads_with_last_coordinate() {
        let (out, report) = repair_linear_rings(DEGENERATE, ErrorPolicy::Replace).unwrap();
        assert_eq!(report, RepairReport { padded: 1, dropped: 0 });
        assert!(out.contains(
            "<coordinates>-58.1,-34.2 -58.3,-34.4 -58.3,-34.4 -58.3,-34.4</coordinates>"
        ));
    }

    #[test]
    fn test_drop_removes_ring_element() {
        let (out, report) = repair_linear_rings(DEGENERATE, ErrorPolicy::Drop).unwrap();
        assert_eq!(report, RepairReport { padded: 0, dropped: 1 });
        assert!(!out.contains("LinearRing"));
        assert!(out.contains("<outerBoundaryIs></outerBoundaryIs>"));
    }

    #[test]
    fn test_empty_ring_removed_under_replace() {
        let doc = "<kml><LinearRing><coordinates>  </coordinates></LinearRing><LinearRing/></kml>";
        let (out, report) = repair_linear_rings(doc, ErrorPolicy::Replace).unwrap();
        assert_eq!(report.dropped, 2);
        assert_eq!(out, "<kml></kml>");
    }

    #[test]
    fn test_valid_rings_pass_through() {
        let doc = "<kml><LinearRing>\n  <coordinates>0,0 1,0 1,1 0,0</coordinates>\n</LinearRing></kml>";
        let (out, report) = repair_linear_rings(doc, ErrorPolicy::Drop).unwrap();
        assert!(!report.touched());
        assert_eq!(out, doc);
    }

    #[test]
    fn test_malformed_xml_is_validation_error() {
        let err = repair_linear_rings("<kml><Document></kml>", ErrorPolicy::Replace).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
