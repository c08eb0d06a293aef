//! GPX track reader and the filtered-track writer.
//!
//! The reader accepts the usual `<trk>/<trkseg>/<trkpt>` layout with optional
//! `<ele>` and TrackPointExtension speed / heart-rate payloads (matched by
//! local element name, so any namespace prefix works). The writer emits the
//! cleaned point sequence as a single track, tagging the creator string with
//! the tool version and the originating creator.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::{version, Point, Points, TrackError};

/// Reads all GPX points from raw file bytes.
pub fn read_points_gpx(data: &[u8]) -> Result<Points, TrackError> {
    let text = std::str::from_utf8(data).map_err(|e| TrackError::GpxParse(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut points = Points::default();

    let mut in_trk = false;
    let mut in_trkpt = false;
    let mut in_extensions = false;
    let mut trkpt_lat = 0.0_f64;
    let mut trkpt_lon = 0.0_f64;
    let mut trkpt_time: Option<DateTime<Utc>> = None;
    let mut trkpt_ele: Option<f64> = None;
    let mut trkpt_speed: Option<f64> = None;
    let mut trkpt_hr: Option<i16> = None;
    let mut text_buf = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.local_name().as_ref() {
                    b"gpx" => {
                        if let Some(creator) = get_attribute(e, "creator") {
                            points.creator = creator;
                        }
                    }
                    b"trk" => in_trk = true,
                    b"trkpt" => {
                        in_trkpt = true;
                        trkpt_lat = parse_coord_attribute(e, "lat")?;
                        trkpt_lon = parse_coord_attribute(e, "lon")?;
                        trkpt_time = None;
                        trkpt_ele = None;
                        trkpt_speed = None;
                        trkpt_hr = None;
                    }
                    b"extensions" => in_extensions = true,
                    _ => {}
                }
                text_buf.clear();
            }
            Ok(Event::End(ref e)) => {
                match e.local_name().as_ref() {
                    b"trk" => in_trk = false,
                    b"trkpt" => {
                        in_trkpt = false;
                        let ts = trkpt_time.take().ok_or_else(|| {
                            TrackError::GpxParse("trkpt without <time>".to_string())
                        })?;
                        let mut p = Point::new(trkpt_lat, trkpt_lon, ts);
                        p.ele = trkpt_ele;
                        p.speed = trkpt_speed;
                        p.hr = trkpt_hr;
                        p.global_idx = points.ps.len();
                        points.ps.push(p);
                    }
                    b"extensions" => in_extensions = false,
                    b"time" if in_trkpt => {
                        let parsed = DateTime::parse_from_rfc3339(text_buf.trim())
                            .map_err(|e| TrackError::GpxParse(e.to_string()))?;
                        trkpt_time = Some(parsed.with_timezone(&Utc));
                    }
                    b"ele" if in_trkpt => {
                        trkpt_ele = text_buf.trim().parse().ok();
                    }
                    b"speed" if in_trkpt && in_extensions => {
                        trkpt_speed = text_buf.trim().parse().ok();
                    }
                    b"hr" if in_trkpt && in_extensions => {
                        trkpt_hr = text_buf.trim().parse().ok();
                    }
                    b"name" if in_trk && !in_trkpt => {
                        if points.name.is_empty() {
                            points.name = text_buf.trim().to_string();
                        }
                    }
                    b"type" if in_trk && !in_trkpt => {
                        if points.kind.is_empty() {
                            points.kind = text_buf.trim().to_string();
                        }
                    }
                    _ => {}
                }
                text_buf.clear();
            }
            Ok(Event::Text(ref e)) => {
                text_buf = e.unescape().unwrap_or_default().to_string();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(TrackError::Xml(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(points)
}

fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            return Some(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    None
}

fn parse_coord_attribute(e: &BytesStart, name: &str) -> Result<f64, TrackError> {
    get_attribute(e, name)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| TrackError::GpxParse(format!("trkpt without valid {} attribute", name)))
}

/// Writes the points as a GPX document with one track and one segment.
/// Extensions are emitted only when both speed and heart rate were present
/// on the source point.
pub fn save_points_gpx<W: Write>(points: &Points, w: W) -> Result<(), TrackError> {
    let mut writer = Writer::new_with_indent(w, b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let creator = format!("{} from {}", version::banner(), points.creator);
    let mut gpx = BytesStart::new("gpx");
    gpx.push_attribute(("creator", creator.as_str()));
    gpx.push_attribute(("version", "1.1"));
    gpx.push_attribute(("xmlns", "http://www.topografix.com/GPX/1/1"));
    gpx.push_attribute((
        "xmlns:gpxtpx",
        "http://www.garmin.com/xmlschemas/TrackPointExtension/v1",
    ));
    writer.write_event(Event::Start(gpx))?;

    writer.write_event(Event::Start(BytesStart::new("trk")))?;

    let name = format!("{} - cleaned up by {}", points.name, version::NAME);
    writer.write_event(Event::Start(BytesStart::new("name")))?;
    writer.write_event(Event::Text(BytesText::new(&name)))?;
    writer.write_event(Event::End(BytesEnd::new("name")))?;

    if !points.kind.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("type")))?;
        writer.write_event(Event::Text(BytesText::new(&points.kind)))?;
        writer.write_event(Event::End(BytesEnd::new("type")))?;
    }

    writer.write_event(Event::Start(BytesStart::new("trkseg")))?;
    for p in &points.ps {
        write_trkpt(&mut writer, p)?;
    }
    writer.write_event(Event::End(BytesEnd::new("trkseg")))?;

    writer.write_event(Event::End(BytesEnd::new("trk")))?;
    writer.write_event(Event::End(BytesEnd::new("gpx")))?;
    Ok(())
}

fn write_trkpt<W: Write>(writer: &mut Writer<W>, p: &Point) -> Result<(), TrackError> {
    let lat = p.lat.to_string();
    let lon = p.lon.to_string();
    let mut trkpt = BytesStart::new("trkpt");
    trkpt.push_attribute(("lat", lat.as_str()));
    trkpt.push_attribute(("lon", lon.as_str()));
    writer.write_event(Event::Start(trkpt))?;

    if let Some(ele) = p.ele {
        writer.write_event(Event::Start(BytesStart::new("ele")))?;
        writer.write_event(Event::Text(BytesText::new(&ele.to_string())))?;
        writer.write_event(Event::End(BytesEnd::new("ele")))?;
    }

    let time = p.ts.to_rfc3339_opts(SecondsFormat::AutoSi, true);
    writer.write_event(Event::Start(BytesStart::new("time")))?;
    writer.write_event(Event::Text(BytesText::new(&time)))?;
    writer.write_event(Event::End(BytesEnd::new("time")))?;

    if let (Some(speed), Some(hr)) = (p.speed, p.hr) {
        writer.write_event(Event::Start(BytesStart::new("extensions")))?;
        writer.write_event(Event::Start(BytesStart::new("gpxtpx:TrackPointExtension")))?;

        writer.write_event(Event::Start(BytesStart::new("gpxtpx:speed")))?;
        writer.write_event(Event::Text(BytesText::new(&speed.to_string())))?;
        writer.write_event(Event::End(BytesEnd::new("gpxtpx:speed")))?;

        writer.write_event(Event::Start(BytesStart::new("gpxtpx:hr")))?;
        writer.write_event(Event::Text(BytesText::new(&hr.to_string())))?;
        writer.write_event(Event::End(BytesEnd::new("gpxtpx:hr")))?;

        writer.write_event(Event::End(BytesEnd::new("gpxtpx:TrackPointExtension")))?;
        writer.write_event(Event::End(BytesEnd::new("extensions")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("trkpt")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect_track_type;
    use crate::TrackType;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx creator="Amazfit T-Rex Pro" version="1.1" xmlns="http://www.topografix.com/GPX/1/1" xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
  <trk>
    <name>Morning session</name>
    <type>windsurfing</type>
    <trkseg>
      <trkpt lat="43.5082177" lon="16.4398231">
        <ele>2.5</ele>
        <time>2022-10-14T14:01:24Z</time>
        <extensions>
          <gpxtpx:TrackPointExtension>
            <gpxtpx:speed>5.5</gpxtpx:speed>
            <gpxtpx:hr>120</gpxtpx:hr>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
      <trkpt lat="43.5083076" lon="16.4398231">
        <time>2022-10-14T14:01:25Z</time>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_read_points_gpx() {
        let points = read_points_gpx(SAMPLE.as_bytes()).unwrap();
        assert_eq!(points.creator, "Amazfit T-Rex Pro");
        assert_eq!(points.name, "Morning session");
        assert_eq!(points.kind, "windsurfing");
        assert_eq!(points.ps.len(), 2);

        let p = &points.ps[0];
        assert!((p.lat - 43.5082177).abs() < 1e-9);
        assert!((p.lon - 16.4398231).abs() < 1e-9);
        assert_eq!(p.ele, Some(2.5));
        assert_eq!(p.speed, Some(5.5));
        assert_eq!(p.hr, Some(120));
        assert_eq!(
            p.ts,
            Utc.with_ymd_and_hms(2022, 10, 14, 14, 1, 24).unwrap()
        );
        assert_eq!(p.global_idx, 0);

        let p = &points.ps[1];
        assert_eq!(p.ele, None);
        assert_eq!(p.speed, None);
        assert_eq!(p.hr, None);
        assert_eq!(p.global_idx, 1);
    }

    #[test]
    fn test_read_points_gpx_detected_as_gpx() {
        assert_eq!(detect_track_type(SAMPLE.as_bytes()), TrackType::Gpx);
    }

    #[test]
    fn test_read_points_gpx_missing_time_is_error() {
        let doc = r#"<?xml version="1.0"?>
<gpx creator="x"><trk><trkseg><trkpt lat="1.0" lon="2.0"></trkpt></trkseg></trk></gpx>"#;
        assert!(matches!(
            read_points_gpx(doc.as_bytes()),
            Err(TrackError::GpxParse(_))
        ));
    }

    #[test]
    fn test_read_points_gpx_missing_lat_is_error() {
        let doc = r#"<?xml version="1.0"?>
<gpx creator="x"><trk><trkseg><trkpt lon="2.0"><time>2022-10-14T14:01:24Z</time></trkpt></trkseg></trk></gpx>"#;
        assert!(matches!(
            read_points_gpx(doc.as_bytes()),
            Err(TrackError::GpxParse(_))
        ));
    }

    #[test]
    fn test_read_points_gpx_malformed_is_error() {
        let doc = "<?xml version=\"1.0\"?><gpx><trk></gpx>";
        assert!(read_points_gpx(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_save_points_gpx_header_and_metadata() {
        let points = read_points_gpx(SAMPLE.as_bytes()).unwrap();
        let mut out = Vec::new();
        save_points_gpx(&points, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("from Amazfit T-Rex Pro"));
        assert!(text.contains(&format!("{} version {}", version::NAME, version::VERSION)));
        assert!(text.contains("Morning session - cleaned up by gps-stats"));
        // Extensions only for the point carrying both speed and heart rate.
        assert_eq!(text.matches("<gpxtpx:TrackPointExtension>").count(), 1);
        assert_eq!(text.matches("<trkpt").count(), 2);
    }

    #[test]
    fn test_save_points_gpx_round_trip() {
        let points = read_points_gpx(SAMPLE.as_bytes()).unwrap();
        let mut out = Vec::new();
        save_points_gpx(&points, &mut out).unwrap();

        let reread = read_points_gpx(&out).unwrap();
        assert_eq!(reread.ps.len(), points.ps.len());
        for (a, b) in points.ps.iter().zip(reread.ps.iter()) {
            assert!((a.lat - b.lat).abs() < 1e-7);
            assert!((a.lon - b.lon).abs() < 1e-7);
            assert_eq!(a.ts, b.ts);
            assert_eq!(a.ele, b.ele);
            assert_eq!(a.speed, b.speed);
            assert_eq!(a.hr, b.hr);
        }
    }
}
