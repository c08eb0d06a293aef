//! SBN track decoder.
//!
//! An SBN file is a stream of framed records: a 4-byte header whose last byte
//! is the body length, the body, a big-endian 16-bit checksum over the body,
//! and the end marker `B0 B3`. Only bodies starting with `0x29` carry a
//! position fix; every record is checksum-verified.

use chrono::NaiveDate;

use crate::{Point, Points, TrackError};

const END_SEQUENCE: [u8; 2] = [0xB0, 0xB3];
const POSITION_RECORD: u8 = 0x29;

/// Reads all SBN points from raw file bytes.
pub fn read_points_sbn(data: &[u8]) -> Result<Points, TrackError> {
    let mut ps = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (point, remaining) = read_record(rest)?;
        if let Some(mut p) = point {
            p.global_idx = ps.len();
            ps.push(p);
        }
        rest = remaining;
    }

    Ok(Points {
        name: "SBN track".to_string(),
        ps,
        ..Points::default()
    })
}

/// Decodes the next record, returning the contained position fix (if the
/// record is a position record) and the remaining input.
fn read_record(data: &[u8]) -> Result<(Option<Point>, &[u8]), TrackError> {
    if data.len() < 4 {
        return Err(TrackError::SbnTruncated("header"));
    }
    let body_len = data[3] as usize;
    let total_len = 4 + body_len + 4;
    if data.len() < total_len {
        return Err(TrackError::SbnTruncated("body"));
    }
    let body = &data[4..4 + body_len];
    let checksum = u16_from_2ub(&data[4 + body_len..4 + body_len + 2]);
    let end = [data[total_len - 2], data[total_len - 1]];
    if end != END_SEQUENCE {
        return Err(TrackError::SbnEndSequence(end));
    }

    let mut calculated: u16 = 0;
    for &b in body {
        calculated = (calculated + b as u16) & 0x7FFF;
    }
    if checksum != calculated {
        return Err(TrackError::SbnChecksum {
            found: checksum,
            expected: calculated,
        });
    }

    if body.first() != Some(&POSITION_RECORD) {
        return Ok((None, &data[total_len..]));
    }
    if body_len < 31 {
        return Err(TrackError::SbnTruncated("position body"));
    }
    if body[1] != 0 || body[2] != 0 {
        return Err(TrackError::SbnNavValid([body[1], body[2]]));
    }

    let msecs = u16_from_2ub(&body[17..19]) as u32;
    let ts = NaiveDate::from_ymd_opt(
        u16_from_2ub(&body[11..13]) as i32,
        body[13] as u32,
        body[14] as u32,
    )
    .and_then(|date| {
        date.and_hms_milli_opt(body[15] as u32, body[16] as u32, msecs / 1000, msecs % 1000)
    })
    .ok_or(TrackError::SbnTimestamp)?
    .and_utc();

    let lat = int_from_4sb(&body[23..27]) as f64 / 10_000_000.0;
    let lon = int_from_4sb(&body[27..31]) as f64 / 10_000_000.0;

    Ok((Some(Point::new(lat, lon, ts)), &data[total_len..]))
}

fn u16_from_2ub(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

/// Decodes the recorder's 4-byte signed coordinate encoding: a set top bit is
/// stripped and the remaining 31 bits are taken as the big-endian magnitude.
fn int_from_4sb(b: &[u8]) -> i64 {
    ((b[0] & 0x7F) as i64) << 24 | (b[1] as i64) << 16 | (b[2] as i64) << 8 | b[3] as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    /// Frames a body into a full SBN record with a valid checksum.
    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0xA0, 0xA2, 0x00, body.len() as u8];
        out.extend_from_slice(body);
        let mut checksum: u16 = 0;
        for &b in body {
            checksum = (checksum + b as u16) & 0x7FFF;
        }
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&END_SEQUENCE);
        out
    }

    /// Builds a 34-byte position body for the given fix.
    fn position_body(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        msec_of_minute: u16,
        lat_e7: u32,
        lon_e7: u32,
    ) -> Vec<u8> {
        let mut body = vec![0u8; 34];
        body[0] = POSITION_RECORD;
        body[11..13].copy_from_slice(&year.to_be_bytes());
        body[13] = month;
        body[14] = day;
        body[15] = hour;
        body[16] = minute;
        body[17..19].copy_from_slice(&msec_of_minute.to_be_bytes());
        body[23..27].copy_from_slice(&lat_e7.to_be_bytes());
        body[27..31].copy_from_slice(&lon_e7.to_be_bytes());
        body
    }

    #[test]
    fn test_decode_position_record() {
        let body = position_body(2022, 10, 14, 14, 1, 24_500, 435_082_177, 164_398_231);
        let data = frame(&body);
        let points = read_points_sbn(&data).unwrap();
        assert_eq!(points.name, "SBN track");
        assert_eq!(points.ps.len(), 1);

        let p = &points.ps[0];
        assert!((p.lat - 43.5082177).abs() < 1e-9);
        assert!((p.lon - 16.4398231).abs() < 1e-9);
        assert_eq!(p.ts.year(), 2022);
        assert_eq!(p.ts.month(), 10);
        assert_eq!(p.ts.day(), 14);
        assert_eq!(p.ts.hour(), 14);
        assert_eq!(p.ts.minute(), 1);
        assert_eq!(p.ts.second(), 24);
        assert_eq!(p.ts.timestamp_subsec_millis(), 500);
        assert_eq!(p.heading, -1.0);
        assert_eq!(p.global_idx, 0);
    }

    #[test]
    fn test_multiple_records_are_indexed() {
        let mut data = Vec::new();
        for minute in 0..3 {
            let body = position_body(2022, 10, 14, 14, minute, 0, 435_082_177, 164_398_231);
            data.extend_from_slice(&frame(&body));
        }
        let points = read_points_sbn(&data).unwrap();
        assert_eq!(points.ps.len(), 3);
        for (idx, p) in points.ps.iter().enumerate() {
            assert_eq!(p.global_idx, idx);
        }
    }

    #[test]
    fn test_non_position_records_are_skipped() {
        let mut data = frame(&[0x06, 0x01, 0x02, 0x03]);
        let body = position_body(2022, 10, 14, 14, 1, 0, 435_082_177, 164_398_231);
        data.extend_from_slice(&frame(&body));
        let points = read_points_sbn(&data).unwrap();
        assert_eq!(points.ps.len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_is_error() {
        let body = position_body(2022, 10, 14, 14, 1, 0, 435_082_177, 164_398_231);
        let mut data = frame(&body);
        let checksum_at = 4 + body.len();
        data[checksum_at] ^= 0x01;
        assert!(matches!(
            read_points_sbn(&data),
            Err(TrackError::SbnChecksum { .. })
        ));
    }

    #[test]
    fn test_checksum_verified_for_non_position_records() {
        let mut data = frame(&[0x06, 0x01, 0x02, 0x03]);
        let checksum_at = data.len() - 4;
        data[checksum_at] ^= 0x01;
        assert!(matches!(
            read_points_sbn(&data),
            Err(TrackError::SbnChecksum { .. })
        ));
    }

    #[test]
    fn test_bad_end_sequence_is_error() {
        let body = position_body(2022, 10, 14, 14, 1, 0, 435_082_177, 164_398_231);
        let mut data = frame(&body);
        let last = data.len() - 1;
        data[last] = 0x00;
        assert!(matches!(
            read_points_sbn(&data),
            Err(TrackError::SbnEndSequence(_))
        ));
    }

    #[test]
    fn test_nav_valid_flags_are_checked() {
        let mut body = position_body(2022, 10, 14, 14, 1, 0, 435_082_177, 164_398_231);
        body[1] = 0x01;
        let data = frame(&body);
        assert!(matches!(
            read_points_sbn(&data),
            Err(TrackError::SbnNavValid(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_error() {
        let body = position_body(2022, 10, 14, 14, 1, 0, 435_082_177, 164_398_231);
        let data = frame(&body);
        assert!(matches!(
            read_points_sbn(&data[..data.len() - 3]),
            Err(TrackError::SbnTruncated(_))
        ));
    }

    #[test]
    fn test_sign_bit_is_stripped_not_twos_complement() {
        // The recorder encoding keeps a magnitude under the top bit; a
        // southern-hemisphere-looking value decodes to its positive
        // counterpart. Locked here so a change is a deliberate decision.
        assert_eq!(int_from_4sb(&[0x99, 0x00, 0x00, 0x01]), 0x19_00_00_01);
        assert_eq!(int_from_4sb(&[0x19, 0x00, 0x00, 0x01]), 0x19_00_00_01);

        let body = position_body(2022, 10, 14, 14, 1, 0, 0x8000_0000 | 435_082_177, 164_398_231);
        let data = frame(&body);
        let points = read_points_sbn(&data).unwrap();
        assert!((points.ps[0].lat - 43.5082177).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input_yields_no_points() {
        let points = read_points_sbn(&[]).unwrap();
        assert!(points.ps.is_empty());
    }
}
