//! Core track-analysis library for windsurfing / kiteboarding GPS sessions.
//!
//! Decodes SBN and GPX tracks into an ordered point sequence, cleans it up,
//! and computes the session statistics catalogue: total distance and duration,
//! peak speeds over time and distance windows, the five best non-overlapping
//! 10 s runs, Alpha 500 / Delta 500 turn scores, and per-side splits when the
//! wind direction is known or can be detected.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

mod gpx;
mod sbn;
mod turns;

pub use gpx::{read_points_gpx, save_points_gpx};
pub use sbn::read_points_sbn;
pub use turns::{detect_turn_type, detect_turn_type_from_heading, detect_turn_type_from_points};

/// Earth circumference around the poles, in meters.
pub const EARTH_CIRC_POLES: f64 = 40_007_863.0;
/// Earth circumference around the equator, in meters.
pub const EARTH_CIRC_EQUATOR: f64 = 40_075_017.0;

const M_PER_SEC_TO_KTS: f64 = 1.94384;
const M_PER_SEC_TO_KMH: f64 = 3.6;

/// Build-time identification, shown by the CLI version banner and embedded in
/// the creator string of filtered GPX exports.
pub mod version {
    pub const NAME: &str = "gps-stats";
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const PLATFORM: &str = match option_env!("GPS_STATS_PLATFORM") {
        Some(platform) => platform,
        None => "local",
    };
    pub const BUILD_TIME: &str = match option_env!("GPS_STATS_BUILD_TIME") {
        Some(build_time) => build_time,
        None => "",
    };

    pub fn banner() -> String {
        format!("{} version {} {} {}", NAME, VERSION, PLATFORM, BUILD_TIME)
    }
}

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("unknown track type")]
    UnknownTrackType,
    #[error("truncated SBN record ({0})")]
    SbnTruncated(&'static str),
    #[error("invalid SBN end sequence: {0:02x?}")]
    SbnEndSequence([u8; 2]),
    #[error("invalid SBN checksum: {found:#06x}, should be {expected:#06x}")]
    SbnChecksum { found: u16, expected: u16 },
    #[error("SBN nav-valid flags not zero: {0:02x?}")]
    SbnNavValid([u8; 2]),
    #[error("invalid SBN timestamp")]
    SbnTimestamp,
    #[error("GPX parse error: {0}")]
    GpxParse(String),
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Speed units used for display-space values. Distances stay in meters
/// internally; only `Track::speed` is stored in the requested unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Unit {
    Ms,
    Kmh,
    #[default]
    Kts,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Unit::Ms => "ms",
            Unit::Kmh => "kmh",
            Unit::Kts => "kts",
        };
        f.write_str(name)
    }
}

/// Converts kts to m/s.
pub fn kts_to_ms(speed_kts: f64) -> f64 {
    speed_kts / M_PER_SEC_TO_KTS
}

/// Converts m/s to the requested display unit.
pub fn ms_to_units(speed_ms: f64, units: Unit) -> f64 {
    match units {
        Unit::Ms => speed_ms,
        Unit::Kmh => speed_ms * M_PER_SEC_TO_KMH,
        Unit::Kts => speed_ms * M_PER_SEC_TO_KTS,
    }
}

/// Which statistic the analyzer computes and the formatter prints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum StatKind {
    #[default]
    All,
    Distance,
    Duration,
    Speed2s,
    Speed10sAvg,
    Speed10s1,
    Speed10s2,
    Speed10s3,
    Speed10s4,
    Speed10s5,
    Speed15m,
    Speed1h,
    Speed100m,
    Speed1nm,
    Alpha,
}

impl StatKind {
    fn is_10s(self) -> bool {
        matches!(
            self,
            StatKind::All
                | StatKind::Speed10sAvg
                | StatKind::Speed10s1
                | StatKind::Speed10s2
                | StatKind::Speed10s3
                | StatKind::Speed10s4
                | StatKind::Speed10s5
        )
    }
}

/// Turn maneuver type: a jibe passes through the downwind axis, a tack
/// through the upwind axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TurnKind {
    #[default]
    Unknown,
    Jibe,
    Tack,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnKind::Unknown => "unknown",
            TurnKind::Jibe => "jibe",
            TurnKind::Tack => "tack",
        };
        f.write_str(name)
    }
}

/// Riding side: which side of the rider the wind is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Side {
    #[default]
    Unknown,
    Starboard,
    Port,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Side::Unknown => "unknown",
            Side::Starboard => "starboard",
            Side::Port => "port",
        };
        f.write_str(name)
    }
}

/// A single GPS fix. `heading` and `side` are assigned during analysis;
/// `used_for_10s` is transient state owned by the top-5 selector.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    pub ts: DateTime<Utc>,
    pub ele: Option<f64>,
    pub speed: Option<f64>,
    pub hr: Option<i16>,
    pub global_idx: usize,
    /// Compass heading of motion into this point (0 = north, 90 = east),
    /// -1.0 when undefined.
    pub heading: f64,
    pub side: Side,
    #[serde(skip)]
    pub used_for_10s: bool,
}

impl Point {
    pub fn new(lat: f64, lon: f64, ts: DateTime<Utc>) -> Self {
        Self {
            lat,
            lon,
            ts,
            ele: None,
            speed: None,
            hr: None,
            global_idx: 0,
            heading: -1.0,
            side: Side::Unknown,
            used_for_10s: false,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}/{} {:.1}° ({})}}",
            self.lat,
            self.lon,
            self.heading,
            self.ts.format("%Y-%m-%d %H:%M:%S +0000 UTC")
        )
    }
}

/// All points decoded from one track file, plus source metadata.
#[derive(Clone, Debug, Default)]
pub struct Points {
    pub creator: String,
    pub name: String,
    pub kind: String,
    pub ps: Vec<Point>,
}

/// Type of a track file, as determined by the leading bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackType {
    Sbn,
    Gpx,
    Unknown,
}

/// Sniffs the track type from the leading bytes of the input.
pub fn detect_track_type(data: &[u8]) -> TrackType {
    if data.len() >= 4 && data[0..4] == [0xA0, 0xA2, 0x00, 0x22] {
        return TrackType::Sbn;
    }
    if data.len() >= 6 && &data[0..6] == b"<?xml " {
        return TrackType::Gpx;
    }
    TrackType::Unknown
}

/// Reads all points from a raw track file, autodetecting the format.
pub fn read_points(data: &[u8]) -> Result<Points, TrackError> {
    match detect_track_type(data) {
        TrackType::Sbn => read_points_sbn(data),
        TrackType::Gpx => read_points_gpx(data),
        TrackType::Unknown => Err(TrackError::UnknownTrackType),
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Distance in meters between two fixes, ignoring the curvature of the earth
/// surface (small distances).
pub fn dist_simple(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat_m = (lat2 - lat1) / 360.0 * EARTH_CIRC_POLES;
    let d_lon_m =
        (lon2 - lon1) / 360.0 * EARTH_CIRC_EQUATOR * ((lat1 + lat2) / 2.0).to_radians().cos();

    (d_lat_m * d_lat_m + d_lon_m * d_lon_m).sqrt()
}

/// Compass heading in degrees from the first fix to the second
/// (0 = north, 90 = east), or -1.0 when the fixes are closer than 0.5 m.
pub fn heading_simple(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat_m = (lat2 - lat1) / 360.0 * EARTH_CIRC_POLES;
    let d_lon_m =
        (lon2 - lon1) / 360.0 * EARTH_CIRC_EQUATOR * ((lat1 + lat2) / 2.0).to_radians().cos();
    let dist = (d_lat_m * d_lat_m + d_lon_m * d_lon_m).sqrt();

    // Headings over sub-meter moves are GPS noise, not motion.
    if dist <= 0.5 {
        return -1.0;
    }
    let angle_math = d_lat_m.atan2(d_lon_m).to_degrees();
    ((90.0 - angle_math) + 360.0) % 360.0
}

pub(crate) fn point_distance(p1: &Point, p2: &Point) -> f64 {
    dist_simple(p1.lat, p1.lon, p2.lat, p2.lon)
}

pub(crate) fn point_heading(p1: &Point, p2: &Point) -> f64 {
    heading_simple(p1.lat, p1.lon, p2.lat, p2.lon)
}

fn point_speed(p1: &Point, p2: &Point, units: Unit) -> f64 {
    let d = point_distance(p1, p2);
    let dt = seconds_between(p1.ts, p2.ts);
    ms_to_units(d / dt, units)
}

/// The smaller unsigned angle between two bearings, in [0, 180].
pub fn angle_diff(angle1: f64, angle2: f64) -> f64 {
    let diff = (angle2 - angle1 + 360.0) % 360.0;
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Riding side for a heading relative to the wind direction (the bearing the
/// wind blows from). A 30° dead-zone around the upwind and downwind axes maps
/// to `Side::Unknown`, as does an undefined heading or wind direction.
pub fn detect_tack_side(heading: f64, wind_dir: f64) -> Side {
    if wind_dir < 0.0 || heading < 0.0 {
        return Side::Unknown;
    }

    let rel_heading = (wind_dir - heading + 360.0) % 360.0;

    let min_heading_diff = 30.0;
    if rel_heading >= min_heading_diff && rel_heading <= 180.0 - min_heading_diff {
        return Side::Starboard;
    }
    if rel_heading >= 180.0 + min_heading_diff && rel_heading <= 360.0 - min_heading_diff {
        return Side::Port;
    }
    Side::Unknown
}

/// A contiguous window over the cleaned point sequence with its running
/// duration (seconds), distance (meters) and speed (display units).
///
/// The window operations keep the sums incremental: a point append adjusts
/// the totals by the new segment and pops leftmost points while the window
/// still meets its target, so a whole-session scan stays O(N).
#[derive(Clone, Debug, Default, Serialize)]
pub struct Track {
    pub(crate) ps: VecDeque<Point>,
    pub(crate) duration: f64,
    pub(crate) distance: f64,
    pub(crate) speed: f64,
    pub(crate) units: Unit,
    pub(crate) valid: bool,
}

impl Track {
    pub fn new(units: Unit) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.ps.iter()
    }

    /// The riding side of a track is the side of its first point.
    pub fn side(&self) -> Side {
        self.ps.front().map(|p| p.side).unwrap_or(Side::Unknown)
    }

    /// Human-readable single line for this track.
    pub fn txt_line(&self) -> String {
        let timestamp = self
            .ps
            .front()
            .map(|p| p.ts)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let side = match self.side() {
            Side::Unknown => String::new(),
            side => format!(", {}", side),
        };
        format!(
            "{:06.3} {} ({:.0} sec, {:06.3} m, {}{})",
            self.speed,
            self.units,
            self.duration,
            self.distance,
            timestamp.format("%Y-%m-%d %H:%M:%S +0000 UTC"),
            side
        )
    }

    /// Recomputes duration, distance and speed from the point list.
    pub(crate) fn recalculate(&mut self) {
        self.duration = 0.0;
        self.distance = 0.0;
        self.speed = 0.0;
        for i in 0..self.ps.len().saturating_sub(1) {
            self.duration += seconds_between(self.ps[i].ts, self.ps[i + 1].ts);
            self.distance += point_distance(&self.ps[i], &self.ps[i + 1]);
        }
        if self.duration > 0.0 {
            self.speed = ms_to_units(self.distance / self.duration, self.units);
        }
    }

    /// Appends a point and pops leftmost points while the window still covers
    /// at least `min_duration` seconds. `valid` is true once the window has
    /// reached the target duration.
    pub fn add_point_min_duration(&mut self, p: Point, min_duration: f64) {
        self.ps.push_back(p);
        let l = self.ps.len();
        if l > 1 {
            self.duration += seconds_between(self.ps[l - 2].ts, self.ps[l - 1].ts);
            self.distance += point_distance(&self.ps[l - 2], &self.ps[l - 1]);
            self.valid = self.duration >= min_duration;

            if self.duration > min_duration && self.ps.len() > 2 {
                let mut dur_test = self.duration - seconds_between(self.ps[0].ts, self.ps[1].ts);
                while dur_test >= min_duration && self.ps.len() > 2 {
                    self.duration = dur_test;
                    self.distance -= point_distance(&self.ps[0], &self.ps[1]);
                    self.ps.pop_front();
                    dur_test = self.duration - seconds_between(self.ps[0].ts, self.ps[1].ts);
                }
            }
            if self.duration > 0.0 {
                self.speed = ms_to_units(self.distance / self.duration, self.units);
            }
        }
    }

    /// `add_point_min_duration` with the unused-10s gate: a point already
    /// claimed by an earlier top-5 pick restarts the window.
    pub fn add_point_min_duration_unused_10s(&mut self, p: Point, min_duration: f64) {
        if p.used_for_10s {
            *self = Track::new(self.units);
            return;
        }
        self.add_point_min_duration(p, min_duration);
    }

    /// Appends a point and pops leftmost points while the window still covers
    /// at least `min_distance` meters. `valid` is true once the window has
    /// reached the target distance.
    pub fn add_point_min_distance(&mut self, p: Point, min_distance: f64) {
        self.ps.push_back(p);
        let l = self.ps.len();
        if l > 1 {
            self.duration += seconds_between(self.ps[l - 2].ts, self.ps[l - 1].ts);
            self.distance += point_distance(&self.ps[l - 2], &self.ps[l - 1]);
            self.valid = self.distance >= min_distance;

            if self.distance > min_distance && self.ps.len() > 2 {
                let mut dist_test = self.distance - point_distance(&self.ps[0], &self.ps[1]);
                while dist_test >= min_distance && self.ps.len() > 2 {
                    self.distance = dist_test;
                    self.duration -= seconds_between(self.ps[0].ts, self.ps[1].ts);
                    self.ps.pop_front();
                    dist_test = self.distance - point_distance(&self.ps[0], &self.ps[1]);
                }
            }
            if self.duration > 0.0 {
                self.speed = ms_to_units(self.distance / self.duration, self.units);
            }
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ps.front(), self.ps.back()) {
            (Some(first), Some(last)) => write!(
                f,
                "dur: {}, dist: {:.3}, speed: {:.3}, ps: {} - {}",
                self.duration, self.distance, self.speed, first, last
            ),
            _ => write!(
                f,
                "dur: {}, dist: {:.3}, speed: {:.3}, ps: -",
                self.duration, self.distance, self.speed
            ),
        }
    }
}

/// Removes points that look invalid: duplicate timestamps, unreliable fixes
/// around recording dropouts, and speed outliers.
///
/// The output sequence is re-indexed so `global_idx` is the position in the
/// cleaned sequence; overlap checks downstream rely on it. Inputs shorter
/// than two points pass through unchanged.
pub fn clean_up(points: &Points, delta_speed_max: f64, units: Unit) -> Points {
    let mut res = Points {
        creator: points.creator.clone(),
        name: points.name.clone(),
        kind: points.kind.clone(),
        ps: Vec::new(),
    };
    if points.ps.len() < 2 {
        res.ps = points.ps.clone();
        return res;
    }

    let timed = clean_up_timing(&points.ps);
    res.ps = clean_up_speed(&timed, delta_speed_max, units);
    for (idx, p) in res.ps.iter_mut().enumerate() {
        p.global_idx = idx;
    }
    res
}

/// Temporal cleanup: drops both points of a same-timestamp pair, and around a
/// region of missing samples (consecutive over-1-s gaps) drops the point just
/// before the region and the first three points after recording resumes.
///
/// An expected 1 Hz sequence `43,44,45,46,_,48,_,50,51,52,53,54` becomes
/// `43,44,45,48,53,54`.
fn clean_up_timing(ps: &[Point]) -> Vec<Point> {
    let n = ps.len();
    let mut cleaned = Vec::with_capacity(n);
    cleaned.push(ps[0]);
    let mut idx = 1;
    while idx < n {
        if idx == n - 1 {
            cleaned.push(ps[idx]);
            break;
        }
        let curr = ps[idx];
        let next = ps[idx + 1];
        if curr.ts == next.ts {
            idx += 2;
            continue;
        }
        if seconds_between(curr.ts, next.ts) > 1.0 {
            // Walk the chain of consecutive gaps; points between two gaps are
            // kept, the point before the region and the three points after it
            // resumes are not.
            let mut resume = idx + 1;
            while resume < n - 1 && seconds_between(ps[resume].ts, ps[resume + 1].ts) > 1.0 {
                cleaned.push(ps[resume]);
                resume += 1;
            }
            idx = resume + 3;
        } else {
            cleaned.push(curr);
            idx += 1;
        }
    }
    cleaned
}

/// Speed-outlier cleanup: fast stops are legitimate (crashes, lulls), fast
/// speedups beyond `delta_speed_max` are recording errors.
fn clean_up_speed(ps: &[Point], delta_speed_max: f64, units: Unit) -> Vec<Point> {
    if ps.len() < 2 {
        return ps.to_vec();
    }
    let mut res = vec![ps[0], ps[1]];
    let mut speed_prev = point_speed(&ps[0], &ps[1], units);
    for idx in 2..ps.len() - 1 {
        // Three speeds around the candidate: previous accepted segment, last
        // accepted point to candidate, candidate to next raw point.
        let speed_cur = point_speed(res.last().unwrap(), &ps[idx], units);
        let speed_next = point_speed(&ps[idx], &ps[idx + 1], units);
        let delta0 = speed_cur - speed_prev;
        let delta1 = speed_next - speed_cur;

        if delta0 - delta1 < delta_speed_max || delta0 < 0.0 {
            speed_prev = speed_cur;
            res.push(ps[idx]);
        }
    }
    if ps.len() > 2 {
        res.push(ps[ps.len() - 1]);
    }
    res
}

/// Estimates the wind direction from the heading distribution, preferring the
/// candidate under which more transitions classify as the given maneuver.
/// Returns degrees in [0, 360), or -1.0 when indeterminate.
pub fn auto_detect_wind_dir(ps: &[Point], prefer: TurnKind) -> f64 {
    if ps.len() < 2 {
        return -1.0;
    }

    // 10°-per-bin histogram over per-segment headings.
    let mut bins = [0usize; 36];
    for p in ps {
        bins[heading_bin(p.heading)] += 1;
    }

    let mut primary_bin = 0;
    let mut primary_count = 0;
    for (bin, &count) in bins.iter().enumerate() {
        if count > primary_count {
            primary_count = count;
            primary_bin = bin;
        }
    }
    if primary_count == 0 {
        return -1.0;
    }

    // The secondary bin is the most populated within ±1 bin of the exact
    // opposite direction.
    let opposite_bin = (primary_bin + 18) % 36;
    let mut secondary_bin = 0;
    let mut secondary_count = 0;
    for offset in [35usize, 0, 1] {
        let bin = (opposite_bin + offset) % 36;
        if bins[bin] > secondary_count {
            secondary_count = bins[bin];
            secondary_bin = bin;
        }
    }
    if secondary_count == 0 {
        return -1.0;
    }

    // Collect headings around both bins onto one riding axis: the secondary
    // side is rotated by 180°.
    let mut selected = Vec::new();
    for p in ps {
        let bin = heading_bin(p.heading);
        if bin == primary_bin || bin == (primary_bin + 1) % 36 || bin == (primary_bin + 35) % 36 {
            selected.push(p.heading);
        } else if bin == secondary_bin
            || bin == (secondary_bin + 1) % 36
            || bin == (secondary_bin + 35) % 36
        {
            selected.push((p.heading + 180.0) % 360.0);
        }
    }
    if selected.is_empty() {
        return -1.0;
    }

    let mut sum_sin = 0.0;
    let mut sum_cos = 0.0;
    for h in &selected {
        sum_sin += h.to_radians().sin();
        sum_cos += h.to_radians().cos();
    }
    let mut avg_heading = sum_sin.atan2(sum_cos).to_degrees();
    if avg_heading < 0.0 {
        avg_heading += 360.0;
    }

    // The wind is perpendicular to the mean riding axis; replay the session
    // under one candidate and count which maneuver the transitions match.
    let wd_assumed = (avg_heading + 90.0) % 360.0;
    let wd_opposite = (avg_heading - 90.0 + 360.0) % 360.0;

    let mut turn_begin = Point::new(0.0, 0.0, DateTime::<Utc>::UNIX_EPOCH);
    let mut side_prev = Side::Unknown;
    let mut side_curr = Side::Unknown;
    let mut jibe_count = 0;
    let mut tack_count = 0;
    for p in ps {
        let side = detect_tack_side(p.heading, wd_assumed);
        if side == Side::Unknown {
            continue;
        }
        if side_prev == Side::Unknown {
            side_prev = side;
            side_curr = side;
        } else if side == side_curr {
            // Last point still on the incoming side: the turn begins here.
            turn_begin = *p;
        } else {
            let turn_end = *p;
            side_curr = side;
            match turns::detect_turn_type_from_points(&turn_begin, &turn_end, wd_assumed) {
                TurnKind::Jibe => jibe_count += 1,
                TurnKind::Tack => tack_count += 1,
                TurnKind::Unknown => {}
            }
            side_prev = side_curr;
        }
    }

    match prefer {
        TurnKind::Tack => {
            if tack_count >= jibe_count {
                wd_assumed
            } else {
                wd_opposite
            }
        }
        _ => {
            if jibe_count >= tack_count {
                wd_assumed
            } else {
                wd_opposite
            }
        }
    }
}

fn heading_bin(heading: f64) -> usize {
    let bin = (heading / 10.0) as i64 % 36;
    bin.max(0) as usize
}

/// Analyzer inputs: the requested statistic, display unit, wind direction
/// handling, and debug reporting.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnalyzeParams {
    pub stat: StatKind,
    pub units: Unit,
    /// Auto-detect the wind direction, preferring this maneuver.
    pub prefer: Option<TurnKind>,
    /// Explicit wind direction in degrees; overridden by `prefer`.
    pub wind_dir: Option<f64>,
    pub debug: bool,
}

/// Statistics split by riding side, available once a wind direction is known
/// or assumed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WindDirStats {
    wind_direction: f64,
    jibes_count: usize,
    tacks_count: usize,
    delta_500m: Track,
    starboard_speed_2s: Track,
    starboard_speed_5x10s: Vec<Track>,
    starboard_speed_100m: Track,
    starboard_alpha_500m: Track,
    starboard_delta_500m: Track,
    port_speed_2s: Track,
    port_speed_5x10s: Vec<Track>,
    port_speed_100m: Track,
    port_alpha_500m: Track,
    port_delta_500m: Track,
}

/// The calculated session statistics.
#[derive(Clone, Debug, Serialize)]
pub struct Stats {
    total_distance: f64,
    /// Total duration in hours.
    total_duration: f64,
    unkn_turns_count: usize,
    speed_2s: Track,
    speed_5x10s: Vec<Track>,
    speed_15m: Track,
    speed_1h: Track,
    speed_100m: Track,
    speed_1nm: Track,
    alpha_500m: Track,
    units: Unit,
    wind_dir_known: bool,
    wind: WindDirStats,
}

impl Stats {
    fn new(units: Unit) -> Self {
        Self {
            total_distance: 0.0,
            total_duration: 0.0,
            unkn_turns_count: 0,
            speed_2s: Track::new(units),
            speed_5x10s: vec![Track::new(units); 5],
            speed_15m: Track::new(units),
            speed_1h: Track::new(units),
            speed_100m: Track::new(units),
            speed_1nm: Track::new(units),
            alpha_500m: Track::new(units),
            units,
            wind_dir_known: false,
            wind: WindDirStats {
                delta_500m: Track::new(units),
                starboard_speed_2s: Track::new(units),
                starboard_speed_5x10s: vec![Track::new(units); 5],
                starboard_speed_100m: Track::new(units),
                starboard_alpha_500m: Track::new(units),
                starboard_delta_500m: Track::new(units),
                port_speed_2s: Track::new(units),
                port_speed_5x10s: vec![Track::new(units); 5],
                port_speed_100m: Track::new(units),
                port_alpha_500m: Track::new(units),
                port_delta_500m: Track::new(units),
                ..WindDirStats::default()
            },
        }
    }

    pub fn all_turns_count(&self) -> usize {
        self.unkn_turns_count + self.wind.jibes_count + self.wind.tacks_count
    }

    /// Single-line summary for one statistic kind.
    pub fn txt_single_stat(&self, kind: StatKind) -> String {
        match kind {
            StatKind::Distance => format!("{:06.3} km", self.total_distance / 1000.0),
            StatKind::Duration => format!("{:06.3} h", self.total_duration),
            StatKind::Speed2s => self.speed_2s.txt_line(),
            StatKind::Speed10sAvg => format!("{:06.3}", calc_tracks_avg(&self.speed_5x10s)),
            StatKind::Speed10s1 => self.speed_5x10s[0].txt_line(),
            StatKind::Speed10s2 => self.speed_5x10s[1].txt_line(),
            StatKind::Speed10s3 => self.speed_5x10s[2].txt_line(),
            StatKind::Speed10s4 => self.speed_5x10s[3].txt_line(),
            StatKind::Speed10s5 => self.speed_5x10s[4].txt_line(),
            StatKind::Speed15m => self.speed_15m.txt_line(),
            StatKind::Speed1h => self.speed_1h.txt_line(),
            StatKind::Speed100m => self.speed_100m.txt_line(),
            StatKind::Speed1nm => self.speed_1nm.txt_line(),
            StatKind::Alpha => self.alpha_500m.txt_line(),
            StatKind::All => String::new(),
        }
    }

    /// Multi-line human-readable report with all statistics.
    pub fn txt_stats(&self) -> String {
        use std::fmt::Write;

        let mut b = String::new();
        let _ = writeln!(b, "Total Distance:     {:06.3} km", self.total_distance / 1000.0);
        let _ = writeln!(b, "Total Duration:     {:06.3} h", self.total_duration);

        if self.wind_dir_known {
            let _ = writeln!(b, "Wind Direction:     {:06.3}", self.wind.wind_direction);
            let _ = writeln!(b, "Unkn turns Count:   {}", self.unkn_turns_count);
            let _ = writeln!(b, "Jibes Count:        {}", self.wind.jibes_count);
            let _ = writeln!(b, "Tacks Count:        {}", self.wind.tacks_count);
        } else {
            let _ = writeln!(b, "Wind Dir +/- 180°:  {:06.3}", self.wind.wind_direction);
            let _ = writeln!(b, "Turns Count:        {}", self.all_turns_count());
        }

        let _ = writeln!(b, "2 Second Peak:      {}", self.speed_2s.txt_line());
        let _ = writeln!(
            b,
            "5x10 Average:       {:06.3} {}",
            calc_tracks_avg(&self.speed_5x10s),
            self.units
        );
        for (i, track) in self.speed_5x10s.iter().enumerate() {
            let _ = writeln!(b, "  Top {} 5x10 speed: {}", i + 1, track.txt_line());
        }
        let _ = writeln!(b, "15 Min:             {}", self.speed_15m.txt_line());
        let _ = writeln!(b, "1 Hr:               {}", self.speed_1h.txt_line());
        let _ = writeln!(b, "100m peak:          {}", self.speed_100m.txt_line());
        let _ = writeln!(b, "Nautical Mile:      {}", self.speed_1nm.txt_line());
        let _ = writeln!(b, "Alpha 500:          {}", self.alpha_500m.txt_line());

        if self.wind_dir_known {
            let _ = writeln!(b, "Delta 500:          {}", self.wind.delta_500m.txt_line());
            let _ = writeln!(b);
            let _ = writeln!(b, "Starboard 2s:       {}", self.wind.starboard_speed_2s.txt_line());
            let _ = writeln!(
                b,
                "Starboard 5x10s:    {:06.3} {}",
                calc_tracks_avg(&self.wind.starboard_speed_5x10s),
                self.units
            );
            for (i, track) in self.wind.starboard_speed_5x10s.iter().enumerate() {
                let _ = writeln!(b, "  Top {} 5x10 speed: {}", i + 1, track.txt_line());
            }
            let _ = writeln!(b, "Starboard 100m:     {}", self.wind.starboard_speed_100m.txt_line());
            let _ = writeln!(b, "Starboard Alpha:    {}", self.wind.starboard_alpha_500m.txt_line());
            let _ = writeln!(b, "Starboard Delta:    {}", self.wind.starboard_delta_500m.txt_line());
            let _ = writeln!(b);
            let _ = writeln!(b, "Port 2s:            {}", self.wind.port_speed_2s.txt_line());
            let _ = writeln!(
                b,
                "Port 5x10s:         {:06.3} {}",
                calc_tracks_avg(&self.wind.port_speed_5x10s),
                self.units
            );
            for (i, track) in self.wind.port_speed_5x10s.iter().enumerate() {
                let _ = writeln!(b, "  Top {} 5x10 speed: {}", i + 1, track.txt_line());
            }
            let _ = writeln!(b, "Port 100m:          {}", self.wind.port_speed_100m.txt_line());
            let _ = writeln!(b, "Port Alpha:         {}", self.wind.port_alpha_500m.txt_line());
            let _ = writeln!(b, "Port Delta:         {}", self.wind.port_delta_500m.txt_line());
        }
        b
    }
}

/// Average speed over a set of tracks.
pub fn calc_tracks_avg(tracks: &[Track]) -> f64 {
    if tracks.is_empty() {
        return 0.0;
    }
    tracks.iter().map(|t| t.speed).sum::<f64>() / tracks.len() as f64
}

/// Calculates statistics from cleaned-up points.
///
/// Headings, riding sides and the transient top-5 flags are (re)assigned on
/// the given slice. Inputs with fewer than two points produce a zeroed
/// aggregate; absence of a statistic is not an error.
pub fn calculate_stats(ps: &mut [Point], params: &AnalyzeParams) -> Stats {
    for i in 1..ps.len() {
        ps[i].heading = point_heading(&ps[i - 1], &ps[i]);
    }

    let mut wind_dir = params.wind_dir.unwrap_or(-1.0);
    if let Some(prefer) = params.prefer {
        wind_dir = auto_detect_wind_dir(ps, prefer);
    }
    let wind_dir_known = wind_dir >= 0.0;

    // Without a confirmed wind direction, assume the favorite turn is a jibe;
    // turn detection still works against the assumed axis.
    if !wind_dir_known {
        wind_dir = auto_detect_wind_dir(ps, TurnKind::Jibe);
    }

    for i in 1..ps.len() {
        ps[i].side = detect_tack_side(ps[i].heading, wind_dir);
    }

    let units = params.units;
    let stat = params.stat;
    let mut res = Stats::new(units);
    res.wind_dir_known = wind_dir_known;
    res.wind.wind_direction = wind_dir;

    if ps.len() < 2 {
        return res;
    }

    res.total_duration = seconds_between(ps[0].ts, ps[ps.len() - 1].ts) / 3600.0;

    let do_2s = matches!(stat, StatKind::All | StatKind::Speed2s);
    let do_15m = matches!(stat, StatKind::All | StatKind::Speed15m);
    let do_1h = matches!(stat, StatKind::All | StatKind::Speed1h);
    let do_100m = matches!(stat, StatKind::All | StatKind::Speed100m);
    let do_1nm = matches!(stat, StatKind::All | StatKind::Speed1nm);

    let mut track_2s = Track::new(units);
    let mut track_15m = Track::new(units);
    let mut track_1h = Track::new(units);
    let mut track_100m = Track::new(units);
    let mut track_1nm = Track::new(units);

    for i in 0..ps.len() {
        if i > 0 {
            res.total_distance += point_distance(&ps[i - 1], &ps[i]);
        }
        if do_2s {
            track_2s.add_point_min_duration(ps[i], 2.0);
        }
        if do_15m {
            track_15m.add_point_min_duration(ps[i], 900.0);
        }
        if do_1h {
            track_1h.add_point_min_duration(ps[i], 3600.0);
        }
        if do_100m {
            track_100m.add_point_min_distance(ps[i], 100.0);
        }
        if do_1nm {
            track_1nm.add_point_min_distance(ps[i], 1852.0);
        }
        if i == 0 {
            continue;
        }

        if track_2s.valid && res.speed_2s.speed < track_2s.speed {
            res.speed_2s = track_2s.clone();
        }
        if track_15m.valid && res.speed_15m.speed < track_15m.speed {
            res.speed_15m = track_15m.clone();
        }
        if track_1h.valid && res.speed_1h.speed < track_1h.speed {
            res.speed_1h = track_1h.clone();
        }
        if track_100m.valid && res.speed_100m.speed < track_100m.speed {
            res.speed_100m = track_100m.clone();
        }
        if track_1nm.valid && res.speed_1nm.speed < track_1nm.speed {
            res.speed_1nm = track_1nm.clone();
        }

        if track_2s.valid
            && track_2s.side() == Side::Starboard
            && res.wind.starboard_speed_2s.speed < track_2s.speed
        {
            res.wind.starboard_speed_2s = track_2s.clone();
        }
        if track_100m.valid
            && track_100m.side() == Side::Starboard
            && res.wind.starboard_speed_100m.speed < track_100m.speed
        {
            res.wind.starboard_speed_100m = track_100m.clone();
        }
        if track_2s.valid
            && track_2s.side() == Side::Port
            && res.wind.port_speed_2s.speed < track_2s.speed
        {
            res.wind.port_speed_2s = track_2s.clone();
        }
        if track_100m.valid
            && track_100m.side() == Side::Port
            && res.wind.port_speed_100m.speed < track_100m.speed
        {
            res.wind.port_speed_100m = track_100m.clone();
        }
    }

    if matches!(stat, StatKind::All | StatKind::Alpha) {
        compute_turn_stats(ps, wind_dir, params, &mut res);
    }

    if stat.is_10s() {
        res.speed_5x10s = collect_top_10s(ps, units, None);

        if res.wind_dir_known {
            for p in ps.iter_mut() {
                p.used_for_10s = false;
            }
            res.wind.starboard_speed_5x10s = collect_top_10s(ps, units, Some(Side::Starboard));

            for p in ps.iter_mut() {
                p.used_for_10s = false;
            }
            res.wind.port_speed_5x10s = collect_top_10s(ps, units, Some(Side::Port));
        }
    }

    res
}

/// Segments the track into single-turn spans, extracts the best gated
/// sub-span of each (Alpha/Delta 500), classifies it and updates the
/// aggregate.
fn compute_turn_stats(ps: &[Point], wind_dir: f64, params: &AnalyzeParams, res: &mut Stats) {
    let units = params.units;
    let turn_tracks = turns::collect_turn_tracks(ps, units);

    for turn_track in &turn_tracks {
        let sub = turns::find_max_turn_subtrack(turn_track, units);
        if !sub.valid {
            if params.debug {
                let kind = turns::detect_turn_type(&sub, wind_dir);
                debug!(
                    "{} turn ({}): {}, full track: {}",
                    kind,
                    sub.side(),
                    sub,
                    turn_track
                );
            }
            continue;
        }

        let kind = turns::detect_turn_type(&sub, wind_dir);
        if params.debug {
            debug!("{} turn ({}): {}", kind, sub.side(), sub);
        }

        match kind {
            TurnKind::Unknown => {
                res.unkn_turns_count += 1;
                if !res.wind_dir_known && res.alpha_500m.speed < sub.speed {
                    res.alpha_500m = sub.clone();
                }
            }
            TurnKind::Jibe => {
                res.wind.jibes_count += 1;
                if res.alpha_500m.speed < sub.speed {
                    res.alpha_500m = sub.clone();
                }
                match sub.side() {
                    Side::Starboard => {
                        if res.wind.starboard_alpha_500m.speed < sub.speed {
                            res.wind.starboard_alpha_500m = sub.clone();
                        }
                    }
                    Side::Port => {
                        if res.wind.port_alpha_500m.speed < sub.speed {
                            res.wind.port_alpha_500m = sub.clone();
                        }
                    }
                    Side::Unknown => {}
                }
            }
            TurnKind::Tack => {
                res.wind.tacks_count += 1;
                if res.wind.delta_500m.speed < sub.speed {
                    res.wind.delta_500m = sub.clone();
                }
                match sub.side() {
                    Side::Starboard => {
                        if res.wind.starboard_delta_500m.speed < sub.speed {
                            res.wind.starboard_delta_500m = sub.clone();
                        }
                    }
                    Side::Port => {
                        if res.wind.port_delta_500m.speed < sub.speed {
                            res.wind.port_delta_500m = sub.clone();
                        }
                    }
                    Side::Unknown => {}
                }
            }
        }
    }
}

/// Picks five non-overlapping fastest 10 s windows, ordered by decreasing
/// speed. Every point of a pick is flagged so later picks restart across it.
/// With a side filter, only windows starting on that side are considered.
fn collect_top_10s(ps: &mut [Point], units: Unit, side: Option<Side>) -> Vec<Track> {
    let mut out = Vec::with_capacity(5);
    for _ in 0..5 {
        let mut best = Track::new(units);
        let mut track = Track::new(units);
        for i in 0..ps.len() {
            track.add_point_min_duration_unused_10s(ps[i], 10.0);
            if track.valid && side.map_or(true, |s| track.side() == s) && best.speed < track.speed
            {
                best = track.clone();
            }
        }
        for p in best.ps.iter() {
            ps[p.global_idx].used_for_10s = true;
        }
        out.push(best);
    }
    out
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use chrono::TimeZone;

    pub fn base_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 10, 14, 14, 0, 0).unwrap()
    }

    pub fn pt(lat: f64, lon: f64, ts: DateTime<Utc>) -> Point {
        Point::new(lat, lon, ts)
    }

    /// Builds a 1 Hz track starting at a fixed position, walking one
    /// `(heading_deg, meters)` step per second. Points are indexed as a
    /// cleaned sequence would be.
    pub fn walk_track(steps: &[(f64, f64)]) -> Vec<Point> {
        let mut lat = 43.5_f64;
        let mut lon = 16.4_f64;
        let mut ts = base_ts();
        let mut ps = vec![pt(lat, lon, ts)];
        for &(heading, meters) in steps {
            let rad = heading.to_radians();
            let north_m = meters * rad.cos();
            let east_m = meters * rad.sin();
            lat += north_m * 360.0 / EARTH_CIRC_POLES;
            lon += east_m * 360.0 / (EARTH_CIRC_EQUATOR * lat.to_radians().cos());
            ts = ts + chrono::Duration::seconds(1);
            ps.push(pt(lat, lon, ts));
        }
        for (idx, p) in ps.iter_mut().enumerate() {
            p.global_idx = idx;
        }
        ps
    }

    /// Repeats `(heading, meters, count)` legs into a step list.
    pub fn legs(pattern: &[(f64, f64, usize)]) -> Vec<(f64, f64)> {
        let mut steps = Vec::new();
        for &(heading, meters, count) in pattern {
            for _ in 0..count {
                steps.push((heading, meters));
            }
        }
        steps
    }
}
