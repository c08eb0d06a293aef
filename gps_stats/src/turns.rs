//! Turn segmentation and classification: single-turn track extraction, the
//! gated Alpha/Delta 500 sub-span search, and jibe/tack detection.

use crate::{angle_diff, point_distance, point_heading, Point, Side, Track, TurnKind, Unit};

const TURN_MAX_DISTANCE: f64 = 500.0;
const TURN_MIN_DISTANCE: f64 = 100.0;
const TURN_GATE_SIZE: f64 = 50.0;

impl Track {
    /// Appends a point to a turn track capped at 500 m and returns the best
    /// gated sub-span for this append (50 m gate, at least 100 m long).
    pub(crate) fn add_point_turn_500(&mut self, p: Point) -> Track {
        self.add_point_turn_max_distance(p, TURN_MAX_DISTANCE, TURN_MIN_DISTANCE, TURN_GATE_SIZE)
    }

    /// Appends a point while keeping the track as long as possible but no
    /// longer than `max_distance`, then searches for a sub-span whose first
    /// and last points are at most `gate_size` apart, that covers at least
    /// `min_distance` (riding straight past a mark is not a turn), and whose
    /// endpoints sit on opposite riding sides. The returned track is `valid`
    /// when such a sub-span exists.
    pub(crate) fn add_point_turn_max_distance(
        &mut self,
        p: Point,
        max_distance: f64,
        min_distance: f64,
        gate_size: f64,
    ) -> Track {
        // Static or near upwind/downwind points cannot open a turn track.
        if self.ps.is_empty() && p.heading < 0.0 {
            return Track::new(self.units);
        }

        self.ps.push_back(p);
        let mut l = self.ps.len();
        if l > 1 {
            let first_side = self.ps[0].side;
            self.duration += crate::seconds_between(self.ps[l - 2].ts, self.ps[l - 1].ts);
            self.distance += point_distance(&self.ps[l - 2], &self.ps[l - 1]);

            // 1. Trim from the left towards max_distance, not trimming past a
            //    point with an unknown side.
            if self.distance > max_distance && l > 2 {
                let mut dist_test = self.distance - point_distance(&self.ps[0], &self.ps[1]);
                while dist_test > max_distance && l > 2 && self.ps[0].side != Side::Unknown {
                    self.distance = dist_test;
                    self.duration -= crate::seconds_between(self.ps[0].ts, self.ps[1].ts);
                    self.ps.pop_front();
                    l = self.ps.len();
                    dist_test = self.distance - point_distance(&self.ps[0], &self.ps[1]);
                }
                self.distance = dist_test;
                self.duration -= crate::seconds_between(self.ps[0].ts, self.ps[1].ts);
                self.ps.pop_front();
                l = self.ps.len();
            }

            // 2. The last point must sit on a known side.
            let mut last_side = self.ps[l - 1].side;
            while last_side == Side::Unknown && l > 2 {
                self.ps.pop_back();
                l -= 1;
                last_side = self.ps[l - 1].side;
            }

            // 3. Only a track that changed sides can hold a turn.
            if last_side != Side::Unknown && last_side != first_side {
                // 4. Look for the earliest left trim closing a gate.
                let mut subtrack_distance = self.distance;
                for i in 0..l.saturating_sub(2) {
                    if subtrack_distance < min_distance {
                        break;
                    }
                    if self.ps[i].side != first_side {
                        break;
                    }
                    if self.ps[i].side == Side::Unknown {
                        subtrack_distance -= point_distance(&self.ps[i], &self.ps[i + 1]);
                        continue;
                    }
                    let gate_distance = point_distance(&self.ps[i], &self.ps[l - 1]);
                    if gate_distance <= gate_size && subtrack_distance >= min_distance {
                        let mut subtrack = Track::new(self.units);
                        subtrack.ps = self.ps.iter().skip(i).copied().collect();
                        subtrack.valid = true;
                        subtrack.recalculate();
                        return subtrack;
                    }
                    subtrack_distance -= point_distance(&self.ps[i], &self.ps[i + 1]);
                }
            }
        }

        Track::new(self.units)
    }
}

/// Splits the point sequence into maximal spans containing exactly two
/// distinct riding sides (one side change, with unknown runs in between).
/// Consecutive spans share the run of points around their common side.
pub(crate) fn collect_turn_tracks(ps: &[Point], units: Unit) -> Vec<Track> {
    let mut turn_tracks = Vec::new();

    let mut curr_track = Track::new(units);
    let mut next_track = Track::new(units);
    let mut curr_side = Side::Unknown;
    let mut curr_track_sides = 0;
    let mut total_sides = 0;

    for &p in ps {
        if p.side != Side::Unknown && p.side != curr_side {
            curr_side = p.side;
            curr_track_sides += 1;
            total_sides += 1;
        }

        if total_sides == 0 {
            continue;
        }
        if curr_track_sides <= 2 {
            curr_track.ps.push_back(p);
            if total_sides > 1 {
                // The next track opens on a point with a known side.
                if !next_track.ps.is_empty() || p.side != Side::Unknown {
                    next_track.ps.push_back(p);
                }
            }
        } else {
            next_track.ps.push_back(p);
            turn_tracks.push(curr_track);

            curr_track = next_track;
            next_track = Track::new(units);
            curr_track_sides = 2;
        }
    }

    if curr_track_sides > 1 {
        turn_tracks.push(curr_track);
    }

    turn_tracks
}

/// Finds the fastest gated sub-span within a single-turn track.
pub(crate) fn find_max_turn_subtrack(turn_track: &Track, units: Unit) -> Track {
    let mut track = Track::new(units);
    let mut best = Track::new(units);

    for &p in turn_track.ps.iter() {
        let subtrack = track.add_point_turn_500(p);
        if subtrack.valid && subtrack.speed > best.speed {
            best = subtrack;
        }
    }

    best
}

/// Classifies a turn sub-span as jibe or tack from the bearing between the
/// last point on the incoming side and the first point on the outgoing side.
pub fn detect_turn_type(track: &Track, wind_dir: f64) -> TurnKind {
    if track.ps.len() < 2 {
        return TurnKind::Unknown;
    }

    let mut turn_begin: Option<Point> = None;
    let mut turn_end: Option<Point> = None;
    for p in track.ps.iter() {
        if p.side == Side::Unknown {
            continue;
        }
        match turn_begin {
            // The begin point tracks the last point on the incoming side.
            Some(begin) if begin.side == p.side => turn_begin = Some(*p),
            Some(_) => {
                turn_end = Some(*p);
                break;
            }
            None => turn_begin = Some(*p),
        }
    }

    match (turn_begin, turn_end) {
        (Some(begin), Some(end)) => detect_turn_type_from_points(&begin, &end, wind_dir),
        _ => TurnKind::Unknown,
    }
}

/// Classifies a turn from its begin and end points. Points closer than one
/// meter carry no usable bearing.
pub fn detect_turn_type_from_points(begin: &Point, end: &Point, wind_dir: f64) -> TurnKind {
    let dist = point_distance(begin, end);
    if dist >= 1.0 {
        let heading = point_heading(begin, end);
        return detect_turn_type_from_heading(heading, wind_dir);
    }
    TurnKind::Unknown
}

/// Classifies a turn from the bearing across it: near-upwind is a tack,
/// near-downwind a jibe.
pub fn detect_turn_type_from_heading(heading: f64, wind_dir: f64) -> TurnKind {
    let diff = angle_diff(heading, wind_dir);

    let min_heading_diff = 60.0;
    if diff < min_heading_diff {
        TurnKind::Tack
    } else if diff > 180.0 - min_heading_diff {
        TurnKind::Jibe
    } else {
        TurnKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::{calculate_stats, AnalyzeParams, Unit};

    #[test]
    fn test_detect_turn_type_from_heading_thresholds() {
        assert_eq!(detect_turn_type_from_heading(30.0, 0.0), TurnKind::Tack);
        assert_eq!(detect_turn_type_from_heading(59.9, 0.0), TurnKind::Tack);
        assert_eq!(detect_turn_type_from_heading(60.0, 0.0), TurnKind::Unknown);
        assert_eq!(detect_turn_type_from_heading(90.0, 0.0), TurnKind::Unknown);
        assert_eq!(detect_turn_type_from_heading(120.0, 0.0), TurnKind::Unknown);
        assert_eq!(detect_turn_type_from_heading(121.0, 0.0), TurnKind::Jibe);
        assert_eq!(detect_turn_type_from_heading(180.0, 0.0), TurnKind::Jibe);
        // Wrap-around near north.
        assert_eq!(detect_turn_type_from_heading(350.0, 10.0), TurnKind::Tack);
    }

    #[test]
    fn test_detect_turn_type_from_points_short_distance() {
        let ts = base_ts();
        let begin = pt(43.5, 16.4, ts);
        // Half a meter away: no usable bearing.
        let end = pt(43.5 + 0.5 * 360.0 / crate::EARTH_CIRC_POLES, 16.4, ts);
        assert_eq!(
            detect_turn_type_from_points(&begin, &end, 0.0),
            TurnKind::Unknown
        );
    }

    #[test]
    fn test_collect_turn_tracks_segments() {
        let mut ps = walk_track(&legs(&[(90.0, 8.0, 7)]));
        let sides = [
            Side::Unknown,
            Side::Port,
            Side::Port,
            Side::Unknown,
            Side::Starboard,
            Side::Starboard,
            Side::Port,
            Side::Port,
        ];
        for (p, side) in ps.iter_mut().zip(sides) {
            p.side = side;
        }

        let tracks = collect_turn_tracks(&ps, Unit::Kts);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].ps.len(), 5);
        assert_eq!(tracks[0].ps.front().unwrap().side, Side::Port);
        assert_eq!(tracks[0].ps.back().unwrap().side, Side::Starboard);
        assert_eq!(tracks[1].ps.len(), 4);
        assert_eq!(tracks[1].ps.front().unwrap().side, Side::Starboard);
        assert_eq!(tracks[1].ps.back().unwrap().side, Side::Port);
    }

    #[test]
    fn test_collect_turn_tracks_straight_ride() {
        let mut ps = walk_track(&legs(&[(90.0, 8.0, 20)]));
        for p in ps.iter_mut() {
            p.side = Side::Port;
        }
        assert!(collect_turn_tracks(&ps, Unit::Kts).is_empty());
    }

    fn jibe_steps() -> Vec<(f64, f64)> {
        // Reach out at 100°, bear away through dead downwind (wind from 10°),
        // reach back at 280° to close the loop near the entry.
        legs(&[
            (100.0, 8.0, 25),
            (140.0, 8.0, 1),
            (190.0, 8.0, 1),
            (240.0, 8.0, 1),
            (280.0, 8.0, 25),
        ])
    }

    #[test]
    fn test_jibe_produces_alpha_500() {
        let mut ps = walk_track(&jibe_steps());
        let params = AnalyzeParams {
            units: Unit::Ms,
            wind_dir: Some(10.0),
            ..AnalyzeParams::default()
        };
        let stats = calculate_stats(&mut ps, &params);

        let alpha = &stats.alpha_500m;
        assert!(alpha.valid, "no alpha found");
        assert!(
            alpha.distance >= 100.0 && alpha.distance <= 500.0,
            "alpha distance = {}",
            alpha.distance
        );
        let first = alpha.ps.front().unwrap();
        let last = alpha.ps.back().unwrap();
        assert!(point_distance(first, last) <= 50.0);
        assert_ne!(first.side, Side::Unknown);
        assert_ne!(last.side, Side::Unknown);
        assert_ne!(first.side, last.side);
        assert!((alpha.speed - 8.0).abs() < 1.0, "alpha speed = {}", alpha.speed);

        assert_eq!(stats.wind.jibes_count, 1);
        assert_eq!(stats.wind.tacks_count, 0);
        assert!(!stats.wind.delta_500m.valid);
        // The turn entered on port, so it lands in the port split.
        assert_eq!(alpha.side(), Side::Port);
        assert!(stats.wind.port_alpha_500m.valid);
        assert!(!stats.wind.starboard_alpha_500m.valid);
    }

    #[test]
    fn test_tack_produces_delta_500() {
        // Beat out at 80°, tack through the eye of the wind (from 10°), beat
        // back at 260°.
        let mut ps = walk_track(&legs(&[
            (80.0, 8.0, 25),
            (40.0, 8.0, 1),
            (0.0, 8.0, 1),
            (320.0, 8.0, 1),
            (260.0, 8.0, 25),
        ]));
        let params = AnalyzeParams {
            units: Unit::Ms,
            wind_dir: Some(10.0),
            ..AnalyzeParams::default()
        };
        let stats = calculate_stats(&mut ps, &params);

        let delta = &stats.wind.delta_500m;
        assert!(delta.valid, "no delta found");
        assert!(delta.distance >= 100.0 && delta.distance <= 500.0);
        let first = delta.ps.front().unwrap();
        let last = delta.ps.back().unwrap();
        assert!(point_distance(first, last) <= 50.0);
        assert_ne!(first.side, last.side);
        assert_eq!(stats.wind.tacks_count, 1);
        assert_eq!(stats.wind.jibes_count, 0);
        assert!(!stats.alpha_500m.valid);
    }

    #[test]
    fn test_diverging_turn_fails_gate() {
        // A single 140° bend without a return leg never closes the 50 m gate.
        let mut ps = walk_track(&legs(&[(100.0, 8.0, 25), (240.0, 8.0, 25)]));
        let params = AnalyzeParams {
            units: Unit::Ms,
            wind_dir: Some(10.0),
            ..AnalyzeParams::default()
        };
        let stats = calculate_stats(&mut ps, &params);
        assert!(!stats.alpha_500m.valid);
        assert!(!stats.wind.delta_500m.valid);
        assert_eq!(stats.wind.jibes_count, 0);
        assert_eq!(stats.wind.tacks_count, 0);
    }

    #[test]
    fn test_long_turn_track_trims_to_500() {
        // Very long legs force the left trim: the surviving sub-span still
        // respects the distance cap.
        let mut ps = walk_track(&legs(&[
            (100.0, 8.0, 60),
            (140.0, 8.0, 1),
            (190.0, 8.0, 1),
            (240.0, 8.0, 1),
            (280.0, 8.0, 60),
        ]));
        let params = AnalyzeParams {
            units: Unit::Ms,
            wind_dir: Some(10.0),
            ..AnalyzeParams::default()
        };
        let stats = calculate_stats(&mut ps, &params);
        if stats.alpha_500m.valid {
            assert!(stats.alpha_500m.distance <= 500.0);
            assert!(stats.alpha_500m.distance >= 100.0);
        }
    }

    #[test]
    fn test_find_max_turn_subtrack_prefers_fastest() {
        // Same geometry, but the second half of the return leg is slower; the
        // best sub-span is discovered while the fast points still dominate.
        let mut ps = walk_track(&jibe_steps());
        for i in 1..ps.len() {
            ps[i].heading = crate::point_heading(&ps[i - 1], &ps[i]);
        }
        for p in ps.iter_mut() {
            p.side = crate::detect_tack_side(p.heading, 10.0);
        }
        let turn_tracks = collect_turn_tracks(&ps, Unit::Ms);
        assert_eq!(turn_tracks.len(), 1);
        let best = find_max_turn_subtrack(&turn_tracks[0], Unit::Ms);
        assert!(best.valid);
        assert!(best.speed > 0.0);
        let recheck = {
            let mut t = best.clone();
            t.recalculate();
            t
        };
        assert!((recheck.speed - best.speed).abs() < 1e-9);
        assert!((recheck.distance - best.distance).abs() < 1e-9);
    }
}
