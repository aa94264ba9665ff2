use serde::ser::{Serialize, SerializeSeq, SerializeTuple, Serializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cycle::CycleId;
use crate::elevation::ElevationGrid;
use crate::errors::SimError;
use crate::fingerprint::RequestKey;
use crate::wind::WindFile;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const DEG_PER_RAD: f64 = 180.0 / std::f64::consts::PI;

/// Default integrator step in seconds.
pub const DEFAULT_STEP: f64 = 60.0;

/// One integrator step of a trajectory. Serialized on the wire as the
/// 6-tuple `[t, lat, lon, alt, u, v]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub t: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub u: f64,
    pub v: f64,
}

impl Serialize for TrackPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.t)?;
        tuple.serialize_element(&self.lat)?;
        tuple.serialize_element(&self.lon)?;
        tuple.serialize_element(&self.alt)?;
        tuple.serialize_element(&self.u)?;
        tuple.serialize_element(&self.v)?;
        tuple.end()
    }
}

/// A full three-phase flight. Serialized as an outer array of the three
/// segment arrays, ascent first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub ascent: Vec<TrackPoint>,
    pub float: Vec<TrackPoint>,
    pub descent: Vec<TrackPoint>,
}

impl Trajectory {
    /// The landing point: the last record of the descent segment.
    pub fn landing(&self) -> Option<&TrackPoint> {
        self.descent.last()
    }
}

impl Serialize for Trajectory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.ascent)?;
        seq.serialize_element(&self.float)?;
        seq.serialize_element(&self.descent)?;
        seq.end()
    }
}

/// Launch parameters of one three-phase flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightProfile {
    /// Launch epoch, seconds UTC.
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    /// Launch altitude, meters.
    pub alt: f64,
    /// Ascent ends when altitude reaches this, meters.
    pub burst_alt: f64,
    /// Equilibrium float duration, hours. May be zero.
    pub float_hours: f64,
    /// m/s, > 0.
    pub ascent_rate: f64,
    /// m/s, > 0.
    pub descent_rate: f64,
    /// Multiplier on the descent rate; perturbed by the Monte-Carlo sampler.
    pub coeff: f64,
    /// Integrator step, seconds.
    pub step: f64,
}

impl FlightProfile {
    pub fn request_key(&self, member: i32) -> RequestKey {
        RequestKey {
            time: self.time,
            lat: self.lat,
            lon: self.lon,
            alt: self.alt,
            burst_alt: self.burst_alt,
            float_hours: self.float_hours,
            ascent_rate: self.ascent_rate,
            descent_rate: self.descent_rate,
            coeff: self.coeff,
            member,
        }
    }
}

/// Normalize a mod-360 longitude into [-180, 180) for emission.
pub fn normalize_lon(lon: f64) -> f64 {
    let wrapped = lon.rem_euclid(360.0);
    if wrapped >= 180.0 { wrapped - 360.0 } else { wrapped }
}

enum SegmentEnd {
    DurationElapsed,
    GroundHit,
}

/// One wind field bound to the shared elevation grid, ready to integrate
/// flights. Pure after construction: no I/O beyond faults into the mapped
/// tensor.
pub struct Simulator {
    wind: WindFile,
    elevation: Arc<ElevationGrid>,
    cycle: CycleId,
    member: u8,
}

impl Simulator {
    pub fn new(wind: WindFile, elevation: Arc<ElevationGrid>, cycle: CycleId, member: u8) -> Self {
        Self {
            wind,
            elevation,
            cycle,
            member,
        }
    }

    pub fn cycle(&self) -> &CycleId {
        &self.cycle
    }

    pub fn member(&self) -> u8 {
        self.member
    }

    pub fn wind_mut(&mut self) -> &mut WindFile {
        &mut self.wind
    }

    /// Integrate one constant-rate segment with the fixed-step midpoint
    /// method. The first emitted record is the requested start state.
    pub fn simulate(
        &self,
        start: (f64, f64, f64, f64),
        v_z: f64,
        duration: f64,
        step: f64,
        ground_check: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrackPoint>, SimError> {
        self.segment(start, v_z, duration, step, ground_check, cancel)
            .map(|(points, _)| points)
    }

    fn segment(
        &self,
        start: (f64, f64, f64, f64),
        v_z: f64,
        duration: f64,
        step: f64,
        ground_check: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<TrackPoint>, SegmentEnd), SimError> {
        if !(step > 0.0) || !duration.is_finite() || duration < 0.0 {
            return Err(SimError::IntegratorFailed);
        }

        let (mut t, mut lat, mut lon, mut alt) = start;
        let (mut u, mut v) = self.wind.get(lat, lon, alt, t)?;

        let mut points = Vec::with_capacity((duration / step) as usize + 1);
        points.push(TrackPoint {
            t,
            lat,
            lon: normalize_lon(lon),
            alt,
            u,
            v,
        });

        let mut remaining = duration;
        while remaining > 0.0 {
            if cancel.is_cancelled() {
                return Err(SimError::Cancelled);
            }
            let dt = step.min(remaining);

            // One cosine per step, shared by the midpoint and full advance.
            let cos_lat = (lat / DEG_PER_RAD).cos();
            let dlat = |wind_v: f64| wind_v * dt / EARTH_RADIUS_M * DEG_PER_RAD;
            let dlon = |wind_u: f64| wind_u * dt / (EARTH_RADIUS_M * cos_lat) * DEG_PER_RAD;

            // Midpoint state under the start-of-step derivatives.
            let mid_lat = lat + 0.5 * dlat(v);
            let mid_lon = lon + 0.5 * dlon(u);
            let mid_alt = alt + 0.5 * v_z * dt;
            let mid_t = t + 0.5 * dt;
            let (mu, mv) = self.wind.get(mid_lat, mid_lon, mid_alt, mid_t)?;

            // Full step with midpoint derivatives.
            lat += dlat(mv);
            lon = (lon + dlon(mu)).rem_euclid(360.0);
            alt += v_z * dt;
            t += dt;
            remaining -= dt;

            if !lat.is_finite() || !lon.is_finite() || !alt.is_finite() {
                return Err(SimError::IntegratorFailed);
            }

            if ground_check {
                let ground = self.elevation.elev(lat, normalize_lon(lon));
                if alt <= ground {
                    points.push(TrackPoint {
                        t,
                        lat,
                        lon: normalize_lon(lon),
                        alt: ground,
                        u: mu,
                        v: mv,
                    });
                    return Ok((points, SegmentEnd::GroundHit));
                }
            }

            let sample = self.wind.get(lat, lon, alt, t)?;
            u = sample.0;
            v = sample.1;
            points.push(TrackPoint {
                t,
                lat,
                lon: normalize_lon(lon),
                alt,
                u,
                v,
            });
        }

        Ok((points, SegmentEnd::DurationElapsed))
    }

    /// A full three-phase flight: ascent to burst, float at equilibrium,
    /// descent to ground. Cross-phase state is exactly the final point of
    /// the previous phase.
    pub fn fly(
        &self,
        profile: &FlightProfile,
        cancel: &CancellationToken,
    ) -> Result<Trajectory, SimError> {
        if !(profile.ascent_rate > 0.0) || !(profile.descent_rate > 0.0) {
            return Err(SimError::IntegratorFailed);
        }
        let step = if profile.step > 0.0 {
            profile.step
        } else {
            DEFAULT_STEP
        };

        let start = (profile.time, profile.lat, profile.lon, profile.alt);
        let ascent_duration = (profile.burst_alt - profile.alt).max(0.0) / profile.ascent_rate;
        let (ascent, _) = self.segment(
            start,
            profile.ascent_rate,
            ascent_duration,
            step,
            false,
            cancel,
        )?;

        if cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }
        let top = *ascent.last().expect("segment always emits its start");
        let (float, _) = self.segment(
            (top.t, top.lat, top.lon, top.alt),
            0.0,
            profile.float_hours * 3600.0,
            step,
            false,
            cancel,
        )?;

        if cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }
        let drop = *float.last().expect("segment always emits its start");
        // Descend until the ground or the end of the wind window, whichever
        // comes first; running out of wind data before landing is out of
        // domain.
        let window_end = self.wind.header().time_span().1 as f64;
        let (descent, end) = self.segment(
            (drop.t, drop.lat, drop.lon, drop.alt),
            -profile.descent_rate * profile.coeff,
            (window_end - drop.t).max(0.0),
            step,
            true,
            cancel,
        )?;
        match end {
            SegmentEnd::GroundHit => Ok(Trajectory {
                ascent,
                float,
                descent,
            }),
            SegmentEnd::DurationElapsed => Err(SimError::OutOfDomain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wind::{AccessMode, WindHeader, write_artifact};
    use std::str::FromStr;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000;

    fn header() -> WindHeader {
        WindHeader {
            n_t: 48,
            n_p: 5,
            n_lat: 19,
            n_lon: 36,
            dt_secs: 3600,
            base: T0,
            levels: vec![1000.0, 500.0, 100.0, 20.0, 10.0],
        }
    }

    /// A simulator over a uniform wind field and a flat world.
    fn simulator(u: f32, v: f32, ground_m: i16) -> (TempDir, Simulator) {
        let dir = tempfile::tempdir().unwrap();
        let h = header();

        let wind_path = dir.path().join("w.zst");
        let values: Vec<f32> = (0..h.values())
            .map(|i| if i % 2 == 0 { u } else { v })
            .collect();
        write_artifact(&wind_path, &h, &values).unwrap();
        let wind = WindFile::open(&wind_path, AccessMode::Mapped).unwrap();

        let elev_path = dir.path().join("elev.bin");
        crate::elevation::write_grid(&elev_path, 91, |_, _| ground_m).unwrap();
        let elevation = Arc::new(ElevationGrid::open(&elev_path).unwrap());

        let sim = Simulator::new(
            wind,
            elevation,
            CycleId::from_str("2024010100").unwrap(),
            0,
        );
        (dir, sim)
    }

    fn profile() -> FlightProfile {
        FlightProfile {
            time: T0 as f64 + 600.0,
            lat: 37.3553,
            lon: -121.8763,
            alt: 10.0,
            burst_alt: 30_000.0,
            float_hours: 0.0,
            ascent_rate: 4.0,
            descent_rate: 8.0,
            coeff: 1.0,
            step: DEFAULT_STEP,
        }
    }

    #[test]
    fn first_record_is_the_launch_state() {
        let (_d, sim) = simulator(5.0, -2.0, 0);
        let cancel = CancellationToken::new();
        let p = profile();
        let path = sim.fly(&p, &cancel).unwrap();

        let first = path.ascent[0];
        assert_eq!(first.t, p.time);
        assert_eq!(first.lat, p.lat);
        assert_eq!(first.lon, p.lon);
        assert_eq!(first.alt, p.alt);
    }

    #[test]
    fn full_flight_has_three_consistent_segments() {
        let (_d, sim) = simulator(5.0, 3.0, 0);
        let cancel = CancellationToken::new();
        let path = sim.fly(&profile(), &cancel).unwrap();

        // ascent strictly increasing in altitude
        for pair in path.ascent.windows(2) {
            assert!(pair[1].alt > pair[0].alt);
        }
        // timestamps strictly non-decreasing across the whole flight
        let mut last_t = f64::NEG_INFINITY;
        for p in path
            .ascent
            .iter()
            .chain(&path.float)
            .chain(&path.descent)
        {
            assert!(p.t >= last_t);
            last_t = p.t;
        }
        // phases hand off exactly
        assert_eq!(path.ascent.last(), path.float.first());
        assert_eq!(path.float.last(), path.descent.first());
    }

    #[test]
    fn descent_snaps_to_ground_elevation() {
        let (_d, sim) = simulator(5.0, 3.0, 150);
        let cancel = CancellationToken::new();
        let path = sim.fly(
            &FlightProfile {
                alt: 200.0,
                ..profile()
            },
            &cancel,
        )
        .unwrap();

        let landing = path.landing().unwrap();
        assert!((landing.alt - 150.0).abs() < 1.0, "alt {}", landing.alt);
    }

    #[test]
    fn burst_above_wind_domain_is_out_of_domain() {
        let (_d, sim) = simulator(5.0, 3.0, 0);
        let cancel = CancellationToken::new();
        let result = sim.fly(
            &FlightProfile {
                burst_alt: 50_000.0,
                ..profile()
            },
            &cancel,
        );
        assert!(matches!(result, Err(SimError::OutOfDomain)));
    }

    #[test]
    fn burst_at_launch_altitude_gives_zero_length_ascent() {
        let (_d, sim) = simulator(5.0, 3.0, 0);
        let cancel = CancellationToken::new();
        let path = sim.fly(
            &FlightProfile {
                alt: 1_000.0,
                burst_alt: 1_000.0,
                ..profile()
            },
            &cancel,
        )
        .unwrap();

        assert_eq!(path.ascent.len(), 1);
        assert!(!path.descent.is_empty());
    }

    #[test]
    fn eastward_wind_moves_east() {
        let (_d, sim) = simulator(10.0, 0.0, 0);
        let cancel = CancellationToken::new();
        let points = sim
            .simulate(
                (T0 as f64, 10.0, 20.0, 5_000.0),
                0.0,
                3600.0,
                DEFAULT_STEP,
                false,
                &cancel,
            )
            .unwrap();

        assert!(points.last().unwrap().lon > points[0].lon);
        let dlat = (points.last().unwrap().lat - points[0].lat).abs();
        assert!(dlat < 1e-9, "meridional drift {dlat}");
    }

    #[test]
    fn cancelled_token_stops_the_flight() {
        let (_d, sim) = simulator(5.0, 3.0, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            sim.fly(&profile(), &cancel),
            Err(SimError::Cancelled)
        ));
    }

    #[test]
    fn track_point_serializes_as_wire_tuple() {
        let p = TrackPoint {
            t: 1.0,
            lat: 2.0,
            lon: 3.0,
            alt: 4.0,
            u: 5.0,
            v: 6.0,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0,5.0,6.0]");
    }
}
