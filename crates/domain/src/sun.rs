//! Solar times for sun triggers and conditions.
//!
//! Times follow the usual low-precision solar position formulas
//! (a few minutes of accuracy away from the poles). Events that do not
//! happen on a given day, such as a sunset during polar day, yield `None`.

use std::f64::consts::PI;

use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

const RAD: f64 = PI / 180.0;
const DAY_MS: f64 = 86_400_000.0;
const J1970: f64 = 2_440_588.0;
const J2000: f64 = 2_451_545.0;
const J0: f64 = 0.0009;
/// Obliquity of the Earth.
const OBLIQUITY: f64 = RAD * 23.4397;

/// Observer position in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub lat: f64,
    #[serde(alias = "long", alias = "lng")]
    pub lon: f64,
}

impl Position {
    #[must_use]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// This position with the given coordinates overriding it.
    #[must_use]
    pub fn or_override(self, lat: Option<f64>, lon: Option<f64>) -> Self {
        Self {
            lat: lat.unwrap_or(self.lat),
            lon: lon.unwrap_or(self.lon),
        }
    }
}

/// A named moment of the solar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SunEvent {
    #[serde(alias = "nightEnd")]
    NightEnd,
    #[serde(alias = "nauticalDawn")]
    NauticalDawn,
    Dawn,
    Sunrise,
    #[serde(alias = "sunriseEnd")]
    SunriseEnd,
    #[serde(alias = "goldenHourEnd")]
    GoldenHourEnd,
    #[serde(alias = "solarNoon")]
    SolarNoon,
    #[serde(alias = "goldenHour")]
    GoldenHour,
    #[serde(alias = "sunsetStart")]
    SunsetStart,
    Sunset,
    Dusk,
    #[serde(alias = "nauticalDusk")]
    NauticalDusk,
    Night,
    Nadir,
}

impl SunEvent {
    /// Sun altitude in degrees and whether the event is in the morning.
    fn altitude(self) -> Option<(f64, bool)> {
        match self {
            Self::NightEnd => Some((-18.0, true)),
            Self::NauticalDawn => Some((-12.0, true)),
            Self::Dawn => Some((-6.0, true)),
            Self::Sunrise => Some((-0.833, true)),
            Self::SunriseEnd => Some((-0.3, true)),
            Self::GoldenHourEnd => Some((6.0, true)),
            Self::GoldenHour => Some((6.0, false)),
            Self::SunsetStart => Some((-0.3, false)),
            Self::Sunset => Some((-0.833, false)),
            Self::Dusk => Some((-6.0, false)),
            Self::NauticalDusk => Some((-12.0, false)),
            Self::Night => Some((-18.0, false)),
            Self::SolarNoon | Self::Nadir => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NightEnd => "night_end",
            Self::NauticalDawn => "nautical_dawn",
            Self::Dawn => "dawn",
            Self::Sunrise => "sunrise",
            Self::SunriseEnd => "sunrise_end",
            Self::GoldenHourEnd => "golden_hour_end",
            Self::SolarNoon => "solar_noon",
            Self::GoldenHour => "golden_hour",
            Self::SunsetStart => "sunset_start",
            Self::Sunset => "sunset",
            Self::Dusk => "dusk",
            Self::NauticalDusk => "nautical_dusk",
            Self::Night => "night",
            Self::Nadir => "nadir",
        }
    }
}

impl std::fmt::Display for SunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_julian(at: Timestamp) -> f64 {
    at.timestamp_millis() as f64 / DAY_MS - 0.5 + J1970
}

#[allow(clippy::cast_possible_truncation)]
fn from_julian(julian: f64) -> Option<Timestamp> {
    if !julian.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(((julian + 0.5 - J1970) * DAY_MS).round() as i64)
}

fn solar_mean_anomaly(days: f64) -> f64 {
    RAD * (357.5291 + 0.985_600_28 * days)
}

fn ecliptic_longitude(anomaly: f64) -> f64 {
    let center = RAD * (1.9148 * anomaly.sin() + 0.02 * (2.0 * anomaly).sin() + 0.0003 * (3.0 * anomaly).sin());
    let perihelion = RAD * 102.9372;
    anomaly + center + perihelion + PI
}

fn solar_transit(approx: f64, anomaly: f64, longitude: f64) -> f64 {
    J2000 + approx + 0.0053 * anomaly.sin() - 0.0069 * (2.0 * longitude).sin()
}

/// Time of `event` on the solar day closest to `on`, at `position`.
#[must_use]
pub fn sun_time(event: SunEvent, on: Timestamp, position: Position) -> Option<Timestamp> {
    let lw = -RAD * position.lon;
    let phi = RAD * position.lat;
    let days = to_julian(on) - J2000;
    let cycle = (days - J0 - lw / (2.0 * PI)).round();
    let approx = J0 + lw / (2.0 * PI) + cycle;
    let anomaly = solar_mean_anomaly(approx);
    let longitude = ecliptic_longitude(anomaly);
    let declination = (longitude.sin() * OBLIQUITY.sin()).asin();
    let noon = solar_transit(approx, anomaly, longitude);

    let Some((altitude, morning)) = event.altitude() else {
        return match event {
            SunEvent::Nadir => from_julian(noon - 0.5),
            _ => from_julian(noon),
        };
    };
    let cos_hour = ((RAD * altitude).sin() - phi.sin() * declination.sin()) / (phi.cos() * declination.cos());
    if !(-1.0..=1.0).contains(&cos_hour) {
        return None;
    }
    let hour_angle = cos_hour.acos();
    let set = solar_transit(J0 + (hour_angle + lw) / (2.0 * PI) + cycle, anomaly, longitude);
    from_julian(if morning { noon - (set - noon) } else { set })
}

/// First occurrence of `event` shifted by `offset` strictly after `after`.
///
/// Looks up to a year ahead so that events skipped by polar days or nights
/// are still found.
#[must_use]
pub fn next_sun_time(event: SunEvent, after: Timestamp, offset: TimeDelta, position: Position) -> Option<Timestamp> {
    (0..=366).find_map(|day| {
        let on = after + TimeDelta::days(day);
        sun_time(event, on, position)
            .map(|at| at + offset)
            .filter(|at| *at > after)
    })
}

/// Local midnight starting the day of `at`.
#[must_use]
pub fn local_midnight(at: Timestamp) -> Timestamp {
    at.with_timezone(&Local)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map_or(at, |midnight| midnight.with_timezone(&Utc))
}

/// Whether `now` lies after `after` and before `before` (both shifted by
/// their offsets) on the solar day of `now`.
///
/// A missing bound stands for the local midnight opening or closing the
/// day. A window whose end comes before its start wraps around midnight,
/// so `after: sunset, before: sunrise` covers the night.
#[must_use]
pub fn is_sun_between(
    now: Timestamp,
    position: Position,
    after: Option<(SunEvent, TimeDelta)>,
    before: Option<(SunEvent, TimeDelta)>,
) -> bool {
    let midnight = local_midnight(now);
    let noon = midnight + TimeDelta::hours(12);
    let bound = |spec: Option<(SunEvent, TimeDelta)>, fallback: Timestamp| match spec {
        Some((event, offset)) => sun_time(event, noon, position).map(|at| at + offset),
        None => Some(fallback),
    };
    let (Some(start), Some(end)) = (
        bound(after, midnight),
        bound(before, midnight + TimeDelta::days(1)),
    ) else {
        return false;
    };
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}
