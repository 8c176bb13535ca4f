//! Sun position and clear-sky irradiance.
//!
//! Position follows the NOAA low-precision solar calculator (good to a fraction of a degree
//! between 1901 and 2099). Irradiance is the clear-sky plane-of-array model from G. Masters,
//! "Renewable and Efficient Electric Power Systems", section 7.9.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation_m: f64,
}

/// Orientation of the array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelProperties {
    /// Degrees from horizontal.
    pub tilt: f64,
    /// Compass degrees the panels face (180 = south).
    pub azimuth: f64,
    /// Ground reflectance.
    #[serde(default)]
    pub rho: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolarPosition {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
}

pub trait SolarModel: Send + Sync {
    fn position(&self, at: DateTime<Utc>) -> SolarPosition;
}

/// Solar model backed by [`solar_position`] for a fixed site.
#[derive(Debug, Clone, Copy)]
pub struct Astronomical {
    location: SiteLocation,
}

impl Astronomical {
    pub fn new(location: SiteLocation) -> Self {
        Self { location }
    }
}

impl SolarModel for Astronomical {
    fn position(&self, at: DateTime<Utc>) -> SolarPosition {
        solar_position(at, &self.location)
    }
}

pub fn is_daylight(elevation_deg: f64, horizon_deg: f64) -> bool {
    elevation_deg > horizon_deg
}

pub fn solar_position(at: DateTime<Utc>, location: &SiteLocation) -> SolarPosition {
    let julian_day = at.timestamp() as f64 / 86_400.0 + 2_440_587.5;
    let t = (julian_day - 2_451_545.0) / 36_525.0;

    let mean_long = (280.466_46 + t * (36_000.769_83 + t * 0.000_303_2)).rem_euclid(360.0);
    let mean_anom = 357.529_11 + t * (35_999.050_29 - 0.000_153_7 * t);
    let eccent = 0.016_708_634 - t * (0.000_042_037 + 0.000_000_126_7 * t);

    let m = mean_anom.to_radians();
    let center = m.sin() * (1.914_602 - t * (0.004_817 + 0.000_014 * t))
        + (2.0 * m).sin() * (0.019_993 - 0.000_101 * t)
        + (3.0 * m).sin() * 0.000_289;
    let true_long = mean_long + center;

    let omega = (125.04 - 1_934.136 * t).to_radians();
    let apparent_long = (true_long - 0.005_69 - 0.004_78 * omega.sin()).to_radians();

    let seconds = 21.448 - t * (46.815 + t * (0.000_59 - t * 0.001_813));
    let obliq_mean = 23.0 + (26.0 + seconds / 60.0) / 60.0;
    let obliq = (obliq_mean + 0.002_56 * omega.cos()).to_radians();

    let declination = (obliq.sin() * apparent_long.sin()).asin();

    let y = (obliq / 2.0).tan().powi(2);
    let l0 = mean_long.to_radians();
    let eq_time_min = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * eccent * m.sin()
            + 4.0 * eccent * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * eccent * eccent * (2.0 * m).sin())
        .to_degrees();

    let utc_minutes =
        at.hour() as f64 * 60.0 + at.minute() as f64 + at.second() as f64 / 60.0;
    let true_solar_min = (utc_minutes + eq_time_min + 4.0 * location.longitude).rem_euclid(1_440.0);
    let hour_angle = true_solar_min / 4.0 - 180.0;

    let lat = location.latitude.to_radians();
    let ha = hour_angle.to_radians();
    let cos_zenith = (lat.sin() * declination.sin() + lat.cos() * declination.cos() * ha.cos())
        .clamp(-1.0, 1.0);
    let zenith = cos_zenith.acos();
    let elevation = 90.0 - zenith.to_degrees();

    let az_denom = lat.cos() * zenith.sin();
    let azimuth = if az_denom.abs() < 1e-9 {
        if location.latitude > 0.0 { 180.0 } else { 0.0 }
    } else {
        let cos_az = ((lat.sin() * zenith.cos() - declination.sin()) / az_denom).clamp(-1.0, 1.0);
        let az = cos_az.acos().to_degrees();
        if hour_angle > 0.0 {
            (az + 180.0).rem_euclid(360.0)
        } else {
            (540.0 - az).rem_euclid(360.0)
        }
    };

    // Observers above sea level see past the geometric horizon.
    let dip = 0.0293 * location.elevation_m.max(0.0).sqrt();

    SolarPosition {
        azimuth_deg: azimuth,
        elevation_deg: elevation + refraction(elevation) + dip,
    }
}

fn refraction(elevation: f64) -> f64 {
    if elevation > 85.0 {
        return 0.0;
    }
    let te = elevation.to_radians().tan();
    let arc_seconds = if elevation > 5.0 {
        58.1 / te - 0.07 / te.powi(3) + 0.000_086 / te.powi(5)
    } else if elevation > -0.575 {
        1_735.0 + elevation * (-518.2 + elevation * (103.4 + elevation * (-12.79 + elevation * 0.711)))
    } else {
        -20.772 / te
    };
    arc_seconds / 3_600.0
}

/// Modeled clear-sky irradiance on the array, W/m².
pub fn clearsky_irradiance(
    at: DateTime<Utc>,
    location: &SiteLocation,
    panels: &PanelProperties,
) -> f64 {
    let position = solar_position(at, location);
    if position.elevation_deg <= 0.0 {
        return 0.0;
    }

    let n = at.ordinal() as f64;
    let seasonal = |offset: f64| ((360.0 / 365.0) * (n - offset)).to_radians().sin();
    let apparent_extraterrestrial = 1_160.0 + 75.0 * seasonal(275.0);
    let optical_depth = 0.174 + 0.035 * seasonal(100.0);
    let sky_diffuse = 0.095 + 0.04 * seasonal(100.0);

    let beta = position.elevation_deg.to_radians();
    let air_mass = 1.0 / beta.sin();
    let beam = apparent_extraterrestrial * (-optical_depth * air_mass).exp();

    let sigma = panels.tilt.to_radians();
    // Azimuths measured from south, positive toward east.
    let phi_s = (180.0 - position.azimuth_deg).to_radians();
    let phi_c = (180.0 - panels.azimuth).to_radians();
    let cos_theta =
        beta.cos() * (phi_s - phi_c).cos() * sigma.sin() + beta.sin() * sigma.cos();

    let beam_on_panel = beam * cos_theta.max(0.0);
    let diffuse = sky_diffuse * beam * (1.0 + sigma.cos()) / 2.0;
    let reflected = panels.rho * beam * (beta.sin() + sky_diffuse) * (1.0 - sigma.cos()) / 2.0;

    let total = beam_on_panel + diffuse + reflected;
    if total.is_finite() { total } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const GREENWICH: SiteLocation = SiteLocation {
        latitude: 51.4769,
        longitude: 0.0,
        elevation_m: 0.0,
    };

    #[test]
    fn summer_solstice_noon_at_greenwich() {
        let at = Utc.with_ymd_and_hms(2024, 6, 21, 12, 2, 0).single().expect("valid date");

        let pos = solar_position(at, &GREENWICH);

        assert!((pos.elevation_deg - 61.97).abs() < 0.5, "elevation {}", pos.elevation_deg);
        assert!((pos.azimuth_deg - 180.0).abs() < 3.0, "azimuth {}", pos.azimuth_deg);
    }

    #[test]
    fn sun_is_down_at_midnight_and_rises_in_the_east() {
        let midnight = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).single().expect("valid date");
        let morning = Utc.with_ymd_and_hms(2024, 3, 20, 8, 0, 0).single().expect("valid date");

        assert!(solar_position(midnight, &GREENWICH).elevation_deg < -20.0);
        let pos = solar_position(morning, &GREENWICH);
        assert!(pos.elevation_deg > 0.0);
        assert!(pos.azimuth_deg > 90.0 && pos.azimuth_deg < 150.0);
    }

    #[test]
    fn horizon_threshold_is_exclusive() {
        assert!(!is_daylight(0.0, 0.0));
        assert!(is_daylight(0.5, 0.0));
        assert!(is_daylight(-5.0, -6.0));
    }

    #[test]
    fn irradiance_is_zero_at_night_and_plausible_at_noon() {
        let panels = PanelProperties {
            tilt: 30.0,
            azimuth: 180.0,
            rho: 0.2,
        };
        let night = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).single().expect("valid date");
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).single().expect("valid date");

        assert_eq!(clearsky_irradiance(night, &GREENWICH, &panels), 0.0);
        let igc = clearsky_irradiance(noon, &GREENWICH, &panels);
        assert!(igc > 700.0 && igc < 1_200.0, "irradiance {igc}");
    }
}
