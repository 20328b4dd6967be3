//! FAO-56 Penman–Monteith daily reference evapotranspiration.

use crate::weather::WeatherSnapshot;

const ALBEDO: f64 = 0.23;
/// Stefan–Boltzmann constant, MJ K^-4 m^-2 day^-1.
const SIGMA: f64 = 4.903e-9;
const MAX_SUN_HOURS: f64 = 12.0;

/// Saturation vapour pressure (kPa) at `t` °C.
pub fn saturation_vapor_pressure(t: f64) -> f64 {
    0.6108 * ((17.27 * t) / (t + 237.3)).exp()
}

/// Atmospheric pressure (kPa) at `altitude_m`.
pub fn atmospheric_pressure(altitude_m: f64) -> f64 {
    101.3 * ((293.0 - 0.0065 * altitude_m) / 293.0).powf(5.26)
}

/// Reference ETo in mm/day for a site at `altitude_m`. Soil heat flux is
/// taken as zero at daily resolution.
pub fn reference_eto(w: &WeatherSnapshot, altitude_m: f64) -> f64 {
    let t_mean = (w.min_temp + w.max_temp) / 2.0;

    let es = (saturation_vapor_pressure(w.min_temp) + saturation_vapor_pressure(w.max_temp)) / 2.0;
    let ea = (w.humidity / 100.0) * es;
    let vpd = es - ea;
    let delta = (4098.0 * es) / (t_mean + 237.3).powi(2);

    let gamma = 0.000665 * atmospheric_pressure(altitude_m);

    let rns = (1.0 - ALBEDO) * w.radiation;
    let tmax_k = w.max_temp + 273.16;
    let tmin_k = w.min_temp + 273.16;
    let rnl = SIGMA
        * ((tmax_k.powi(4) + tmin_k.powi(4)) / 2.0)
        * (0.34 - 0.14 * ea.sqrt())
        * (1.35 - 0.35 * (w.sun_hours / MAX_SUN_HOURS));
    let rn = rns - rnl;
    let g = 0.0;

    (0.408 * delta * (rn - g) + gamma * (900.0 / (t_mean + 273.0)) * w.wind * vpd)
        / (delta + gamma * (1.0 + 0.34 * w.wind))
}

// ===========================================================================
// Tests
// ===========================================================================
