//! Weather inputs for one decision cycle: the daily aggregate fetched from the
//! forecast service and the snapshot derived from it (sunshine hours and solar
//! radiation estimated from cloud cover).

use std::f64::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::error::WeatherError;

/// Default forecast endpoint (5 day / 3 hour).
pub const OPENWEATHER_FORECAST_URL: &str = "https://api.openweathermap.org/data/2.5/forecast";

/// Daylight hours assumed when deriving sunshine from cloud cover.
const MAX_SUN_HOURS: f64 = 12.0;

/// Solar constant in MJ m^-2 min^-1.
const GSC: f64 = 0.0820;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Fixed location of the irrigated field.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
}

/// Today's aggregate as reported by the weather collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyWeather {
    pub min_temp: f64,
    pub max_temp: f64,
    pub humidity: f64,
    pub wind: f64,
    pub cloud_cover: f64,
}

/// Inputs to both estimators. Built once per cycle and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub min_temp: f64,
    pub max_temp: f64,
    pub humidity: f64,
    pub wind: f64,
    pub sun_hours: f64,
    pub radiation: f64,
}

impl WeatherSnapshot {
    /// Derive sunshine hours and incoming solar radiation (MJ m^-2 day^-1)
    /// from cloud cover, for a site at `latitude` on `day_of_year`.
    pub fn derive(daily: &DailyWeather, latitude: f64, day_of_year: u16) -> Self {
        let clear = 1.0 - daily.cloud_cover / 100.0;
        let ra = extraterrestrial_radiation(latitude, day_of_year);
        Self {
            min_temp: daily.min_temp,
            max_temp: daily.max_temp,
            humidity: daily.humidity,
            wind: daily.wind,
            sun_hours: MAX_SUN_HOURS * clear,
            radiation: (0.25 + 0.50 * clear) * ra,
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.min_temp,
            self.max_temp,
            self.humidity,
            self.wind,
            self.sun_hours,
            self.radiation,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// FAO-56 extraterrestrial radiation Ra (MJ m^-2 day^-1).
pub fn extraterrestrial_radiation(latitude: f64, day_of_year: u16) -> f64 {
    let phi = latitude.to_radians();
    let j = f64::from(day_of_year);
    let dr = 1.0 + 0.033 * (2.0 * PI * j / 365.0).cos();
    let delta = 0.409 * (2.0 * PI * j / 365.0 - 1.39).sin();
    // Clamped so polar day/night stays finite.
    let ws = (-phi.tan() * delta.tan()).clamp(-1.0, 1.0).acos();

    (24.0 * 60.0 / PI)
        * GSC
        * dr
        * (ws * phi.sin() * delta.sin() + phi.cos() * delta.cos() * ws.sin())
}

// ---------------------------------------------------------------------------
// Collaborator seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch_today(&self) -> Result<DailyWeather, WeatherError>;
}

/// Fetch today's weather once and turn it into a snapshot for `site`.
pub async fn snapshot_for_today(
    source: &dyn WeatherSource,
    site: &Site,
) -> Result<WeatherSnapshot, WeatherError> {
    let daily = source.fetch_today().await?;
    let day_of_year = OffsetDateTime::now_utc().ordinal();
    let snapshot = WeatherSnapshot::derive(&daily, site.latitude, day_of_year);
    if !snapshot.is_finite() {
        return Err(WeatherError::Invalid(format!("{snapshot:?}")));
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// OpenWeatherMap forecast client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    list: Vec<ForecastEntry>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    dt: i64,
    main: MainBlock,
    wind: WindBlock,
    clouds: CloudBlock,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp_min: f64,
    temp_max: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct WindBlock {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct CloudBlock {
    all: f64,
}

pub struct OpenWeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    site: Site,
}

impl OpenWeatherClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        site: Site,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            site,
        })
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherClient {
    async fn fetch_today(&self) -> Result<DailyWeather, WeatherError> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[
                ("lat", self.site.latitude.to_string()),
                ("lon", self.site.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(WeatherError::Status(resp.status().as_u16()));
        }

        let body: ForecastResponse = resp.json().await?;
        let today = OffsetDateTime::now_utc().date();
        tracing::debug!(entries = body.list.len(), %today, "forecast received");
        aggregate_day(&body.list, today)
    }
}

/// Collapse the 3-hourly entries falling on `day` (UTC) into one aggregate.
fn aggregate_day(entries: &[ForecastEntry], day: Date) -> Result<DailyWeather, WeatherError> {
    let todays: Vec<&ForecastEntry> = entries
        .iter()
        .filter(|e| {
            OffsetDateTime::from_unix_timestamp(e.dt)
                .map(|t| t.date() == day)
                .unwrap_or(false)
        })
        .collect();

    if todays.is_empty() {
        return Err(WeatherError::NoDataForToday);
    }

    let n = todays.len() as f64;
    let mean = |f: fn(&ForecastEntry) -> f64| todays.iter().map(|e| f(e)).sum::<f64>() / n;

    Ok(DailyWeather {
        min_temp: todays
            .iter()
            .map(|e| e.main.temp_min)
            .fold(f64::INFINITY, f64::min),
        max_temp: todays
            .iter()
            .map(|e| e.main.temp_max)
            .fold(f64::NEG_INFINITY, f64::max),
        humidity: mean(|e| e.main.humidity),
        wind: mean(|e| e.wind.speed),
        cloud_cover: mean(|e| e.clouds.all),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn daily(cloud_cover: f64) -> DailyWeather {
        DailyWeather {
            min_temp: 21.0,
            max_temp: 33.0,
            humidity: 55.0,
            wind: 2.5,
            cloud_cover,
        }
    }

    // -- Solar derivation -------------------------------------------------

    #[test]
    fn clear_sky_gives_full_sun_hours() {
        let s = WeatherSnapshot::derive(&daily(0.0), 13.9, 172);
        assert!((s.sun_hours - 12.0).abs() < 1e-9);
        let ra = extraterrestrial_radiation(13.9, 172);
        assert!((s.radiation - 0.75 * ra).abs() < 1e-9);
    }

    #[test]
    fn overcast_gives_quarter_of_ra() {
        let s = WeatherSnapshot::derive(&daily(100.0), 13.9, 172);
        assert!(s.sun_hours.abs() < 1e-9);
        let ra = extraterrestrial_radiation(13.9, 172);
        assert!((s.radiation - 0.25 * ra).abs() < 1e-9);
    }

    #[test]
    fn tropical_ra_in_expected_band() {
        // FAO-56 tables put Ra between ~30 and ~40 MJ/m2/day near 14N.
        for doy in [1_u16, 80, 172, 266, 355] {
            let ra = extraterrestrial_radiation(13.9, doy);
            assert!((25.0..42.0).contains(&ra), "doy={doy} ra={ra}");
        }
    }

    #[test]
    fn polar_night_stays_finite() {
        let ra = extraterrestrial_radiation(80.0, 355);
        assert!(ra.is_finite());
        assert!(ra.abs() < 1e-6, "expected no sunlight, got {ra}");
    }

    #[test]
    fn snapshot_passes_temperatures_through() {
        let s = WeatherSnapshot::derive(&daily(40.0), 13.9, 100);
        assert_eq!(s.min_temp, 21.0);
        assert_eq!(s.max_temp, 33.0);
        assert_eq!(s.humidity, 55.0);
        assert_eq!(s.wind, 2.5);
        assert!(s.is_finite());
    }

    // -- Forecast aggregation --------------------------------------------

    fn entry(
        ts: OffsetDateTime,
        tmin: f64,
        tmax: f64,
        hum: f64,
        wind: f64,
        clouds: f64,
    ) -> ForecastEntry {
        ForecastEntry {
            dt: ts.unix_timestamp(),
            main: MainBlock {
                temp_min: tmin,
                temp_max: tmax,
                humidity: hum,
            },
            wind: WindBlock { speed: wind },
            clouds: CloudBlock { all: clouds },
        }
    }

    #[test]
    fn aggregate_uses_only_requested_day() {
        let entries = vec![
            entry(datetime!(2026-10-18 21:00 UTC), 5.0, 40.0, 99.0, 9.0, 100.0),
            entry(datetime!(2026-10-19 00:00 UTC), 20.0, 25.0, 60.0, 2.0, 20.0),
            entry(datetime!(2026-10-19 12:00 UTC), 24.0, 34.0, 40.0, 4.0, 40.0),
            entry(datetime!(2026-10-20 00:00 UTC), 1.0, 50.0, 10.0, 9.0, 0.0),
        ];
        let d = aggregate_day(&entries, date!(2026 - 10 - 19)).unwrap();
        assert_eq!(d.min_temp, 20.0);
        assert_eq!(d.max_temp, 34.0);
        assert!((d.humidity - 50.0).abs() < 1e-9);
        assert!((d.wind - 3.0).abs() < 1e-9);
        assert!((d.cloud_cover - 30.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_without_today_fails() {
        let entries = vec![entry(datetime!(2026-10-20 03:00 UTC), 1.0, 2.0, 3.0, 4.0, 5.0)];
        assert!(matches!(
            aggregate_day(&entries, date!(2026 - 10 - 19)),
            Err(WeatherError::NoDataForToday)
        ));
    }

    #[test]
    fn forecast_json_deserializes() {
        let json = r#"{"cod":"200","list":[{"dt":1760832000,
            "main":{"temp":22.1,"temp_min":21.0,"temp_max":23.5,"humidity":64},
            "wind":{"speed":3.2,"deg":140},"clouds":{"all":75},"weather":[]}]}"#;
        let resp: ForecastResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.list.len(), 1);
        assert_eq!(resp.list[0].main.humidity, 64.0);
        assert_eq!(resp.list[0].clouds.all, 75.0);
    }
}
