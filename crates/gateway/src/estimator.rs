//! Crop water-demand (ETc) estimators.
//!
//! Two independent estimators share the [`EtEstimator`] capability: a physical
//! one built on Penman–Monteith and a learned one backed by the tree ensemble.
//! Both scale their ETo through [`crop::maize_kc`].

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::crop;
use crate::error::EstimateError;
use crate::model::{InferencePath, TreeEnsemble, INFERENCE_CHAIN};
use crate::penman;
use crate::weather::WeatherSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Physical,
    Learned,
}

/// One estimator's output for one cycle. Never merged with the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtcEstimate {
    pub source: EstimatorKind,
    /// Crop water demand, mm/day.
    pub etc: f64,
    pub eto: f64,
    pub kc: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_path: Option<InferencePath>,
}

pub trait EtEstimator: Send + Sync {
    fn kind(&self) -> EstimatorKind;

    fn estimate(
        &self,
        weather: &WeatherSnapshot,
        growth_day: u32,
    ) -> Result<EtcEstimate, EstimateError>;
}

/// Half-to-even, so a flow of 0.125 l reads as 0.12.
pub(crate) fn round_to(v: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (v * f).round_ties_even() / f
}

// ---------------------------------------------------------------------------
// Physical
// ---------------------------------------------------------------------------

pub struct PhysicalEstimator {
    altitude_m: f64,
}

impl PhysicalEstimator {
    pub fn new(altitude_m: f64) -> Self {
        Self { altitude_m }
    }
}

impl EtEstimator for PhysicalEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Physical
    }

    fn estimate(
        &self,
        weather: &WeatherSnapshot,
        growth_day: u32,
    ) -> Result<EtcEstimate, EstimateError> {
        if !weather.is_finite() {
            return Err(EstimateError::InvalidInput(format!("{weather:?}")));
        }
        let eto = penman::reference_eto(weather, self.altitude_m);
        if !eto.is_finite() {
            return Err(EstimateError::InvalidInput(format!(
                "reference ETo not finite for {weather:?}"
            )));
        }
        let kc = crop::maize_kc(f64::from(growth_day));

        Ok(EtcEstimate {
            source: EstimatorKind::Physical,
            etc: round_to(eto * kc, 4),
            eto: round_to(eto, 4),
            kc: round_to(kc, 3),
            inference_path: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Learned
// ---------------------------------------------------------------------------

pub struct LearnedEstimator {
    model: Arc<TreeEnsemble>,
}

impl LearnedEstimator {
    pub fn new(model: Arc<TreeEnsemble>) -> Self {
        Self { model }
    }
}

/// Model input row, in training order.
pub fn feature_row(w: &WeatherSnapshot) -> [(&'static str, f64); 6] {
    [
        ("min_temp", w.min_temp),
        ("max_temp", w.max_temp),
        ("humidity", round_to(w.humidity, 2)),
        ("wind", round_to(w.wind, 2)),
        ("sun_hours", round_to(w.sun_hours, 2)),
        ("radiation", w.radiation),
    ]
}

impl EtEstimator for LearnedEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Learned
    }

    fn estimate(
        &self,
        weather: &WeatherSnapshot,
        growth_day: u32,
    ) -> Result<EtcEstimate, EstimateError> {
        let row = feature_row(weather);
        let values: Vec<f64> = row.iter().map(|(_, v)| *v).collect();
        let mut failures = Vec::new();

        for path in INFERENCE_CHAIN {
            let attempt = match path {
                InferencePath::Validated => self.model.predict(&row),
                InferencePath::Raw => self.model.predict_raw(&values),
            };
            match attempt {
                Ok(eto) => {
                    if !failures.is_empty() {
                        warn!(%path, "learned estimator recovered on fallback path");
                    }
                    let kc = crop::maize_kc(f64::from(growth_day));
                    return Ok(EtcEstimate {
                        source: EstimatorKind::Learned,
                        etc: eto * kc,
                        eto,
                        kc,
                        inference_path: Some(path),
                    });
                }
                Err(source) => {
                    warn!(%path, error = %source, "learned inference path failed");
                    failures.push(EstimateError::Inference { path, source });
                }
            }
        }

        Err(EstimateError::Exhausted(failures))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
