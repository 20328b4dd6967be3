//! Decision & command dispatcher.
//!
//! One call to [`Dispatcher::decide`] is one decision cycle: both estimators
//! run against the same weather snapshot, the sensor cache is read once, the
//! motor rule is applied and the resulting command is handed to the command
//! session at most once. The dispatcher holds no mutable state, so concurrent
//! cycles are independent.

use std::sync::Arc;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DecisionError, EstimateError};
use crate::estimator::{round_to, EtEstimator, EtcEstimate};
use crate::mqtt::MotorCommand;
use crate::session::{Connectivity, PublishOutcome, SecureSession};
use crate::state::SensorCache;
use crate::weather::WeatherSnapshot;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Tunable decision constants. The threshold itself is always the smaller of
/// the available estimates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DecisionPolicy {
    #[serde(default = "default_soil_limit")]
    pub soil_moisture_limit_pct: f64,
}

fn default_soil_limit() -> f64 {
    15.0
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            soil_moisture_limit_pct: default_soil_limit(),
        }
    }
}

/// Irrigate unless recent flow already covers demand or the soil is moist.
pub fn motor_on(
    threshold: f64,
    water_flow: f64,
    soil_moisture: f64,
    policy: &DecisionPolicy,
) -> bool {
    !(water_flow > threshold || soil_moisture > policy.soil_moisture_limit_pct)
}

// ---------------------------------------------------------------------------
// Command sink
// ---------------------------------------------------------------------------

/// Where motor commands go. Must never block.
pub trait CommandSink: Connectivity {
    fn send_command(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome;
}

impl CommandSink for SecureSession {
    fn send_command(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome {
        self.publish(topic, payload, QoS::AtLeastOnce)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimatePair {
    pub physical: Option<EtcEstimate>,
    pub learned: Option<EtcEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimatorErrors {
    pub physical: Option<String>,
    pub learned: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorData {
    pub water_flow: f64,
    pub soil_moisture: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionReport {
    pub status: &'static str,
    pub threshold: f64,
    /// Learned estimator's ETc.
    pub predicted_etc: Option<f64>,
    /// Physical estimator's ETc.
    pub calculated_etc: Option<f64>,
    pub estimates: EstimatePair,
    pub estimator_errors: EstimatorErrors,
    pub weather: WeatherSnapshot,
    pub growth_day: u32,
    pub sensor_data: SensorData,
    pub motor: bool,
    pub command_published: bool,
    pub sensor_connected: bool,
    pub command_connected: bool,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    physical: Arc<dyn EtEstimator>,
    learned: Arc<dyn EtEstimator>,
    cache: SensorCache,
    sink: Arc<dyn CommandSink>,
    ingest: Arc<dyn Connectivity>,
    command_topic: String,
    policy: DecisionPolicy,
}

impl Dispatcher {
    pub fn new(
        physical: Arc<dyn EtEstimator>,
        learned: Arc<dyn EtEstimator>,
        cache: SensorCache,
        sink: Arc<dyn CommandSink>,
        ingest: Arc<dyn Connectivity>,
        command_topic: &str,
        policy: DecisionPolicy,
    ) -> Self {
        Self {
            physical,
            learned,
            cache,
            sink,
            ingest,
            command_topic: command_topic.to_string(),
            policy,
        }
    }

    pub async fn decide(
        &self,
        weather: &WeatherSnapshot,
        growth_day: u32,
    ) -> Result<DecisionReport, DecisionError> {
        let physical = run_estimator(self.physical.as_ref(), weather, growth_day);
        let learned = run_estimator(self.learned.as_ref(), weather, growth_day);

        let (physical, learned) = match (physical, learned) {
            (Err(physical), Err(learned)) => {
                return Err(DecisionError::BothEstimatorsFailed { physical, learned });
            }
            pair => pair,
        };

        // At least one side is Ok here.
        let threshold = [&physical, &learned]
            .into_iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|e| e.etc)
            .fold(f64::INFINITY, f64::min);

        let (physical, physical_err) = split(physical);
        let (learned, learned_err) = split(learned);

        // One read; missing data is flow 0, moisture 0.
        let reading = self.cache.read().await;
        let sensor_data = SensorData {
            water_flow: reading.map_or(0.0, |r| round_to(r.water_flow_liters, 2)),
            soil_moisture: reading.map_or(0.0, |r| r.soil_moisture_pct),
        };

        let motor = motor_on(
            threshold,
            sensor_data.water_flow,
            sensor_data.soil_moisture,
            &self.policy,
        );
        info!(
            growth_day,
            threshold,
            water_flow = sensor_data.water_flow,
            soil_moisture = sensor_data.soil_moisture,
            motor,
            "decision computed"
        );

        let command_published = self.dispatch(MotorCommand { motor });

        Ok(DecisionReport {
            status: "success",
            threshold,
            predicted_etc: learned.as_ref().map(|e| e.etc),
            calculated_etc: physical.as_ref().map(|e| e.etc),
            estimates: EstimatePair { physical, learned },
            estimator_errors: EstimatorErrors {
                physical: physical_err.map(|e| e.to_string()),
                learned: learned_err.map(|e| e.to_string()),
            },
            weather: *weather,
            growth_day,
            sensor_data,
            motor,
            command_published,
            sensor_connected: self.ingest.is_connected(),
            command_connected: self.sink.is_connected(),
        })
    }

    /// Single non-blocking attempt. Never retried here.
    fn dispatch(&self, command: MotorCommand) -> bool {
        let payload = match command.to_payload() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to encode motor command");
                return false;
            }
        };

        match self.sink.send_command(&self.command_topic, payload) {
            PublishOutcome::Queued => {
                info!(
                    topic = %self.command_topic,
                    motor = command.motor,
                    "motor command published"
                );
                true
            }
            PublishOutcome::NotConnected => {
                warn!(topic = %self.command_topic, "command session down, motor command not sent");
                false
            }
            PublishOutcome::Rejected(reason) => {
                error!(topic = %self.command_topic, %reason, "motor command rejected");
                false
            }
        }
    }
}

fn run_estimator(
    estimator: &dyn EtEstimator,
    weather: &WeatherSnapshot,
    growth_day: u32,
) -> Result<EtcEstimate, EstimateError> {
    let result = estimator.estimate(weather, growth_day);
    if let Err(e) = &result {
        error!(estimator = ?estimator.kind(), error = %e, "estimator failed");
    }
    result
}

fn split(r: Result<EtcEstimate, EstimateError>) -> (Option<EtcEstimate>, Option<EstimateError>) {
    match r {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
