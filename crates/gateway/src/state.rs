use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::session::ConnectionState;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Latest decoded field reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub water_flow_liters: f64,
    pub soil_moisture_pct: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

/// Read side of the sensor cache. Cheap to clone, cannot write.
#[derive(Clone)]
pub struct SensorCache {
    inner: Arc<RwLock<Option<SensorReading>>>,
}

/// The single write side of the sensor cache. Not `Clone`: it is handed to
/// the ingest handler and nobody else.
pub struct SensorWriter {
    inner: Arc<RwLock<Option<SensorReading>>>,
}

impl SensorCache {
    /// Create an empty cache, returning its only writer and a reader.
    pub fn new() -> (SensorWriter, SensorCache) {
        let inner = Arc::new(RwLock::new(None));
        (
            SensorWriter {
                inner: Arc::clone(&inner),
            },
            SensorCache { inner },
        )
    }

    /// Latest reading, or `None` until the first message arrives.
    pub async fn read(&self) -> Option<SensorReading> {
        *self.inner.read().await
    }
}

impl SensorWriter {
    /// Replace the stored reading. Older values are dropped, never queued.
    pub async fn update(&self, reading: SensorReading) {
        *self.inner.write().await = Some(reading);
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the status API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub sensor_connected: bool,
    pub command_connected: bool,
    pub sensor_session: ConnectionState,
    pub command_session: ConnectionState,
    pub latest_water_flow: Option<f64>,
    pub latest_soil_moisture: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_observed_at: Option<OffsetDateTime>,
}

impl StatusResponse {
    pub fn new(
        (sensor_connected, sensor_session): (bool, ConnectionState),
        (command_connected, command_session): (bool, ConnectionState),
        reading: Option<SensorReading>,
    ) -> Self {
        Self {
            sensor_connected,
            command_connected,
            sensor_session,
            command_session,
            latest_water_flow: reading.map(|r| r.water_flow_liters),
            latest_soil_moisture: reading.map(|r| r.soil_moisture_pct),
            latest_observed_at: reading.map(|r| r.observed_at),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
