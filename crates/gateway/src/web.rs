use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::dispatcher::{DecisionReport, Dispatcher};
use crate::error::DecisionError;
use crate::session::SessionStatus;
use crate::state::{SensorCache, StatusResponse};
use crate::weather::{self, Site, WeatherSource};

/// Everything the handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub weather: Arc<dyn WeatherSource>,
    pub site: Site,
    pub cache: SensorCache,
    pub ingest: SessionStatus,
    pub command: SessionStatus,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/decision", get(api_decision))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse::new(
        state.ingest.snapshot(),
        state.command.snapshot(),
        state.cache.read().await,
    ))
}

#[derive(Debug, Deserialize)]
struct DecisionQuery {
    /// Days after sowing.
    das: u32,
}

async fn api_decision(
    State(state): State<AppState>,
    Query(query): Query<DecisionQuery>,
) -> Result<Json<DecisionReport>, ApiError> {
    let snapshot = weather::snapshot_for_today(state.weather.as_ref(), &state.site)
        .await
        .map_err(|e| ApiError::new(e.into(), &state))?;

    let report = state
        .dispatcher
        .decide(&snapshot, query.das)
        .await
        .map_err(|e| ApiError::new(e, &state))?;

    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed decision cycle, reported with the current connectivity.
struct ApiError {
    error: DecisionError,
    sensor_connected: bool,
    command_connected: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: String,
    sensor_connected: bool,
    command_connected: bool,
}

impl ApiError {
    fn new(error: DecisionError, state: &AppState) -> Self {
        Self {
            error,
            sensor_connected: state.ingest.snapshot().0,
            command_connected: state.command.snapshot().0,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            DecisionError::Weather(_) => StatusCode::BAD_GATEWAY,
            DecisionError::BothEstimatorsFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(status = status.as_u16(), error = %self.error, "decision cycle failed");

        let body = ErrorBody {
            status: "error",
            error: self.error.to_string(),
            sensor_connected: self.sensor_connected,
            command_connected: self.command_connected,
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{dispatcher, FakeLink, RecordingSink};
    use crate::error::WeatherError;
    use crate::session::connection_channel;
    use crate::state::{SensorReading, SensorWriter};
    use crate::weather::DailyWeather;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    struct FixedWeather(Option<DailyWeather>);

    #[async_trait]
    impl WeatherSource for FixedWeather {
        async fn fetch_today(&self) -> Result<DailyWeather, WeatherError> {
            self.0.ok_or(WeatherError::Status(503))
        }
    }

    fn daily() -> DailyWeather {
        DailyWeather {
            min_temp: 21.0,
            max_temp: 33.0,
            humidity: 55.0,
            wind: 2.5,
            cloud_cover: 30.0,
        }
    }

    fn status(up: bool) -> SessionStatus {
        let (_tx, watch) = connection_channel();
        SessionStatus {
            link: Arc::new(FakeLink::new(up)),
            watch,
        }
    }

    fn app(
        physical: Option<f64>,
        learned: Option<f64>,
        weather: Option<DailyWeather>,
    ) -> (Router, SensorWriter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::connected());
        let (dispatcher, writer) = dispatcher(physical, learned, Arc::clone(&sink));
        // The dispatcher owns its own cache; the status route gets a fresh one.
        let (_status_writer, cache) = SensorCache::new();
        let state = AppState {
            dispatcher: Arc::new(dispatcher),
            weather: Arc::new(FixedWeather(weather)),
            site: Site {
                latitude: 13.9,
                longitude: 100.6,
                altitude_m: 545.0,
            },
            cache,
            ingest: status(true),
            command: status(false),
        };
        (router(state), writer, sink)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn status_reports_connectivity_and_empty_cache() {
        let (router, _, _) = app(Some(4.2), Some(3.8), Some(daily()));
        let (code, json) = get_json(router, "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["sensor_connected"], true);
        assert_eq!(json["command_connected"], false);
        assert_eq!(json["sensor_session"], "disconnected");
        assert!(json["latest_water_flow"].is_null());
    }

    #[tokio::test]
    async fn decision_returns_report() {
        let (router, writer, sink) = app(Some(4.2), Some(3.8), Some(daily()));
        writer
            .update(SensorReading {
                water_flow_liters: 2.0,
                soil_moisture_pct: 10.0,
                observed_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await;

        let (code, json) = get_json(router, "/api/decision?das=40").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["threshold"], 3.8);
        assert_eq!(json["predicted_etc"], 3.8);
        assert_eq!(json["calculated_etc"], 4.2);
        assert_eq!(json["growth_day"], 40);
        assert_eq!(json["motor"], true);
        assert_eq!(json["sensor_data"]["water_flow"], 2.0);
        assert_eq!(json["sensor_data"]["soil_moisture"], 10.0);
        assert!(json["weather"]["radiation"].as_f64().unwrap() > 0.0);
        assert_eq!(sink.payloads(), vec![r#"{"motor":true}"#.to_string()]);
    }

    #[tokio::test]
    async fn negative_growth_day_is_rejected() {
        let (router, _, sink) = app(Some(4.2), Some(3.8), Some(daily()));
        let (code, _) = get_json(router, "/api/decision?das=-1").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn missing_growth_day_is_rejected() {
        let (router, _, _) = app(Some(4.2), Some(3.8), Some(daily()));
        let (code, _) = get_json(router, "/api/decision").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn weather_failure_is_bad_gateway() {
        let (router, _, sink) = app(Some(4.2), Some(3.8), None);
        let (code, json) = get_json(router, "/api/decision?das=10").await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert_eq!(json["status"], "error");
        assert_eq!(json["sensor_connected"], true);
        assert_eq!(json["command_connected"], false);
        assert!(json["error"].as_str().unwrap().contains("503"));
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn both_estimators_failing_is_internal_error() {
        let (router, _, _) = app(None, None, Some(daily()));
        let (code, json) = get_json(router, "/api/decision?das=10").await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["status"], "error");
        assert!(json["error"].as_str().unwrap().contains("both estimators failed"));
    }
}
