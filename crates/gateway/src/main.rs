mod config;
mod crop;
mod dispatcher;
mod error;
mod estimator;
mod model;
mod mqtt;
mod penman;
mod session;
mod state;
mod supervisor;
mod weather;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{BrokerConfig, SessionConfig};
use dispatcher::Dispatcher;
use estimator::{LearnedEstimator, PhysicalEstimator};
use model::TreeEnsemble;
use mqtt::{CommandHandler, IngestHandler};
use session::{
    ConnectionWatch, NetworkLoop, SecureSession, SessionEventHandler, SessionIdentity, SessionRole,
    SessionStatus, TlsBundle,
};
use state::SensorCache;
use supervisor::Supervisor;
use weather::OpenWeatherClient;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "gateway.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Learned model (fatal if missing) ────────────────────────────
    let model = TreeEnsemble::load(&cfg.model.path)
        .with_context(|| format!("failed to load model: {}", cfg.model.path.display()))?;
    info!(
        path = %cfg.model.path.display(),
        trees = model.trees.len(),
        features = model.n_features(),
        "model loaded"
    );

    // ── Sessions (fatal if TLS material is missing) ─────────────────
    let (ingest, ingest_loop) =
        SecureSession::new(identity(SessionRole::Ingest, &cfg.ingest, &cfg.broker)?);
    let (command, command_loop) =
        SecureSession::new(identity(SessionRole::Command, &cfg.command, &cfg.broker)?);

    // ── Sensor cache: the ingest handler holds the only writer ──────
    let (writer, cache) = SensorCache::new();

    let ingest_watch = spawn_supervisor(
        ingest.clone(),
        ingest_loop,
        Arc::new(IngestHandler::new(&cfg.ingest.topic, writer)),
    );
    let command_watch = spawn_supervisor(
        command.clone(),
        command_loop,
        Arc::new(CommandHandler::new(&cfg.command.topic)),
    );

    // ── Decision path ───────────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        Arc::new(PhysicalEstimator::new(cfg.site.altitude_m)),
        Arc::new(LearnedEstimator::new(Arc::new(model))),
        cache.clone(),
        Arc::new(command.clone()),
        Arc::new(ingest.clone()),
        &cfg.command.topic,
        cfg.policy,
    );

    let weather = OpenWeatherClient::new(
        &cfg.weather.base_url,
        &cfg.weather.api_key,
        cfg.site,
        cfg.weather.timeout(),
    )
    .context("failed to build weather client")?;

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        weather: Arc::new(weather),
        site: cfg.site,
        cache,
        ingest: SessionStatus {
            link: Arc::new(ingest),
            watch: ingest_watch,
        },
        command: SessionStatus {
            link: Arc::new(command),
            watch: command_watch,
        },
    };

    // ── Web server (runs until the process is stopped) ──────────────
    web::serve(state, cfg.web.port).await
}

fn identity(
    role: SessionRole,
    s: &SessionConfig,
    broker: &BrokerConfig,
) -> Result<SessionIdentity> {
    let tls = TlsBundle::load(&s.root_ca, &s.cert, &s.key)
        .with_context(|| format!("{role} session cannot start"))?;
    Ok(SessionIdentity::new(
        role,
        &s.client_id,
        &broker.host,
        broker.port,
        broker.keep_alive(),
        tls,
    ))
}

/// Hand the network loop to a supervisor and run it in the background.
fn spawn_supervisor(
    session: SecureSession,
    network: NetworkLoop,
    handler: Arc<dyn SessionEventHandler>,
) -> ConnectionWatch {
    let (supervisor, watch) = Supervisor::new(session.role(), session, move || {
        network.spawn(handler);
    });
    tokio::spawn(supervisor.run());
    watch
}
