mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldSim, Scenario};

/// Ingest payload. `volume_l` carries millilitres; the gateway divides by 1000.
#[derive(Debug, Serialize)]
struct SensorMsg {
    volume_l: f64,
    soil_moisture_pct: f64,
}

#[derive(Debug, Deserialize)]
struct MotorCommand {
    motor: bool,
}

fn parse_motor_command(payload: &[u8]) -> Result<bool, serde_json::Error> {
    serde_json::from_slice::<MotorCommand>(payload).map(|c| c.motor)
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Mutual TLS when all three of `NODE_ROOT_CA`, `NODE_CERT`, `NODE_KEY` are set.
fn tls_from_env() -> Result<Option<Transport>> {
    let (Ok(ca), Ok(cert), Ok(key)) = (
        env::var("NODE_ROOT_CA"),
        env::var("NODE_CERT"),
        env::var("NODE_KEY"),
    ) else {
        return Ok(None);
    };
    let read = |p: &str| std::fs::read(p).with_context(|| format!("failed to read {p}"));
    Ok(Some(Transport::Tls(TlsConfiguration::Simple {
        ca: read(&ca)?,
        alpn: None,
        client_auth: Some((read(&cert)?, read(&key)?)),
    })))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let transport = tls_from_env()?;
    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env_parse("MQTT_PORT", if transport.is_some() { 8883 } else { 1883 });
    let node_id = env_or("NODE_ID", "field-1");
    let ingest_topic = env_or("INGEST_TOPIC", "irrigation/field-1/sensors");
    let command_topic = env_or("COMMAND_TOPIC", "irrigation/field-1/motor");
    let sample_every_s: u64 = env_parse("SAMPLE_EVERY_S", 60);
    let flow_ml: f64 = env_parse("SIM_FLOW_ML", 2000.0);
    let scenario = Scenario::from_str_lossy(&env_or("SIM_SCENARIO", "drying"));

    let mut mqttoptions = MqttOptions::new(format!("irrigation-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Some(t) = transport {
        mqttoptions.set_transport(t);
        info!("mutual TLS enabled");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let pump = Arc::new(AtomicBool::new(false));

    // Event loop: (re)subscribe on every connect and follow motor commands.
    let sub_client = client.clone();
    let sub_topic = command_topic.clone();
    let pump_flag = Arc::clone(&pump);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(&sub_topic, QoS::AtLeastOnce) {
                        warn!(error = %e, topic = %sub_topic, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == sub_topic => {
                    match parse_motor_command(&p.payload) {
                        Ok(on) => {
                            info!(motor = on, "motor command received");
                            pump_flag.store(on, Ordering::SeqCst);
                        }
                        Err(e) => warn!(error = %e, "bad motor command"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(topic = %ingest_topic, %scenario, sample_every_s, "publishing field telemetry");
    let mut field = FieldSim::new(scenario, flow_ml);

    loop {
        field.set_pump(pump.load(Ordering::SeqCst));
        let s = field.sample();
        let msg = SensorMsg {
            volume_l: s.volume_ml,
            soil_moisture_pct: s.soil_moisture_pct,
        };
        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(&ingest_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!(error = %e, "publish error");
        } else {
            debug!(?msg, pump = field.pump_on(), "published sample");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
