//! clip_receiver - Reassemble chunked camera clips from MQTT and render them.
//!
//! 1. Subscribes to the video data topic and, optionally, the control topic
//! 2. Rebuilds frames from their chunks and writes them to the output directory
//! 3. Decides when each clip is complete (frame count, end signal or idle gap)
//! 4. Runs ffmpeg once per complete clip
//!
//! Pipeline settings come from an optional JSON config file and `CLIP_*`
//! environment variables; the flags below override both.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use clip_receiver::config::ReceiverConfig;
use clip_receiver::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, MqttSession, MqttSettings, TlsMaterials,
};
use clip_receiver::{
    Engine, FfmpegEncoder, FsFrameStore, WireFormat, Worker, WorkerEvent,
};

const RECEIVER_NAME: &str = "clip_receiver";

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive chunked camera clips over MQTT")]
struct Args {
    /// MQTT broker address.
    /// By default, only loopback addresses are allowed.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (required for mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = RECEIVER_NAME)]
    mqtt_client_id: String,

    /// JSON config file with pipeline settings.
    #[arg(long, env = "CLIP_RECEIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for frames and rendered videos.
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Video data topic.
    #[arg(long)]
    topic: Option<String>,

    /// Control topic. Pass an empty string to rely on the idle gap instead.
    #[arg(long)]
    ctrl_topic: Option<String>,

    /// Output frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Wire format of the data topic: 'binary' or 'json'.
    #[arg(long)]
    format: Option<WireFormat>,

    /// Delete a clip's existing frames when its start signal arrives.
    #[arg(long)]
    clean_on_start: bool,
}

impl Args {
    fn apply_overrides(&self, cfg: &mut ReceiverConfig) {
        if let Some(dir) = &self.outdir {
            cfg.output_dir = dir.clone();
        }
        if let Some(topic) = &self.topic {
            cfg.topics.data = topic.clone();
        }
        if let Some(topic) = &self.ctrl_topic {
            let topic = topic.trim();
            cfg.topics.control = (!topic.is_empty()).then(|| topic.to_string());
        }
        if let Some(fps) = self.fps {
            cfg.frame_rate = fps;
        }
        if let Some(format) = self.format {
            cfg.format = format;
        }
        if self.clean_on_start {
            cfg.clean_on_start = true;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ReceiverConfig::load_from(args.config.as_deref())?;
    args.apply_overrides(&mut cfg);
    cfg.validate()?;

    let endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&endpoint, &args.mqtt_broker_addr)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;

    let store = FsFrameStore::open(&cfg.output_dir)?;

    log::info!("Clip receiver starting");
    log::info!(
        "  MQTT broker: {}:{} (TLS: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls
    );
    log::info!("  Data topic: {} ({})", cfg.topics.data, cfg.format);
    log::info!(
        "  Control topic: {}",
        cfg.topics.control.as_deref().unwrap_or("none (idle gap)")
    );
    log::info!("  Output: {}", store.root().display());
    log::info!("  Frame rate: {}", cfg.frame_rate);
    log::info!("  Render policy: {}", cfg.render.policy()?);

    let engine = Engine::new(cfg.engine_config()?, Box::new(store));
    let encoder = Arc::new(FfmpegEncoder::new(
        cfg.render.encoder.clone(),
        cfg.render.timeout,
    ));
    let worker = Worker::new(
        engine,
        cfg.format.decoder(),
        encoder,
        cfg.topics.clone(),
        cfg.tick_period,
    );

    let shutdown = worker.sender();
    ctrlc::set_handler(move || {
        let _ = shutdown.send(WorkerEvent::Shutdown);
    })
    .context("install Ctrl-C handler")?;

    let settings = MqttSettings {
        endpoint,
        tls,
        client_id: args.mqtt_client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
    };
    let session = MqttSession::start(&settings, &cfg.topics.subscriptions(), worker.sender())?;

    let result = worker.run();
    if let Err(e) = session.disconnect() {
        log::debug!("MQTT disconnect: {:#}", e);
    }
    let stats = result?;
    log::info!(
        "Shutdown: {} frame(s) assembled, {} integrity failure(s), {} render(s) ok, {} failed",
        stats.frames_assembled,
        stats.integrity_failures,
        stats.renders_succeeded,
        stats.renders_failed
    );
    log::info!("  Full counters: {:?}", stats);
    Ok(())
}
