//! Single-consumer worker loop.
//!
//! Broker messages, render results and shutdown requests all arrive on one
//! channel; the periodic tick is the channel's receive timeout. The engine is
//! only ever touched from this loop.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{Engine, EngineStats};
use crate::ingest::FrameDecoder;
use crate::render::{ClipEncoder, RenderJob, RenderOutcome};
use crate::transport::parse_control;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum WorkerEvent {
    Message { topic: String, payload: Vec<u8> },
    RenderFinished(RenderOutcome),
    TransportFailed(String),
    Shutdown,
}

/// Topic names the worker routes on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub control: Option<String>,
}

impl Topics {
    pub fn subscriptions(&self) -> Vec<&str> {
        let mut topics = vec![self.data.as_str()];
        if let Some(control) = self.control.as_deref() {
            topics.push(control);
        }
        topics
    }
}

pub struct Worker {
    engine: Engine,
    decoder: Box<dyn FrameDecoder>,
    encoder: Arc<dyn ClipEncoder>,
    topics: Topics,
    tick_period: Duration,
    tx: Sender<WorkerEvent>,
    rx: Receiver<WorkerEvent>,
    renders_in_flight: usize,
}

impl Worker {
    pub fn new(
        engine: Engine,
        decoder: Box<dyn FrameDecoder>,
        encoder: Arc<dyn ClipEncoder>,
        topics: Topics,
        tick_period: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            engine,
            decoder,
            encoder,
            topics,
            tick_period,
            tx,
            rx,
            renders_in_flight: 0,
        }
    }

    /// Handle for producers feeding this worker.
    pub fn sender(&self) -> Sender<WorkerEvent> {
        self.tx.clone()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run until shutdown. A transport failure ends the loop with an error.
    pub fn run(mut self) -> Result<EngineStats> {
        log::info!(
            "Worker started: decoder={} topics={:?} tick={:?}",
            self.decoder.name(),
            self.topics.subscriptions(),
            self.tick_period
        );
        let mut next_tick = Instant::now() + self.tick_period;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(WorkerEvent::Message { topic, payload }) => {
                    self.handle_message(&topic, &payload, Instant::now());
                }
                Ok(WorkerEvent::RenderFinished(outcome)) => {
                    self.renders_in_flight = self.renders_in_flight.saturating_sub(1);
                    self.engine.on_render_finished(outcome, Instant::now());
                }
                Ok(WorkerEvent::TransportFailed(reason)) => {
                    return Err(anyhow!("MQTT connection failed: {}", reason));
                }
                Ok(WorkerEvent::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now >= next_tick {
                let jobs = self.engine.tick(now);
                self.dispatch(jobs);
                next_tick = now + self.tick_period;
            }
        }

        if self.renders_in_flight > 0 {
            log::warn!(
                "Shutting down with {} render(s) still running",
                self.renders_in_flight
            );
        }
        Ok(self.engine.stats())
    }

    /// Route one broker message to the engine. Anything not on the control
    /// topic goes to the decoder, so wildcard data subscriptions work.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8], now: Instant) {
        let jobs = if self.topics.control.as_deref() == Some(topic) {
            match parse_control(payload) {
                Ok(signal) => self.engine.on_control(signal, now),
                Err(e) => {
                    log::debug!("Ignoring control message: {:#}", e);
                    return;
                }
            }
        } else {
            match self.decoder.decode(payload) {
                Some(arrival) => self.engine.on_frame(arrival, now),
                None => {
                    log::debug!("Ignoring {} byte non-frame message on {}", payload.len(), topic);
                    return;
                }
            }
        };
        self.dispatch(jobs);
    }

    fn dispatch(&mut self, jobs: Vec<RenderJob>) {
        for job in jobs {
            let encoder = Arc::clone(&self.encoder);
            let tx = self.tx.clone();
            let thread_job = job.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("render-{}", job.clip))
                .spawn(move || {
                    let result = encoder.encode(&thread_job);
                    let _ = tx.send(WorkerEvent::RenderFinished(RenderOutcome::from_result(
                        &thread_job,
                        result,
                    )));
                });
            match spawned {
                Ok(_) => self.renders_in_flight += 1,
                Err(e) => {
                    let outcome = RenderOutcome::from_result(
                        &job,
                        Err(anyhow!("spawn render thread: {}", e)),
                    );
                    self.engine.on_render_finished(outcome, Instant::now());
                }
            }
        }
    }
}
