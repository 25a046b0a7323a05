use super::discovery::Server;
use super::scale::AdaptiveScale;
use super::{format_mbps, throughput_bps, Measurement, Method, Phase, ProbeUpdate};
use crate::error::ProbeError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Session {
    phase: Phase,
    bytes: u64,
    started: Instant,
    mbps: Option<String>,
    scale: AdaptiveScale,
    log: Vec<String>,
    server: Option<Server>,
    updates: mpsc::UnboundedSender<ProbeUpdate>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(updates: mpsc::UnboundedSender<ProbeUpdate>, cancel: CancellationToken) -> Self {
        Self {
            phase: Phase::Idle,
            bytes: 0,
            started: Instant::now(),
            mbps: None,
            scale: AdaptiveScale::default(),
            log: Vec::new(),
            server: None,
            updates,
            cancel,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn mbps(&self) -> Option<&str> {
        self.mbps.as_deref()
    }

    pub fn trail(&self) -> &[String] {
        &self.log
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn advance(&mut self, next: Phase) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if !self.phase.can_advance_to(next) {
            warn!("Refusing phase change {:?} -> {:?}", self.phase, next);
            return false;
        }
        debug!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.emit(ProbeUpdate::Phase(next));
        true
    }

    pub fn begin_attempt(&mut self, server: &Server) {
        self.reset_accounting();
        self.scale.reset();
        self.server = Some(server.clone());
        self.emit(ProbeUpdate::Server(server.clone()));
    }

    pub fn begin_fallback(&mut self) {
        self.reset_accounting();
        self.server = None;
    }

    fn reset_accounting(&mut self) {
        self.bytes = 0;
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        let Some(bps) = throughput_bps(self.bytes, self.elapsed()) else {
            return;
        };
        let mbps = format_mbps(bps);
        let scale_pct = self.scale.observe(bps);
        self.mbps = Some(mbps.clone());
        self.emit(ProbeUpdate::Progress {
            mbps,
            bits_per_second: bps,
            scale_pct,
            bytes: self.bytes,
        });
    }

    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.log.push(message.clone());
        self.emit(ProbeUpdate::Log(message));
    }

    pub fn measurement(&mut self, method: Method) -> Measurement {
        let elapsed = self.elapsed();
        let bits_per_second = throughput_bps(self.bytes, elapsed).unwrap_or(0.0);
        let mbps = format_mbps(bits_per_second);
        self.mbps = Some(mbps.clone());
        Measurement {
            bits_per_second,
            mbps,
            bytes: self.bytes,
            elapsed,
            method,
            server: self.server.clone(),
        }
    }

    pub fn unknown_speed(&mut self) -> Measurement {
        self.mbps = Some("0".to_string());
        Measurement {
            bits_per_second: 0.0,
            mbps: "0".to_string(),
            bytes: 0,
            elapsed: self.elapsed(),
            method: Method::Http,
            server: None,
        }
    }

    /// Performs the terminal transition and publishes the completion exactly
    /// once. Returns `None` when the session was cancelled or already finished.
    pub fn finish(
        &mut self,
        result: Result<Measurement, ProbeError>,
    ) -> Option<Result<Measurement, ProbeError>> {
        let next = if result.is_ok() { Phase::Done } else { Phase::Error };
        if !self.advance(next) {
            return None;
        }
        self.emit(ProbeUpdate::Finished(result.clone()));
        Some(result)
    }

    fn emit(&self, update: ProbeUpdate) {
        if self.is_cancelled() {
            return;
        }
        // The receiver going away only means nobody is watching.
        let _ = self.updates.send(update);
    }
}
