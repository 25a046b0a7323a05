pub mod cache;
pub mod discovery;
pub mod fallback;
pub mod probe;
pub mod scale;
pub mod session;
pub mod transport;

use crate::error::ProbeError;
use discovery::Server;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locating,
    Downloading,
    Done,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Locating)
                | (Phase::Locating, Phase::Downloading)
                | (Phase::Downloading, Phase::Done)
                | (Phase::Locating, Phase::Error)
                | (Phase::Downloading, Phase::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Socket,
    Http,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub bits_per_second: f64,
    pub mbps: String,
    pub bytes: u64,
    pub elapsed: Duration,
    pub method: Method,
    pub server: Option<Server>,
}

#[derive(Debug, Clone)]
pub enum ProbeUpdate {
    Phase(Phase),
    Server(Server),
    Progress {
        mbps: String,
        bits_per_second: f64,
        scale_pct: f64,
        bytes: u64,
    },
    Log(String),
    Finished(Result<Measurement, ProbeError>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Done(Measurement),
    Failed(ProbeError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Cancelled,
    Failed(ProbeError),
}

pub fn throughput_bps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some((bytes as f64 * 8.0) / secs)
    } else {
        None
    }
}

pub fn format_mbps(bits_per_second: f64) -> String {
    format!("{:.2}", bits_per_second / 1_000_000.0)
}
