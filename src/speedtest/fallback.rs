use super::session::Session;
use super::transport::HttpTransport;
use super::{Halt, Measurement, Method};
use crate::error::ProbeError;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

const RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct FallbackPlan<'a> {
    pub sources: &'a [String],
    pub probe_url: &'a str,
    pub duration: Duration,
}

pub async fn measure<H: HttpTransport>(
    http: &H,
    session: &mut Session,
    plan: &FallbackPlan<'_>,
) -> Result<Measurement, Halt> {
    session.begin_fallback();
    session.note("HTTP fallback engaged");
    let cancel = session.cancel_token().clone();
    let finish_at = Instant::now() + plan.duration;

    let mut index = 0usize;
    while !plan.sources.is_empty() && Instant::now() < finish_at {
        let url = &plan.sources[index % plan.sources.len()];
        index += 1;

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Halt::Cancelled),
            _ = sleep_until(finish_at) => {
                debug!("Fallback duration reached during {}", url);
                break;
            }
            fetched = http.fetch(url) => fetched,
        };

        match fetched {
            Ok(body) => {
                debug!("Fallback source {} returned {} bytes", url, body.len());
                session.record(body.len());
            }
            Err(e) => {
                session.note(format!("HTTP dl source fail: {url} ({e})"));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Halt::Cancelled),
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Halt::Cancelled);
    }
    if session.bytes() > 0 {
        return Ok(session.measurement(Method::Http));
    }

    let probe = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Halt::Cancelled),
        probe = http.fetch(plan.probe_url) => probe,
    };
    match probe {
        Ok(_) => {
            session.note("Connectivity probe succeeded but large test files blocked");
            Ok(session.unknown_speed())
        }
        Err(e) => {
            session.note(format!(
                "Connectivity probe failed ({e}) -> network likely offline or blocked"
            ));
            Err(Halt::Failed(ProbeError::Offline))
        }
    }
}
