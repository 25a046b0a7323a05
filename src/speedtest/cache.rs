use super::discovery::Server;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct ServerCache {
    ttl: Duration,
    slot: Mutex<Option<(Server, Instant)>>,
}

impl ServerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn fresh(&self) -> Option<Server> {
        let slot = self.slot.lock().ok()?;
        match slot.as_ref() {
            Some((server, stored_at)) if stored_at.elapsed() < self.ttl => Some(server.clone()),
            _ => None,
        }
    }

    pub fn store(&self, server: Server) {
        if let Ok(mut slot) = self.slot.lock() {
            debug!("Caching server {}", server.download_url());
            *slot = Some((server, Instant::now()));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}
