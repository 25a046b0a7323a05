use super::transport::Discovery;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const DOWNLOAD_PATH: &str = "/ndt/v7/download";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    download_url: String,
}

impl Server {
    pub fn from_url(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if !raw.starts_with("wss://") {
            return None;
        }

        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };
        let path = path.trim_end_matches('/');
        if path.len() <= "wss://".len() {
            return None;
        }

        let mut download_url = if path.ends_with(DOWNLOAD_PATH) {
            path.to_string()
        } else {
            format!("{path}{DOWNLOAD_PATH}")
        };
        if let Some(query) = query {
            download_url.push('?');
            download_url.push_str(query);
        }

        Some(Self { download_url })
    }

    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    pub fn host(&self) -> &str {
        let rest = &self.download_url["wss://".len()..];
        rest.split('/').next().unwrap_or(rest)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.download_url)
    }
}

pub fn normalize_all<S: AsRef<str>>(urls: &[S]) -> Vec<Server> {
    urls.iter().filter_map(|u| Server::from_url(u.as_ref())).collect()
}

#[derive(Debug, Clone)]
pub struct Discovered {
    pub servers: Vec<Server>,
    pub used_static: bool,
    pub note: String,
}

/// One bounded attempt at the locate service. Never fails: timeouts, errors
/// and empty answers all fall back to `static_servers`.
pub async fn discover<D: Discovery>(
    discovery: &D,
    timeout: Duration,
    static_servers: &[String],
) -> Discovered {
    let fallback = |note: String| {
        warn!("{}", note);
        Discovered {
            servers: normalize_all(static_servers),
            used_static: true,
            note,
        }
    };

    match tokio::time::timeout(timeout, discovery.locate()).await {
        Ok(Ok(urls)) => {
            let servers = normalize_all(&urls);
            debug!("Locate returned {} url(s), {} usable", urls.len(), servers.len());
            if servers.is_empty() {
                fallback("Locate returned 0 -> using static fallback server list".to_string())
            } else {
                Discovered {
                    note: format!("Locate: found {} server(s)", servers.len()),
                    servers,
                    used_static: false,
                }
            }
        }
        Ok(Err(e)) => fallback(format!("Locate error ({e}) -> using static fallback server list")),
        Err(_) => fallback(format!(
            "Locate timed out after {}ms -> using static fallback server list",
            timeout.as_millis()
        )),
    }
}

/// Candidates consumed in order by the socket stage. The last-resort server,
/// if any, is only handed out after everything else, including servers
/// injected mid-session.
#[derive(Debug, Clone, Default)]
pub struct ServerQueue {
    servers: Vec<Server>,
    next: usize,
    static_injected: bool,
    last_resort: Option<Server>,
}

impl ServerQueue {
    pub fn new(servers: Vec<Server>, static_injected: bool) -> Self {
        Self {
            servers,
            next: 0,
            static_injected,
            last_resort: None,
        }
    }

    fn contains(&self, server: &Server) -> bool {
        self.servers.contains(server) || self.last_resort.as_ref() == Some(server)
    }

    pub fn push_unique(&mut self, server: Server) {
        if !self.contains(&server) {
            self.servers.push(server);
        }
    }

    pub fn set_last_resort(&mut self, server: Server) {
        if !self.servers.contains(&server) {
            self.last_resort = Some(server);
        }
    }

    pub fn inject_static(&mut self, static_servers: &[Server]) -> bool {
        if self.static_injected {
            return false;
        }
        self.static_injected = true;
        let before = self.servers.len();
        for server in static_servers {
            self.push_unique(server.clone());
        }
        self.servers.len() > before
    }

    pub fn len(&self) -> usize {
        self.servers.len() + usize::from(self.last_resort.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_server(&mut self) -> Option<(Server, usize)> {
        if self.next >= self.servers.len() {
            let last = self.last_resort.take()?;
            self.servers.push(last);
        }
        let server = self.servers[self.next].clone();
        self.next += 1;
        Some((server, self.next))
    }
}
