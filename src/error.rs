use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("No servers available")]
    NoServers,

    #[error("Global timeout exceeded")]
    GlobalTimeout,

    #[error("All fallback sources unreachable")]
    Offline,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to resolve host: {0}")]
    Dns(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bad status {0}")]
    Status(u16),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl TransportError {
    pub fn is_dns_failure(&self) -> bool {
        matches!(self, TransportError::Dns(_))
    }

    pub fn from_connect_message(message: String) -> Self {
        let lower = message.to_lowercase();
        let dns = [
            "unable to resolve host",
            "no address associated",
            "failed to lookup address",
            "name or service not known",
            "nodename nor servname",
        ]
        .iter()
        .any(|needle| lower.contains(needle));

        if dns {
            TransportError::Dns(message)
        } else {
            TransportError::Connect(message)
        }
    }
}
