use super::cache::ServerCache;
use super::discovery::{discover, normalize_all, Server, ServerQueue};
use super::fallback::{self, FallbackPlan};
use super::session::Session;
use super::transport::{
    Discovery, HttpClient, HttpTransport, LocateClient, SocketConnection, SocketMessage,
    SocketTransport, WsTransport, NDT7_PROTOCOL,
};
use super::{Halt, Measurement, Method, Phase, ProbeOutcome, ProbeUpdate};
use crate::error::{ProbeError, TransportError};
use crate::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub type LiveProbe = SpeedProbe<LocateClient, WsTransport, HttpClient>;

pub struct SpeedProbe<D, S, H> {
    discovery: D,
    socket: S,
    http: H,
    settings: Settings,
    cache: Arc<ServerCache>,
}

#[derive(Debug)]
enum AttemptEnd {
    Cancelled,
    GlobalTimeout,
    Stalled,
    OpenFailed(TransportError),
    Failed(TransportError),
    /// The test duration elapsed, or the server closed the stream.
    Finished { peer_closed: bool },
}

enum Tick {
    Cancelled,
    GlobalTimeout,
    Elapsed,
    Stalled,
    Message(Option<Result<SocketMessage, TransportError>>),
}

enum Verdict {
    Measured(Measurement),
    Escalate(String),
    Cancelled,
}

impl LiveProbe {
    pub fn live(settings: Settings, cache: Arc<ServerCache>) -> Result<Self, TransportError> {
        let discovery = LocateClient::new(settings.locate_url.clone())?;
        let http = HttpClient::new()?;
        Ok(SpeedProbe::new(discovery, WsTransport, http, settings, cache))
    }
}

impl<D, S, H> SpeedProbe<D, S, H>
where
    D: Discovery,
    S: SocketTransport,
    H: HttpTransport,
{
    pub fn new(discovery: D, socket: S, http: H, settings: Settings, cache: Arc<ServerCache>) -> Self {
        Self {
            discovery,
            socket,
            http,
            settings,
            cache,
        }
    }

    pub async fn run(
        &self,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
        cancel: CancellationToken,
    ) -> ProbeOutcome {
        let mut session = Session::new(updates, cancel);
        info!("Starting speed probe");
        let result = self.drive(&mut session).await;
        conclude(&mut session, result)
    }

    pub async fn run_fallback_only(
        &self,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
        cancel: CancellationToken,
    ) -> ProbeOutcome {
        let mut session = Session::new(updates, cancel);
        info!("Starting HTTP-only speed probe");
        let result = self.drive_fallback_only(&mut session).await;
        conclude(&mut session, result)
    }

    async fn drive(&self, session: &mut Session) -> Result<Measurement, Halt> {
        if !session.advance(Phase::Locating) {
            return Err(Halt::Cancelled);
        }
        let mut queue = self.candidates(session).await?;
        if queue.is_empty() {
            return Err(Halt::Failed(ProbeError::NoServers));
        }

        if !session.advance(Phase::Downloading) {
            return Err(Halt::Cancelled);
        }
        let deadline = Instant::now() + self.settings.global_timeout();

        match self.socket_stage(session, &mut queue, deadline).await {
            Verdict::Measured(measurement) => Ok(measurement),
            Verdict::Cancelled => Err(Halt::Cancelled),
            Verdict::Escalate(reason) => {
                session.note(format!("{reason} -> HTTP fallback"));
                self.http_stage(session).await
            }
        }
    }

    async fn drive_fallback_only(&self, session: &mut Session) -> Result<Measurement, Halt> {
        if !session.advance(Phase::Locating) {
            return Err(Halt::Cancelled);
        }
        session.note("HTTP fallback requested, skipping server discovery");
        if !session.advance(Phase::Downloading) {
            return Err(Halt::Cancelled);
        }
        self.http_stage(session).await
    }

    async fn candidates(&self, session: &mut Session) -> Result<ServerQueue, Halt> {
        let mut queue = match self.cache.fresh() {
            Some(cached) => {
                session.note(format!("Using cached server: {cached}"));
                let mut queue = ServerQueue::new(vec![cached], true);
                for server in normalize_all(&self.settings.static_servers) {
                    queue.push_unique(server);
                }
                queue
            }
            None => {
                let cancel = session.cancel_token().clone();
                let found = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Halt::Cancelled),
                    found = discover(
                        &self.discovery,
                        self.settings.locate_timeout(),
                        &self.settings.static_servers,
                    ) => found,
                };
                session.note(found.note);
                ServerQueue::new(found.servers, found.used_static)
            }
        };

        if let Some(last_resort) = Server::from_url(&self.settings.last_resort_server) {
            queue.set_last_resort(last_resort);
        }
        Ok(queue)
    }

    async fn socket_stage(
        &self,
        session: &mut Session,
        queue: &mut ServerQueue,
        mut deadline: Instant,
    ) -> Verdict {
        let low_bytes = self.settings.low_byte_threshold;

        while let Some((server, position)) = queue.next_server() {
            session.begin_attempt(&server);
            session.note(format!("Using server ({position}/{}): {server}", queue.len()));

            match self.attempt(session, &server, &mut deadline).await {
                AttemptEnd::Cancelled => return Verdict::Cancelled,
                AttemptEnd::GlobalTimeout => return Verdict::Escalate("Global timeout".to_string()),
                AttemptEnd::Stalled => {
                    session.note(format!(
                        "Stall: no data for {}ms -> switching server",
                        self.settings.stall_ms
                    ));
                }
                AttemptEnd::OpenFailed(e) => {
                    session.note(format!("Socket open failed: {e}"));
                    if e.is_dns_failure()
                        && queue.inject_static(&normalize_all(&self.settings.static_servers))
                    {
                        session.note("DNS resolution failure -> injecting static fallback server list");
                    }
                }
                AttemptEnd::Failed(e) => {
                    session.note(format!("WebSocket error on download: {e}"));
                }
                AttemptEnd::Finished { peer_closed } => {
                    if peer_closed && session.bytes() == 0 {
                        session.note("Socket closed before any data");
                        continue;
                    }
                    if session.bytes() < low_bytes {
                        let cause = if peer_closed {
                            "Socket closed early with low data"
                        } else {
                            "Low data after duration"
                        };
                        return Verdict::Escalate(format!("{cause} ({} bytes)", session.bytes()));
                    }
                    self.cache.store(server.clone());
                    let measurement = session.measurement(Method::Socket);
                    info!(
                        "Socket measurement complete: {} Mbps from {}",
                        measurement.mbps,
                        server.host()
                    );
                    return Verdict::Measured(measurement);
                }
            }
        }

        // Bytes still belong to the last attempt here.
        if session.bytes() > 0 {
            Verdict::Escalate("Socket servers exhausted after partial data".to_string())
        } else {
            Verdict::Escalate("All socket servers failed (no data)".to_string())
        }
    }

    // Opening a connection re-arms the global deadline from that moment.
    async fn attempt(
        &self,
        session: &mut Session,
        server: &Server,
        deadline: &mut Instant,
    ) -> AttemptEnd {
        let cancel = session.cancel_token().clone();
        let stall_threshold = self.settings.stall_threshold();
        let stall = tokio::time::sleep(stall_threshold);
        tokio::pin!(stall);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptEnd::Cancelled,
            _ = sleep_until(*deadline) => return AttemptEnd::GlobalTimeout,
            _ = &mut stall => return AttemptEnd::Stalled,
            opened = self.socket.open(server.download_url(), NDT7_PROTOCOL) => opened,
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => return AttemptEnd::OpenFailed(e),
        };
        debug!("Socket open to {}", server.host());
        let opened_at = Instant::now();
        *deadline = opened_at + self.settings.global_timeout();
        let deadline = *deadline;
        let finish_at = opened_at + self.settings.download_duration();

        loop {
            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => Tick::Cancelled,
                _ = sleep_until(deadline) => Tick::GlobalTimeout,
                _ = sleep_until(finish_at) => Tick::Elapsed,
                _ = &mut stall => Tick::Stalled,
                message = conn.next_message() => Tick::Message(message),
            };

            match tick {
                // Dropping the connection releases it without a handshake.
                Tick::Cancelled => return AttemptEnd::Cancelled,
                Tick::GlobalTimeout => {
                    release(&mut conn, "global timeout").await;
                    return AttemptEnd::GlobalTimeout;
                }
                Tick::Elapsed => {
                    release(&mut conn, "test duration elapsed").await;
                    return AttemptEnd::Finished { peer_closed: false };
                }
                Tick::Stalled => {
                    release(&mut conn, "stalled").await;
                    return AttemptEnd::Stalled;
                }
                Tick::Message(None) => return AttemptEnd::Finished { peer_closed: true },
                Tick::Message(Some(Err(e))) => return AttemptEnd::Failed(e),
                Tick::Message(Some(Ok(SocketMessage::Binary(len)))) => {
                    session.record(len);
                    stall.as_mut().reset(Instant::now() + stall_threshold);
                }
                // Server-side measurement reports; not needed for throughput.
                Tick::Message(Some(Ok(SocketMessage::Text(_)))) => {}
            }
        }
    }

    async fn http_stage(&self, session: &mut Session) -> Result<Measurement, Halt> {
        let plan = FallbackPlan {
            sources: &self.settings.http_sources,
            probe_url: &self.settings.connectivity_probe_url,
            duration: self.settings.download_duration(),
        };
        let ceiling = self.settings.global_timeout();
        match tokio::time::timeout(ceiling, fallback::measure(&self.http, session, &plan)).await {
            Ok(result) => result,
            Err(_) if session.bytes() > 0 => {
                session.note("Global timeout during HTTP fallback, keeping partial result");
                Ok(session.measurement(Method::Http))
            }
            Err(_) => {
                session.note("Global timeout during HTTP fallback");
                Err(Halt::Failed(ProbeError::GlobalTimeout))
            }
        }
    }
}

async fn release<C: SocketConnection>(conn: &mut C, reason: &str) {
    if tokio::time::timeout(CLOSE_GRACE, conn.close(reason)).await.is_err() {
        debug!("Socket close timed out ({})", reason);
    }
}

fn conclude(session: &mut Session, result: Result<Measurement, Halt>) -> ProbeOutcome {
    let result = match result {
        Ok(measurement) => Ok(measurement),
        Err(Halt::Cancelled) => return ProbeOutcome::Cancelled,
        Err(Halt::Failed(e)) => Err(e),
    };
    let outcome = match session.finish(result) {
        Some(Ok(measurement)) => {
            info!(
                mbps = %measurement.mbps,
                bits_per_second = measurement.bits_per_second,
                bytes = measurement.bytes,
                elapsed = ?measurement.elapsed,
                method = ?measurement.method,
                "Speed probe finished"
            );
            ProbeOutcome::Done(measurement)
        }
        Some(Err(e)) => {
            info!("Speed probe failed: {} [{}]", e, session.trail().join(" | "));
            ProbeOutcome::Failed(e)
        }
        None => ProbeOutcome::Cancelled,
    };
    debug!(
        phase = ?session.phase(),
        mbps = ?session.mbps(),
        server = ?session.server().map(Server::host),
        "Session ended"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ONE: &str = "wss://one.example.net/ndt/v7/download";
    const TWO: &str = "wss://two.example.net/ndt/v7/download";
    const THREE: &str = "wss://three.example.net/ndt/v7/download";
    const STATIC: &str = "wss://static.example.net/ndt/v7/download";
    const LAST: &str = "wss://last.example.net/ndt/v7/download";
    const SRC_A: &str = "https://files.example.net/a.bin";
    const SRC_B: &str = "https://files.example.net/b.bin";
    const PROBE: &str = "https://probe.example.net/get";

    #[derive(Debug, Clone, Copy)]
    enum After {
        Stall,
        Close,
        Error,
    }

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Refuse,
        Dns,
        Hang,
        Stream {
            chunk: usize,
            every: Duration,
            count: Option<usize>,
            then: After,
        },
    }

    fn stream(chunk: usize, every_ms: u64) -> Script {
        Script::Stream {
            chunk,
            every: Duration::from_millis(every_ms),
            count: None,
            then: After::Stall,
        }
    }

    fn stream_then(chunk: usize, every_ms: u64, count: usize, then: After) -> Script {
        Script::Stream {
            chunk,
            every: Duration::from_millis(every_ms),
            count: Some(count),
            then,
        }
    }

    struct FakeDiscovery {
        urls: Vec<String>,
        calls: AtomicUsize,
    }

    impl FakeDiscovery {
        fn new(urls: &[&str]) -> Self {
            Self {
                urls: urls.iter().map(|u| u.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Discovery for FakeDiscovery {
        async fn locate(&self) -> Result<Vec<String>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.urls.clone())
        }
    }

    #[derive(Default)]
    struct FakeSocket {
        scripts: HashMap<String, Script>,
        opened: Mutex<Vec<String>>,
    }

    impl FakeSocket {
        fn with(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts.iter().map(|(u, s)| (u.to_string(), *s)).collect(),
                opened: Mutex::new(Vec::new()),
            }
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    struct FakeConn {
        script: Script,
        sent: usize,
    }

    impl SocketTransport for FakeSocket {
        type Conn = FakeConn;

        async fn open(&self, url: &str, protocol: &str) -> Result<FakeConn, TransportError> {
            assert_eq!(protocol, NDT7_PROTOCOL);
            self.opened.lock().unwrap().push(url.to_string());
            match self.scripts.get(url).copied().unwrap_or(Script::Refuse) {
                Script::Refuse => Err(TransportError::Connect("connection refused".into())),
                Script::Dns => Err(TransportError::Dns(url.to_string())),
                Script::Hang => std::future::pending().await,
                script => Ok(FakeConn { script, sent: 0 }),
            }
        }
    }

    impl SocketConnection for FakeConn {
        async fn next_message(&mut self) -> Option<Result<SocketMessage, TransportError>> {
            let Script::Stream { chunk, every, count, then } = self.script else {
                return None;
            };
            if count.is_some_and(|count| self.sent >= count) {
                return match then {
                    After::Stall => std::future::pending().await,
                    After::Close => None,
                    After::Error => Some(Err(TransportError::WebSocket("reset".into()))),
                };
            }
            tokio::time::sleep(every).await;
            self.sent += 1;
            Some(Ok(SocketMessage::Binary(chunk)))
        }

        async fn close(&mut self, _reason: &str) {}
    }

    struct FakeHttp {
        bodies: HashMap<String, usize>,
        latency: Duration,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHttp {
        fn with(bodies: &[(&str, usize)], latency_ms: u64) -> Self {
            Self {
                bodies: bodies.iter().map(|(u, n)| (u.to_string(), *n)).collect(),
                latency: Duration::from_millis(latency_ms),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn offline() -> Self {
            Self::with(&[], 10)
        }

        fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl HttpTransport for FakeHttp {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.calls.lock().unwrap().push(url.to_string());
            tokio::time::sleep(self.latency).await;
            match self.bodies.get(url) {
                Some(len) => Ok(vec![0u8; *len]),
                None => Err(TransportError::Connect(format!("{url} unreachable"))),
            }
        }
    }

    fn settings() -> Settings {
        Settings {
            static_servers: vec![STATIC.to_string()],
            last_resort_server: LAST.to_string(),
            http_sources: vec![SRC_A.to_string(), SRC_B.to_string()],
            connectivity_probe_url: PROBE.to_string(),
            ..Settings::default()
        }
    }

    fn probe(
        discovery: FakeDiscovery,
        socket: FakeSocket,
        http: FakeHttp,
        settings: Settings,
    ) -> SpeedProbe<FakeDiscovery, FakeSocket, FakeHttp> {
        let cache = Arc::new(ServerCache::new(settings.server_cache_ttl()));
        SpeedProbe::new(discovery, socket, http, settings, cache)
    }

    async fn run(
        probe: &SpeedProbe<FakeDiscovery, FakeSocket, FakeHttp>,
    ) -> (ProbeOutcome, Vec<ProbeUpdate>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = probe.run(tx, CancellationToken::new()).await;
        let updates = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        (outcome, updates)
    }

    fn done(outcome: ProbeOutcome) -> Measurement {
        match outcome {
            ProbeOutcome::Done(m) => m,
            other => panic!("expected a measurement, got {other:?}"),
        }
    }

    fn phases(updates: &[ProbeUpdate]) -> Vec<Phase> {
        updates
            .iter()
            .filter_map(|u| match u {
                ProbeUpdate::Phase(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn logs(updates: &[ProbeUpdate]) -> Vec<String> {
        updates
            .iter()
            .filter_map(|u| match u {
                ProbeUpdate::Log(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    fn fallback_runs(updates: &[ProbeUpdate]) -> usize {
        logs(updates).iter().filter(|l| *l == "HTTP fallback engaged").count()
    }

    fn finished(updates: &[ProbeUpdate]) -> Vec<Result<Measurement, ProbeError>> {
        updates
            .iter()
            .filter_map(|u| match u {
                ProbeUpdate::Finished(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_server_succeeds_without_fallback() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO, THREE]),
            FakeSocket::with(&[(ONE, Script::Refuse), (TWO, Script::Refuse), (THREE, stream(32 * 1024, 100))]),
            FakeHttp::with(&[(SRC_A, 1_000_000)], 100),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.method, Method::Socket);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(THREE));
        assert!(m.bytes >= 64 * 1024);
        assert_eq!(p.socket.opened(), vec![ONE, TWO, THREE]);
        assert_eq!(p.http.total_calls(), 0);
        assert_eq!(fallback_runs(&updates), 0);
        assert_eq!(phases(&updates), vec![Phase::Locating, Phase::Downloading, Phase::Done]);
        assert_eq!(finished(&updates).len(), 1);
        assert_eq!(p.cache.fresh().map(|s| s.download_url().to_string()).as_deref(), Some(THREE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_servers_fail_probe_succeeds_reports_zero() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO, THREE]),
            FakeSocket::default(),
            FakeHttp::with(&[(PROBE, 300)], 10),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.mbps, "0");
        assert_eq!(m.method, Method::Http);
        assert_eq!(p.socket.opened(), vec![ONE, TWO, THREE, LAST]);
        assert_eq!(fallback_runs(&updates), 1);
        assert_eq!(p.http.calls_to(PROBE), 1);
        assert!(p.http.calls_to(SRC_A) > 0 && p.http.calls_to(SRC_B) > 0);
        assert!(logs(&updates).iter().any(|l| l.starts_with("All socket servers failed (no data)")));
        assert_eq!(phases(&updates), vec![Phase::Locating, Phase::Downloading, Phase::Done]);
        assert!(p.cache.fresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_reports_error() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        assert_eq!(outcome, ProbeOutcome::Failed(ProbeError::Offline));
        assert_eq!(fallback_runs(&updates), 1);
        assert_eq!(p.http.calls_to(PROBE), 1);
        assert_eq!(phases(&updates), vec![Phase::Locating, Phase::Downloading, Phase::Error]);
        assert_eq!(finished(&updates), vec![Err(ProbeError::Offline)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_with_partial_data_switches_server() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO]),
            FakeSocket::with(&[
                (ONE, stream_then(1_000_000, 100, 3, After::Stall)),
                (TWO, stream(16 * 1024, 100)),
            ]),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(TWO));
        assert_eq!(m.bytes % (16 * 1024), 0);
        assert!(m.bytes > 0 && m.bytes < 3_000_000);
        assert!(logs(&updates).iter().any(|l| l.starts_with("Stall:")));
        assert_eq!(p.http.total_calls(), 0);

        // First server's progress climbed to 3 MB, the second attempt restarted from zero.
        let progress: Vec<u64> = updates
            .iter()
            .filter_map(|u| match u {
                ProbeUpdate::Progress { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .collect();
        let peak = progress.iter().position(|b| *b == 3_000_000).unwrap();
        assert_eq!(progress[peak + 1], 16 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_escalates_to_fallback() {
        // Nothing ever opens, so each server costs one stall window.
        let urls: Vec<String> = (0..10)
            .map(|i| format!("wss://hang{i}.example.net/ndt/v7/download"))
            .collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let scripts: Vec<(&str, Script)> = url_refs.iter().map(|u| (*u, Script::Hang)).collect();
        let p = probe(
            FakeDiscovery::new(&url_refs),
            FakeSocket::with(&scripts),
            FakeHttp::with(&[(SRC_A, 1_000_000), (SRC_B, 1_000_000)], 200),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.method, Method::Http);
        assert!(m.bytes >= 1_000_000);
        assert!(logs(&updates).contains(&"Global timeout -> HTTP fallback".to_string()));
        assert_eq!(fallback_runs(&updates), 1);
        assert_eq!(p.http.calls_to(PROBE), 0);
        // 14 s ceiling over 2 s stalls: the seventh attempt is cut off.
        assert_eq!(p.socket.opened().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_server_then_full_run_keeps_socket_result() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO]),
            FakeSocket::with(&[(ONE, Script::Hang), (TWO, stream(32 * 1024, 100))]),
            FakeHttp::with(&[(SRC_A, 1_000_000)], 100),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.method, Method::Socket);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(TWO));
        assert_eq!(m.elapsed, Duration::from_secs(12));
        assert_eq!(p.http.total_calls(), 0);
        let logs = logs(&updates);
        assert!(logs.iter().any(|l| l.starts_with("Stall:")));
        assert!(!logs.iter().any(|l| l.starts_with("Global timeout")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fallback_keeps_received_bytes() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::with(&[(SRC_A, 1_000_000), (SRC_B, 1_000_000)], 5_000),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        // Two sources finish within 12 s; the third fetch is cut at the test duration.
        let m = done(outcome);
        assert_eq!(m.method, Method::Http);
        assert_eq!(m.bytes, 2_000_000);
        assert_eq!(m.mbps, "1.33");
        assert_eq!(p.http.calls_to(SRC_A), 2);
        assert_eq!(p.http.calls_to(PROBE), 0);
        assert_eq!(finished(&updates).len(), 1);
        assert_eq!(phases(&updates), vec![Phase::Locating, Phase::Downloading, Phase::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_fallback_is_fatal() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::with(&[(SRC_A, 1_000_000)], 60_000),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        assert_eq!(outcome, ProbeOutcome::Failed(ProbeError::GlobalTimeout));
        assert_eq!(fallback_runs(&updates), 1);
        assert_eq!(p.http.calls_to(PROBE), 1);
        assert_eq!(finished(&updates), vec![Err(ProbeError::GlobalTimeout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_data_prefers_fallback() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::with(&[(ONE, stream(100, 100))]),
            FakeHttp::with(&[(SRC_A, 1_000_000), (SRC_B, 1_000_000)], 500),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.method, Method::Http);
        assert!(logs(&updates).iter().any(|l| l.starts_with("Low data after duration")));
        assert_eq!(fallback_runs(&updates), 1);
        assert!(p.cache.fresh().is_none());
        // Only the first server was needed to decide; the rest of the queue is untouched.
        assert_eq!(p.socket.opened(), vec![ONE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_after_data_completes() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::with(&[(ONE, stream_then(64 * 1024, 100, 10, After::Close))]),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, _) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.bytes, 10 * 64 * 1024);
        let expected = 10.0 * 64.0 * 1024.0 * 8.0;
        assert!((m.bits_per_second - expected).abs() / expected < 0.01);
        assert_eq!(m.mbps, "5.24");
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_close_with_low_data_names_the_close() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::with(&[(ONE, stream_then(1024, 100, 5, After::Close))]),
            FakeHttp::with(&[(SRC_A, 1_000_000)], 500),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        assert_eq!(done(outcome).method, Method::Http);
        let logs = logs(&updates);
        assert!(logs.contains(&"Socket closed early with low data (5120 bytes) -> HTTP fallback".to_string()));
        assert!(!logs.iter().any(|l| l.starts_with("Low data after duration")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_close_and_error_advance_server() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO, THREE]),
            FakeSocket::with(&[
                (ONE, stream_then(1024, 100, 0, After::Close)),
                (TWO, stream_then(1024, 100, 2, After::Error)),
                (THREE, stream(32 * 1024, 100)),
            ]),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(THREE));
        let logs = logs(&updates);
        assert!(logs.contains(&"Socket closed before any data".to_string()));
        assert!(logs.iter().any(|l| l.starts_with("WebSocket error on download")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_open_counts_as_stall() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO]),
            FakeSocket::with(&[(ONE, Script::Hang), (TWO, stream(32 * 1024, 100))]),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, _) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(TWO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_failure_injects_static_servers() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::with(&[(ONE, Script::Dns), (STATIC, stream(32 * 1024, 100))]),
            FakeHttp::offline(),
            settings(),
        );
        let (outcome, updates) = run(&p).await;

        let m = done(outcome);
        assert_eq!(m.server.as_ref().map(|s| s.download_url()), Some(STATIC));
        assert_eq!(p.socket.opened(), vec![ONE, STATIC]);
        assert!(logs(&updates)
            .contains(&"DNS resolution failure -> injecting static fallback server list".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_server_skips_discovery_until_expiry() {
        let p = probe(
            FakeDiscovery::new(&[ONE, TWO]),
            FakeSocket::with(&[(ONE, Script::Refuse), (TWO, stream(32 * 1024, 100))]),
            FakeHttp::offline(),
            settings(),
        );

        let (first, _) = run(&p).await;
        assert!(matches!(first, ProbeOutcome::Done(_)));
        assert_eq!(p.discovery.calls.load(Ordering::SeqCst), 1);

        let (second, updates) = run(&p).await;
        assert!(matches!(second, ProbeOutcome::Done(_)));
        assert_eq!(p.discovery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.socket.opened(), vec![ONE, TWO, TWO]);
        assert!(logs(&updates).iter().any(|l| l.starts_with("Using cached server")));

        tokio::time::advance(Duration::from_secs(301)).await;
        let (third, _) = run(&p).await;
        assert!(matches!(third, ProbeOutcome::Done(_)));
        assert_eq!(p.discovery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_all_updates() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::with(&[(ONE, stream(32 * 1024, 100))]),
            FakeHttp::offline(),
            settings(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(update) = rx.recv().await {
                seen.push((Instant::now(), update));
            }
            seen
        });

        let cancel = CancellationToken::new();
        let cancel_at = Instant::now() + Duration::from_secs(3);
        let (outcome, _) = tokio::join!(p.run(tx, cancel.clone()), async {
            sleep_until(cancel_at).await;
            cancel.cancel();
        });

        assert_eq!(outcome, ProbeOutcome::Cancelled);
        let seen = collector.await.unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|(at, _)| *at <= cancel_at));
        assert!(seen.iter().all(|(_, u)| !matches!(u, ProbeUpdate::Finished(_))));
        let phases: Vec<Phase> = seen
            .iter()
            .filter_map(|(_, u)| match u {
                ProbeUpdate::Phase(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![Phase::Locating, Phase::Downloading]);
        assert!(p.cache.fresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_fallback() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::with(&[(SRC_A, 1_000_000)], 1_000),
            settings(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (outcome, _) = tokio::join!(p.run(tx, cancel.clone()), async {
            tokio::time::sleep(Duration::from_secs(4)).await;
            cancel.cancel();
        });

        assert_eq!(outcome, ProbeOutcome::Cancelled);
        let updates: Vec<ProbeUpdate> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(fallback_runs(&updates), 1);
        assert!(finished(&updates).is_empty());
        assert_eq!(p.http.calls_to(PROBE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_is_silent() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::offline(),
            settings(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(p.run(tx, cancel).await, ProbeOutcome::Cancelled);
        assert!(rx.try_recv().is_err());
        assert_eq!(p.discovery.calls.load(Ordering::SeqCst), 0);
        assert!(p.socket.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_only_session() {
        let p = probe(
            FakeDiscovery::new(&[ONE]),
            FakeSocket::default(),
            FakeHttp::with(&[(SRC_A, 1_000_000), (SRC_B, 1_000_000)], 250),
            settings(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = p.run_fallback_only(tx, CancellationToken::new()).await;
        let updates: Vec<ProbeUpdate> = std::iter::from_fn(|| rx.try_recv().ok()).collect();

        let m = done(outcome);
        assert_eq!(m.method, Method::Http);
        assert!(p.socket.opened().is_empty());
        assert_eq!(p.discovery.calls.load(Ordering::SeqCst), 0);
        assert_eq!(phases(&updates), vec![Phase::Locating, Phase::Downloading, Phase::Done]);
    }
}
