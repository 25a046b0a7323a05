use crate::checkin::{CheckInDraft, CheckInField, CheckInPayload};
use crate::error::ProbeError;
use crate::settings::{Settings, SettingsField};
use crate::speedtest::{
    cache::ServerCache, discovery::Server, probe::LiveProbe, Method, Phase, ProbeUpdate,
};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppView {
    Main,
    Settings,
}

pub struct App {
    pub phase: Phase,
    pub should_quit: bool,

    // UI state
    pub view: AppView,
    pub notice: Option<String>,

    // Settings
    pub settings: Settings,
    pub selected_setting: SettingsField,

    // Live measurement
    pub mbps: Option<String>,
    pub scale_pct: f64,
    pub samples: Vec<f64>,
    pub server: Option<Server>,
    pub method: Option<Method>,
    pub log: Vec<String>,
    pub error: Option<ProbeError>,

    // Check-in
    pub cafe_id: String,
    pub form: CheckInDraft,
    pub selected_field: CheckInField,
    pub submitted: Option<CheckInPayload>,

    cache: Arc<ServerCache>,
    cancel: Option<CancellationToken>,
}

impl App {
    pub fn new(settings: Settings, cafe_id: String) -> Self {
        let cache = Arc::new(ServerCache::new(settings.server_cache_ttl()));
        Self {
            phase: Phase::Idle,
            should_quit: false,
            view: AppView::Main,
            notice: None,
            settings,
            selected_setting: SettingsField::Duration,
            mbps: None,
            scale_pct: 0.0,
            samples: Vec::new(),
            server: None,
            method: None,
            log: Vec::new(),
            error: None,
            cafe_id,
            form: CheckInDraft::default(),
            selected_field: CheckInField::Crowd,
            submitted: None,
            cache,
            cancel: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase != Phase::Idle && !self.phase.is_terminal()
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match self.view {
            AppView::Main => self.handle_main_key(key),
            AppView::Settings => self.handle_settings_key(key),
        }
    }

    fn handle_main_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        self.notice = None;
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Char('s') => {
                if !self.is_running() {
                    self.view = AppView::Settings;
                }
                None
            }
            KeyCode::Enter => (!self.is_running()).then_some(AppAction::StartTest),
            KeyCode::Esc => self.is_running().then_some(AppAction::CancelTest),
            KeyCode::Char('f') => (self.phase == Phase::Error).then_some(AppAction::StartFallback),
            KeyCode::Char('u') => {
                if self.phase == Phase::Error {
                    self.form.set_unknown();
                    self.cache.clear();
                    self.phase = Phase::Idle;
                    self.error = None;
                }
                None
            }
            KeyCode::Char('c') => self.submit(),
            KeyCode::Tab | KeyCode::Down | KeyCode::Char('j') => {
                self.selected_field = self.selected_field.next();
                None
            }
            KeyCode::BackTab | KeyCode::Up | KeyCode::Char('k') => {
                self.selected_field = self.selected_field.prev();
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.form.cycle(self.selected_field, true);
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.form.cycle(self.selected_field, false);
                None
            }
            _ => None,
        }
    }

    fn handle_settings_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => {
                self.view = AppView::Main;
                None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_setting = self.selected_setting.prev();
                None
            }
            KeyCode::Down | KeyCode::Char('j') | KeyCode::Tab => {
                self.selected_setting = self.selected_setting.next();
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.decrease_setting();
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.increase_setting();
                None
            }
            _ => None,
        }
    }

    fn increase_setting(&mut self) {
        match self.selected_setting {
            SettingsField::Duration => {
                self.settings.download_secs = (self.settings.download_secs + 2).min(30);
            }
            SettingsField::Stall => {
                self.settings.stall_ms = (self.settings.stall_ms + 1000).min(5000);
            }
            SettingsField::TimeoutBuffer => {
                self.settings.timeout_buffer_secs = (self.settings.timeout_buffer_secs + 1).min(10);
            }
        }
    }

    fn decrease_setting(&mut self) {
        match self.selected_setting {
            SettingsField::Duration => {
                self.settings.download_secs = self.settings.download_secs.saturating_sub(2).max(6);
            }
            SettingsField::Stall => {
                self.settings.stall_ms = self.settings.stall_ms.saturating_sub(1000).max(1000);
            }
            SettingsField::TimeoutBuffer => {
                self.settings.timeout_buffer_secs =
                    self.settings.timeout_buffer_secs.saturating_sub(1).max(1);
            }
        }
    }

    fn submit(&mut self) -> Option<AppAction> {
        match self.form.payload(&self.cafe_id) {
            Some(Ok(payload)) => {
                self.submitted = Some(payload);
                self.should_quit = true;
                Some(AppAction::Submit)
            }
            Some(Err(e)) => {
                warn!("Unusable Wi-Fi speed {:?}: {}", self.form.wifi_speed(), e);
                self.notice = Some("Wi-Fi speed is not a number, re-test first".to_string());
                None
            }
            None => {
                self.notice = Some("Fill in every field and measure Wi-Fi first".to_string());
                None
            }
        }
    }

    pub fn reset_for_new_test(&mut self) -> CancellationToken {
        if self.phase == Phase::Error {
            self.cache.clear();
        }
        self.phase = Phase::Locating;
        self.mbps = None;
        self.scale_pct = 0.0;
        self.samples.clear();
        self.server = None;
        self.method = None;
        self.log.clear();
        self.error = None;

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        cancel
    }

    pub fn start_test(&mut self, fallback_only: bool) -> Result<mpsc::UnboundedReceiver<ProbeUpdate>> {
        let probe = LiveProbe::live(self.settings.clone(), Arc::clone(&self.cache))?;
        let cancel = self.reset_for_new_test();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let outcome = if fallback_only {
                probe.run_fallback_only(tx, cancel).await
            } else {
                probe.run(tx, cancel).await
            };
            info!("Probe task finished: {:?}", outcome);
        });

        Ok(rx)
    }

    pub fn cancel_test(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.phase = Phase::Idle;
        self.mbps = None;
        self.scale_pct = 0.0;
        self.server = None;
    }

    pub fn handle_update(&mut self, update: ProbeUpdate) {
        match update {
            ProbeUpdate::Phase(phase) => self.phase = phase,
            ProbeUpdate::Server(server) => {
                self.server = Some(server);
                self.scale_pct = 0.0;
            }
            ProbeUpdate::Progress {
                mbps,
                bits_per_second,
                scale_pct,
                ..
            } => {
                self.mbps = Some(mbps);
                self.scale_pct = scale_pct;
                self.samples.push(bits_per_second / 1_000_000.0);
                // Keep last 100 samples
                if self.samples.len() > MAX_SAMPLES {
                    self.samples.remove(0);
                }
            }
            ProbeUpdate::Log(line) => self.log.push(line),
            ProbeUpdate::Finished(Ok(measurement)) => {
                self.phase = Phase::Done;
                self.form.apply_speed(measurement.mbps.clone());
                self.mbps = Some(measurement.mbps);
                self.method = Some(measurement.method);
                self.server = measurement.server;
                self.cancel = None;
            }
            ProbeUpdate::Finished(Err(e)) => {
                self.phase = Phase::Error;
                self.error = Some(e);
                self.cancel = None;
            }
        }
    }

    pub fn probe_exited(&mut self) {
        if self.is_running() {
            self.cancel_test();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Quit,
    StartTest,
    StartFallback,
    CancelTest,
    Submit,
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}
