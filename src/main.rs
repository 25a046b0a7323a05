mod app;
mod checkin;
mod error;
mod settings;
mod speedtest;
mod ui;

use anyhow::{Context, Result};
use app::{poll_event, App, AppAction};
use crossterm::event::Event;
use ratatui::DefaultTerminal;
use settings::Settings;
use speedtest::ProbeUpdate;
use std::fs::File;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use ui::draw_ui;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let settings = Settings::from_env();
    let cafe_id = std::env::args().nth(1).unwrap_or_else(|| "unknown".to_string());
    let mut app = App::new(settings, cafe_id);

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, &mut app).await;

    ratatui::restore();
    result?;

    if let Some(payload) = &app.submitted {
        println!("{}", serde_json::to_string_pretty(payload)?);
    }
    Ok(())
}

fn init_tracing() -> Result<()> {
    let Ok(path) = std::env::var("CAFESPEED_LOG") else {
        return Ok(());
    };
    let file = File::create(&path).with_context(|| format!("creating log file {path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn run_app(terminal: &mut DefaultTerminal, app: &mut App) -> Result<()> {
    let mut probe_rx: Option<mpsc::UnboundedReceiver<ProbeUpdate>> = None;

    loop {
        terminal.draw(|frame| draw_ui(frame, app))?;

        // Handle probe updates
        if let Some(rx) = probe_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(update) => app.handle_update(update),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        app.probe_exited();
                        probe_rx = None;
                        break;
                    }
                }
            }
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit | AppAction::Submit => break,
                    AppAction::StartTest => probe_rx = Some(app.start_test(false)?),
                    AppAction::StartFallback => probe_rx = Some(app.start_test(true)?),
                    AppAction::CancelTest => {
                        app.cancel_test();
                        probe_rx = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    app.cancel_test();
    Ok(())
}
