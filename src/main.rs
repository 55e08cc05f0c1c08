//! Area Scene
//!
//! Standalone X11 compositor: redirects the root window's children and
//! repaints the screen through the scene whenever something changed.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use area_scene::compositor::Compositor;
use area_scene::compositor::context::CompositorContext;
use area_scene::config::Config;
use area_scene::dbus::{DbusManager, LogNotifier, Notifier};
use area_scene::platform::X11Platform;
use area_scene::platform::events::{EventStream, is_disconnect};

struct App {
    events: EventStream,
    /// Dropped before the platform releases the overlay window
    compositor: Compositor,
    platform: X11Platform,
    refresh_rate: u32,
    /// Keeps the session bus connection open for notifications
    _dbus: Option<DbusManager>,
}

impl App {
    async fn new() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;

        let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X11 server")?;
        let conn = Arc::new(conn);
        info!("Connected to X11 server (screen {})", screen_num);

        let dbus = match DbusManager::new().await {
            Ok(dbus) => Some(dbus),
            Err(e) => {
                warn!("D-Bus unavailable, notifications go to the log: {}", e);
                None
            }
        };
        let notifier: Rc<dyn Notifier> = match &dbus {
            Some(dbus) => match dbus.notifier().await {
                Ok(notifier) => Rc::new(notifier),
                Err(e) => {
                    warn!("Notification service unavailable: {}", e);
                    Rc::new(LogNotifier)
                }
            },
            None => Rc::new(LogNotifier),
        };

        let refresh_rate = config.compositor.refresh_rate.max(1);
        let platform = X11Platform::new(conn.clone(), screen_num, &config)?;
        let ctx = CompositorContext::new(Some(conn.clone()), config, notifier);
        let events = EventStream::new(conn)?;

        Ok(Self {
            events,
            compositor: Compositor::new(ctx),
            platform,
            refresh_rate,
            _dbus: dbus,
        })
    }

    async fn run(mut self) -> Result<()> {
        if !self.compositor.setup(&mut self.platform) {
            warn!("Running without compositing");
        }

        let mut repaint_interval = tokio::time::interval(Duration::from_secs(1) / self.refresh_rate);
        repaint_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        repaint_interval.tick().await;

        info!("Starting main event loop");
        loop {
            // Events can sit in the connection's queue without the socket
            // becoming readable again
            if !self.process_events()? {
                return Ok(());
            }

            tokio::select! {
                () = self.events.readable() => {}

                _ = repaint_interval.tick() => {
                    if let Some(frame_time) = self.compositor.perform_compositing(&mut self.platform) {
                        if frame_time > Duration::from_secs(1) / self.refresh_rate {
                            debug!("Slow frame: {:?}", frame_time);
                        }
                    }
                }
            }
        }
    }

    /// Handle every queued event. Returns false once the server is gone.
    fn process_events(&mut self) -> Result<bool> {
        if let Err(e) = self.events.flush() {
            if is_disconnect(&e) {
                info!("X11 connection lost, exiting cleanly");
                return Ok(false);
            }
            warn!("Failed to flush X11 requests: {}", e);
        }

        let events = match self.events.drain() {
            Ok(events) => events,
            Err(e) if is_disconnect(&e) => {
                error!("X11 connection lost, exiting cleanly");
                return Ok(false);
            }
            Err(e) => {
                error!("Error polling for X11 events: {}", e);
                return Ok(true);
            }
        };

        for event in events {
            if let Err(e) = self.platform.handle_event(event, &mut self.compositor) {
                debug!("Failed to handle event: {:#}", e);
            }
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "area_scene=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Area scene compositor");

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let app = App::new().await?;

    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                error!("Compositor error: {:#}", e);
                return Err(e);
            }
        }
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
    }

    Ok(())
}
