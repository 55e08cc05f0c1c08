//! D-Bus integration: user-facing notifications about the compositor

use anyhow::{Context, Result};
use std::sync::Arc;
use zbus::Connection;

pub mod notifications;

pub use notifications::{DesktopNotifier, NotificationService};

/// Tells the user about events they should know of, such as a graphics
/// reset. Must never block the caller.
pub trait Notifier {
    fn notify(&self, summary: &str, body: &str);
}

/// Fallback when no session bus is available
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &str, body: &str) {
        tracing::warn!("{}: {}", summary, body);
    }
}

pub struct DbusManager {
    conn: Arc<Connection>,
}

impl DbusManager {
    /// Connect to session D-Bus
    pub async fn new() -> Result<Self> {
        let conn = Connection::session()
            .await
            .context("Failed to connect to D-Bus session bus")?;

        tracing::info!("Connected to D-Bus session bus");

        Ok(Self { conn: Arc::new(conn) })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Desktop notifier on this bus
    pub async fn notifier(&self) -> Result<DesktopNotifier> {
        let service = NotificationService::new(&self.conn).await?;
        Ok(DesktopNotifier::new(service))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Records notifications instead of sending them
    #[derive(Debug, Default, Clone)]
    pub struct RecordingNotifier {
        pub sent: Rc<RefCell<Vec<(String, String)>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, summary: &str, body: &str) {
            self.sent.borrow_mut().push((summary.to_string(), body.to_string()));
        }
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::default();
        let dyn_notifier: &dyn Notifier = &notifier;
        dyn_notifier.notify("a", "b");
        assert_eq!(*notifier.sent.borrow(), vec![("a".to_string(), "b".to_string())]);
    }
}
