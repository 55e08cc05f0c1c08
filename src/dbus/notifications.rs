//! Desktop notifications via org.freedesktop.Notifications

use anyhow::Result;
use tracing::{debug, warn};
use zbus::{Connection, proxy};

use super::Notifier;

/// Proxy for org.freedesktop.Notifications
#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    /// Show a notification
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: std::collections::HashMap<&str, zbus::zvariant::Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;
}

#[derive(Clone)]
pub struct NotificationService {
    proxy: NotificationsProxy<'static>,
}

impl NotificationService {
    pub async fn new(conn: &Connection) -> Result<Self> {
        let proxy = NotificationsProxy::new(conn).await?;
        Ok(Self { proxy })
    }

    /// Show a warning that stays until dismissed
    pub async fn show_warning(&self, title: &str, message: &str) -> Result<u32> {
        let id = self
            .proxy
            .notify(
                "Area Scene",
                0,
                "dialog-warning",
                title,
                message,
                &[],
                std::collections::HashMap::new(),
                0,
            )
            .await?;
        Ok(id)
    }
}

/// Sends notifications from a spawned task so the paint loop never waits
/// on the bus
#[derive(Clone)]
pub struct DesktopNotifier {
    service: NotificationService,
}

impl DesktopNotifier {
    pub fn new(service: NotificationService) -> Self {
        Self { service }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, summary: &str, body: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("{}: {}", summary, body);
            return;
        };
        let service = self.service.clone();
        let (summary, body) = (summary.to_string(), body.to_string());
        handle.spawn(async move {
            match service.show_warning(&summary, &body).await {
                Ok(id) => debug!("Sent notification {}", id),
                Err(e) => warn!("Failed to send notification '{}': {}", summary, e),
            }
        });
    }
}
