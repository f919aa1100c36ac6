//! Desktop notification manager.
//!
//! Tells the user how a file transfer ended. Uses `notify-rust`, which
//! provides a unified API across platforms (D-Bus on Linux desktops,
//! NSUserNotification on macOS).
//!
//! # Rate Limiting
//!
//! A burst of transfers must not turn into a burst of popups, so at most
//! one notification per second is shown.

use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Minimum time between notifications to prevent spam.
const MIN_NOTIFICATION_INTERVAL: Duration = Duration::from_secs(1);

/// Manages desktop notification delivery.
pub struct NotificationManager {
    /// When the last notification was shown.
    last_notification: Option<Instant>,
    /// Whether notifications are enabled.
    enabled: bool,
}

impl NotificationManager {
    /// Creates a new notification manager with notifications enabled.
    pub fn new() -> Self {
        Self {
            last_notification: None,
            enabled: true,
        }
    }

    /// Notifies the user that a file transfer finished.
    ///
    /// Respects rate limiting — if another notification was shown less
    /// than 1 second ago, this call is silently ignored.
    pub fn notify_transfer_result(&mut self, path: &str, success: bool) {
        if !self.enabled {
            return;
        }

        if let Some(last) = self.last_notification {
            if last.elapsed() < MIN_NOTIFICATION_INTERVAL {
                debug!("notification rate-limited, skipping");
                return;
            }
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        let (summary, body) = if success {
            ("File received", format!("{file_name} was saved"))
        } else {
            ("File transfer failed", format!("{file_name} could not be copied"))
        };

        let result = notify_rust::Notification::new()
            .summary(summary)
            .body(&body)
            .timeout(notify_rust::Timeout::Milliseconds(5000))
            .show();

        match result {
            Ok(_) => {
                debug!(path, success, "notification sent");
                self.last_notification = Some(Instant::now());
            }
            Err(e) => {
                error!(error = %e, "failed to send notification");
            }
        }
    }

    /// Enables or disables notifications.
    #[allow(dead_code)]
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}
