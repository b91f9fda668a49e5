//! Non-blocking resolution notifications using a dedicated worker thread
//! and mpsc channel.
//!
//! Delivery (email, push) is an external collaborator; the engine enqueues
//! and moves on. Sends are fire-and-forget: failures are logged, never
//! retried, and never block the resolution flow.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{info, warn};

/// Payout notice for one user after a market resolves. Non-winning bettors
/// receive a zero-payout notice.
#[derive(Debug, Clone)]
pub struct ResolutionNotification {
    pub user_id: String,
    pub payout: f64,
    pub creator_name: String,
    pub contract_id: String,
    pub question: String,
    pub outcome: String,
    pub resolution_probability: Option<f64>,
    pub resolutions: Option<HashMap<String, f64>>,
}

/// Messages accepted by the notification worker
pub enum NotificationMessage {
    Resolution(ResolutionNotification),
    /// Graceful shutdown
    Shutdown,
}

/// Channel handle for enqueuing notifications (non-blocking).
#[derive(Clone)]
pub struct NotificationChannel {
    tx: Sender<NotificationMessage>,
}

impl NotificationChannel {
    /// Enqueue one resolution notice. Returns whether the worker accepted
    /// it; a dead worker is logged and ignored.
    pub fn send_resolution(&self, notification: ResolutionNotification) -> bool {
        let user_id = notification.user_id.clone();
        let accepted = self
            .tx
            .send(NotificationMessage::Resolution(notification))
            .is_ok();
        if !accepted {
            warn!("[NOTIFY] dropping resolution notice for {}: worker gone", user_id);
        }
        accepted
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(NotificationMessage::Shutdown);
    }
}

/// Create a notification channel plus its receiving end.
/// Tests keep the receiver to assert on enqueued notices.
pub fn create_notification_channel() -> (NotificationChannel, Receiver<NotificationMessage>) {
    let (tx, rx) = mpsc::channel();
    (NotificationChannel { tx }, rx)
}

/// Create a channel and spawn the default worker that drains it.
pub fn spawn_notification_worker() -> NotificationChannel {
    let (channel, rx) = create_notification_channel();
    thread::spawn(move || run_notification_loop(rx));
    channel
}

/// Worker loop: hands each notice to the delivery collaborator. The default
/// delivery is the structured log stream.
pub fn run_notification_loop(rx: Receiver<NotificationMessage>) {
    for message in rx {
        match message {
            NotificationMessage::Resolution(n) => {
                info!(
                    "[NOTIFY] {} resolved {} by {}: {} receives {:.2}",
                    n.contract_id, n.outcome, n.creator_name, n.user_id, n.payout
                );
            }
            NotificationMessage::Shutdown => {
                info!("[NOTIFY] worker shutdown complete");
                break;
            }
        }
    }
}
