//! Notification channel abstraction (§6.2 `notifications.*`). Delivery to
//! external channels is out of scope (§1); only `console` is implemented
//! concretely, the way a CLI's own stdout banner needs no adapter.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Console,
    Slack,
    Email,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationConfig {
    pub enabled: bool,
    pub on_anomaly: bool,
    pub on_complete: bool,
    pub channel: Option<Channel>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str) {
        println!("[notify] {message}");
    }
}

/// Channels other than `console` are acknowledged but not delivered; this
/// crate's scope stops at the uniform `Notifier` interface (§1).
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _message: &str) {}
}

pub fn notifier_for(channel: Option<Channel>) -> Box<dyn Notifier> {
    match channel {
        Some(Channel::Console) | None => Box::new(ConsoleNotifier),
        Some(Channel::Slack) | Some(Channel::Email) => Box::new(NullNotifier),
    }
}
