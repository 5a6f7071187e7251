use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of an upstream event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceEventKind {
    /// Placeholder for events carrying no category.
    #[default]
    None,
    /// Money donation.
    Donation,
    /// New subscription.
    Subscription,
    /// Renewed subscription.
    Resubscription,
    /// Single gifted subscription.
    GiftSubscription,
    /// Batch of gifted subscriptions.
    MultiGiftSubscription,
    /// Incoming raid.
    Raid,
    /// Chat command issued by a viewer.
    ChatCommand,
}

/// Platform-independent event fed to the rule engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceEvent {
    /// Event category.
    pub kind: SourceEventKind,
    /// Monetary amount or count, depending on the kind.
    pub amount: f64,
    /// ISO currency code for donations.
    pub currency: String,
    /// Display name of whoever triggered the event.
    pub name: String,
    /// Attached message.
    pub message: String,
    /// Channel or campaign the event came from.
    pub channel: String,
}

impl SourceEvent {
    /// Creates an event with empty currency and channel.
    #[must_use]
    pub fn new(
        kind: SourceEventKind,
        name: impl Into<String>,
        amount: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            amount,
            name: name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Donation in `currency`.
    #[must_use]
    pub fn donation(name: impl Into<String>, amount: f64, currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            ..Self::new(SourceEventKind::Donation, name, amount, "")
        }
    }

    /// Sets the origin channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from {}, amount {}", self.kind, self.name, self.amount)?;
        if !self.currency.is_empty() {
            write!(f, " {}", self.currency)?;
        }
        if !self.message.is_empty() {
            write!(f, " - msg {}", self.message)?;
        }
        Ok(())
    }
}

/// Event tagged with the workflow and console source that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEnvelope {
    /// Rule workflow evaluated for this event.
    pub workflow: String,
    /// Console source tag of the producer (`test`, `twitch`, ...).
    pub source: String,
    /// The event itself.
    pub event: SourceEvent,
}

impl SourceEnvelope {
    /// Wraps `event`.
    #[must_use]
    pub fn new(workflow: impl Into<String>, source: impl Into<String>, event: SourceEvent) -> Self {
        Self {
            workflow: workflow.into(),
            source: source.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_compact_summary() {
        let event = SourceEvent::donation("TestRig", 12.5, "USD").with_message("hi");
        assert_eq!(
            event.to_string(),
            "Donation from TestRig, amount 12.5 USD - msg hi"
        );
        let raid = SourceEvent::new(SourceEventKind::Raid, "crew", 40.0, "");
        assert_eq!(raid.to_string(), "Raid from crew, amount 40");
    }
}
