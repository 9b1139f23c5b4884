//! Broker destination naming.

use mats_trace::{Channel, MessagingModel};

/// Broker-level destination type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    /// Point-to-point queue.
    Queue,
    /// Publish/subscribe topic.
    Topic,
}

/// A physical broker destination.
///
/// Every endpoint receives on `<prefix><endpointId>`; subsequent stages of
/// endpoint `E` with index `i > 0` receive on `<prefix>E.stage<i>`. Topics
/// use the same prefix with a topic destination type. Since stage ids carry
/// the `.stage<i>` suffix themselves, a destination name is always
/// `<prefix><channel id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Queue or topic.
    pub kind: DestinationKind,
    /// Fully prefixed destination name.
    pub name: String,
}

impl Destination {
    /// Creates a queue destination from a fully prefixed name.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    /// Creates a topic destination from a fully prefixed name.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    /// Derives the destination for a logical channel under `prefix`.
    pub fn for_channel(prefix: &str, channel: &Channel) -> Self {
        let name = format!("{prefix}{}", channel.id);
        match channel.model {
            MessagingModel::Queue => Self::queue(name),
            MessagingModel::Topic => Self::topic(name),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue:{}", self.name),
            DestinationKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mapping_applies_prefix_and_kind() {
        let q = Destination::for_channel("mats.", &Channel::queue("orders.place"));
        assert_eq!(q, Destination::queue("mats.orders.place"));

        let t = Destination::for_channel("mats.", &Channel::topic("evt.x"));
        assert_eq!(t, Destination::topic("mats.evt.x"));
    }

    #[test]
    fn stage_channels_name_their_stage_queue() {
        let d = Destination::for_channel("mats.", &Channel::queue("orders.place.stage2"));
        assert_eq!(d.name, "mats.orders.place.stage2");
    }
}
