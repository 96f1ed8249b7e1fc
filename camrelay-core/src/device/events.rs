//! v4l2loopback client-usage events
//!
//! Two driver generations report consumers through a private event, with
//! different event numbers and opposite payload semantics:
//!
//! | Driver | Event type | Payload meaning |
//! |---|---|---|
//! | 0.12.x | `V4L2_EVENT_PRIVATE_START` | `count > 0`: a client is attached |
//! | 0.13+ | `V4L2_EVENT_PRIVATE_START + 0x08E00000 + 1` | `count == 0`: a client is attached |
//!
//! The negotiated scheme is kept by the monitor and decoding is a pure
//! function of (scheme, event).

use v4l::v4l_sys::V4L2_EVENT_PRIVATE_START;

/// Event type of the 0.12.x client-usage event
pub const LEGACY_EVENT_TYPE: u32 = V4L2_EVENT_PRIVATE_START;

/// Event type of the 0.13+ client-usage event
pub const MODERN_EVENT_TYPE: u32 = V4L2_EVENT_PRIVATE_START + 0x08E0_0000 + 1;

/// Raw client-usage notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientUsageEvent {
    /// V4L2 event type
    pub event_type: u32,
    /// First payload word
    pub count: u32,
}

/// Decoded meaning of a client-usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSignal {
    /// At least one consumer is attached
    Connected,
    /// No consumer is attached
    Disconnected,
}

/// How consumers are detected while idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventScheme {
    /// v4l2loopback 0.12.x event numbering
    Legacy,
    /// v4l2loopback 0.13+ event numbering
    Modern,
    /// No driver events; the opener census is polled
    #[default]
    Polling,
}

impl EventScheme {
    /// Schemes tried at subscribe time, in order
    pub const NEGOTIATION_ORDER: [EventScheme; 2] = [Self::Legacy, Self::Modern];

    /// Driver event type, `None` for polling
    pub fn event_type(&self) -> Option<u32> {
        match self {
            Self::Legacy => Some(LEGACY_EVENT_TYPE),
            Self::Modern => Some(MODERN_EVENT_TYPE),
            Self::Polling => None,
        }
    }

    /// Whether the driver delivers events under this scheme
    pub fn uses_events(&self) -> bool {
        self.event_type().is_some()
    }

    /// Decode an event under this scheme
    ///
    /// Events of any other type are not ours and decode to `None`.
    pub fn decode(&self, event: &ClientUsageEvent) -> Option<ClientSignal> {
        if self.event_type() != Some(event.event_type) {
            return None;
        }

        let connected = match self {
            Self::Legacy => event.count > 0,
            Self::Modern => event.count == 0,
            Self::Polling => return None,
        };

        Some(if connected {
            ClientSignal::Connected
        } else {
            ClientSignal::Disconnected
        })
    }
}

impl std::fmt::Display for EventScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "v4l2loopback 0.12 events"),
            Self::Modern => write!(f, "v4l2loopback 0.13+ events"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: u32, count: u32) -> ClientUsageEvent {
        ClientUsageEvent { event_type, count }
    }

    #[test]
    fn test_legacy_decoding() {
        let scheme = EventScheme::Legacy;
        assert_eq!(
            scheme.decode(&event(LEGACY_EVENT_TYPE, 1)),
            Some(ClientSignal::Connected)
        );
        assert_eq!(
            scheme.decode(&event(LEGACY_EVENT_TYPE, 3)),
            Some(ClientSignal::Connected)
        );
        assert_eq!(
            scheme.decode(&event(LEGACY_EVENT_TYPE, 0)),
            Some(ClientSignal::Disconnected)
        );
    }

    #[test]
    fn test_modern_decoding_is_inverted() {
        let scheme = EventScheme::Modern;
        assert_eq!(
            scheme.decode(&event(MODERN_EVENT_TYPE, 0)),
            Some(ClientSignal::Connected)
        );
        assert_eq!(
            scheme.decode(&event(MODERN_EVENT_TYPE, 1)),
            Some(ClientSignal::Disconnected)
        );
    }

    #[test]
    fn test_foreign_event_types_ignored() {
        assert_eq!(EventScheme::Legacy.decode(&event(MODERN_EVENT_TYPE, 1)), None);
        assert_eq!(EventScheme::Modern.decode(&event(LEGACY_EVENT_TYPE, 0)), None);
        assert_eq!(EventScheme::Polling.decode(&event(LEGACY_EVENT_TYPE, 1)), None);
    }

    #[test]
    fn test_event_type_constants() {
        assert_eq!(LEGACY_EVENT_TYPE, 0x0800_0000);
        assert_eq!(MODERN_EVENT_TYPE, 0x10E0_0001);
        assert!(!EventScheme::Polling.uses_events());
        assert_eq!(
            EventScheme::NEGOTIATION_ORDER,
            [EventScheme::Legacy, EventScheme::Modern]
        );
    }
}
