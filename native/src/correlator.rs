use log::{debug, warn};
use std::collections::HashMap;

use crate::ipc::protocol::MessageKind;

/// Tag stamped into `arg1` of an outbound command and echoed by return-status.
///
/// Tags are kind-level: two in-flight requests of the same kind share a tag
/// and their status replies cannot be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationTag(i32);

impl CorrelationTag {
    /// Reserved for the registration handshake.
    pub const REGISTRATION: Self = Self(MessageKind::RegisterClient as i32);

    pub fn for_kind(kind: MessageKind) -> Self {
        Self(kind.code())
    }

    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn kind(self) -> Option<MessageKind> {
        MessageKind::from_i32(self.0)
    }
}

/// What a return-status reply resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Registration { status: i32 },
    Informational { kind: Option<MessageKind>, status: i32 },
}

/// Tracks outstanding status-answered requests per tag. No retries, no
/// timeouts: a reply that never arrives stays outstanding until `clear`.
#[derive(Debug, Default)]
pub struct Correlator {
    in_flight: HashMap<CorrelationTag, u32>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent request that will be answered by return-status.
    pub fn track(&mut self, tag: CorrelationTag) {
        let outstanding = self.in_flight.entry(tag).or_insert(0);
        *outstanding += 1;
        if *outstanding > 1 {
            warn!(
                "[CORRELATOR] {} requests with tag {} in flight, their replies are indistinguishable",
                outstanding,
                tag.value()
            );
        }
    }

    pub fn resolve(&mut self, tag: i32, status: i32) -> Resolution {
        let tag = CorrelationTag::from_raw(tag);

        match self.in_flight.get_mut(&tag) {
            Some(outstanding) if *outstanding > 1 => *outstanding -= 1,
            Some(_) => {
                self.in_flight.remove(&tag);
            }
            None => debug!("[CORRELATOR] Status for untracked tag {}", tag.value()),
        }

        if tag == CorrelationTag::REGISTRATION {
            Resolution::Registration { status }
        } else {
            debug!("[CORRELATOR] Tag {} resolved with status {}", tag.value(), status);
            Resolution::Informational {
                kind: tag.kind(),
                status,
            }
        }
    }

    pub fn outstanding(&self, tag: CorrelationTag) -> u32 {
        self.in_flight.get(&tag).copied().unwrap_or(0)
    }

    /// Forget everything outstanding; used on session teardown.
    pub fn clear(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(
                "[CORRELATOR] Dropping {} outstanding tags",
                self.in_flight.len()
            );
        }
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_tag_is_reserved() {
        let mut correlator = Correlator::new();
        assert_eq!(
            correlator.resolve(CorrelationTag::REGISTRATION.value(), 0),
            Resolution::Registration { status: 0 }
        );
    }

    #[test]
    fn other_tags_are_informational() {
        let mut correlator = Correlator::new();
        let tag = CorrelationTag::for_kind(MessageKind::ConfigureImage);
        correlator.track(tag);

        assert_eq!(
            correlator.resolve(tag.value(), -1),
            Resolution::Informational {
                kind: Some(MessageKind::ConfigureImage),
                status: -1
            }
        );
        assert_eq!(correlator.outstanding(tag), 0);
    }

    #[test]
    fn same_kind_requests_share_one_counter() {
        let mut correlator = Correlator::new();
        let tag = CorrelationTag::for_kind(MessageKind::RunUserFunction);
        correlator.track(tag);
        correlator.track(tag);
        assert_eq!(correlator.outstanding(tag), 2);

        correlator.resolve(tag.value(), 0);
        assert_eq!(correlator.outstanding(tag), 1);
    }

    #[test]
    fn unknown_tag_resolves_without_kind() {
        let mut correlator = Correlator::new();
        assert_eq!(
            correlator.resolve(77, 3),
            Resolution::Informational {
                kind: None,
                status: 3
            }
        );
    }

    #[test]
    fn clear_forgets_outstanding() {
        let mut correlator = Correlator::new();
        let tag = CorrelationTag::for_kind(MessageKind::SetPatientInfo);
        correlator.track(tag);
        correlator.clear();
        assert_eq!(correlator.outstanding(tag), 0);
    }
}
