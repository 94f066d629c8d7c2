//! Change-feed messages and the live events they produce.
//!
//! The write pipeline publishes one message per save or delete on a
//! channel named `<applicationId><topic>`. Each message is inflated into a
//! [`ChangeEvent`] and classified per subscription into a [`LiveEventKind`].

use serde::Deserialize;
use serde_json::Value;

use super::LiveObject;
use crate::error::LiveQueryError;

/// Logical topics of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTopic {
    /// An object was created or updated.
    AfterSave,
    /// An object was deleted.
    AfterDelete,
    /// Cached roles for a user must be dropped.
    ClearCache,
}

impl ChangeTopic {
    /// All topics a live-query server listens on.
    pub const ALL: [Self; 3] = [Self::AfterSave, Self::AfterDelete, Self::ClearCache];

    /// Returns the topic suffix as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AfterSave => "afterSave",
            Self::AfterDelete => "afterDelete",
            Self::ClearCache => "clearCache",
        }
    }

    /// Returns the full channel name for an application.
    #[must_use]
    pub fn channel(self, application_id: &str) -> String {
        format!("{application_id}{}", self.as_str())
    }

    /// Resolves a channel name back to its topic.
    #[must_use]
    pub fn from_channel(application_id: &str, channel: &str) -> Option<Self> {
        let suffix = channel.strip_prefix(application_id)?;
        Self::parse(suffix)
    }

    /// Parses a bare topic name (`afterSave`, `afterDelete`, `clearCache`).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeMessage {
    current_parse_object: Value,
    #[serde(default)]
    original_parse_object: Option<Value>,
}

/// A save or delete as seen by the live-query engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Object state after the write (the deleted state for deletes).
    pub current: LiveObject,
    /// Object state before the write, absent for creations.
    pub original: Option<LiveObject>,
}

impl ChangeEvent {
    /// Inflates a change-feed payload.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::InvalidRequest`] if the payload is not
    /// JSON or either snapshot is malformed.
    pub fn from_payload(payload: &str) -> Result<Self, LiveQueryError> {
        let raw: RawChangeMessage = serde_json::from_str(payload)
            .map_err(|e| LiveQueryError::InvalidRequest(format!("malformed change message: {e}")))?;
        let current = LiveObject::from_value(raw.current_parse_object)?;
        let original = match raw.original_parse_object {
            None | Some(Value::Null) => None,
            Some(value) => Some(LiveObject::from_value(value)?),
        };
        Ok(Self { current, original })
    }

    /// Returns the class the change belongs to.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.current.class_name()
    }
}

/// Payload of the `clearCache` topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheMessage {
    /// User whose cached roles are stale.
    pub user_id: String,
}

/// Live event pushed to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveEventKind {
    /// A new object matches.
    Create,
    /// An existing object started matching.
    Enter,
    /// A matching object changed and still matches.
    Update,
    /// A matching object changed and no longer matches.
    Leave,
    /// A matching object was deleted.
    Delete,
}

impl LiveEventKind {
    /// Classifies a save for one subscriber from the (authorized) match
    /// results on the original and current snapshots.
    #[must_use]
    pub const fn classify_save(
        original_matched: bool,
        current_matched: bool,
        original_present: bool,
    ) -> Option<Self> {
        match (original_matched, current_matched) {
            (true, true) => Some(Self::Update),
            (true, false) => Some(Self::Leave),
            (false, true) if original_present => Some(Self::Enter),
            (false, true) => Some(Self::Create),
            (false, false) => None,
        }
    }

    /// Returns the op name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Enter => "enter",
            Self::Update => "update",
            Self::Leave => "leave",
            Self::Delete => "delete",
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(
            LiveEventKind::classify_save(true, true, true),
            Some(LiveEventKind::Update)
        );
        assert_eq!(
            LiveEventKind::classify_save(true, false, true),
            Some(LiveEventKind::Leave)
        );
        assert_eq!(
            LiveEventKind::classify_save(false, true, true),
            Some(LiveEventKind::Enter)
        );
        assert_eq!(
            LiveEventKind::classify_save(false, true, false),
            Some(LiveEventKind::Create)
        );
        assert_eq!(LiveEventKind::classify_save(false, false, true), None);
    }

    #[test]
    fn inflates_save_without_original() {
        let payload = r#"{"currentParseObject":{"className":"Note","objectId":"N1"}}"#;
        let Ok(event) = ChangeEvent::from_payload(payload) else {
            panic!("payload should inflate");
        };
        assert_eq!(event.class_name(), "Note");
        assert!(event.original.is_none());
    }

    #[test]
    fn rejects_payload_without_object() {
        assert!(ChangeEvent::from_payload(r#"{"foo":1}"#).is_err());
        assert!(ChangeEvent::from_payload("not json").is_err());
        assert!(
            ChangeEvent::from_payload(
                r#"{"currentParseObject":{"className":"Note","objectId":"N1"},"originalParseObject":{"objectId":"N1"}}"#
            )
            .is_err()
        );
    }

    #[test]
    fn topic_channels_round_trip() {
        for topic in ChangeTopic::ALL {
            let channel = topic.channel("myApp");
            assert_eq!(ChangeTopic::from_channel("myApp", &channel), Some(topic));
        }
        assert_eq!(ChangeTopic::from_channel("myApp", "otherafterSave"), None);
        assert_eq!(LiveEventKind::Leave.as_str(), "leave");
    }
}
