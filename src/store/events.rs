//! Event log records
//!
//! Every accepted command leaves one human-readable line in the session's
//! `<session>.events.log`. Lines are never rewritten.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::Node;

/// Kind of event written to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    SessionStart,
    SessionResume,
    SessionSave,
    SessionRestoredFrom,
    AddChild,
    AddSibling,
    Rename,
    Focus,
    Complete,
    Delete,
    ReturnParent,
    Undo,
    Redo,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::SessionStart => "SESSION_START",
            EventAction::SessionResume => "SESSION_RESUME",
            EventAction::SessionSave => "SESSION_SAVE",
            EventAction::SessionRestoredFrom => "SESSION_RESTORED_FROM",
            EventAction::AddChild => "ADD_CHILD",
            EventAction::AddSibling => "ADD_SIBLING",
            EventAction::Rename => "RENAME",
            EventAction::Focus => "FOCUS",
            EventAction::Complete => "COMPLETE",
            EventAction::Delete => "DELETE",
            EventAction::ReturnParent => "RETURN_PARENT",
            EventAction::Undo => "UNDO",
            EventAction::Redo => "REDO",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node-related fields of an event line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDetails {
    pub node_id: Option<String>,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    /// Free-form trailing text, e.g. `snapshot=...`
    pub extra: Option<String>,
}

impl EventDetails {
    /// Details describing `node`: its id, parent and title
    pub fn for_node(node: &Node) -> Self {
        Self {
            node_id: Some(node.id.clone()),
            parent_id: node.parent_id.clone(),
            title: Some(node.title.clone()),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

/// Escapes a title so the record stays on one line and the quotes stay balanced
pub fn escape_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

/// Formats one log line, without the trailing newline
pub fn format_event_line(
    at: DateTime<Utc>,
    action: EventAction,
    details: &EventDetails,
) -> String {
    let mut line = format!(
        "[{}] {} nodeId={} parentId={} title=\"{}\"",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        action,
        details.node_id.as_deref().unwrap_or("none"),
        details.parent_id.as_deref().unwrap_or("none"),
        escape_title(details.title.as_deref().unwrap_or("")),
    );
    if let Some(extra) = details.extra.as_deref().filter(|e| !e.is_empty()) {
        line.push(' ');
        line.push_str(extra);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_format_full_line() {
        let details = EventDetails {
            node_id: Some("n-1".to_string()),
            parent_id: Some("n-0".to_string()),
            title: Some("Say \"hi\"".to_string()),
            extra: Some("from=\"old\"".to_string()),
        };
        assert_eq!(
            format_event_line(at(), EventAction::Rename, &details),
            r#"[2024-03-09T14:05:07.000Z] RENAME nodeId=n-1 parentId=n-0 title="Say \"hi\"" from="old""#
        );
    }

    #[test]
    fn test_format_defaults_to_none() {
        assert_eq!(
            format_event_line(at(), EventAction::SessionSave, &EventDetails::default()),
            "[2024-03-09T14:05:07.000Z] SESSION_SAVE nodeId=none parentId=none title=\"\""
        );
    }

    #[test]
    fn test_escape_keeps_single_line() {
        let escaped = escape_title("line one\nline \\two");
        assert!(!escaped.contains('\n'));
        assert_eq!(escaped, "line one\\nline \\\\two");
    }

    #[test]
    fn test_details_for_root_has_no_parent() {
        let node = Node::new("root".to_string(), None, "Root");
        let details = EventDetails::for_node(&node).with_extra("snapshot=abc");
        assert_eq!(details.parent_id, None);
        assert_eq!(details.extra.as_deref(), Some("snapshot=abc"));
    }
}
