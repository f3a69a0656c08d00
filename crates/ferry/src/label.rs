use std::fmt;

use thiserror::Error;

/// Joins caller and callee names in a control channel label.
pub const LABEL_SEPARATOR: &str = "-<>-";
/// Sits between the control label and the file name in a file channel label.
pub const FILE_LABEL_MARKER: &str = "-file-";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("channel label '{0}' has no participant separator")]
    MissingSeparator(String),
    #[error("channel label '{0}' has an empty participant name")]
    EmptyParticipant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    File,
}

/// Parsed data channel label.
///
/// Control: `<caller>-<>-<callee>`.
/// File: `<caller>-<>-<callee>-file-<fileName>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelLabel {
    caller: String,
    callee: String,
    file_name: Option<String>,
}

impl ChannelLabel {
    pub fn control(caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            callee: callee.into(),
            file_name: None,
        }
    }

    /// File channels hang off the control label of the call they belong to.
    pub fn file(&self, file_name: impl Into<String>) -> Self {
        Self {
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            file_name: Some(file_name.into()),
        }
    }

    pub fn parse(label: &str) -> Result<Self, LabelError> {
        let (caller, rest) = label
            .split_once(LABEL_SEPARATOR)
            .ok_or_else(|| LabelError::MissingSeparator(label.to_string()))?;
        let (callee, file_name) = match rest.split_once(FILE_LABEL_MARKER) {
            Some((callee, file_name)) => (callee, Some(file_name.to_string())),
            None => (rest, None),
        };
        if caller.is_empty() || callee.is_empty() {
            return Err(LabelError::EmptyParticipant(label.to_string()));
        }
        Ok(Self {
            caller: caller.to_string(),
            callee: callee.to_string(),
            file_name,
        })
    }

    /// Classifies a raw label against this control label. Unlike [`parse`],
    /// this stays exact when a participant name itself contains the file
    /// marker.
    ///
    /// [`parse`]: ChannelLabel::parse
    pub fn resolve(&self, label: &str) -> Option<ChannelLabel> {
        let control = self.control_label();
        let rest = label.strip_prefix(control.to_string().as_str())?;
        if rest.is_empty() {
            return Some(control);
        }
        rest.strip_prefix(FILE_LABEL_MARKER)
            .map(|file_name| control.file(file_name))
    }

    pub fn kind(&self) -> ChannelKind {
        if self.file_name.is_some() {
            ChannelKind::File
        } else {
            ChannelKind::Control
        }
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// The label of the control channel this label belongs to.
    pub fn control_label(&self) -> ChannelLabel {
        Self::control(self.caller.clone(), self.callee.clone())
    }

    /// Drops the local name from the participant pair and returns the other one.
    pub fn remote_name(&self, local_name: &str) -> Option<&str> {
        if self.caller == local_name {
            Some(&self.callee)
        } else if self.callee == local_name {
            Some(&self.caller)
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.caller, LABEL_SEPARATOR, self.callee)?;
        if let Some(file_name) = &self.file_name {
            write!(f, "{FILE_LABEL_MARKER}{file_name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_label_round_trips() {
        let label = ChannelLabel::control("alice", "bob");
        assert_eq!(label.to_string(), "alice-<>-bob");
        let parsed = ChannelLabel::parse("alice-<>-bob").expect("parse");
        assert_eq!(parsed, label);
        assert_eq!(parsed.kind(), ChannelKind::Control);
    }

    #[test]
    fn file_label_keeps_control_prefix() {
        let control = ChannelLabel::control("alice", "bob");
        let file = control.file("holiday photos.zip");
        assert_eq!(file.to_string(), "alice-<>-bob-file-holiday photos.zip");

        let parsed = ChannelLabel::parse(&file.to_string()).expect("parse");
        assert_eq!(parsed.kind(), ChannelKind::File);
        assert_eq!(parsed.file_name(), Some("holiday photos.zip"));
        assert_eq!(parsed.control_label(), control);
    }

    #[test]
    fn file_names_may_contain_the_marker() {
        let parsed = ChannelLabel::parse("a-<>-b-file-x-file-y.txt").expect("parse");
        assert_eq!(parsed.callee(), "b");
        assert_eq!(parsed.file_name(), Some("x-file-y.txt"));
    }

    #[test]
    fn resolve_handles_names_containing_the_marker() {
        let control = ChannelLabel::control("alice", "my-file-box");
        // Plain parsing splits at the first marker and gets this wrong.
        assert_eq!(
            ChannelLabel::parse("alice-<>-my-file-box").expect("parse").kind(),
            ChannelKind::File
        );

        let resolved = control.resolve("alice-<>-my-file-box").expect("control");
        assert_eq!(resolved.kind(), ChannelKind::Control);
        assert_eq!(resolved.callee(), "my-file-box");

        let file = control
            .resolve("alice-<>-my-file-box-file-notes.txt")
            .expect("file");
        assert_eq!(file.kind(), ChannelKind::File);
        assert_eq!(file.file_name(), Some("notes.txt"));
        assert_eq!(file.control_label(), control);

        assert_eq!(control.resolve("alice-<>-my-file-boxes"), None);
        assert_eq!(control.resolve("bob-<>-my-file-box"), None);
    }

    #[test]
    fn remote_name_drops_local_side() {
        let label = ChannelLabel::parse("12345-<>-67890").expect("parse");
        assert_eq!(label.remote_name("12345"), Some("67890"));
        assert_eq!(label.remote_name("67890"), Some("12345"));
        assert_eq!(label.remote_name("someone-else"), None);
    }

    #[test]
    fn rejects_malformed_labels() {
        assert!(matches!(
            ChannelLabel::parse("no separator here"),
            Err(LabelError::MissingSeparator(_))
        ));
        assert!(matches!(
            ChannelLabel::parse("-<>-bob"),
            Err(LabelError::EmptyParticipant(_))
        ));
    }
}
