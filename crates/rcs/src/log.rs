//! Immutable commit/snapshot logs and the `CommitWriter` protocol
//!
//! A log records one logical transaction: author, message, free-form
//! metadata, and an ordered list of per-resource change entries. It is
//! written exactly once and never modified; a failed entry carries an
//! `error` attribute instead of aborting its siblings.

use crate::live::RcsHandler;
use crate::manager::RevisionStoreManager;
use crate::xml::{attributes, emit, text_element};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use rcs_core::{LogKind, RcsError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The per-resource operation a change entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeOp::Create),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One per-resource change entry in a log
#[derive(Debug, Clone)]
pub struct Change {
    pub op: ChangeOp,
    /// Stable id; absent only when resolution itself failed
    pub uuid: Option<String>,
    /// Path at commit time; resolved lazily from the uuid when not queued
    pub uri: Option<String>,
    /// Folder of the revision this change produced (successful entries)
    pub revision_path: Option<PathBuf>,
    /// Failure description (failed entries); never set together with a path
    pub error: Option<String>,
}

/// An immutable commit or snapshot record
#[derive(Debug, Clone)]
pub struct ChangeLog {
    /// Lexically-sortable, collision-checked id
    pub id: String,
    pub kind: LogKind,
    pub author: Option<String>,
    pub message: Option<String>,
    pub metadata: Vec<(String, String)>,
    /// Entries in the order they were queued
    pub changes: Vec<Change>,
}

impl ChangeLog {
    /// Write the log's XML file (once; the file is never modified after)
    pub fn write_xml(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| RcsError::io(path, e))?;
        let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);

        emit(&mut writer, path, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let name = self.kind.element_name();
        let mut root = BytesStart::new(name);
        root.push_attribute(("id", self.id.as_str()));
        emit(&mut writer, path, Event::Start(root))?;

        if let Some(author) = &self.author {
            text_element(&mut writer, path, "author", author)?;
        }
        if let Some(message) = &self.message {
            text_element(&mut writer, path, "message", message)?;
        }
        for (key, value) in &self.metadata {
            let mut e = BytesStart::new("metadata");
            e.push_attribute(("key", key.as_str()));
            emit(&mut writer, path, Event::Start(e))?;
            emit(
                &mut writer,
                path,
                Event::Text(quick_xml::events::BytesText::new(value)),
            )?;
            emit(&mut writer, path, Event::End(BytesEnd::new("metadata")))?;
        }

        for change in &self.changes {
            let mut e = BytesStart::new("entry");
            e.push_attribute(("operation", change.op.as_str()));
            if let Some(uuid) = &change.uuid {
                e.push_attribute(("id", uuid.as_str()));
            }
            if let Some(uri) = &change.uri {
                e.push_attribute(("uri", uri.as_str()));
            }
            if let Some(rev_path) = &change.revision_path {
                e.push_attribute(("path", rev_path.display().to_string().as_str()));
            }
            if let Some(error) = &change.error {
                e.push_attribute(("error", error.as_str()));
            }
            emit(&mut writer, path, Event::Empty(e))?;
        }

        emit(&mut writer, path, Event::End(BytesEnd::new(name)))?;
        writer
            .into_inner()
            .flush()
            .map_err(|e| RcsError::io(path, e))
    }

    /// Read a log back from disk
    pub fn read_xml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RcsError::io(path, e))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut id = String::new();
        let mut kind = None;
        let mut author = None;
        let mut message = None;
        let mut metadata = Vec::new();
        let mut changes = Vec::new();

        let mut leaf: Option<String> = None;
        let mut metadata_key: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"commit" | b"snapshot" => {
                        kind = Some(if e.name().as_ref() == b"commit" {
                            LogKind::Commit
                        } else {
                            LogKind::Snapshot
                        });
                        if let Some((_, value)) = attributes(&e, path)?
                            .into_iter()
                            .find(|(k, _)| k == "id")
                        {
                            id = value;
                        }
                    }
                    b"metadata" => {
                        metadata_key = attributes(&e, path)?
                            .into_iter()
                            .find(|(k, _)| k == "key")
                            .map(|(_, v)| v);
                    }
                    b"entry" => changes.push(parse_entry(&e, path)?),
                    name => leaf = Some(String::from_utf8_lossy(name).into_owned()),
                },
                Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"entry" => changes.push(parse_entry(&e, path)?),
                    b"metadata" => {
                        if let Some((_, key)) = attributes(&e, path)?
                            .into_iter()
                            .find(|(k, _)| k == "key")
                        {
                            metadata.push((key, String::new()));
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| RcsError::xml(path, e.to_string()))?
                        .into_owned();
                    if let Some(key) = metadata_key.take() {
                        metadata.push((key, text));
                        continue;
                    }
                    match leaf.as_deref() {
                        Some("author") => author = Some(text),
                        Some("message") => message = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    // An element with no text body still read a value: it
                    // is the empty string, not an absent field.
                    match e.name().as_ref() {
                        b"metadata" => {
                            if let Some(key) = metadata_key.take() {
                                metadata.push((key, String::new()));
                            }
                        }
                        b"author" => {
                            if leaf.take().is_some() && author.is_none() {
                                author = Some(String::new());
                            }
                        }
                        b"message" => {
                            if leaf.take().is_some() && message.is_none() {
                                message = Some(String::new());
                            }
                        }
                        _ => leaf = None,
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(RcsError::xml(path, e.to_string())),
            }
        }

        let kind = kind.ok_or_else(|| RcsError::xml(path, "missing commit/snapshot root"))?;
        Ok(Self {
            id,
            kind,
            author,
            message,
            metadata,
            changes,
        })
    }
}

fn parse_entry(e: &BytesStart, path: &Path) -> Result<Change> {
    let mut change = Change {
        op: ChangeOp::Update,
        uuid: None,
        uri: None,
        revision_path: None,
        error: None,
    };
    let mut saw_op = false;
    for (key, value) in attributes(e, path)? {
        match key.as_str() {
            "operation" => {
                change.op = ChangeOp::from_str(&value)
                    .ok_or_else(|| RcsError::xml(path, format!("unknown operation {value:?}")))?;
                saw_op = true;
            }
            "id" => change.uuid = Some(value),
            "uri" => change.uri = Some(value),
            "path" => change.revision_path = Some(PathBuf::from(value)),
            "error" => change.error = Some(value),
            _ => {}
        }
    }
    if !saw_op {
        return Err(RcsError::xml(path, "entry without operation attribute"));
    }
    Ok(change)
}

/// Accumulated state of an open commit, handed to the manager on `done()`
pub(crate) struct CommitParts {
    pub author: Option<String>,
    pub message: Option<String>,
    pub metadata: Vec<(String, String)>,
    pub actions: Vec<(ChangeOp, String)>,
}

/// Builder/writer for one commit
///
/// Queue actions, then `done()` to finalize or `abort()` to roll back. A
/// writer dropped without either behaves as `abort()`: nothing reaches disk
/// and the manager forgets it.
pub struct CommitWriter<'a> {
    manager: &'a RevisionStoreManager,
    handler: Arc<dyn RcsHandler>,
    token: u64,
    author: Option<String>,
    message: Option<String>,
    metadata: Vec<(String, String)>,
    actions: Vec<(ChangeOp, String)>,
    closed: bool,
}

impl<'a> CommitWriter<'a> {
    pub(crate) fn new(
        manager: &'a RevisionStoreManager,
        handler: Arc<dyn RcsHandler>,
        token: u64,
    ) -> Self {
        Self {
            manager,
            handler,
            token,
            author: None,
            message: None,
            metadata: Vec::new(),
            actions: Vec::new(),
            closed: false,
        }
    }

    pub fn author(&mut self, author: impl Into<String>) -> &mut Self {
        self.author = Some(author.into());
        self
    }

    pub fn message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Queue a create action for the resource at `uri`
    pub fn create(&mut self, uri: impl Into<String>) -> &mut Self {
        self.actions.push((ChangeOp::Create, uri.into()));
        self
    }

    /// Queue an update action for the resource at `uri`
    pub fn update(&mut self, uri: impl Into<String>) -> &mut Self {
        self.actions.push((ChangeOp::Update, uri.into()));
        self
    }

    /// Queue a delete action (records a tombstone revision)
    pub fn delete(&mut self, uri: impl Into<String>) -> &mut Self {
        self.actions.push((ChangeOp::Delete, uri.into()));
        self
    }

    /// Number of queued actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Finalize: allocate a log id, capture one revision per queued action,
    /// write the log file, and notify listeners
    pub fn done(mut self) -> Result<ChangeLog> {
        self.closed = true;
        let parts = CommitParts {
            author: self.author.take(),
            message: self.message.take(),
            metadata: std::mem::take(&mut self.metadata),
            actions: std::mem::take(&mut self.actions),
        };
        self.manager
            .finalize_commit(self.token, parts, Arc::clone(&self.handler))
    }

    /// Roll back: discard all queued actions, write nothing
    pub fn abort(mut self) {
        self.closed = true;
        self.manager.rollback(self.token);
    }
}

impl Drop for CommitWriter<'_> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(token = self.token, "commit writer dropped without done(), rolling back");
            self.manager.rollback(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_log() -> ChangeLog {
        ChangeLog {
            id: "20260830-101501-123".to_string(),
            kind: LogKind::Commit,
            author: Some("alice".to_string()),
            message: Some("nightly ingest <batch 7>".to_string()),
            metadata: vec![("ticket".to_string(), "DB-42".to_string())],
            changes: vec![
                Change {
                    op: ChangeOp::Create,
                    uuid: Some("u-1".to_string()),
                    uri: Some("/db/a/x.xml".to_string()),
                    revision_path: Some(PathBuf::from("uuids/aaaa/bbbb/u-1/170001")),
                    error: None,
                },
                Change {
                    op: ChangeOp::Delete,
                    uuid: Some("u-2".to_string()),
                    uri: Some("/db/a/y.xml".to_string()),
                    revision_path: None,
                    error: Some("resource vanished during capture".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_log_roundtrip() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("20260830-101501-123");
        let original = sample_log();

        original.write_xml(&path)?;
        let loaded = ChangeLog::read_xml(&path)?;

        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.kind, LogKind::Commit);
        assert_eq!(loaded.author, original.author);
        assert_eq!(loaded.message, original.message);
        assert_eq!(loaded.metadata, original.metadata);
        assert_eq!(loaded.changes.len(), 2);

        assert_eq!(loaded.changes[0].op, ChangeOp::Create);
        assert_eq!(loaded.changes[0].uuid.as_deref(), Some("u-1"));
        assert!(loaded.changes[0].revision_path.is_some());
        assert!(loaded.changes[0].error.is_none());

        assert_eq!(loaded.changes[1].op, ChangeOp::Delete);
        assert!(loaded.changes[1].revision_path.is_none());
        assert_eq!(
            loaded.changes[1].error.as_deref(),
            Some("resource vanished during capture")
        );
        Ok(())
    }

    #[test]
    fn test_snapshot_root_element() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("snap");
        let mut log = sample_log();
        log.kind = LogKind::Snapshot;

        log.write_xml(&path)?;
        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("<snapshot id=\"20260830-101501-123\">"));
        assert_eq!(ChangeLog::read_xml(&path)?.kind, LogKind::Snapshot);
        Ok(())
    }

    #[test]
    fn test_empty_fields_round_trip_as_empty_strings() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("log");
        let mut log = sample_log();
        log.author = Some(String::new());
        log.message = Some(String::new());
        log.metadata = vec![
            ("origin".to_string(), String::new()),
            ("ticket".to_string(), "DB-42".to_string()),
        ];

        log.write_xml(&path)?;
        let loaded = ChangeLog::read_xml(&path)?;

        assert_eq!(loaded.author.as_deref(), Some(""));
        assert_eq!(loaded.message.as_deref(), Some(""));
        assert_eq!(loaded.metadata, log.metadata);
        Ok(())
    }

    #[test]
    fn test_empty_metadata_does_not_swallow_next_element() {
        let content = r#"<commit id="x">
            <metadata key="a"></metadata>
            <message>keep me</message>
        </commit>"#;
        let loaded = ChangeLog::parse(content, Path::new("x")).unwrap();
        assert_eq!(loaded.metadata, vec![("a".to_string(), String::new())]);
        assert_eq!(loaded.message.as_deref(), Some("keep me"));
    }

    #[test]
    fn test_entry_requires_operation() {
        let content = r#"<commit id="x"><entry uri="/db/a"/></commit>"#;
        let err = ChangeLog::parse(content, Path::new("x")).unwrap_err();
        assert!(matches!(err, RcsError::Xml { .. }));
    }
}
