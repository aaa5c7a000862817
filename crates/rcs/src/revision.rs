//! Revision records and their on-disk XML metadata files
//!
//! One revision is one point-in-time state of a resource. Its metadata lives
//! in `revision.xml` inside the revision's folder; the content itself (for
//! documents) lives in the blob store under the recorded hash.

use crate::xml::{attributes, emit, parse_timestamp, render_timestamp, text_element};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use rcs_core::{ContentHash, RcsError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Metadata file name inside each revision folder
pub const METADATA_FILE: &str = "revision.xml";

/// What a revision snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// An XML document (content captured through the serializer)
    Xml,
    /// A binary document (content captured as raw bytes)
    Binary,
    /// A collection (metadata only, no content digest)
    Collection,
    /// A deletion marker (no content digest)
    Tombstone,
}

impl ResourceKind {
    /// Wire code used in the `type` element
    pub fn code(&self) -> &'static str {
        match self {
            ResourceKind::Xml => "xml",
            ResourceKind::Binary => "bin",
            ResourceKind::Collection => "col",
            ResourceKind::Tombstone => "del",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "xml" => Some(ResourceKind::Xml),
            "bin" => Some(ResourceKind::Binary),
            "col" => Some(ResourceKind::Collection),
            "del" => Some(ResourceKind::Tombstone),
            _ => None,
        }
    }

    /// Whether revisions of this kind carry a content digest
    pub fn has_content(&self) -> bool {
        matches!(self, ResourceKind::Xml | ResourceKind::Binary)
    }
}

/// One access-control entry under a permission block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    /// `USER` or `GROUP`
    pub target: String,
    /// Subject the entry applies to
    pub who: String,
    /// Access bits, octal
    pub mode: u32,
}

/// Ownership and POSIX mode captured with every revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub owner: String,
    pub group: String,
    pub mode: u32,
    pub acl: Vec<AclEntry>,
}

impl Default for Permission {
    fn default() -> Self {
        Self {
            owner: "admin".to_string(),
            group: "dba".to_string(),
            mode: 0o644,
            acl: Vec::new(),
        }
    }
}

/// One historical, content-addressed snapshot of a resource
#[derive(Debug, Clone)]
pub struct Revision {
    /// Stable surrogate id of the resource, constant across renames
    pub uuid: String,
    /// Folder name under the uuid dir; strictly increasing per uuid.
    /// Derived from the folder, never written into the metadata file.
    pub revision_id: u64,
    pub kind: ResourceKind,
    /// Content digest; absent for collections and tombstones
    pub hash: Option<ContentHash>,
    /// Back-reference to the commit/snapshot log that produced this revision
    pub log_path: String,
    pub file_name: String,
    /// Path of the resource at capture time
    pub file_path: String,
    /// Surrogate id of the containing collection; absent at the root
    pub parent_uuid: Option<String>,
    pub mime_type: String,
    /// Unix milliseconds
    pub created: i64,
    /// Unix milliseconds
    pub last_modified: i64,
    pub permission: Permission,
    /// Free-form resource metadata key/value pairs
    pub extension: Vec<(String, String)>,
}

impl Revision {
    /// Write `revision.xml` into the given revision folder
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(METADATA_FILE);
        let file = File::create(&path).map_err(|e| RcsError::io(&path, e))?;
        let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);
        let p = &path;

        emit(&mut writer, p, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("revision");
        root.push_attribute(("id", self.revision_id.to_string().as_str()));
        emit(&mut writer, p, Event::Start(root))?;

        text_element(&mut writer, p, "uuid", &self.uuid)?;
        text_element(&mut writer, p, "type", self.kind.code())?;
        if let Some(hash) = &self.hash {
            text_element(&mut writer, p, "hash", &hash.to_hex())?;
        }
        text_element(&mut writer, p, "log", &self.log_path)?;
        text_element(&mut writer, p, "file-name", &self.file_name)?;
        text_element(&mut writer, p, "file-path", &self.file_path)?;
        if let Some(parent) = &self.parent_uuid {
            text_element(&mut writer, p, "parent-uuid", parent)?;
        }
        text_element(&mut writer, p, "meta-type", &self.mime_type)?;
        text_element(&mut writer, p, "created", &render_timestamp(self.created))?;
        text_element(&mut writer, p, "lastModified", &render_timestamp(self.last_modified))?;

        let mut perm = BytesStart::new("permission");
        perm.push_attribute(("owner", self.permission.owner.as_str()));
        perm.push_attribute(("group", self.permission.group.as_str()));
        perm.push_attribute(("mode", format!("{:o}", self.permission.mode).as_str()));
        if self.permission.acl.is_empty() {
            emit(&mut writer, p, Event::Empty(perm))?;
        } else {
            emit(&mut writer, p, Event::Start(perm))?;
            for ace in &self.permission.acl {
                let mut e = BytesStart::new("ace");
                e.push_attribute(("target", ace.target.as_str()));
                e.push_attribute(("who", ace.who.as_str()));
                e.push_attribute(("mode", format!("{:o}", ace.mode).as_str()));
                emit(&mut writer, p, Event::Empty(e))?;
            }
            emit(&mut writer, p, Event::End(BytesEnd::new("permission")))?;
        }

        if !self.extension.is_empty() {
            emit(&mut writer, p, Event::Start(BytesStart::new("extension")))?;
            for (key, value) in &self.extension {
                let mut e = BytesStart::new("pair");
                e.push_attribute(("key", key.as_str()));
                emit(&mut writer, p, Event::Start(e))?;
                emit(
                    &mut writer,
                    p,
                    Event::Text(quick_xml::events::BytesText::new(value)),
                )?;
                emit(&mut writer, p, Event::End(BytesEnd::new("pair")))?;
            }
            emit(&mut writer, p, Event::End(BytesEnd::new("extension")))?;
        }

        emit(&mut writer, p, Event::End(BytesEnd::new("revision")))?;
        writer
            .into_inner()
            .flush()
            .map_err(|e| RcsError::io(&path, e))?;
        Ok(path)
    }

    /// Read a revision back from its folder
    ///
    /// Unknown elements are skipped; a missing `uuid` or `type` is a
    /// malformed file.
    pub fn read_from_dir(dir: &Path, revision_id: u64) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| RcsError::io(&path, e))?;
        Self::parse(&content, &path, revision_id)
    }

    fn parse(content: &str, path: &Path, revision_id: u64) -> Result<Self> {
        #[derive(PartialEq)]
        enum Section {
            Top,
            Permission,
            Extension,
        }

        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut uuid = None;
        let mut kind = None;
        let mut hash = None;
        let mut log_path = String::new();
        let mut file_name = String::new();
        let mut file_path = String::new();
        let mut parent_uuid = None;
        let mut mime_type = String::new();
        let mut created = 0i64;
        let mut last_modified = 0i64;
        let mut permission = Permission::default();
        let mut extension = Vec::new();

        let mut section = Section::Top;
        let mut leaf: Option<String> = None;
        let mut pair_key: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"permission" => {
                        read_permission_attrs(&e, path, &mut permission)?;
                        section = Section::Permission;
                    }
                    b"extension" => section = Section::Extension,
                    b"pair" if section == Section::Extension => {
                        pair_key = attributes(&e, path)?
                            .into_iter()
                            .find(|(k, _)| k == "key")
                            .map(|(_, v)| v);
                    }
                    name => leaf = Some(String::from_utf8_lossy(name).into_owned()),
                },
                Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"permission" => read_permission_attrs(&e, path, &mut permission)?,
                    b"ace" if section == Section::Permission => {
                        permission.acl.push(read_ace(&e, path)?);
                    }
                    b"pair" if section == Section::Extension => {
                        if let Some((_, key)) = attributes(&e, path)?
                            .into_iter()
                            .find(|(k, _)| k == "key")
                        {
                            extension.push((key, String::new()));
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| RcsError::xml(path, e.to_string()))?
                        .into_owned();
                    if let Some(key) = pair_key.take() {
                        extension.push((key, text));
                        continue;
                    }
                    match leaf.as_deref() {
                        Some("uuid") => uuid = Some(text),
                        Some("type") => {
                            kind = Some(ResourceKind::from_code(&text).ok_or_else(|| {
                                RcsError::xml(path, format!("unknown resource type {text:?}"))
                            })?)
                        }
                        Some("hash") => hash = Some(ContentHash::from_hex(&text)?),
                        Some("log") => log_path = text,
                        Some("file-name") => file_name = text,
                        Some("file-path") => file_path = text,
                        Some("parent-uuid") => parent_uuid = Some(text),
                        Some("meta-type") => mime_type = text,
                        Some("created") => created = parse_timestamp(&text, path)?,
                        Some("lastModified") => last_modified = parse_timestamp(&text, path)?,
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"permission" | b"extension" => section = Section::Top,
                    b"pair" => {
                        // A pair with no text body still carries its key;
                        // the value is the empty string.
                        if let Some(key) = pair_key.take() {
                            extension.push((key, String::new()));
                        }
                    }
                    _ => leaf = None,
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(RcsError::xml(path, e.to_string())),
            }
        }

        let uuid = uuid.ok_or_else(|| RcsError::xml(path, "missing uuid element"))?;
        let kind = kind.ok_or_else(|| RcsError::xml(path, "missing type element"))?;

        Ok(Self {
            uuid,
            revision_id,
            kind,
            hash,
            log_path,
            file_name,
            file_path,
            parent_uuid,
            mime_type,
            created,
            last_modified,
            permission,
            extension,
        })
    }
}

fn read_permission_attrs(e: &BytesStart, path: &Path, out: &mut Permission) -> Result<()> {
    for (key, value) in attributes(e, path)? {
        match key.as_str() {
            "owner" => out.owner = value,
            "group" => out.group = value,
            "mode" => out.mode = parse_mode(&value, path)?,
            _ => {}
        }
    }
    Ok(())
}

fn read_ace(e: &BytesStart, path: &Path) -> Result<AclEntry> {
    let mut ace = AclEntry {
        target: String::new(),
        who: String::new(),
        mode: 0,
    };
    for (key, value) in attributes(e, path)? {
        match key.as_str() {
            "target" => ace.target = value,
            "who" => ace.who = value,
            "mode" => ace.mode = parse_mode(&value, path)?,
            _ => {}
        }
    }
    Ok(ace)
}

fn parse_mode(text: &str, path: &Path) -> Result<u32> {
    u32::from_str_radix(text, 8).map_err(|e| RcsError::xml(path, format!("bad mode {text:?}: {e}")))
}
