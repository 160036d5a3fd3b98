//! Versioned XML history documents
//!
//! A document is a `<history version="2.0">` root holding one `<item>` per
//! entry. Each item carries its kind and uuid as attributes, its primary
//! value in a `<value>` child and any rich formats in base64-encoded
//! `<special-value mime="...">` children:
//!
//! ```xml
//! <history version="2.0">
//!   <item kind="Text" uuid="5f0c...">
//!     <value>a &amp; b</value>
//!     <special-value mime="text/html">PGI+YSAmIGI8L2I+</special-value>
//!   </item>
//!   <item kind="Image" uuid="9e1d..." date="1700000000" checksum="ab12...">
//!     <value>/home/me/.local/share/clipstash/images/ab12....png</value>
//!   </item>
//! </history>
//! ```
//!
//! Version 1.0 documents put the value inline as the item's text and have
//! no uuids or special values. They are still read; the caller re-saves
//! them in the current format.
//!
//! Parsing is event driven. Failures are isolated per item: an item that
//! cannot be built is skipped and the rest of the document is still read.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::image_cache;
use super::item::{Item, ItemKind};

pub const CURRENT_VERSION: &str = "2.0";
pub const LEGACY_VERSION: &str = "1.0";

/// Document-level failures; item-level problems never surface here
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("document root is not <history>")]
    NotAHistory,

    #[error("empty document")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format version declared by a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    /// Absent or "1.0"
    Legacy,
    Current,
    Unknown(String),
}

impl Version {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some(LEGACY_VERSION) => Version::Legacy,
            Some(CURRENT_VERSION) => Version::Current,
            Some(other) => Version::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Items beyond this count are read but not built
    pub max_items: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_items: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub save_passwords: bool,
}

/// Result of reading a document
#[derive(Debug)]
pub struct Decoded {
    pub items: Vec<Item>,
    pub version: Version,
    /// Items dropped because they were invalid, duplicated or over the limit
    pub skipped: usize,
    /// The document ended early or broke; `items` holds what preceded the damage
    pub truncated: bool,
}

impl Decoded {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            version: Version::Current,
            skipped: 0,
            truncated: false,
        }
    }

    /// Whether the document should be rewritten in the current format
    pub fn needs_migration(&self) -> bool {
        self.version == Version::Legacy
    }
}

/// Serialize items; passwords are left out unless `save_passwords` is set
/// and images whose side file was never written are always left out.
pub fn encode<'a, I>(items: I, options: &EncodeOptions) -> String
where
    I: IntoIterator<Item = &'a Item>,
{
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!("<history version=\"{}\">\n", CURRENT_VERSION));

    for item in items {
        let mut attrs = format!(" kind=\"{}\" uuid=\"{}\"", item.kind(), item.uuid());
        match item.kind() {
            ItemKind::Password => {
                if !options.save_passwords {
                    continue;
                }
                let name = item.password_name().unwrap_or_default();
                attrs.push_str(&format!(" name=\"{}\"", escape(name)));
            }
            ItemKind::Image => {
                let Some(image) = item.image() else { continue };
                if !image.is_stored() {
                    warn!("Not saving image {} without a side file", item.uuid());
                    continue;
                }
                attrs.push_str(&format!(
                    " date=\"{}\" checksum=\"{}\"",
                    image.date().timestamp(),
                    escape(image.checksum())
                ));
            }
            ItemKind::Text | ItemKind::Uris => {}
        }

        out.push_str(&format!("  <item{}>\n", attrs));
        out.push_str(&format!("    <value>{}</value>\n", escape(item.real_value())));
        for special in item.special_values() {
            out.push_str(&format!(
                "    <special-value mime=\"{}\">{}</special-value>\n",
                escape(special.mime.as_str()),
                STANDARD.encode(&special.data)
            ));
        }
        out.push_str("  </item>\n");
    }

    out.push_str("</history>\n");
    out
}

/// Parse a document
///
/// Returns an error only when nothing in the document is usable.
pub fn decode(document: &str, options: &DecodeOptions) -> Result<Decoded, CodecError> {
    let mut reader = Reader::from_str(document);
    let mut parser = Parser::new(options);

    loop {
        let result = match reader.read_event() {
            Ok(Event::Start(e)) => {
                parser.start(&e);
                Ok(())
            }
            Ok(Event::Empty(e)) => {
                parser.start(&e);
                parser.end(e.name().as_ref());
                Ok(())
            }
            Ok(Event::End(e)) => {
                parser.end(e.name().as_ref());
                Ok(())
            }
            Ok(Event::Text(t)) => {
                match t.unescape() {
                    Ok(text) => parser.text(&text),
                    Err(e) => parser.break_item(format!("bad text: {}", e)),
                }
                Ok(())
            }
            Ok(Event::CData(c)) => {
                parser.text(&String::from_utf8_lossy(&c));
                Ok(())
            }
            Ok(Event::Eof) => break,
            Ok(_) => Ok(()),
            Err(e) => Err(CodecError::Xml {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            }),
        };

        if let Err(e) = result {
            if parser.state == State::Begin {
                return Err(e);
            }
            warn!("History document is damaged, keeping items read so far: {}", e);
            parser.truncated = true;
            break;
        }
        if parser.state == State::Invalid {
            if parser.seen_root {
                warn!("Malformed history document, keeping items read so far");
                parser.truncated = true;
                break;
            }
            return Err(CodecError::NotAHistory);
        }
    }

    parser.finish()
}

/// Element names the parser distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    History,
    Item,
    Value,
    SpecialValue,
    Other,
}

impl Tag {
    fn of(name: &[u8]) -> Self {
        match name {
            b"history" => Tag::History,
            b"item" => Tag::Item,
            b"value" => Tag::Value,
            b"special-value" => Tag::SpecialValue,
            _ => Tag::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Start(Tag),
    End(Tag),
}

/// Where to go back to once an unexpected element has been skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    History,
    Item,
    Value,
    SpecialValue,
}

impl Frame {
    fn state(self) -> State {
        match self {
            Frame::History => State::InHistory,
            Frame::Item => State::InItem,
            Frame::Value => State::InValue,
            Frame::SpecialValue => State::InSpecialValue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Begin,
    InHistory,
    InItem,
    InValue,
    InSpecialValue,
    Skipping { depth: u32, resume: Frame },
    End,
    Invalid,
}

fn transition(state: State, input: Input) -> State {
    use Input::{End as Close, Start as Open};

    match (state, input) {
        (State::Begin, Open(Tag::History)) => State::InHistory,
        (State::Begin, _) => State::Invalid,

        (State::InHistory, Open(Tag::Item)) => State::InItem,
        (State::InHistory, Close(Tag::History)) => State::End,

        (State::InItem, Open(Tag::Value)) => State::InValue,
        (State::InItem, Open(Tag::SpecialValue)) => State::InSpecialValue,
        (State::InItem, Close(Tag::Item)) => State::InHistory,

        (State::InValue, Close(Tag::Value)) => State::InItem,
        (State::InSpecialValue, Close(Tag::SpecialValue)) => State::InItem,

        (State::Skipping { depth, resume }, Open(_)) => State::Skipping {
            depth: depth + 1,
            resume,
        },
        (State::Skipping { depth: 1, resume }, Close(_)) => resume.state(),
        (State::Skipping { depth, resume }, Close(_)) => State::Skipping {
            depth: depth - 1,
            resume,
        },

        (State::InHistory, Open(_)) => State::Skipping {
            depth: 1,
            resume: Frame::History,
        },
        (State::InItem, Open(_)) => State::Skipping {
            depth: 1,
            resume: Frame::Item,
        },
        (State::InValue, Open(_)) => State::Skipping {
            depth: 1,
            resume: Frame::Value,
        },
        (State::InSpecialValue, Open(_)) => State::Skipping {
            depth: 1,
            resume: Frame::SpecialValue,
        },

        (State::End, Open(_)) => State::Invalid,
        (_, Close(_)) => State::Invalid,
        (State::Invalid, _) => State::Invalid,
    }
}

#[derive(Debug, Default)]
struct PendingItem {
    attrs: HashMap<String, String>,
    value: String,
    specials: Vec<(String, String)>,
    special: Option<(String, String)>,
    broken: Option<String>,
}

struct Parser<'a> {
    state: State,
    options: &'a DecodeOptions,
    version: Version,
    seen_root: bool,
    pending: Option<PendingItem>,
    items: Vec<Item>,
    uuids: HashSet<Uuid>,
    skipped: usize,
    truncated: bool,
}

impl<'a> Parser<'a> {
    fn new(options: &'a DecodeOptions) -> Self {
        Self {
            state: State::Begin,
            options,
            version: Version::Current,
            seen_root: false,
            pending: None,
            items: Vec::new(),
            uuids: HashSet::new(),
            skipped: 0,
            truncated: false,
        }
    }

    fn start(&mut self, e: &BytesStart<'_>) {
        let prev = self.state;
        self.state = transition(prev, Input::Start(Tag::of(e.name().as_ref())));

        match (prev, self.state) {
            (State::Begin, State::InHistory) => {
                self.seen_root = true;
                let attrs = read_attributes(e).unwrap_or_default();
                self.version = Version::parse(attrs.get("version").map(String::as_str));
                match &self.version {
                    Version::Legacy => debug!("Reading legacy history document"),
                    Version::Unknown(v) => warn!(
                        "Unknown history version {:?}, reading it as {}",
                        v, CURRENT_VERSION
                    ),
                    Version::Current => {}
                }
            }
            (State::InHistory, State::InItem) => {
                let mut pending = PendingItem::default();
                match read_attributes(e) {
                    Ok(attrs) => pending.attrs = attrs,
                    Err(msg) => pending.broken = Some(msg),
                }
                self.pending = Some(pending);
            }
            (State::InItem, State::InSpecialValue) => {
                if let Some(pending) = self.pending.as_mut() {
                    match read_attributes(e).map(|mut a| a.remove("mime")) {
                        Ok(Some(mime)) => pending.special = Some((mime, String::new())),
                        Ok(None) => debug!("Ignoring special value without a mime type"),
                        Err(msg) => debug!("Ignoring special value: {}", msg),
                    }
                }
            }
            (_, State::Skipping { depth: 1, .. }) => {
                debug!(
                    "Skipping unexpected <{}>",
                    String::from_utf8_lossy(e.name().as_ref())
                );
            }
            _ => {}
        }
    }

    fn end(&mut self, name: &[u8]) {
        let prev = self.state;
        self.state = transition(prev, Input::End(Tag::of(name)));

        match (prev, self.state) {
            (State::InItem, State::InHistory) => self.finish_item(),
            (State::InSpecialValue, State::InItem) => {
                if let Some(pending) = self.pending.as_mut() {
                    if let Some(special) = pending.special.take() {
                        pending.specials.push(special);
                    }
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        match self.state {
            State::InValue => pending.value.push_str(text),
            State::InSpecialValue => {
                if let Some((_, data)) = pending.special.as_mut() {
                    data.push_str(text);
                }
            }
            State::InItem if self.version == Version::Legacy => pending.value.push_str(text),
            _ => {}
        }
    }

    fn break_item(&mut self, reason: String) {
        if let Some(pending) = self.pending.as_mut() {
            pending.broken.get_or_insert(reason);
        }
    }

    fn finish_item(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Some(reason) = &pending.broken {
            warn!("Skipping unreadable history item: {}", reason);
            self.skipped += 1;
            return;
        }

        if self.items.len() >= self.options.max_items {
            self.skipped += 1;
            return;
        }

        match self.build_item(pending) {
            Ok(item) => {
                self.uuids.insert(item.uuid());
                self.items.push(item);
            }
            Err(reason) => {
                warn!("Skipping history item: {}", reason);
                self.skipped += 1;
            }
        }
    }

    fn build_item(&self, mut pending: PendingItem) -> Result<Item, String> {
        let kind: ItemKind = pending
            .attrs
            .get("kind")
            .ok_or_else(|| "missing kind".to_string())?
            .parse()
            .map_err(|e: super::HistoryError| e.to_string())?;
        let uuid = self.resolve_uuid(pending.attrs.get("uuid").map(String::as_str))?;
        let value = std::mem::take(&mut pending.value);

        let mut item = match kind {
            ItemKind::Text if value.is_empty() => return Err("empty text item".to_string()),
            ItemKind::Text => Item::new_text(value),
            ItemKind::Uris if value.trim().is_empty() => {
                return Err("empty uri list".to_string())
            }
            ItemKind::Uris => Item::new_uris(value),
            ItemKind::Password => {
                let name = pending
                    .attrs
                    .remove("name")
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| "password item without a name".to_string())?;
                Item::new_password(name, value)
            }
            ItemKind::Image => build_image(&pending.attrs, value.trim())?,
        };

        for (mime, encoded) in pending.specials {
            match STANDARD.decode(encoded.trim()) {
                Ok(data) => {
                    if let Err(e) = item.add_special_value(mime, data) {
                        debug!("Dropping special value: {}", e);
                    }
                }
                Err(e) => warn!("Dropping undecodable {} special value: {}", mime, e),
            }
        }

        Ok(item.with_uuid(uuid))
    }

    /// Legacy documents get a fresh uuid whenever theirs is missing or taken;
    /// current documents drop the later of two items sharing a uuid.
    fn resolve_uuid(&self, raw: Option<&str>) -> Result<Uuid, String> {
        let parsed = raw.and_then(|r| Uuid::parse_str(r).ok());
        match parsed {
            Some(uuid) if !self.uuids.contains(&uuid) => Ok(uuid),
            Some(uuid) if self.version != Version::Legacy => {
                Err(format!("duplicate uuid {}", uuid))
            }
            _ => loop {
                let uuid = Uuid::new_v4();
                if !self.uuids.contains(&uuid) {
                    break Ok(uuid);
                }
            },
        }
    }

    fn finish(self) -> Result<Decoded, CodecError> {
        match self.state {
            State::Begin => return Err(CodecError::Empty),
            State::End => {}
            _ => {
                if !self.truncated {
                    warn!("History document ended early, keeping items read so far");
                }
            }
        }
        let truncated = self.truncated || self.state != State::End;
        Ok(Decoded {
            items: self.items,
            version: self.version,
            skipped: self.skipped,
            truncated,
        })
    }
}

/// An image whose side file is gone is only kept when the document dates it
fn build_image(attrs: &HashMap<String, String>, value: &str) -> Result<Item, String> {
    if value.is_empty() {
        return Err("image item without a path".to_string());
    }
    let path = PathBuf::from(value);
    let date = attrs
        .get("date")
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    let checksum = attrs.get("checksum").cloned().or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
    });

    if path.exists() {
        let checksum = match checksum {
            Some(sum) => sum,
            None => image_cache::load(&path)
                .map(|pixels| image_cache::checksum(&pixels))
                .map_err(|e| format!("unreadable image {:?}: {}", path, e))?,
        };
        return Ok(Item::image_reference(
            path,
            checksum,
            date.unwrap_or_else(Utc::now),
        ));
    }

    match (date, checksum) {
        (Some(date), Some(checksum)) => Ok(Item::image_reference(path, checksum, date)),
        _ => Err(format!("image side file {:?} is missing", path)),
    }
}

fn read_attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, String> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| format!("bad attribute: {}", err))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| format!("bad attribute value: {}", err))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}
