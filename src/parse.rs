//! XML parsing into the document tree.
//!
//! [`safe_parse`] builds a [`Document`] from textual XML using quick-xml.
//! Element names are resolved against the reader's namespace state and
//! stored expanded; attribute names are kept lexical (prefix + local name),
//! including the `xmlns` declarations, weil der Validator Attribute erst
//! gegen die In-Scope-Abbildung seines Walkers aufloest.
//!
//! Fragments are welcome: the input may carry several top-level nodes and
//! character data outside any element. Adjacent character data (text and
//! CDATA) is coalesced so the resulting tree keeps text nodes normalized.

use core::fmt;
use std::borrow::Cow;

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use crate::dom::{Document, NodeId};
use crate::qname::QName;

/// A diagnostic from the XML parser, with the byte offset it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsingError {
    message: String,
    offset: u64,
}

impl ParsingError {
    fn new(message: impl Into<String>, offset: u64) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }

    /// The parser's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Byte offset into the source the diagnostic refers to.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XML parse error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for ParsingError {}

/// XML-Zeilenenden normalisieren (`\r\n` und `\r` werden `\n`).
fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if !text.contains('\r') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
}

fn utf8(bytes: &[u8], offset: u64) -> Result<&str, ParsingError> {
    std::str::from_utf8(bytes).map_err(|e| ParsingError::new(e.to_string(), offset))
}

/// Loest eine Zeichenreferenz auf (`name` ohne fuehrendes `#`).
fn resolve_char_reference(name: &str) -> Option<char> {
    let code = if let Some(hex) = name.strip_prefix('x').or_else(|| name.strip_prefix('X')) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        name.parse::<u32>().ok()?
    };
    char::from_u32(code)
}

/// Parses `source` into a document tree.
pub fn safe_parse(source: &str) -> Result<Document, ParsingError> {
    let mut reader = NsReader::from_str(source);
    let mut doc = Document::new();
    let mut stack: Vec<NodeId> = vec![doc.root()];

    loop {
        let offset = reader.buffer_position();
        match reader.read_event() {
            Err(e) => return Err(ParsingError::new(e.to_string(), reader.buffer_position())),
            Ok(Event::Start(e)) => {
                let element = build_element(&reader, &mut doc, &e, offset)?;
                let parent = *stack.last().expect("parse stack holds the document root");
                doc.append_child(parent, element);
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = build_element(&reader, &mut doc, &e, offset)?;
                let parent = *stack.last().expect("parse stack holds the document root");
                doc.append_child(parent, element);
            }
            Ok(Event::End(_)) => {
                // quick-xml prueft die Tag-Paarung selbst.
                stack.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .decode()
                    .map_err(|er| ParsingError::new(er.to_string(), offset))?;
                let text = normalize_line_endings(&text);
                let parent = *stack.last().expect("parse stack holds the document root");
                if stack.len() == 1 && text.trim().is_empty() {
                    // Whitespace zwischen Top-Level-Knoten.
                    continue;
                }
                doc.append_text(parent, &text);
            }
            Ok(Event::CData(e)) => {
                let text = utf8(e.as_ref(), offset)?.to_string();
                let parent = *stack.last().expect("parse stack holds the document root");
                if !text.is_empty() {
                    doc.append_text(parent, &text);
                }
            }
            Ok(Event::Comment(e)) => {
                let text = utf8(e.as_ref(), offset)?;
                let parent = *stack.last().expect("parse stack holds the document root");
                let node = doc.create_comment(text);
                doc.append_child(parent, node);
            }
            Ok(Event::PI(e)) => {
                let raw = utf8(e.as_ref(), offset)?;
                let (target, data) = match raw.split_once(|c: char| c.is_ascii_whitespace()) {
                    Some((t, d)) => (t, d.trim_start()),
                    None => (raw, ""),
                };
                let parent = *stack.last().expect("parse stack holds the document root");
                let node = doc.create_processing_instruction(target, data);
                doc.append_child(parent, node);
            }
            Ok(Event::GeneralRef(e)) => {
                let name = utf8(e.as_ref(), offset)?;
                let resolved = if let Some(stripped) = name.strip_prefix('#') {
                    resolve_char_reference(stripped)
                        .ok_or_else(|| {
                            ParsingError::new(format!("invalid character reference '&{name};'"), offset)
                        })?
                        .to_string()
                } else if let Some(predefined) = resolve_predefined_entity(name) {
                    predefined.to_string()
                } else {
                    // Ohne DTD-Unterstuetzung sind weitere Entities nicht
                    // aufloesbar.
                    return Err(ParsingError::new(format!("unknown entity '&{name};'"), offset));
                };
                let parent = *stack.last().expect("parse stack holds the document root");
                if stack.len() == 1 && resolved.trim().is_empty() {
                    continue;
                }
                doc.append_text(parent, &resolved);
            }
            Ok(Event::Decl(_) | Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
        }
    }
    if stack.len() != 1 {
        return Err(ParsingError::new(
            "unexpected end of input inside an element",
            reader.buffer_position(),
        ));
    }
    Ok(doc)
}

fn build_element(
    reader: &NsReader<&[u8]>,
    doc: &mut Document,
    e: &BytesStart<'_>,
    offset: u64,
) -> Result<NodeId, ParsingError> {
    let (resolution, local) = reader.resolve_element(e.name());
    let uri: Cow<'_, str> = match resolution {
        ResolveResult::Bound(ns) => Cow::Owned(utf8(ns.as_ref(), offset)?.to_string()),
        ResolveResult::Unbound => Cow::Borrowed(""),
        ResolveResult::Unknown(prefix) => {
            let prefix = utf8(&prefix, offset)?;
            return Err(ParsingError::new(
                format!("unbound namespace prefix '{prefix}'"),
                offset,
            ));
        }
    };
    let local_name = utf8(local.as_ref(), offset)?;
    let prefix = match e.name().prefix() {
        Some(p) => Some(utf8(p.as_ref(), offset)?.to_string()),
        None => None,
    };
    let name = match &prefix {
        Some(p) => QName::with_prefix(&uri, local_name, p),
        None => QName::new(&uri, local_name),
    };
    let element = doc.create_element(name);

    for attr in e.attributes() {
        let attr = attr.map_err(|er| ParsingError::new(er.to_string(), offset))?;
        let key = attr.key;
        let attr_prefix = match key.prefix() {
            Some(p) => Some(utf8(p.as_ref(), offset)?.to_string()),
            None => None,
        };
        let attr_local = utf8(key.local_name().as_ref(), offset)?.to_string();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|er| ParsingError::new(er.to_string(), offset))?;
        doc.set_attribute(element, attr_prefix.as_deref(), &attr_local, &value);
    }
    Ok(element)
}
