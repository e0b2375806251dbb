//! Incremental framing of an XMPP stream.
//!
//! A client stream is one long XML document, so inbound bytes are buffered
//! until a complete top-level element (or the stream header/close tag) is
//! available. Only tag boundaries are tracked here; element contents are
//! handed to minidom once complete.

use perch_core::{
    Stanza,
    stanza::{ns, with_default_namespace},
};
use xmpp_parsers::minidom::Element;

use crate::error::CodecError;

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Opening tag of the client stream to `domain`. No `version` attribute is
/// sent, which keeps servers on pre-SASL legacy authentication.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' to='{}'>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        escape_attr(domain)
    )
}

pub fn encode(stanza: &Stanza) -> Result<Vec<u8>, CodecError> {
    Ok(stanza.to_bytes()?)
}

/// Attributes of the server's stream header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    fn parse(tag: &str) -> Self {
        Self {
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    Stanza(Stanza),
    /// A top-level element that is not a stanza, e.g. `<stream:features/>`
    /// or `<stream:error/>`.
    Element(Element),
    StreamClose,
}

#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every frame completed by it.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, end)) = self.next_frame(consumed)? {
            consumed = end;
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        self.buffer.drain(..consumed);
        Ok(frames)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Scans from `start` for the next frame. Returns the frame (or `None` for
    /// skipped markup such as the XML declaration) and the offset just past
    /// it, or `None` when more input is needed.
    fn next_frame(&self, start: usize) -> Result<Option<(Option<Frame>, usize)>, CodecError> {
        let buf = &self.buffer;
        let Some(offset) = buf[start..].iter().position(|&b| b == b'<') else {
            return Ok(None);
        };
        let open = start + offset;
        let rest = &buf[open..];

        if rest.starts_with(b"<?") {
            return Ok(find(buf, open, b"?>").map(|end| (None, end + 2)));
        }
        if rest.starts_with(b"<!--") {
            return Ok(find(buf, open, b"-->").map(|end| (None, end + 3)));
        }

        let Some(close) = tag_end(buf, open) else {
            return Ok(None);
        };
        let tag = utf8(&buf[open..=close])?;

        if rest.starts_with(b"</") {
            let name = tag[2..tag.len() - 1].trim();
            if name == "stream:stream" || name == "stream" {
                return Ok(Some((Some(Frame::StreamClose), close + 1)));
            }
            return Err(CodecError::MalformedXml(format!("unexpected closing tag {tag}")));
        }

        if is_stream_open(tag) {
            return Ok(Some((Some(Frame::StreamOpen(StreamHeader::parse(tag))), close + 1)));
        }

        let Some(end) = element_end(buf, open)? else {
            return Ok(None);
        };
        let fragment = utf8(&buf[open..end])?;
        Ok(Some((Some(parse_fragment(fragment)?), end)))
    }
}

fn is_stream_open(tag: &str) -> bool {
    (tag.starts_with("<stream:stream") || tag.starts_with("<stream "))
        && !tag.ends_with("/>")
}

fn parse_fragment(fragment: &str) -> Result<Frame, CodecError> {
    let name_end = fragment
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(fragment.len());
    match &fragment[1..name_end] {
        "message" | "presence" | "iq" => Ok(Frame::Stanza(fragment.parse::<Stanza>()?)),
        _ => with_default_namespace(fragment)
            .parse::<Element>()
            .map(Frame::Element)
            .map_err(|error| CodecError::MalformedXml(error.to_string())),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, CodecError> {
    std::str::from_utf8(bytes).map_err(|error| CodecError::InvalidUtf8(error.to_string()))
}

fn find(buf: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    buf[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| from + position)
}

/// Index of the `>` ending the tag opened at `open`, skipping quoted
/// attribute values.
fn tag_end(buf: &[u8], open: usize) -> Option<usize> {
    let mut quote = None;
    for (index, &byte) in buf.iter().enumerate().skip(open + 1) {
        match (quote, byte) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(byte),
            (None, b'>') => return Some(index),
            (None, _) => {}
        }
    }
    None
}

/// Offset just past the element opened at `open`, or `None` if it is not
/// complete yet.
fn element_end(buf: &[u8], open: usize) -> Result<Option<usize>, CodecError> {
    let mut depth = 0usize;
    let mut cursor = open;
    loop {
        let Some(offset) = buf[cursor..].iter().position(|&b| b == b'<') else {
            return Ok(None);
        };
        let at = cursor + offset;
        let rest = &buf[at..];

        let end = if rest.starts_with(b"<!--") {
            match find(buf, at, b"-->") {
                Some(end) => end + 3,
                None => return Ok(None),
            }
        } else if rest.starts_with(b"<![CDATA[") {
            match find(buf, at, b"]]>") {
                Some(end) => end + 3,
                None => return Ok(None),
            }
        } else if rest.starts_with(b"<?") {
            match find(buf, at, b"?>") {
                Some(end) => end + 2,
                None => return Ok(None),
            }
        } else {
            let Some(close) = tag_end(buf, at) else {
                return Ok(None);
            };
            if rest.starts_with(b"</") {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    CodecError::MalformedXml("closing tag without opening tag".to_string())
                })?;
            } else if buf[close - 1] != b'/' {
                depth += 1;
            }
            close + 1
        };

        if depth == 0 {
            return Ok(Some(end));
        }
        cursor = end;
    }
}

/// Value of `name='...'` or `name="..."` in a raw tag.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!(" {name}={quote}");
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
}
