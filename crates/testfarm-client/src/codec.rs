//! Line-oriented wire codec.
//!
//! The wire format is XML-shaped text with exactly one element per line:
//!
//! ```text
//! <message>
//! <type>test</type>
//! <sender>
//! <hostname>client.local</hostname>
//! <port>5451</port>
//! </sender>
//! ...
//! <envelope>
//! ...
//! </envelope>
//! </message>
//! ```
//!
//! Decoding never looks past the line holding `</message>`: a file PUT is
//! followed by raw bytes on the same connection and those must remain in the
//! reader for the transfer handler. Each line is split with plain substring
//! search (first `<`, first `>`, last `<`) since the encoder never puts more
//! than one element on a line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Result, TransportError};
use crate::message::{Message, RawEnvelope};
use crate::types::{FileDescriptor, NodeDescriptor, Product, Test, TestStatus};

/// Longest line the decoder accepts.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Builds wire text one element per line.
pub struct LineWriter {
    buf: String,
}

impl LineWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Writes an opening tag on its own line.
    pub fn open(&mut self, tag: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push_str(">\n");
        self
    }

    /// Writes a closing tag on its own line.
    pub fn close(&mut self, tag: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push_str(">\n");
        self
    }

    /// Writes `<tag>value</tag>` with the value escaped.
    pub fn elem(&mut self, tag: &str, value: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
        self.buf.push_str(&escape(value));
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push_str(">\n");
        self
    }

    /// Writes a numeric element.
    pub fn elem_u64(&mut self, tag: &str, value: u64) -> &mut Self {
        self.elem(tag, &value.to_string())
    }

    /// Writes an element only when the value is present.
    pub fn elem_opt(&mut self, tag: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.elem(tag, v);
        }
        self
    }

    /// Writes multi-line text between an opening and a closing line, one
    /// escaped text line per wire line.
    pub fn text_block(&mut self, tag: &str, text: &str) -> &mut Self {
        self.open(tag);
        if !text.is_empty() {
            for line in text.split('\n') {
                self.buf.push_str(&escape(line));
                self.buf.push('\n');
            }
        }
        self.close(tag)
    }

    /// Returns the accumulated text.
    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for LineWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Escapes markup characters and line breaks.
pub fn escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&apos;"),
            '\r' => result.push_str("&#13;"),
            '\n' => result.push_str("&#10;"),
            _ => result.push(c),
        }
    }
    result
}

/// Reverses [`escape`]. Unknown entities are kept verbatim.
pub fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        result.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let replaced = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
            ("&#13;", '\r'),
            ("&#10;", '\n'),
        ]
        .iter()
        .find(|(entity, _)| rest.starts_with(entity));
        match replaced {
            Some((entity, c)) => {
                result.push(*c);
                rest = &rest[entity.len()..];
            }
            None => {
                result.push('&');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    result
}

/// Serializes a message to wire text.
pub fn encode(message: &Message) -> String {
    let mut w = LineWriter::new();
    w.open("message");
    w.elem("type", message.kind().as_str());
    for (tag, addr) in [("sender", &message.sender), ("receiver", &message.receiver)] {
        w.open(tag);
        w.elem("hostname", &addr.host);
        w.elem_u64("port", u64::from(addr.port));
        w.close(tag);
    }
    message.operation.write_envelope(&mut w);
    w.close("message");
    w.finish()
}

/// Reads lines from `reader` until one complete message has been decoded.
///
/// Returns `Ok(None)` when the stream ends before the root element closes,
/// and stops reading right after the line that closes it.
pub async fn decode<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncBufRead + Unpin,
{
    let mut ctx = ParseContext::new();
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        let content_len = line.len() - usize::from(line.ends_with(b"\n"));
        if content_len > MAX_LINE_LEN {
            return Err(TransportError::invalid(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        let text = String::from_utf8_lossy(&line);
        if let Some(message) = ctx.feed(&text)? {
            return Ok(Some(message));
        }
    }
}

/// Decodes the first message found in `text`.
pub fn decode_str(text: &str) -> Result<Option<Message>> {
    let mut ctx = ParseContext::new();
    for line in text.split_inclusive('\n') {
        if let Some(message) = ctx.feed(line)? {
            return Ok(Some(message));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Message,
    Sender,
    Receiver,
    Envelope,
    Test,
    Packages,
    RequiredProducts,
    ReservedProducts,
    Product,
    File,
    Node,
    NodeProducts,
    Text,
    Ignored,
}

struct Frame {
    scope: Scope,
    tag: String,
}

/// One line split into its parts.
struct Line<'a> {
    open: Option<&'a str>,
    value: Option<&'a str>,
    close: Option<&'a str>,
}

fn split_line(line: &str) -> Option<Line<'_>> {
    let lt = line.find('<')?;
    let gt = lt + line[lt..].find('>')?;
    let head = &line[lt + 1..gt];
    if head.starts_with('?') || head.starts_with('!') || head.ends_with('/') {
        return None;
    }
    if let Some(name) = head.strip_prefix('/') {
        return Some(Line {
            open: None,
            value: None,
            close: Some(name.trim()),
        });
    }
    let name = head.split_whitespace().next().unwrap_or("");
    let last_lt = line.rfind('<').filter(|&pos| pos > gt);
    match last_lt {
        Some(pos) => {
            let tail = &line[pos + 1..];
            let close = tail
                .strip_prefix('/')
                .map(|t| t.split('>').next().unwrap_or("").trim());
            Some(Line {
                open: Some(name),
                value: Some(&line[gt + 1..pos]),
                close,
            })
        }
        None => Some(Line {
            open: Some(name),
            value: None,
            close: None,
        }),
    }
}

/// Per-call decoder state: the scope stack and everything collected so far.
struct ParseContext {
    stack: Vec<Frame>,
    raw: RawEnvelope,
    product: Option<Product>,
    text: Vec<String>,
}

impl ParseContext {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            raw: RawEnvelope::default(),
            product: None,
            text: Vec::new(),
        }
    }

    fn top(&self) -> Option<Scope> {
        self.stack.last().map(|f| f.scope)
    }

    fn push(&mut self, scope: Scope, tag: &str) {
        self.stack.push(Frame {
            scope,
            tag: tag.to_string(),
        });
    }

    /// Consumes one line. Returns the message once the root element closes.
    fn feed(&mut self, line: &str) -> Result<Option<Message>> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if self.top() == Some(Scope::Text) {
            if line.trim() == "</text>" {
                self.stack.pop();
                let text = std::mem::take(&mut self.text).join("\n");
                self.raw.text = Some(text);
            } else {
                self.text.push(unescape(line));
            }
            return Ok(None);
        }

        let Some(parts) = split_line(line) else {
            return Ok(None);
        };
        match (parts.open, parts.value) {
            (Some(tag), Some(value)) => self.leaf(tag, &unescape(value))?,
            (Some(tag), None) => self.open(tag),
            (None, _) => {}
        }
        if parts.value.is_none() {
            if let Some(tag) = parts.close {
                return self.close(tag);
            }
        }
        Ok(None)
    }

    fn open(&mut self, tag: &str) {
        let scope = match (self.top(), tag) {
            (None, "message") => Scope::Message,
            (None, _) => return,
            (Some(Scope::Message), "sender") => Scope::Sender,
            (Some(Scope::Message), "receiver") => Scope::Receiver,
            (Some(Scope::Message), "envelope") => Scope::Envelope,
            (Some(Scope::Envelope), "test") => {
                self.raw.test = Some(Test::with_unchecked_id(String::new()));
                Scope::Test
            }
            (Some(Scope::Envelope), "file") => {
                self.raw.file = Some(FileDescriptor::default());
                Scope::File
            }
            (Some(Scope::Envelope), "node") => {
                self.raw.node = Some(NodeDescriptor::default());
                Scope::Node
            }
            (Some(Scope::Envelope), "text") => {
                self.text.clear();
                Scope::Text
            }
            (Some(Scope::Envelope), "product")
            | (Some(Scope::RequiredProducts), "product")
            | (Some(Scope::ReservedProducts), "product")
            | (Some(Scope::NodeProducts), "product") => {
                self.product = Some(Product::default());
                Scope::Product
            }
            (Some(Scope::Test), "packages") => Scope::Packages,
            (Some(Scope::Test), "requiredproducts") => Scope::RequiredProducts,
            (Some(Scope::Test), "reservedproducts") => Scope::ReservedProducts,
            (Some(Scope::Node), "products") => Scope::NodeProducts,
            _ => Scope::Ignored,
        };
        self.push(scope, tag);
    }

    fn close(&mut self, tag: &str) -> Result<Option<Message>> {
        if self.stack.last().map(|f| f.tag.as_str()) != Some(tag) {
            return Ok(None);
        }
        let Some(frame) = self.stack.pop() else {
            return Ok(None);
        };
        match frame.scope {
            Scope::Product => {
                let product = self.product.take().unwrap_or_default();
                match self.top() {
                    Some(Scope::RequiredProducts) => {
                        if let Some(test) = self.raw.test.as_mut() {
                            test.required_products.push(product);
                        }
                    }
                    Some(Scope::ReservedProducts) => {
                        if let Some(test) = self.raw.test.as_mut() {
                            test.reserved_products.push(product);
                        }
                    }
                    Some(Scope::NodeProducts) => {
                        if let Some(node) = self.raw.node.as_mut() {
                            node.products.push(product);
                        }
                    }
                    _ => self.raw.product = Some(product),
                }
            }
            Scope::Message => {
                let raw = std::mem::take(&mut self.raw);
                return Message::from_raw(raw).map(Some);
            }
            _ => {}
        }
        Ok(None)
    }

    fn leaf(&mut self, tag: &str, value: &str) -> Result<()> {
        let Some(scope) = self.top() else {
            return Ok(());
        };
        let owned = || Some(value.to_string());
        match scope {
            Scope::Message => {
                if tag == "type" {
                    self.raw.kind = owned();
                }
            }
            Scope::Sender | Scope::Receiver => {
                let addr = if scope == Scope::Sender {
                    &mut self.raw.sender
                } else {
                    &mut self.raw.receiver
                };
                match tag {
                    "hostname" => addr.host = owned(),
                    "port" => addr.port = Some(parse_port(value)?),
                    _ => {}
                }
            }
            Scope::Envelope => match tag {
                "operation" => self.raw.code = owned(),
                "testid" => self.raw.test_id = owned(),
                "category" => self.raw.category = owned(),
                "text" => self.raw.text = owned(),
                _ => {}
            },
            Scope::Test => {
                if let Some(test) = self.raw.test.as_mut() {
                    match tag {
                        "id" => test.set_id_unchecked(value.to_string()),
                        "status" => test.status = TestStatus::parse(value),
                        "timeout" => test.timeout_secs = value.trim().parse().unwrap_or(0),
                        "workspace" => test.workspace = value.into(),
                        "environment" => test.environment = owned(),
                        "reason" => test.reason = owned(),
                        "script" => test.script = owned(),
                        _ => {}
                    }
                }
            }
            Scope::Packages => {
                if tag == "package" {
                    if let Some(test) = self.raw.test.as_mut() {
                        test.packages.push(value.to_string());
                    }
                }
            }
            Scope::Product => {
                if let Some(product) = self.product.as_mut() {
                    match tag {
                        "id" => product.id = value.to_string(),
                        "type" => product.product_type = value.to_string(),
                        "environment" => product.environment = owned(),
                        "hostname" => product.hostname = owned(),
                        "reservedby" => product.reserved_by = owned(),
                        _ => {}
                    }
                }
            }
            Scope::File => {
                if let Some(file) = self.raw.file.as_mut() {
                    match tag {
                        "name" => file.name = value.to_string(),
                        "path" => file.path = owned(),
                        "size" => file.size = value.trim().parse::<u64>().ok(),
                        _ => {}
                    }
                }
            }
            Scope::Node => {
                if let Some(node) = self.raw.node.as_mut() {
                    match tag {
                        "hostname" => node.hostname = value.to_string(),
                        "port" => node.port = parse_port(value)?,
                        "description" => node.description = owned(),
                        _ => {}
                    }
                }
            }
            Scope::RequiredProducts
            | Scope::ReservedProducts
            | Scope::NodeProducts
            | Scope::Text
            | Scope::Ignored => {}
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| TransportError::invalid(format!("invalid port {value:?}")))
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_escape_round_trip(s in "\\PC*") {
            prop_assert_eq!(unescape(&escape(&s)), s);
        }

        #[test]
        fn test_escaped_values_stay_on_one_line(s in "(\\PC|\n|\r)*") {
            let escaped = escape(&s);
            prop_assert!(!escaped.contains('<'));
            prop_assert!(!escaped.contains('\r'));
            prop_assert!(!escaped.contains('\n'));
            prop_assert_eq!(unescape(&escaped), s);
        }
    }
}
