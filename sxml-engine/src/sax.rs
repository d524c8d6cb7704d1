//! A SAX-style event stream over `xmlparser`'s tokenizer, with the well-formedness checks
//! the tokenizer leaves to its caller

use sxml_grammar::XML_NAMESPACE;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use xmlparser::{ElementEnd, StrSpan, Token, Tokenizer};

pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub prefix: String,
    pub local: String,
    /// Resolved once the whole start tag has been read; unprefixed attributes have none
    pub uri: String,
    /// Entity-decoded, with whitespace characters normalized to spaces
    pub value: String,
    pub start: usize,
    pub end: usize,
    pub value_start: usize,
    pub value_end: usize,
}

impl Attribute {
    pub fn is_namespace_declaration(&self) -> bool {
        self.prefix == "xmlns" || (self.prefix.is_empty() && self.local == "xmlns")
    }

    /// The prefix bound by a namespace declaration; empty for a default namespace declaration
    pub fn declared_prefix(&self) -> &str {
        if self.prefix == "xmlns" {
            &self.local
        } else {
            ""
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    pub prefix: String,
    pub local: String,
    pub uri: String,
    pub attributes: Vec<Attribute>,
    pub self_closing: bool,
    /// offset of the `<`
    pub start: usize,
    /// offset just past the `>`
    pub end: usize,
}

impl Tag {
    pub fn attribute(&self, uri: &str, local: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| !a.is_namespace_declaration() && a.uri == uri && a.local == local)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaxEvent {
    OpenTagStart { name: String, start: usize },
    Attribute(Attribute),
    OpenTag(Tag),
    Text(String),
    CloseTag(Tag),
    /// The raw text of the whole `<!DOCTYPE ...>` construct
    Doctype(String),
    ProcessingInstruction { target: String, body: String },
    End,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SaxError {
    #[error("{message}")]
    Xml { message: String, offset: usize },
    #[error("unexpected close tag </{name}>")]
    UnexpectedCloseTag { name: String, offset: usize },
    #[error("mismatched close tag: expected </{expected}> but found </{found}>")]
    MismatchedCloseTag {
        expected: String,
        found: String,
        offset: usize,
    },
    #[error("unclosed element <{name}>")]
    UnclosedElement { name: String, offset: usize },
    #[error("document has no root element")]
    NoRootElement { offset: usize },
    #[error("content is not allowed after the root element")]
    ContentAfterRoot { offset: usize },
    #[error("text is not allowed before the root element")]
    TextBeforeRoot { offset: usize },
    #[error("undefined namespace prefix {prefix:?}")]
    UndefinedNamespacePrefix { prefix: String, offset: usize },
    #[error("duplicate attribute {name:?}")]
    DuplicateAttribute { name: String, offset: usize },
    #[error("undefined entity &{name};")]
    UndefinedEntity { name: String, offset: usize },
    #[error("invalid or unclosed entity reference")]
    InvalidOrUnclosedEntity { offset: usize },
}

impl SaxError {
    pub fn offset(&self) -> usize {
        match self {
            SaxError::Xml { offset, .. }
            | SaxError::UnexpectedCloseTag { offset, .. }
            | SaxError::MismatchedCloseTag { offset, .. }
            | SaxError::UnclosedElement { offset, .. }
            | SaxError::NoRootElement { offset }
            | SaxError::ContentAfterRoot { offset }
            | SaxError::TextBeforeRoot { offset }
            | SaxError::UndefinedNamespacePrefix { offset, .. }
            | SaxError::DuplicateAttribute { offset, .. }
            | SaxError::UndefinedEntity { offset, .. }
            | SaxError::InvalidOrUnclosedEntity { offset } => *offset,
        }
    }
}

pub trait SaxSource {
    /// `None` once `SaxEvent::End` or an error has been returned
    fn next_event(&mut self) -> Option<Result<SaxEvent, SaxError>>;
    /// Byte offset just past the most recently consumed construct
    fn offset(&self) -> usize;
    fn define_entity(&mut self, name: &str, value: &str);
}

struct OpenElement {
    tag: Tag,
    namespaces: Vec<(String, String)>,
}

struct PendingTag<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    start: usize,
    attributes: Vec<Attribute>,
}

pub struct XmlSource<'a> {
    text: &'a str,
    tokenizer: Tokenizer<'a>,
    offset: usize,
    stack: Vec<OpenElement>,
    pending: Option<PendingTag<'a>>,
    queue: VecDeque<SaxEvent>,
    entities: HashMap<String, String>,
    dtd_start: Option<usize>,
    seen_root: bool,
    finished: bool,
}

impl<'a> XmlSource<'a> {
    pub fn new(text: &'a str) -> XmlSource<'a> {
        let mut entities = HashMap::new();
        for (name, value) in &[
            ("lt", "<"),
            ("gt", ">"),
            ("amp", "&"),
            ("apos", "'"),
            ("quot", "\""),
        ] {
            entities.insert(name.to_string(), value.to_string());
        }
        XmlSource {
            text,
            tokenizer: Tokenizer::from(text),
            offset: 0,
            stack: vec![],
            pending: None,
            queue: VecDeque::new(),
            entities,
            dtd_start: None,
            seen_root: false,
            finished: false,
        }
    }

    fn fail(&mut self, err: SaxError) -> Option<Result<SaxEvent, SaxError>> {
        self.finished = true;
        self.queue.clear();
        Some(Err(err))
    }

    fn lookup_namespace_uri(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        if prefix == "xmlns" {
            return Some(XMLNS_NAMESPACE);
        }
        self.stack
            .iter()
            .rev()
            .find_map(|e| e.namespaces.iter().rev().find(|(p, _)| p == prefix))
            .map(|(_, uri)| uri.as_str())
    }

    fn decode(&self, text: StrSpan) -> Result<String, SaxError> {
        let mut buffer = String::new();
        for val in parse_entities(text.start(), text.as_str()) {
            match val? {
                Txt::Text(_, val) => buffer.push_str(val),
                Txt::Char(_, c) => buffer.push(c),
                Txt::Entity(pos, name) => match self.entities.get(name) {
                    Some(txt) => buffer.push_str(txt),
                    None => {
                        return Err(SaxError::UndefinedEntity {
                            name: name.to_string(),
                            offset: pos,
                        })
                    }
                },
            }
        }
        Ok(buffer)
    }

    fn start_tag_end(&mut self, end: usize, self_closing: bool) -> Result<(), SaxError> {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => {
                return Err(SaxError::Xml {
                    message: "unexpected end of tag".to_string(),
                    offset: end,
                })
            }
        };
        let namespaces: Vec<(String, String)> = pending
            .attributes
            .iter()
            .filter(|a| a.is_namespace_declaration())
            .map(|a| (a.declared_prefix().to_string(), a.value.clone()))
            .collect();
        // the element's own declarations are in scope for its name and attributes
        self.stack.push(OpenElement {
            tag: Tag {
                name: String::new(),
                prefix: String::new(),
                local: String::new(),
                uri: String::new(),
                attributes: vec![],
                self_closing,
                start: pending.start,
                end,
            },
            namespaces,
        });
        let uri = match self.lookup_namespace_uri(pending.prefix.as_str()) {
            Some(uri) => uri.to_string(),
            None if pending.prefix.as_str().is_empty() => String::new(),
            None => {
                return Err(SaxError::UndefinedNamespacePrefix {
                    prefix: pending.prefix.to_string(),
                    offset: pending.start,
                })
            }
        };
        let mut attributes = pending.attributes;
        for a in attributes.iter_mut() {
            a.uri = if a.is_namespace_declaration() {
                XMLNS_NAMESPACE.to_string()
            } else if a.prefix.is_empty() {
                String::new()
            } else {
                match self.lookup_namespace_uri(&a.prefix) {
                    Some(uri) => uri.to_string(),
                    None => {
                        return Err(SaxError::UndefinedNamespacePrefix {
                            prefix: a.prefix.clone(),
                            offset: a.start,
                        })
                    }
                }
            };
        }
        for (i, a) in attributes.iter().enumerate() {
            if attributes[..i]
                .iter()
                .any(|b| b.uri == a.uri && b.local == a.local && !a.is_namespace_declaration())
            {
                return Err(SaxError::DuplicateAttribute {
                    name: a.name.clone(),
                    offset: a.start,
                });
            }
        }
        let tag = Tag {
            name: qname(pending.prefix.as_str(), pending.local.as_str()),
            prefix: pending.prefix.to_string(),
            local: pending.local.to_string(),
            uri,
            attributes,
            self_closing,
            start: pending.start,
            end,
        };
        for a in &tag.attributes {
            self.queue.push_back(SaxEvent::Attribute(a.clone()));
        }
        self.queue.push_back(SaxEvent::OpenTag(tag.clone()));
        if self_closing {
            self.stack.pop();
            self.queue.push_back(SaxEvent::CloseTag(tag));
        } else if let Some(top) = self.stack.last_mut() {
            top.tag = tag;
        }
        Ok(())
    }

    fn close_tag(&mut self, prefix: StrSpan, local: StrSpan, end: usize) -> Result<(), SaxError> {
        let name = qname(prefix.as_str(), local.as_str());
        match self.stack.pop() {
            None => Err(SaxError::UnexpectedCloseTag { name, offset: end }),
            Some(open) if open.tag.name != name => Err(SaxError::MismatchedCloseTag {
                expected: open.tag.name,
                found: name,
                offset: end,
            }),
            Some(open) => {
                self.queue.push_back(SaxEvent::CloseTag(open.tag));
                Ok(())
            }
        }
    }

    fn handle(&mut self, token: Token<'a>) -> Result<(), SaxError> {
        match token {
            Token::Declaration { span, .. } | Token::Comment { span, .. } => {
                self.offset = span.end();
            }
            Token::ProcessingInstruction {
                target,
                content,
                span,
            } => {
                self.offset = span.end();
                self.queue.push_back(SaxEvent::ProcessingInstruction {
                    target: target.to_string(),
                    body: content.map(|c| c.to_string()).unwrap_or_default(),
                });
            }
            Token::DtdStart { span, .. } => {
                self.offset = span.end();
                self.dtd_start = Some(span.start());
            }
            Token::EntityDeclaration { span, .. } => {
                // declarations are read from the raw DOCTYPE text by whoever handles it
                self.offset = span.end();
            }
            Token::DtdEnd { span } => {
                self.offset = span.end();
                let start = self.dtd_start.take().unwrap_or_else(|| span.start());
                self.queue
                    .push_back(SaxEvent::Doctype(self.text[start..span.end()].to_string()));
            }
            Token::EmptyDtd { span, .. } => {
                self.offset = span.end();
                self.queue.push_back(SaxEvent::Doctype(span.to_string()));
            }
            Token::ElementStart {
                prefix,
                local,
                span,
            } => {
                self.offset = span.end();
                self.seen_root = true;
                self.pending = Some(PendingTag {
                    prefix,
                    local,
                    start: span.start(),
                    attributes: vec![],
                });
                self.queue.push_back(SaxEvent::OpenTagStart {
                    name: qname(prefix.as_str(), local.as_str()),
                    start: span.start(),
                });
            }
            Token::Attribute {
                prefix,
                local,
                value,
                span,
            } => {
                self.offset = span.end();
                let decoded = normalize_attribute_value(&self.decode(value)?);
                let name = qname(prefix.as_str(), local.as_str());
                let pending = self.pending.as_mut().ok_or_else(|| SaxError::Xml {
                    message: "attribute outside of a start tag".to_string(),
                    offset: span.start(),
                })?;
                if pending.attributes.iter().any(|a| a.name == name) {
                    return Err(SaxError::DuplicateAttribute {
                        name,
                        offset: span.start(),
                    });
                }
                pending.attributes.push(Attribute {
                    name,
                    prefix: prefix.to_string(),
                    local: local.to_string(),
                    uri: String::new(),
                    value: decoded,
                    start: span.start(),
                    end: span.end(),
                    value_start: value.start(),
                    value_end: value.end(),
                });
            }
            Token::ElementEnd { end, span } => {
                self.offset = span.end();
                match end {
                    ElementEnd::Open => self.start_tag_end(span.end(), false)?,
                    ElementEnd::Empty => self.start_tag_end(span.end(), true)?,
                    ElementEnd::Close(prefix, local) => self.close_tag(prefix, local, span.end())?,
                }
            }
            Token::Text { text } => {
                self.offset = text.end();
                let decoded = self.decode(text)?;
                self.queue.push_back(SaxEvent::Text(decoded));
            }
            Token::Cdata { text, span } => {
                self.offset = span.end();
                self.queue.push_back(SaxEvent::Text(text.to_string()));
            }
        }
        Ok(())
    }

    /// The tokenizer only accepts markup outside the root element and stops at anything
    /// else, so content around the root surfaces here as an unknown token
    fn tokenizer_error(&self, e: &xmlparser::Error, offset: usize) -> SaxError {
        let outside_root = self.stack.is_empty() && self.pending.is_none();
        if outside_root && matches!(e, xmlparser::Error::UnknownToken(_)) {
            let rest = &self.text[offset.min(self.text.len())..];
            if self.seen_root && !rest.starts_with("<?") {
                return SaxError::ContentAfterRoot { offset };
            }
            if !self.seen_root && !rest.is_empty() && !rest.starts_with('<') {
                return SaxError::TextBeforeRoot { offset };
            }
        }
        SaxError::Xml {
            message: e.to_string(),
            offset,
        }
    }

    fn finish(&mut self) -> Option<Result<SaxEvent, SaxError>> {
        let end = self.text.len();
        if self.pending.is_some() {
            return self.fail(SaxError::Xml {
                message: "unexpected end of input inside a start tag".to_string(),
                offset: end,
            });
        }
        if let Some(open) = self.stack.last() {
            let name = open.tag.name.clone();
            return self.fail(SaxError::UnclosedElement { name, offset: end });
        }
        if !self.seen_root {
            return self.fail(SaxError::NoRootElement { offset: end });
        }
        self.finished = true;
        self.offset = end;
        Some(Ok(SaxEvent::End))
    }
}

impl<'a> SaxSource for XmlSource<'a> {
    fn next_event(&mut self) -> Option<Result<SaxEvent, SaxError>> {
        loop {
            if let Some(e) = self.queue.pop_front() {
                return Some(Ok(e));
            }
            if self.finished {
                return None;
            }
            match self.tokenizer.next() {
                None => return self.finish(),
                Some(Err(e)) => {
                    let pos = e.pos();
                    let offset = text_pos_to_offset(self.text, pos.row, pos.col);
                    self.offset = offset;
                    let err = self.tokenizer_error(&e, offset);
                    return self.fail(err);
                }
                Some(Ok(token)) => {
                    if let Err(e) = self.handle(token) {
                        return self.fail(e);
                    }
                }
            }
        }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn define_entity(&mut self, name: &str, value: &str) {
        self.entities.insert(name.to_string(), value.to_string());
    }
}

fn qname(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{}:{}", prefix, local)
    }
}

/// Converts the 1-based row / column (in characters) that `xmlparser` reports into a byte
/// offset
pub(crate) fn text_pos_to_offset(text: &str, row: u32, col: u32) -> usize {
    let mut line_start = 0;
    for _ in 1..row.max(1) {
        match text[line_start..].find('\n') {
            Some(i) => line_start += i + 1,
            None => return text.len(),
        }
    }
    let line = &text[line_start..];
    line.char_indices()
        .nth(col.max(1) as usize - 1)
        .map(|(i, _)| line_start + i)
        .unwrap_or(text.len())
}

fn normalize_attribute_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect()
}

enum Txt<'a> {
    Text(usize, &'a str),
    Entity(usize, &'a str),
    Char(usize, char),
}

fn parse_entities(pos: usize, text: &str) -> impl Iterator<Item = Result<Txt, SaxError>> {
    struct Entities<'a> {
        text: &'a str,
        pos: usize,
        offset: usize,
        in_entity: bool,
    }
    impl<'a> Iterator for Entities<'a> {
        type Item = Result<Txt<'a>, SaxError>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.offset == self.text.len() {
                return None;
            }
            for (i, c) in self.text[self.offset..].char_indices() {
                if self.in_entity {
                    if c == ';' {
                        self.in_entity = false;
                        let text = &self.text[self.offset..self.offset + i];
                        // report entity references at their '&'
                        let at = self.pos + self.offset - 1;
                        let result = if let Some(text) = text.strip_prefix('#') {
                            numeric_entity(at, text)
                        } else {
                            Ok(Txt::Entity(at, text))
                        };
                        self.offset += i + 1;
                        return Some(result);
                    }
                } else if c == '&' {
                    self.in_entity = true;
                    let result = Txt::Text(
                        self.offset + self.pos,
                        &self.text[self.offset..self.offset + i],
                    );
                    self.offset += i + 1;
                    return Some(Ok(result));
                }
            }
            let result = if self.in_entity {
                Err(SaxError::InvalidOrUnclosedEntity {
                    offset: self.pos + self.offset - 1,
                })
            } else {
                Ok(Txt::Text(self.offset + self.pos, &self.text[self.offset..]))
            };
            self.offset = self.text.len();
            Some(result)
        }
    }
    fn numeric_entity(pos: usize, text: &str) -> Result<Txt, SaxError> {
        let err = || SaxError::InvalidOrUnclosedEntity { offset: pos };
        let c = match text.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| err())?,
            None => text.parse().map_err(|_| err())?,
        };
        Ok(Txt::Char(pos, std::char::from_u32(c).ok_or_else(err)?))
    }
    Entities {
        text,
        pos,
        offset: 0,
        in_entity: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn events(text: &str) -> Vec<Result<SaxEvent, SaxError>> {
        let mut src = XmlSource::new(text);
        let mut result = vec![];
        while let Some(e) = src.next_event() {
            result.push(e);
        }
        result
    }

    #[test]
    fn self_closing_gives_open_and_close() {
        let evts = events("<root a='1'/>");
        assert_matches!(&evts[0], Ok(SaxEvent::OpenTagStart { name, start: 0 }) if name == "root");
        assert_matches!(&evts[1], Ok(SaxEvent::Attribute(a)) if a.name == "a" && a.value == "1");
        assert_matches!(&evts[2], Ok(SaxEvent::OpenTag(t)) if t.self_closing && t.end == 13);
        assert_matches!(&evts[3], Ok(SaxEvent::CloseTag(t)) if t.name == "root");
        assert_matches!(&evts[4], Ok(SaxEvent::End));
        assert_eq!(evts.len(), 5);
    }

    #[test]
    fn namespaces_resolved() {
        let evts = events("<a xmlns='urn:d' xmlns:p='urn:p'><p:b p:x='1' y='2'/></a>");
        let tag = evts
            .iter()
            .find_map(|e| match e {
                Ok(SaxEvent::OpenTag(t)) if t.local == "b" => Some(t.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(tag.uri, "urn:p");
        assert_eq!(tag.attributes[0].uri, "urn:p");
        assert_eq!(tag.attributes[1].uri, "");
        assert!(tag.attribute("urn:p", "x").is_some());
    }

    #[test]
    fn text_decoded() {
        let evts = events("<a>x &amp; &#65;<![CDATA[<y>]]></a>");
        assert_eq!(evts[2], Ok(SaxEvent::Text("x & A".to_string())));
        assert_eq!(evts[3], Ok(SaxEvent::Text("<y>".to_string())));
    }

    #[test]
    fn mismatched_close() {
        let evts = events("<a><b></a>");
        assert_matches!(evts.last(), Some(Err(SaxError::MismatchedCloseTag { expected, .. })) if expected == "b");
    }

    #[test]
    fn unclosed_root() {
        let evts = events("<a><b/>");
        assert_matches!(evts.last(), Some(Err(SaxError::UnclosedElement { name, offset: 7 })) if name == "a");
    }

    #[test]
    fn undefined_prefix() {
        let evts = events("<q:a/>");
        assert_matches!(evts.last(), Some(Err(SaxError::UndefinedNamespacePrefix { prefix, .. })) if prefix == "q");
    }

    #[test]
    fn undefined_entity_until_defined() {
        let evts = events("<a>&foo;</a>");
        assert_matches!(evts.last(), Some(Err(SaxError::UndefinedEntity { name, offset: 3 })) if name == "foo");

        let mut src = XmlSource::new("<a>&foo;</a>");
        src.define_entity("foo", "bar");
        let mut texts = vec![];
        while let Some(e) = src.next_event() {
            if let Ok(SaxEvent::Text(t)) = e {
                texts.push(t);
            }
        }
        assert_eq!(texts, vec!["bar".to_string()]);
    }

    #[test]
    fn content_after_root() {
        assert_matches!(events("<a/><b/>").last(), Some(Err(SaxError::ContentAfterRoot { .. })));
        assert_matches!(events("<a/>x").last(), Some(Err(SaxError::ContentAfterRoot { offset: 4 })));
        assert_matches!(
            events("<a></a>\n<b></b>").last(),
            Some(Err(SaxError::ContentAfterRoot { offset: 8 }))
        );
        assert_matches!(events("").last(), Some(Err(SaxError::NoRootElement { .. })));
    }

    #[test]
    fn trailing_misc_is_allowed() {
        let evts = events("<a/>\n<!-- c -->\n<?pi x?>\n");
        assert_matches!(evts.last(), Some(Ok(SaxEvent::End)));
    }

    #[test]
    fn broken_markup_after_root_is_a_syntax_error() {
        assert_matches!(events("<a/><!-- x").last(), Some(Err(SaxError::Xml { .. })));
    }

    #[test]
    fn text_before_root() {
        assert_matches!(events("x<a/>").last(), Some(Err(SaxError::TextBeforeRoot { offset: 0 })));
        assert_matches!(
            events("<?xml version='1.0'?>\n  hi <a/>").last(),
            Some(Err(SaxError::TextBeforeRoot { .. }))
        );
        assert_matches!(events("<a>x<b/>").last(), Some(Err(SaxError::UnclosedElement { .. })));
    }

    #[test]
    fn doctype_text() {
        let text = "<!DOCTYPE a [<!ENTITY e \"v\">]><a/>";
        let evts = events(text);
        assert_eq!(
            evts[0],
            Ok(SaxEvent::Doctype("<!DOCTYPE a [<!ENTITY e \"v\">]>".to_string()))
        );
    }

    #[test]
    fn offsets() {
        let mut src = XmlSource::new("<a>\n  <b/>\n</a>");
        let mut seen = vec![];
        while let Some(Ok(e)) = src.next_event() {
            if let SaxEvent::OpenTag(t) = e {
                seen.push((t.name, t.start, src.offset()));
            }
        }
        assert_eq!(
            seen,
            vec![("a".to_string(), 0, 3), ("b".to_string(), 6, 10)]
        );
    }

    #[test]
    fn error_position() {
        assert_eq!(text_pos_to_offset("ab\ncd", 2, 2), 4);
        assert_eq!(text_pos_to_offset("ab\ncd", 1, 1), 0);
        assert_eq!(text_pos_to_offset("ab", 5, 1), 2);
    }
}
