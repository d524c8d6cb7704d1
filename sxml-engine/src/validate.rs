//! Drives the SAX stream of a flattened document through a grammar walker and turns
//! every rejection into a diagnostic against the original document.

use crate::error::EngineError;
use crate::sax::{SaxEvent, SaxSource, Tag, XmlSource};
use crate::text::{Position, Range, TextIndex};
use crate::xinclude::{IncludeSite, Marker};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use sxml_grammar::{Event, Grammar, GrammarWalker, NameResolver, Violation};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What went wrong with a document, least severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NoError,
    IncludeUnresolved,
    SchematronViolation,
    GrammarViolation,
    Incomplete,
    SchemaInvalid,
    NotWellFormed,
}

impl ErrorKind {
    pub fn status_label(self) -> &'static str {
        match self {
            ErrorKind::NoError => "valid",
            ErrorKind::IncludeUnresolved
            | ErrorKind::SchematronViolation
            | ErrorKind::GrammarViolation
            | ErrorKind::Incomplete => "not valid",
            ErrorKind::SchemaInvalid => "schema incorrect",
            ErrorKind::NotWellFormed => "not well-formed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// in the coordinates of the document being edited
    pub range: Range,
    pub message: String,
    pub severity: Severity,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub error_kind: ErrorKind,
    pub error_count: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        ValidationResult {
            error_kind: ErrorKind::NoError,
            error_count: 0,
            diagnostics: vec![],
        }
    }
}

impl ValidationResult {
    /// A result holding a single error
    pub fn single(kind: ErrorKind, range: Range, message: String) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.push(kind, Severity::Error, range, message);
        result
    }

    pub fn push(&mut self, kind: ErrorKind, severity: Severity, range: Range, message: String) {
        if severity == Severity::Error {
            self.error_count += 1;
            self.error_kind = self.error_kind.max(kind);
        }
        self.diagnostics.push(Diagnostic {
            range,
            message,
            severity,
            kind,
        });
    }

    pub fn is_valid(&self) -> bool {
        self.error_kind == ErrorKind::NoError
    }

    /// Appends the findings of a later phase
    pub fn merge(&mut self, other: ValidationResult) {
        self.error_kind = self.error_kind.max(other.error_kind);
        self.error_count += other.error_count;
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn status_message(&self, schematron_pending: bool) -> String {
        let msg = match self.error_kind {
            ErrorKind::NoError => "XML is valid",
            ErrorKind::SchemaInvalid => "RNG schema is incorrect",
            ErrorKind::NotWellFormed => "XML is not well formed",
            _ => "XML is not valid",
        };
        let tail = if self.error_count > 0 {
            format!(" Errors: {}", self.error_count)
        } else {
            String::new()
        };
        if schematron_pending {
            format!("{}{}; checking Schematron.", msg, tail)
        } else {
            format!("{}{}.", msg, tail)
        }
    }
}

fn render(violation: &Violation) -> String {
    let mut message = violation.message.clone();
    for name in &violation.names {
        message.push(' ');
        message.push_str(&name.to_string());
    }
    message
}

/// Reads `<!ENTITY name "value">` declarations from the internal subset of a DOCTYPE.  Any
/// other declaration is an error, as is declaring the same entity twice.
pub fn scan_doctype_entities(doctype: &str) -> Result<Vec<(String, String)>, String> {
    lazy_static! {
        static ref COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
        static ref ENTITY: Regex =
            Regex::new(r#"(?s)^<!ENTITY\s+([^\s%"']+)\s+(?:"([^"]*)"|'([^']*)')\s*>"#).unwrap();
    }
    let doctype = COMMENT.replace_all(doctype, "");
    let subset = match (doctype.find('['), doctype.rfind(']')) {
        (Some(open), Some(close)) if open < close => &doctype[open + 1..close],
        _ => return Ok(vec![]),
    };
    let mut entities: Vec<(String, String)> = vec![];
    let mut rest = subset.trim_start();
    while !rest.is_empty() {
        let caps = ENTITY
            .captures(rest)
            .ok_or_else(|| "unexpected construct in DOCTYPE".to_string())?;
        let name = &caps[1];
        if entities.iter().any(|(n, _)| n == name) {
            return Err(format!("redefining entity: {}", name));
        }
        let value = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or("");
        entities.push((name.to_string(), value.to_string()));
        rest = rest[caps[0].len()..].trim_start();
    }
    Ok(entities)
}

struct TagInfo {
    ns: String,
    local: String,
    has_context: bool,
    /// the start tag, already mapped to the original document
    range: Range,
}

/// The state of one pass over a document
struct Pass<'a> {
    walker: Option<Box<dyn GrammarWalker>>,
    names: NameResolver,
    original: &'a TextIndex,
    tags: Vec<TagInfo>,
    includes: Vec<IncludeSite>,
    /// flattened offset minus original offset, for text of the root document
    adjustment: isize,
    text: String,
    /// the pending text run, mapped as it is read since an include may start or end within it
    text_from: Position,
    text_to: Position,
    saw_root: bool,
    notices: HashSet<String>,
    result: ValidationResult,
}

impl<'a> Pass<'a> {
    fn new(walker: Option<Box<dyn GrammarWalker>>, original: &'a TextIndex) -> Pass<'a> {
        Pass {
            walker,
            names: NameResolver::default(),
            original,
            tags: vec![],
            includes: vec![],
            adjustment: 0,
            text: String::new(),
            text_from: Position::default(),
            text_to: Position::default(),
            saw_root: false,
            notices: HashSet::new(),
            result: ValidationResult::default(),
        }
    }

    /// Feeds every event of `source`, stopping at the first well-formedness error
    fn drive(
        &mut self,
        source: &mut dyn SaxSource,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut last_offset = 0;
        while let Some(event) = source.next_event() {
            if cancel.is_cancelled() {
                debug!(offset = last_offset, "validation pass cancelled");
                return Err(EngineError::Cancelled);
            }
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    self.not_well_formed(e.to_string(), e.offset());
                    break;
                }
            };
            match event {
                SaxEvent::OpenTagStart { .. } | SaxEvent::Attribute(_) => {}
                SaxEvent::OpenTag(tag) => {
                    self.flush_text();
                    self.open_tag(&tag);
                }
                SaxEvent::Text(text) => {
                    if self.text.is_empty() {
                        self.text_from = self.map_range(last_offset, last_offset).start;
                    }
                    self.text.push_str(&text);
                    self.text_to = self.map_range(source.offset(), source.offset()).end;
                }
                SaxEvent::CloseTag(_) => {
                    self.flush_text();
                    self.close_tag(source.offset())?;
                }
                SaxEvent::Doctype(doctype) => match scan_doctype_entities(&doctype) {
                    Ok(entities) => {
                        for (name, value) in entities {
                            source.define_entity(&name, &value);
                        }
                    }
                    Err(message) => {
                        self.not_well_formed(message, last_offset);
                        break;
                    }
                },
                SaxEvent::ProcessingInstruction { target, body } => {
                    if let Some(marker) = Marker::parse(&target, &body) {
                        self.marker(marker, source.offset());
                    }
                }
                SaxEvent::End => self.end(),
            }
            last_offset = source.offset();
        }
        Ok(())
    }

    fn to_original(&self, flat: usize) -> usize {
        (flat as isize - self.adjustment).max(0) as usize
    }

    fn map_range(&self, start: usize, end: usize) -> Range {
        match self.includes.last() {
            Some(site) => self.original.range(site.start, site.end),
            None => self
                .original
                .range(self.to_original(start), self.to_original(end)),
        }
    }

    fn fire(&mut self, event: Event<'_>, range: Range) {
        if let Some(walker) = self.walker.as_mut() {
            if let Err(violations) = walker.fire_event(event, &self.names) {
                for v in violations {
                    self.result
                        .push(ErrorKind::GrammarViolation, Severity::Error, range, render(&v));
                }
            }
        }
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let range = Range::new(self.text_from, self.text_to);
        self.fire(Event::Text(&text), range);
    }

    fn open_tag(&mut self, tag: &Tag) {
        let range = self.map_range(tag.start, tag.end);
        let (declarations, mut attributes): (Vec<_>, Vec<_>) = tag
            .attributes
            .iter()
            .partition(|a| a.is_namespace_declaration());
        let has_context = !declarations.is_empty();
        if has_context {
            self.names.enter_context();
            for d in declarations {
                self.names.define_prefix(d.declared_prefix(), &d.value);
            }
        }
        attributes.sort_by(|a, b| (&a.uri, &a.local).cmp(&(&b.uri, &b.local)));

        self.fire(
            Event::EnterStartTag {
                ns: &tag.uri,
                local: &tag.local,
            },
            range,
        );
        for a in attributes {
            let attr_range = self.map_range(a.start, a.end);
            self.fire(
                Event::AttributeName {
                    ns: &a.uri,
                    local: &a.local,
                },
                attr_range,
            );
            self.fire(Event::AttributeValue(&a.value), attr_range);
        }
        self.fire(Event::LeaveStartTag, range);
        self.saw_root = true;
        self.tags.push(TagInfo {
            ns: tag.uri.clone(),
            local: tag.local.clone(),
            has_context,
            range,
        });
    }

    fn close_tag(&mut self, offset: usize) -> Result<(), EngineError> {
        let info = self
            .tags
            .pop()
            .ok_or(EngineError::StackUnderflow { offset })?;
        self.fire(
            Event::EndTag {
                ns: &info.ns,
                local: &info.local,
            },
            info.range,
        );
        if info.has_context {
            self.names.leave_context();
        }
        Ok(())
    }

    fn marker(&mut self, marker: Marker, offset: usize) {
        match marker {
            Marker::EnterInclude(site) => self.includes.push(site),
            Marker::LeaveInclude { resume } => {
                self.includes.pop();
                if self.includes.is_empty() {
                    self.adjustment = offset as isize - resume as isize;
                }
            }
            Marker::EnterNested { .. } | Marker::LeaveNested => {}
            Marker::IncludeError { message, site } => {
                let range = self.site_range(&site, offset);
                self.result.push(
                    ErrorKind::IncludeUnresolved,
                    Severity::Error,
                    range,
                    format!("Could not resolve XInclude: {}", message),
                );
            }
            Marker::Notice { message, site } => {
                let range = self.site_range(&site, offset);
                if self.notices.insert(message.clone()) {
                    self.result
                        .push(ErrorKind::NoError, Severity::Information, range, message);
                }
            }
        }
    }

    /// The range reported for a marker that stands in for an include element.  Markers of
    /// the root document also move the adjustment past the element they replace.
    fn site_range(&mut self, site: &IncludeSite, offset: usize) -> Range {
        match self.includes.last() {
            Some(top) => self.original.range(top.start, top.end),
            None => {
                self.adjustment = offset as isize - site.end as isize;
                self.original.range(site.start, site.end)
            }
        }
    }

    fn not_well_formed(&mut self, message: String, flat_offset: usize) {
        let range = match self.includes.last() {
            Some(site) => self.original.range(site.start, site.end),
            None => Range::point(self.original.position(self.to_original(flat_offset))),
        };
        self.result
            .push(ErrorKind::NotWellFormed, Severity::Error, range, message);
    }

    fn end(&mut self) {
        if let Some(walker) = self.walker.as_mut() {
            if let Err(violations) = walker.end() {
                let range = Range::point(self.original.position(self.original.len()));
                for v in violations {
                    self.result
                        .push(ErrorKind::Incomplete, Severity::Error, range, render(&v));
                }
            }
        }
    }
}

/// Validates one document against an optional grammar.  Without a grammar only
/// well-formedness is checked.
pub struct Driver<'a> {
    grammar: Option<&'a dyn Grammar>,
    original: &'a TextIndex,
}

impl<'a> Driver<'a> {
    pub fn new(grammar: Option<&'a dyn Grammar>, original: &'a TextIndex) -> Driver<'a> {
        Driver { grammar, original }
    }

    /// Runs a whole pass over the events of `source`, the flattened form of the original
    /// document.  Grammar violations and well-formedness errors end up in the result; only
    /// cancellation and internal inconsistencies are errors.
    pub fn run(
        &self,
        source: &mut dyn SaxSource,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, EngineError> {
        self.run_with_names(source, cancel).map(|(result, _)| result)
    }

    pub(crate) fn run_with_names(
        &self,
        source: &mut dyn SaxSource,
        cancel: &CancellationToken,
    ) -> Result<(ValidationResult, NameResolver), EngineError> {
        let mut pass = Pass::new(self.grammar.map(|g| g.new_walker()), self.original);
        pass.drive(source, cancel)?;
        Ok((pass.result, pass.names))
    }
}

/// The grammar state reached at the end of some text, typically a document cut off at the
/// cursor
pub(crate) struct Replayed {
    pub walker: Box<dyn GrammarWalker>,
    pub names: NameResolver,
    /// namespace of the innermost open element
    pub parent_uri: Option<String>,
    pub saw_root: bool,
}

/// Feeds the events of `text` to a new walker, stopping quietly at the first
/// well-formedness error
pub(crate) fn replay(grammar: &dyn Grammar, text: &str) -> Result<Replayed, EngineError> {
    let index = TextIndex::new("", text.to_string());
    let mut pass = Pass::new(Some(grammar.new_walker()), &index);
    let mut source = XmlSource::new(text);
    pass.drive(&mut source, &CancellationToken::new())?;
    pass.flush_text();
    let walker = match pass.walker.take() {
        Some(walker) => walker,
        None => grammar.new_walker(),
    };
    Ok(Replayed {
        walker,
        parent_uri: pass.tags.last().map(|t| t.ns.clone()),
        saw_root: pass.saw_root,
        names: pass.names,
    })
}

/// Validates the flattened text of `original`
pub fn validate(
    flattened: &str,
    original: &TextIndex,
    grammar: Option<&dyn Grammar>,
    cancel: &CancellationToken,
) -> Result<ValidationResult, EngineError> {
    let mut source = XmlSource::new(flattened);
    Driver::new(grammar, original).run(&mut source, cancel)
}
