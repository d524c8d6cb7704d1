//! Completion of element names, attribute names and attribute values from the grammar
//! state at the cursor

use crate::validate::{replay, Replayed};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sxml_grammar::{
    Event, Grammar, NameKind, NamePattern, PossibleEvent, ValueCandidate, XML_NAMESPACE,
};
use tracing::debug;

/// How far completion item details are shortened
pub const DETAIL_LENGTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Tag,
    Attribute,
    Value,
}

/// What made the editor ask for completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Character(char),
    Invoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Element,
    Attribute,
    Value,
}

/// Something the editor should do after inserting an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FollowUp {
    MoveCursor { characters: i64 },
    TriggerValueCompletion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    pub label: String,
    pub kind: ItemKind,
    pub insert_text: String,
    pub filter_text: String,
    pub detail: Option<String>,
    pub documentation: Option<String>,
    pub follow_up: Option<FollowUp>,
}

pub fn truncate(text: &str, n: usize) -> String {
    if text.chars().count() > n {
        let mut s: String = text.chars().take(n.saturating_sub(1)).collect();
        s.push('…');
        s
    } else {
        text.to_string()
    }
}

fn floor_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Decides what to complete from the text before the cursor.  `None` means nothing should
/// be offered.
pub fn detect_request(text: &str, offset: usize, trigger: Trigger) -> Option<RequestKind> {
    lazy_static! {
        static ref IN_TAG: Regex = Regex::new(r"<[^>/!?][^>]*$").unwrap();
        static ref VALUE_START: Regex = Regex::new(r#"=["']$"#).unwrap();
        static ref IN_VALUE: Regex = Regex::new(r#"=["']\s*$"#).unwrap();
    }
    let before = &text[..floor_boundary(text, offset)];
    let line = &before[before.rfind('\n').map(|i| i + 1).unwrap_or(0)..];
    match trigger {
        Trigger::Character('<') => Some(RequestKind::Tag),
        Trigger::Character(' ') => {
            if IN_TAG.is_match(before) {
                Some(RequestKind::Attribute)
            } else {
                None
            }
        }
        Trigger::Character('"') | Trigger::Character('\'') => {
            if VALUE_START.is_match(line) {
                Some(RequestKind::Value)
            } else {
                None
            }
        }
        Trigger::Character(_) => None,
        Trigger::Invoked => {
            if IN_VALUE.is_match(line) {
                Some(RequestKind::Value)
            } else if IN_TAG.is_match(before) {
                Some(RequestKind::Attribute)
            } else {
                Some(RequestKind::Tag)
            }
        }
    }
}

/// The offset of the `<` of a start tag that is still open at the end of `before`
fn unclosed_tag_start(before: &str) -> Option<usize> {
    let start = before.rfind('<')?;
    let rest = &before[start + 1..];
    if rest.contains('>') || rest.starts_with(|c| c == '/' || c == '!' || c == '?') {
        None
    } else {
        Some(start)
    }
}

/// A start tag the cursor is in, read without the help of the parser
struct PartialTag {
    name: String,
    attributes: Vec<(String, String)>,
    /// the attribute whose value the cursor is in
    pending: Option<String>,
}

impl PartialTag {
    fn read(text: &str, start: usize, cursor: usize) -> PartialTag {
        lazy_static! {
            static ref NAME: Regex = Regex::new(r"^<([^\s/>]+)").unwrap();
            static ref ATTRIBUTE: Regex =
                Regex::new(r#"([^\s=/<>"']+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
            static ref PENDING: Regex = Regex::new(r#"([^\s=/<>"']+)\s*=\s*(["'])[^"']*$"#).unwrap();
        }
        let head = &text[start..cursor];
        let name = NAME
            .captures(head)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let mut tail = &text[cursor..];
        tail = &tail[..tail.find(|c| c == '<' || c == '>').unwrap_or(tail.len())];
        let pending = PENDING.captures(head).and_then(|c| {
            let quote = c.get(2)?.as_str();
            // the rest of the value being edited is not an attribute of its own
            tail = tail.find(quote).map(|i| &tail[i + 1..]).unwrap_or("");
            Some(c.get(1)?.as_str().to_string())
        });

        let head = &head[1 + name.len()..];
        let attributes = ATTRIBUTE
            .captures_iter(head)
            .chain(ATTRIBUTE.captures_iter(tail))
            .filter_map(|c| {
                let value = c.get(2).or_else(|| c.get(3))?;
                Some((c.get(1)?.as_str().to_string(), value.as_str().to_string()))
            })
            .collect();
        PartialTag {
            name,
            attributes,
            pending,
        }
    }

    fn is_declaration(name: &str) -> bool {
        name == "xmlns" || name.starts_with("xmlns:")
    }

    /// Fires the tag and its complete attributes.  Returns the names of the attributes
    /// already present.
    fn fire(&self, r: &mut Replayed) -> Vec<(String, String)> {
        let declarations: Vec<_> = self
            .attributes
            .iter()
            .filter(|(name, _)| PartialTag::is_declaration(name))
            .collect();
        if !declarations.is_empty() {
            r.names.enter_context();
            for (name, value) in declarations {
                let prefix = name.strip_prefix("xmlns:").unwrap_or("");
                r.names.define_prefix(prefix, value);
            }
        }
        let (ns, local) = r
            .names
            .resolve_name(&self.name, true)
            .unwrap_or_else(|| (String::new(), self.name.as_str()));
        // violations don't matter here, only the state reached
        let _ = r.walker.fire_event(
            Event::EnterStartTag {
                ns: &ns,
                local,
            },
            &r.names,
        );
        let mut present = vec![];
        for (name, value) in &self.attributes {
            if PartialTag::is_declaration(name) {
                continue;
            }
            if let Some((ns, local)) = r.names.resolve_name(name, false) {
                let _ = r
                    .walker
                    .fire_event(Event::AttributeName { ns: &ns, local }, &r.names);
                let _ = r.walker.fire_event(Event::AttributeValue(value), &r.names);
                present.push((ns, local.to_string()));
            }
        }
        present
    }
}

/// Completion items for the position `cursor` of the flattened document text.  `kind`
/// comes from `detect_request`.
pub fn complete(
    flattened: &str,
    grammar: &dyn Grammar,
    cursor: usize,
    kind: RequestKind,
) -> Vec<CompletionItem> {
    let cursor = floor_boundary(flattened, cursor);
    let open_tag = unclosed_tag_start(&flattened[..cursor]);
    match kind {
        RequestKind::Tag => {
            let end = open_tag.unwrap_or(cursor);
            match replay(grammar, &flattened[..end]) {
                Ok(r) => element_items(grammar, &r, open_tag.is_some()),
                Err(e) => {
                    debug!("no element completion: {}", e);
                    vec![]
                }
            }
        }
        RequestKind::Attribute | RequestKind::Value => {
            let start = match open_tag {
                Some(start) => start,
                None => return vec![],
            };
            let tag = PartialTag::read(flattened, start, cursor);
            let mut r = match replay(grammar, &flattened[..start]) {
                Ok(r) => r,
                Err(e) => {
                    debug!("no attribute completion: {}", e);
                    return vec![];
                }
            };
            let present = tag.fire(&mut r);
            if kind == RequestKind::Attribute {
                return attribute_items(grammar, &r, &present);
            }
            let pending = match &tag.pending {
                Some(name) => name,
                None => return vec![],
            };
            if let Some((ns, local)) = r.names.resolve_name(pending, false) {
                let _ = r
                    .walker
                    .fire_event(Event::AttributeName { ns: &ns, local }, &r.names);
            }
            value_items(&r)
        }
    }
}

fn element_item(
    grammar: &dyn Grammar,
    name: &NamePattern,
    label: String,
    qname: String,
    xmlns: String,
    lt: &str,
) -> CompletionItem {
    let documentation = grammar
        .documentation(NameKind::Element, name)
        .map(str::to_string);
    CompletionItem {
        label,
        kind: ItemKind::Element,
        insert_text: format!("{}{}{}></{}>", lt, qname, xmlns, qname),
        filter_text: qname.clone(),
        detail: documentation.as_deref().map(|d| truncate(d, DETAIL_LENGTH)),
        documentation,
        follow_up: Some(FollowUp::MoveCursor {
            characters: -((qname.chars().count() + 3) as i64),
        }),
    }
}

fn element_items(grammar: &dyn Grammar, r: &Replayed, after_lt: bool) -> Vec<CompletionItem> {
    let lt = if after_lt { "" } else { "<" };
    if !r.saw_root {
        return grammar
            .start_names()
            .iter()
            .map(|n| {
                let xmlns = if n.namespace().is_empty() {
                    String::new()
                } else {
                    format!(" xmlns=\"{}\"", n.namespace())
                };
                element_item(grammar, n, n.name.clone(), n.name.clone(), xmlns, lt)
            })
            .collect();
    }

    // the same name may be reachable along several paths through the grammar
    let mut candidates: Vec<NamePattern> = vec![];
    for p in r.walker.possible() {
        if let PossibleEvent::EnterStartTag(nc) = p {
            for n in nc.names() {
                if !candidates.contains(&n) {
                    candidates.push(n);
                }
            }
        }
    }
    let parent = r.parent_uri.as_deref().unwrap_or("");
    candidates
        .iter()
        .map(|n| {
            let ns = n.namespace();
            let bound = if ns.is_empty() {
                None
            } else {
                r.names.prefix_for(ns)
            };
            let (qname, xmlns) = if r.names.default_namespace() == ns {
                (n.name.clone(), String::new())
            } else if let Some(prefix) = bound {
                (format!("{}:{}", prefix, n.name), String::new())
            } else {
                (n.name.clone(), format!(" xmlns=\"{}\"", ns))
            };
            let label = if ns != parent && !ns.is_empty() {
                format!("{} {}", qname, ns)
            } else {
                qname.clone()
            };
            element_item(grammar, n, label, qname, xmlns, lt)
        })
        .collect()
}

fn attribute_items(
    grammar: &dyn Grammar,
    r: &Replayed,
    present: &[(String, String)],
) -> Vec<CompletionItem> {
    let mut candidates: Vec<NamePattern> = vec![];
    for p in r.walker.possible() {
        if let PossibleEvent::AttributeName(nc) = p {
            for n in nc.names() {
                let is_present = present
                    .iter()
                    .any(|(ns, local)| ns == n.namespace() && *local == n.name);
                if !is_present && !candidates.contains(&n) {
                    candidates.push(n);
                }
            }
        }
    }

    let mut generated: Vec<(String, String)> = vec![];
    let mut next = 1;
    let mut items = vec![];
    for n in &candidates {
        let ns = n.namespace();
        let (prefix, xmlns) = if ns.is_empty() {
            (String::new(), String::new())
        } else if ns == XML_NAMESPACE {
            ("xml:".to_string(), String::new())
        } else if let Some(prefix) = r.names.prefix_for(ns) {
            (format!("{}:", prefix), String::new())
        } else {
            let prefix = match generated.iter().find(|(uri, _)| uri == ns) {
                Some((_, prefix)) => prefix.clone(),
                None => {
                    let prefix = loop {
                        let candidate = format!("ns{}", next);
                        next += 1;
                        if !r.names.is_bound(&candidate) {
                            break candidate;
                        }
                    };
                    generated.push((ns.to_string(), prefix.clone()));
                    prefix
                }
            };
            (
                format!("{}:", prefix),
                format!("xmlns:{}=\"{}\" ", prefix, ns),
            )
        };
        let qname = format!("{}{}", prefix, n.name);
        let label = if xmlns.is_empty() {
            qname.clone()
        } else {
            format!("{} {}", qname, ns)
        };
        let documentation = grammar
            .documentation(NameKind::Attribute, n)
            .map(str::to_string);
        items.push(CompletionItem {
            label,
            kind: ItemKind::Attribute,
            insert_text: format!("{}{}=\"\"", xmlns, qname),
            filter_text: qname,
            detail: documentation.as_deref().map(|d| truncate(d, DETAIL_LENGTH)),
            documentation,
            follow_up: Some(FollowUp::TriggerValueCompletion),
        });
    }
    items
}

fn value_items(r: &Replayed) -> Vec<CompletionItem> {
    let mut values: Vec<String> = vec![];
    for p in r.walker.possible() {
        // open-ended datatypes can't be enumerated
        if let PossibleEvent::AttributeValue(ValueCandidate::Literal(v)) = p {
            if !values.contains(&v) {
                values.push(v);
            }
        }
    }
    values
        .into_iter()
        .map(|v| CompletionItem {
            label: v.clone(),
            kind: ItemKind::Value,
            insert_text: v.clone(),
            filter_text: v,
            detail: None,
            documentation: None,
            follow_up: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sxml_grammar::RngGrammar;

    const RNG: &str = "xmlns=\"http://relaxng.org/ns/structure/1.0\"";
    const TEI: &str = "http://www.tei-c.org/ns/1.0";

    fn grammar(schema: &str) -> RngGrammar {
        match RngGrammar::parse(schema) {
            Ok(g) => g,
            Err(e) => panic!("{:?}", e),
        }
    }

    fn labels(items: &[CompletionItem]) -> Vec<&str> {
        items.iter().map(|i| i.label.as_str()).collect()
    }

    fn at_end(g: &RngGrammar, text: &str, trigger: Trigger) -> Vec<CompletionItem> {
        match detect_request(text, text.len(), trigger) {
            Some(kind) => complete(text, g, text.len(), kind),
            None => vec![],
        }
    }

    #[test]
    fn document_element() {
        let g = grammar(&format!(
            "<grammar {} ns=\"{}\"><start><ref name=\"tei\"/></start>\
             <define name=\"tei\"><element name=\"TEI\"><a:documentation \
             xmlns:a=\"http://relaxng.org/ns/compatibility/annotations/1.0\">A TEI document</a:documentation>\
             <empty/></element></define></grammar>",
            RNG, TEI
        ));
        let items = at_end(&g, "<", Trigger::Character('<'));
        assert_eq!(labels(&items), vec!["TEI"]);
        assert_eq!(items[0].insert_text, format!("TEI xmlns=\"{}\"></TEI>", TEI));
        assert_eq!(items[0].detail.as_deref(), Some("A TEI document"));
    }

    #[test]
    fn children() {
        let g = grammar(&format!(
            "<element {} name=\"root\"><zeroOrMore><choice><element name=\"x\"><empty/></element>\
             <element name=\"y\"><empty/></element></choice></zeroOrMore></element>",
            RNG
        ));
        let items = at_end(&g, "<root>\n  <x/>\n  <", Trigger::Character('<'));
        assert_eq!(labels(&items), vec!["x", "y"]);
        assert_eq!(items[0].insert_text, "x></x>");
        assert_eq!(items[0].follow_up, Some(FollowUp::MoveCursor { characters: -4 }));

        let items = complete("<root></root>", &g, 6, RequestKind::Tag);
        assert_eq!(items[1].insert_text, "<y></y>");
    }

    #[test]
    fn namespaces_for_elements() {
        let g = grammar(&format!(
            "<element {} name=\"root\" ns=\"urn:a\"><element name=\"b\" ns=\"urn:b\"><empty/></element></element>",
            RNG
        ));
        let items = at_end(&g, "<root xmlns=\"urn:a\" xmlns:q=\"urn:b\"><", Trigger::Character('<'));
        assert_eq!(labels(&items), vec!["q:b urn:b"]);
        assert_eq!(items[0].insert_text, "q:b></q:b>");

        let items = at_end(&g, "<root xmlns=\"urn:a\"><", Trigger::Character('<'));
        assert_eq!(items[0].insert_text, "b xmlns=\"urn:b\"></b>");
    }

    #[test]
    fn attributes() {
        let g = grammar(&format!(
            "<element {} name=\"a\"><attribute name=\"x\"/><optional><attribute name=\"y\"/></optional>\
             <optional><attribute name=\"xml:lang\"/></optional>\
             <optional><attribute name=\"q\" ns=\"urn:q\"/></optional></element>",
            RNG
        ));
        let items = at_end(&g, "<a x=\"1\" ", Trigger::Character(' '));
        assert_eq!(labels(&items), vec!["y", "xml:lang", "ns1:q urn:q"]);
        assert_eq!(items[2].insert_text, "xmlns:ns1=\"urn:q\" ns1:q=\"\"");
        assert_eq!(items[0].follow_up, Some(FollowUp::TriggerValueCompletion));

        // attributes after the cursor count as present too
        let text = "<a  y=\"2\"/>";
        let items = complete(text, &g, 3, RequestKind::Attribute);
        assert_eq!(labels(&items), vec!["x", "xml:lang", "ns1:q urn:q"]);
    }

    #[test]
    fn values() {
        let g = grammar(&format!(
            "<element {} name=\"a\"><attribute name=\"type\"><choice><value>one</value><value>two</value>\
             <data type=\"integer\" datatypeLibrary=\"http://www.w3.org/2001/XMLSchema-datatypes\"/>\
             </choice></attribute><optional><attribute name=\"n\"/></optional></element>",
            RNG
        ));
        let items = at_end(&g, "<a n=\"1\" type=\"", Trigger::Character('"'));
        assert_eq!(labels(&items), vec!["one", "two"]);

        let text = "<a type=\"o\" n=\"1\"/>";
        let items = complete(text, &g, 10, RequestKind::Value);
        assert_eq!(labels(&items), vec!["one", "two"]);
    }

    #[test]
    fn request_detection() {
        assert_eq!(detect_request("<a ", 3, Trigger::Character(' ')), Some(RequestKind::Attribute));
        assert_eq!(detect_request("<a>x ", 5, Trigger::Character(' ')), None);
        assert_eq!(detect_request("<a b=\"", 6, Trigger::Character('"')), Some(RequestKind::Value));
        assert_eq!(detect_request("<a>\"", 4, Trigger::Character('"')), None);
        assert_eq!(detect_request("<a b=\" ", 7, Trigger::Invoked), Some(RequestKind::Value));
        assert_eq!(detect_request("<a b", 4, Trigger::Invoked), Some(RequestKind::Attribute));
        assert_eq!(detect_request("<a>", 3, Trigger::Invoked), Some(RequestKind::Tag));
        assert_eq!(detect_request("<a>", 3, Trigger::Character('x')), None);
    }

    #[test]
    fn no_open_tag_no_attributes() {
        let g = grammar(&format!("<element {} name=\"a\"><attribute name=\"x\"/></element>", RNG));
        assert!(complete("<a x=\"1\">", &g, 9, RequestKind::Attribute).is_empty());
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
