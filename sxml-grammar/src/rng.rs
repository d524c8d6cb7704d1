//! Reads a schema written in the RELAX NG XML syntax into a `GrammarModel`

use crate::datatype::{
    normalize_whitespace, DatatypeValues, Datatypes, Facets, XsdDatatype, XSD_NAMESPACE_URI,
};
use crate::model::{Define, DefineId, GrammarModel, NameClass, NameKind, Pattern};
use crate::SchemaError;
use roxmltree::Node;
use std::collections::HashMap;

const NS: &str = "http://relaxng.org/ns/structure/1.0";
const ANNOTATIONS_NS: &str = "http://relaxng.org/ns/compatibility/annotations/1.0";

type Result<T> = std::result::Result<T, SchemaError>;

pub fn parse(text: &str) -> Result<GrammarModel> {
    let doc = roxmltree::Document::parse(text).map_err(|e| SchemaError::Xml(e.to_string()))?;
    let root = doc.root_element();
    if !is_rng_node(root) {
        return Err(SchemaError::Expected(
            "root element in the http://relaxng.org/ns/structure/1.0 namespace",
        ));
    }
    let mut loader = Loader::default();
    let start = loader.pattern(root)?;
    Ok(GrammarModel {
        start,
        defines: loader.defines,
        documentation: loader.documentation,
    })
}

#[derive(Default)]
struct Loader {
    defines: Vec<Define>,
    defined: Vec<bool>,
    /// one name table per nested `<grammar>`
    scopes: Vec<HashMap<String, DefineId>>,
    documentation: HashMap<(NameKind, String, String), String>,
}

impl Loader {
    fn pattern(&mut self, node: Node) -> Result<Pattern> {
        if !is_rng_node(node) {
            return Err(SchemaError::Expected("pattern"));
        }
        match node.tag_name().name() {
            "element" => self.element(node),
            "attribute" => self.attribute(node),
            "group" => Ok(Pattern::Group(self.children(node)?)),
            "interleave" => Ok(Pattern::Interleave(self.children(node)?)),
            "choice" => Ok(Pattern::Choice(self.children(node)?)),
            "optional" => Ok(Pattern::Optional(Box::new(self.content(node)?))),
            "zeroOrMore" => Ok(Pattern::ZeroOrMore(Box::new(self.content(node)?))),
            "oneOrMore" => Ok(Pattern::OneOrMore(Box::new(self.content(node)?))),
            "list" => Ok(Pattern::List(Box::new(self.content(node)?))),
            "mixed" => Ok(Pattern::Mixed(Box::new(self.content(node)?))),
            "ref" => self.reference(node, 1),
            "parentRef" => self.reference(node, 2),
            "empty" => Ok(Pattern::Empty),
            "text" => Ok(Pattern::Text),
            "notAllowed" => Ok(Pattern::NotAllowed),
            "value" => value(node),
            "data" => self.data(node),
            "grammar" => self.grammar(node),
            "externalRef" => Err(SchemaError::Unsupported("externalRef")),
            other => Err(SchemaError::UnexpectedElement(other.to_string())),
        }
    }

    fn children(&mut self, node: Node) -> Result<Vec<Pattern>> {
        let mut result = vec![];
        let mut child = first_rng_child(node);
        while let Some(c) = child {
            result.push(self.pattern(c)?);
            child = next_rng_sibling(c);
        }
        if result.is_empty() {
            return Err(SchemaError::Expected("pattern child"));
        }
        Ok(result)
    }

    /// Several child patterns are an implicit group
    fn content(&mut self, node: Node) -> Result<Pattern> {
        let mut v = self.children(node)?;
        Ok(if v.len() == 1 {
            v.remove(0)
        } else {
            Pattern::Group(v)
        })
    }

    fn content_from<'a, 'input: 'a>(
        &mut self,
        first: Option<Node<'a, 'input>>,
    ) -> Result<Vec<Pattern>> {
        let mut result = vec![];
        let mut child = first;
        while let Some(c) = child {
            result.push(self.pattern(c)?);
            child = next_rng_sibling(c);
        }
        Ok(result)
    }

    fn element(&mut self, node: Node) -> Result<Pattern> {
        let (name_class, rest) = match node.attribute("name") {
            Some(name) => (qname_att(node, name, true)?, first_rng_child(node)),
            None => {
                let name_el = first_rng_child(node)
                    .ok_or(SchemaError::Expected("name class and pattern children"))?;
                (name_class(name_el)?, next_rng_sibling(name_el))
            }
        };
        self.record_documentation(node, NameKind::Element, &name_class);
        let mut content = self.content_from(rest)?;
        let pattern = match content.len() {
            0 => return Err(SchemaError::Expected("pattern child")),
            1 => content.remove(0),
            _ => Pattern::Group(content),
        };
        Ok(Pattern::Element(name_class, Box::new(pattern)))
    }

    fn attribute(&mut self, node: Node) -> Result<Pattern> {
        let (name_class, rest) = match node.attribute("name") {
            // unprefixed attribute names are in no namespace unless ns is given right here
            Some(name) => (qname_att(node, name, false)?, first_rng_child(node)),
            None => {
                let name_el = first_rng_child(node)
                    .ok_or(SchemaError::Expected("name class child"))?;
                (name_class(name_el)?, next_rng_sibling(name_el))
            }
        };
        self.record_documentation(node, NameKind::Attribute, &name_class);
        let mut content = self.content_from(rest)?;
        let pattern = match content.len() {
            0 => Pattern::Text,
            1 => content.remove(0),
            _ => Pattern::Group(content),
        };
        Ok(Pattern::Attribute(name_class, Box::new(pattern)))
    }

    fn record_documentation(&mut self, node: Node, kind: NameKind, name_class: &NameClass) {
        let doc = node
            .children()
            .filter(|c| {
                c.is_element()
                    && c.tag_name().namespace() == Some(ANNOTATIONS_NS)
                    && c.tag_name().name() == "documentation"
            })
            .filter_map(|c| c.text())
            .map(|t| normalize_whitespace(t))
            .collect::<Vec<_>>()
            .join("\n");
        if doc.is_empty() {
            return;
        }
        for name in name_class.names() {
            self.documentation
                .entry((kind, name.namespace().to_string(), name.name.clone()))
                .or_insert_with(|| doc.clone());
        }
    }

    fn reference(&mut self, node: Node, up: usize) -> Result<Pattern> {
        let name = node
            .attribute("name")
            .ok_or(SchemaError::Expected("name attribute"))?
            .trim();
        if self.scopes.len() < up {
            return Err(SchemaError::UndefinedReference(name.to_string()));
        }
        let scope = self.scopes.len() - up;
        Ok(Pattern::Ref(self.define_id(scope, name)))
    }

    fn define_id(&mut self, scope: usize, name: &str) -> DefineId {
        if let Some(id) = self.scopes[scope].get(name) {
            return *id;
        }
        let id = DefineId(self.defines.len());
        self.defines.push(Define {
            name: name.to_string(),
            pattern: Pattern::NotAllowed,
        });
        self.defined.push(false);
        self.scopes[scope].insert(name.to_string(), id);
        id
    }

    fn grammar(&mut self, node: Node) -> Result<Pattern> {
        self.scopes.push(HashMap::new());
        let mut start = None;
        self.grammar_content(node, &mut start)?;
        let scope = self.scopes.pop().unwrap_or_default();
        if let Some((name, _)) = scope.iter().find(|(_, id)| !self.defined[id.0]) {
            return Err(SchemaError::UndefinedReference(name.clone()));
        }
        start.ok_or(SchemaError::Expected("start element"))
    }

    fn grammar_content(&mut self, node: Node, start: &mut Option<Pattern>) -> Result<()> {
        let mut child = first_rng_child(node);
        while let Some(c) = child {
            match c.tag_name().name() {
                "start" => {
                    let p = self.content(c)?;
                    *start = Some(match start.take() {
                        Some(prev) => combine(c, prev, p),
                        None => p,
                    });
                }
                "define" => {
                    let name = c
                        .attribute("name")
                        .ok_or(SchemaError::Expected("name attribute"))?
                        .trim()
                        .to_string();
                    let scope = self.scopes.len() - 1;
                    let id = self.define_id(scope, &name);
                    let p = self.content(c)?;
                    let pattern = if self.defined[id.0] {
                        let prev = std::mem::replace(&mut self.defines[id.0].pattern, Pattern::Empty);
                        combine(c, prev, p)
                    } else {
                        p
                    };
                    self.defines[id.0].pattern = pattern;
                    self.defined[id.0] = true;
                }
                "div" => self.grammar_content(c, start)?,
                "include" => return Err(SchemaError::Unsupported("include")),
                other => return Err(SchemaError::UnexpectedElement(other.to_string())),
            }
            child = next_rng_sibling(c);
        }
        Ok(())
    }

    fn data(&mut self, node: Node) -> Result<Pattern> {
        let type_name = node
            .attribute("type")
            .ok_or(SchemaError::Expected("type attribute"))?
            .trim();
        let library = get_datatype_lib(node);
        let mut facets = Facets::default();
        let mut except = None;
        let mut child = first_rng_child(node);
        while let Some(c) = child {
            match c.tag_name().name() {
                "param" => {
                    let name = c
                        .attribute("name")
                        .ok_or(SchemaError::Expected("name attribute"))?;
                    facets.add(name.trim(), c.text().unwrap_or(""))?;
                }
                "except" => {
                    let mut v = self.children(c)?;
                    except = Some(Box::new(if v.len() == 1 {
                        v.remove(0)
                    } else {
                        Pattern::Choice(v)
                    }));
                }
                other => return Err(SchemaError::UnexpectedElement(other.to_string())),
            }
            child = next_rng_sibling(c);
        }
        let datatype = match (library, type_name) {
            ("", "string") if facets == Facets::default() => Datatypes::String,
            ("", "token") if facets == Facets::default() => Datatypes::Token,
            (XSD_NAMESPACE_URI, name) => match XsdDatatype::from_name(name) {
                Some(dt) => Datatypes::Xsd(dt, facets),
                None => return Err(unknown_datatype(library, name)),
            },
            (library, name) => return Err(unknown_datatype(library, name)),
        };
        Ok(Pattern::DatatypeName { datatype, except })
    }
}

fn unknown_datatype(library: &str, name: &str) -> SchemaError {
    SchemaError::UnknownDatatype {
        library: library.to_string(),
        name: name.to_string(),
    }
}

fn combine(node: Node, prev: Pattern, next: Pattern) -> Pattern {
    match node.attribute("combine") {
        Some("interleave") => Pattern::Interleave(vec![prev, next]),
        _ => Pattern::Choice(vec![prev, next]),
    }
}

fn value(node: Node) -> Result<Pattern> {
    let text = node.text().unwrap_or("");
    let library = get_datatype_lib(node);
    let datatype = match (library, node.attribute("type").map(str::trim)) {
        ("", None) | ("", Some("token")) => DatatypeValues::Token(normalize_whitespace(text)),
        ("", Some("string")) => DatatypeValues::String(text.to_string()),
        (XSD_NAMESPACE_URI, Some("string")) => DatatypeValues::String(text.to_string()),
        (XSD_NAMESPACE_URI, Some("QName")) => {
            let text = text.trim();
            let (prefix, local) = match text.find(':') {
                Some(pos) => (Some(&text[..pos]), &text[pos + 1..]),
                None => (None, text),
            };
            let namespace_uri = match lookup_namespace_def(node, prefix) {
                Some(uri) => uri.to_string(),
                None if prefix.is_none() => String::new(),
                None => return Err(SchemaError::UnknownPrefix(text.to_string())),
            };
            DatatypeValues::QName {
                namespace_uri,
                local: local.to_string(),
            }
        }
        (XSD_NAMESPACE_URI, Some(name)) if XsdDatatype::from_name(name).is_some() => {
            DatatypeValues::Token(normalize_whitespace(text))
        }
        (library, name) => return Err(unknown_datatype(library, name.unwrap_or("token"))),
    };
    Ok(Pattern::DatatypeValue { datatype })
}

fn name_class(node: Node) -> Result<NameClass> {
    if !is_rng_node(node) {
        return Err(SchemaError::Expected("name class"));
    }
    match node.tag_name().name() {
        "name" => qname_el(node),
        "anyName" => Ok(NameClass::any_name(except_name_class(node)?)),
        "nsName" => Ok(NameClass::ns_name(
            get_ns(node).to_string(),
            except_name_class(node)?,
        )),
        "choice" => {
            let mut child =
                first_rng_child(node).ok_or(SchemaError::Expected("name class child"))?;
            let mut result = name_class(child)?;
            while let Some(next) = next_rng_sibling(child) {
                result = NameClass::alt(result, name_class(next)?);
                child = next;
            }
            Ok(result)
        }
        other => Err(SchemaError::UnexpectedElement(other.to_string())),
    }
}

fn except_name_class(node: Node) -> Result<Option<NameClass>> {
    match first_rng_child(node) {
        Some(except) if except.tag_name().name() == "except" => {
            let mut child =
                first_rng_child(except).ok_or(SchemaError::Expected("name class child"))?;
            let mut result = name_class(child)?;
            while let Some(next) = next_rng_sibling(child) {
                result = NameClass::alt(result, name_class(next)?);
                child = next;
            }
            Ok(Some(result))
        }
        Some(other) => Err(SchemaError::UnexpectedElement(
            other.tag_name().name().to_string(),
        )),
        None => Ok(None),
    }
}

fn qname_att(node: Node, name: &str, inherit_ns: bool) -> Result<NameClass> {
    let val = name.trim();
    if let Some(pos) = val.find(':') {
        let prefix = &val[..pos];
        let namespace = lookup_namespace_def(node, Some(prefix))
            .ok_or_else(|| SchemaError::UnknownPrefix(prefix.to_string()))?;
        Ok(NameClass::named(namespace.to_string(), val[pos + 1..].to_string()))
    } else {
        let ns = if inherit_ns {
            get_ns(node)
        } else {
            node.attribute("ns").unwrap_or("")
        };
        Ok(NameClass::named(ns.to_string(), val.to_string()))
    }
}

fn qname_el(node: Node) -> Result<NameClass> {
    let val = node
        .text()
        .ok_or(SchemaError::Expected("name text"))?
        .trim();
    if let Some(pos) = val.find(':') {
        let prefix = &val[..pos];
        let namespace = lookup_namespace_def(node, Some(prefix))
            .ok_or_else(|| SchemaError::UnknownPrefix(prefix.to_string()))?;
        Ok(NameClass::named(namespace.to_string(), val[pos + 1..].to_string()))
    } else {
        Ok(NameClass::named(get_ns(node).to_string(), val.to_string()))
    }
}

/// The `ns` attribute of the element or its nearest ancestor that has one
fn get_ns<'a, 'input: 'a>(start: Node<'a, 'input>) -> &'a str {
    find_inherited(start, "ns").unwrap_or("")
}

fn get_datatype_lib<'a, 'input: 'a>(start: Node<'a, 'input>) -> &'a str {
    find_inherited(start, "datatypeLibrary")
        .map(str::trim)
        .unwrap_or("")
}

fn find_inherited<'a, 'input: 'a>(start: Node<'a, 'input>, name: &str) -> Option<&'a str> {
    start
        .ancestors()
        .filter(|n| n.is_element())
        .find_map(|n| n.attribute(name))
}

fn lookup_namespace_def<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    prefix: Option<&str>,
) -> Option<&'a str> {
    if prefix == Some("xml") {
        Some(crate::names::XML_NAMESPACE)
    } else {
        node.namespaces().iter()
            .find(|ns| ns.name() == prefix)
            .map(|n| n.uri())
    }
}

fn first_rng_child<'a, 'input: 'a>(node: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
    let mut child = node.first_element_child();
    while let Some(node) = child {
        if is_rng_node(node) {
            return Some(node);
        }
        child = node.next_sibling_element();
    }
    None
}

fn next_rng_sibling<'a, 'input: 'a>(node: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
    let mut child = node.next_sibling_element();
    while let Some(node) = child {
        if is_rng_node(node) {
            return Some(node);
        }
        child = node.next_sibling_element();
    }
    None
}

fn is_rng_node(node: Node) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(NS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn element_with_inherited_ns() {
        let model = parse(
            "<element xmlns='http://relaxng.org/ns/structure/1.0' name='a' ns='urn:a'>\
               <attribute name='x'/>\
             </element>",
        )
        .unwrap();
        assert_matches!(model.start, Pattern::Element(NameClass::Named { ref namespace_uri, ref name }, ref content)
            if namespace_uri == "urn:a" && name == "a"
            && matches!(**content, Pattern::Attribute(NameClass::Named { ref namespace_uri, .. }, _) if namespace_uri.is_empty()));
    }

    #[test]
    fn combined_defines() {
        let model = parse(
            "<grammar xmlns='http://relaxng.org/ns/structure/1.0'>\
               <start><ref name='x'/></start>\
               <define name='x'><element name='a'><empty/></element></define>\
               <define name='x' combine='choice'><element name='b'><empty/></element></define>\
             </grammar>",
        )
        .unwrap();
        assert_eq!(model.defines.len(), 1);
        assert_matches!(model.defines[0].pattern, Pattern::Choice(ref v) if v.len() == 2);
        assert_eq!(model.start_elements().len(), 2);
    }

    #[test]
    fn undefined_ref() {
        let err = parse(
            "<grammar xmlns='http://relaxng.org/ns/structure/1.0'>\
               <start><ref name='missing'/></start>\
             </grammar>",
        );
        assert_matches!(err, Err(SchemaError::UndefinedReference(ref n)) if n == "missing");
    }

    #[test]
    fn not_rng() {
        assert_matches!(parse("<foo/>"), Err(SchemaError::Expected(_)));
        assert_matches!(parse("<foo"), Err(SchemaError::Xml(_)));
    }

    #[test]
    fn documentation() {
        let model = parse(
            "<element xmlns='http://relaxng.org/ns/structure/1.0' \
                xmlns:a='http://relaxng.org/ns/compatibility/annotations/1.0' name='p'>\
               <a:documentation>A   paragraph.</a:documentation>\
               <text/>\
             </element>",
        )
        .unwrap();
        assert_eq!(
            model
                .documentation
                .get(&(NameKind::Element, String::new(), "p".to_string()))
                .map(String::as_str),
            Some("A paragraph.")
        );
    }

    #[test]
    fn xsd_facets() {
        let model = parse(
            "<element xmlns='http://relaxng.org/ns/structure/1.0' name='p' \
                datatypeLibrary='http://www.w3.org/2001/XMLSchema-datatypes'>\
               <data type='token'><param name='maxLength'>3</param></data>\
             </element>",
        )
        .unwrap();
        assert_matches!(model.start, Pattern::Element(_, ref c)
            if matches!(**c, Pattern::DatatypeName { datatype: Datatypes::Xsd(XsdDatatype::Token, _), except: None }));
    }
}
