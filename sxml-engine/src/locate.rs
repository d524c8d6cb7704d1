//! Finding things in a document: the node a Schematron location path points at, and the
//! schemas the document asks to be validated against.

use crate::config::Config;
use crate::sax::{SaxEvent, SaxSource, XmlSource};
use crate::text::{Range, TextIndex};
use crate::xinclude::normalize_href;
use crate::xpath::{match_path, parse_steps, NodePath};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

pub const RELAXNG_NAMESPACE: &str = "http://relaxng.org/ns/structure/1.0";
pub const SCHEMATRON_NAMESPACE: &str = "http://purl.oclc.org/dsdl/schematron";

/// The range of the node `xpath` selects: the `<name` of an element or the whole
/// `name="value"` of an attribute.  `None` when the path is malformed or selects nothing.
pub fn locate(document: &TextIndex, xpath: &str) -> Option<Range> {
    let steps = match parse_steps(xpath) {
        Ok(steps) => steps,
        Err(e) => {
            debug!(%xpath, "unusable location: {}", e);
            return None;
        }
    };
    let last = steps.last()?;
    let element_steps = if last.is_attribute {
        &steps[..steps.len() - 1]
    } else {
        &steps[..]
    };

    let mut src = XmlSource::new(document.text());
    let mut path: Vec<NodePath> = vec![];
    // same-named children seen so far, per open element; the first entry is the document
    let mut siblings: Vec<HashMap<(String, String), usize>> = vec![HashMap::new()];
    while let Some(event) = src.next_event() {
        match event.ok()? {
            SaxEvent::OpenTag(tag) => {
                let counts = siblings.last_mut()?;
                let index = counts
                    .entry((tag.uri.clone(), tag.local.clone()))
                    .or_insert(0);
                *index += 1;
                path.push(NodePath {
                    ns: tag.uri.clone(),
                    local: tag.local.clone(),
                    index: *index,
                });
                siblings.push(HashMap::new());

                if match_path(&path, element_steps) {
                    if last.is_attribute {
                        if let Some(a) = tag.attribute(&last.namespace, &last.local) {
                            return Some(document.range(a.start, a.end));
                        }
                    } else {
                        return Some(document.range(tag.start, tag.start + 1 + tag.name.len()));
                    }
                }
            }
            SaxEvent::CloseTag(_) => {
                path.pop();
                siblings.pop();
            }
            SaxEvent::End => break,
            _ => {}
        }
    }
    None
}

/// Schemas named by `xml-model` processing instructions, as written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRefs {
    pub relaxng: Option<String>,
    pub schematron: Option<String>,
}

impl SchemaRefs {
    /// Is the Schematron embedded in the RelaxNG schema, rather than a file of its own?
    pub fn embedded_schematron(&self) -> bool {
        self.schematron.is_some() && self.schematron == self.relaxng
    }
}

pub fn xml_model_schemas(text: &str) -> SchemaRefs {
    lazy_static! {
        static ref MODEL: Regex = Regex::new(r"(?s)<\?xml-model\s(.*?)\?>").unwrap();
        static ref HREF: Regex = Regex::new(r#"\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
        static ref TYPENS: Regex =
            Regex::new(r#"\bschematypens\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
    }
    let attr = |re: &Regex, body: &str| {
        re.captures(body)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
    };
    let mut refs = SchemaRefs::default();
    for pi in MODEL.captures_iter(text) {
        let body = match pi.get(1) {
            Some(body) => body.as_str(),
            None => continue,
        };
        let (href, typens) = match (attr(&HREF, body), attr(&TYPENS, body)) {
            (Some(href), Some(typens)) => (href, typens),
            _ => continue,
        };
        match typens.as_str() {
            RELAXNG_NAMESPACE if refs.relaxng.is_none() => refs.relaxng = Some(href),
            SCHEMATRON_NAMESPACE if refs.schematron.is_none() => refs.schematron = Some(href),
            _ => {}
        }
    }
    refs
}

/// The schemas for the document at `document_uri`, as absolute URLs.  Without an
/// `xml-model` RelaxNG schema, the configured default for the file extension applies.
pub fn schema_for(text: &str, document_uri: &Url, config: &Config) -> SchemaRefs {
    let mut refs = xml_model_schemas(text);
    if refs.relaxng.is_none() {
        let extension = document_uri
            .path_segments()
            .and_then(|mut s| s.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string());
        if let Some(ext) = extension {
            refs.relaxng = config.default_schemas.get(&ext).cloned();
        }
    }
    let resolve = |href: Option<String>| {
        let href = href?;
        match normalize_href(&href, document_uri) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                warn!(%href, "ignoring schema reference: {}", e);
                None
            }
        }
    };
    SchemaRefs {
        relaxng: resolve(refs.relaxng),
        schematron: resolve(refs.schematron),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::Position;

    const DOC: &str = "<r xmlns=\"urn:r\">\n  <p/>\n  <p n=\"2\" xml:id=\"x\">\n    <q/>\n  </p>\n</r>";

    fn index() -> TextIndex {
        TextIndex::new("doc.xml", DOC.to_string())
    }

    #[test]
    fn element() {
        let r = locate(&index(), "/Q{urn:r}r/Q{urn:r}p[2]").unwrap();
        assert_eq!(r, Range::new(Position::new(2, 2), Position::new(2, 4)));
        let r = locate(&index(), "/Q{urn:r}r/Q{urn:r}p[2]/Q{urn:r}q").unwrap();
        assert_eq!(r.start, Position::new(3, 4));
    }

    #[test]
    fn attribute() {
        let r = locate(&index(), "/Q{urn:r}r/Q{urn:r}p[2]/@Q{}n").unwrap();
        assert_eq!(r, Range::new(Position::new(2, 5), Position::new(2, 10)));
        let r = locate(
            &index(),
            "/Q{urn:r}r/Q{urn:r}p[2]/@Q{http://www.w3.org/XML/1998/namespace}id",
        )
        .unwrap();
        assert_eq!(r.start, Position::new(2, 11));
    }

    #[test]
    fn nothing_found() {
        assert_eq!(locate(&index(), "/Q{urn:r}r/Q{urn:r}p[3]"), None);
        assert_eq!(locate(&index(), "/Q{}r"), None);
        assert_eq!(locate(&index(), "r/p"), None);
        assert_eq!(locate(&index(), "/Q{urn:r}r/Q{urn:r}p[1]/@Q{}n"), None);
    }

    #[test]
    fn xml_model() {
        let text = "<?xml-model href=\"tei.rng\" type=\"application/xml\" \
                    schematypens=\"http://relaxng.org/ns/structure/1.0\"?>\n\
                    <?xml-model schematypens=\"http://purl.oclc.org/dsdl/schematron\" href='tei.rng'?>\n<TEI/>";
        let refs = xml_model_schemas(text);
        assert_eq!(refs.relaxng.as_deref(), Some("tei.rng"));
        assert!(refs.embedded_schematron());

        let uri = Url::parse("file:///work/a.xml").unwrap();
        let refs = schema_for(text, &uri, &Config::default());
        assert_eq!(refs.relaxng.as_deref(), Some("file:///work/tei.rng"));
    }

    #[test]
    fn default_schema_by_extension() {
        let mut config = Config::default();
        config
            .default_schemas
            .insert("tei".to_string(), "http://example.com/tei_all.rng".to_string());
        let uri = Url::parse("file:///work/a.tei").unwrap();
        let refs = schema_for("<TEI/>", &uri, &config);
        assert_eq!(refs.relaxng.as_deref(), Some("http://example.com/tei_all.rng"));
        assert_eq!(refs.schematron, None);
        let uri = Url::parse("file:///work/a.xml").unwrap();
        assert_eq!(schema_for("<TEI/>", &uri, &config), SchemaRefs::default());
    }
}
