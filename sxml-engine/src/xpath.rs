//! The restricted XPath that Schematron engines report locations with: a sequence of
//! `/Q{ns}local[n]` element steps, optionally ending in an `/@Q{ns}local` attribute step.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPathStep {
    pub namespace: String,
    pub local: String,
    /// 1-based position among same-named siblings; always `None` for attribute steps
    pub index: Option<usize>,
    pub is_attribute: bool,
}

/// One level of the element path during a traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath {
    pub ns: String,
    pub local: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XPathError {
    #[error("expected '/' at position {0}")]
    ExpectedSlash(usize),
    #[error("expected 'Q{{' at position {0}")]
    ExpectedClarkName(usize),
    #[error("unterminated namespace at position {0}")]
    UnterminatedNamespace(usize),
    #[error("missing local name at position {0}")]
    MissingLocalName(usize),
    #[error("unterminated index at position {0}")]
    UnterminatedIndex(usize),
    #[error("invalid index at position {0}")]
    InvalidIndex(usize),
}

pub fn parse_steps(xpath: &str) -> Result<Vec<XPathStep>, XPathError> {
    let mut steps = vec![];
    let mut pos = 0;
    while pos < xpath.len() {
        let rest = &xpath[pos..];
        if !rest.starts_with('/') {
            return Err(XPathError::ExpectedSlash(pos));
        }
        pos += 1;
        let is_attribute = xpath[pos..].starts_with('@');
        if is_attribute {
            pos += 1;
        }
        if !xpath[pos..].starts_with("Q{") {
            return Err(XPathError::ExpectedClarkName(pos));
        }
        pos += 2;
        let ns_end = match xpath[pos..].find('}') {
            Some(i) => pos + i,
            None => return Err(XPathError::UnterminatedNamespace(pos)),
        };
        let namespace = xpath[pos..ns_end].to_string();
        pos = ns_end + 1;

        let name_len = xpath[pos..]
            .find(|c| c == '[' || c == '/' || c == '@')
            .unwrap_or(xpath.len() - pos);
        if name_len == 0 {
            return Err(XPathError::MissingLocalName(pos));
        }
        let local = xpath[pos..pos + name_len].to_string();
        pos += name_len;

        let mut index = None;
        if xpath[pos..].starts_with('[') {
            let idx_end = match xpath[pos..].find(']') {
                Some(i) => pos + i,
                None => return Err(XPathError::UnterminatedIndex(pos)),
            };
            let n = xpath[pos + 1..idx_end]
                .trim()
                .parse::<usize>()
                .map_err(|_| XPathError::InvalidIndex(pos + 1))?;
            index = Some(n);
            pos = idx_end + 1;
        }
        steps.push(XPathStep {
            namespace,
            local,
            index: if is_attribute {
                None
            } else {
                Some(index.unwrap_or(1))
            },
            is_attribute,
        });
    }
    Ok(steps)
}

/// Does the element path match `steps` exactly, level for level?  A step without an
/// index matches any sibling position.
pub fn match_path(path: &[NodePath], steps: &[XPathStep]) -> bool {
    path.len() == steps.len()
        && path.iter().zip(steps).all(|(p, s)| {
            p.ns == s.namespace
                && p.local == s.local
                && s.index.map(|i| i == p.index).unwrap_or(true)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TEI: &str = "http://www.tei-c.org/ns/1.0";

    #[test]
    fn element_and_attribute_steps() {
        let steps =
            parse_steps(&format!("/Q{{{0}}}TEI/Q{{{0}}}text[2]/@Q{{}}type", TEI)).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].index, Some(1));
        assert_eq!(steps[1].local, "text");
        assert_eq!(steps[1].index, Some(2));
        assert!(steps[2].is_attribute);
        assert_eq!(steps[2].index, None);
        assert_eq!(steps[2].namespace, "");
    }

    #[test]
    fn malformed() {
        assert_matches!(parse_steps("Q{}a"), Err(XPathError::ExpectedSlash(0)));
        assert_matches!(parse_steps("/a"), Err(XPathError::ExpectedClarkName(1)));
        assert_matches!(parse_steps("/Q{urn"), Err(XPathError::UnterminatedNamespace(3)));
        assert_matches!(parse_steps("/Q{}[1]"), Err(XPathError::MissingLocalName(4)));
        assert_matches!(parse_steps("/Q{}a[1"), Err(XPathError::UnterminatedIndex(5)));
        assert_matches!(parse_steps("/Q{}a[x]"), Err(XPathError::InvalidIndex(6)));
        assert_eq!(parse_steps(""), Ok(vec![]));
    }

    #[test]
    fn matching() {
        let steps = parse_steps("/Q{}a/Q{}b[2]").unwrap();
        let path = |i| {
            vec![
                NodePath {
                    ns: String::new(),
                    local: "a".to_string(),
                    index: 1,
                },
                NodePath {
                    ns: String::new(),
                    local: "b".to_string(),
                    index: i,
                },
            ]
        };
        assert!(match_path(&path(2), &steps));
        assert!(!match_path(&path(1), &steps));
        assert!(!match_path(&path(2)[..1], &steps));
    }
}
