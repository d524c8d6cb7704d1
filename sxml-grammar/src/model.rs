use crate::datatype::{DatatypeValues, Datatypes};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
pub enum Pattern {
    Choice(Vec<Pattern>),
    Interleave(Vec<Pattern>),
    /// An ordered sequence of patterns
    Group(Vec<Pattern>),
    Mixed(Box<Pattern>),
    Empty,
    Text,
    NotAllowed,
    Optional(Box<Pattern>),
    ZeroOrMore(Box<Pattern>),
    OneOrMore(Box<Pattern>),
    Attribute(NameClass, Box<Pattern>),
    Element(NameClass, Box<Pattern>),
    Ref(DefineId),
    DatatypeValue {
        datatype: DatatypeValues,
    },
    DatatypeName {
        datatype: Datatypes,
        except: Option<Box<Pattern>>,
    },
    List(Box<Pattern>),
}

/// Index into `GrammarModel::defines`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefineId(pub usize);

#[derive(Debug, Clone)]
pub struct Define {
    pub name: String,
    pub pattern: Pattern,
}

/// Whether a documentation entry describes an element or an attribute name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Element,
    Attribute,
}

#[derive(Debug, Clone)]
pub struct GrammarModel {
    pub start: Pattern,
    pub defines: Vec<Define>,
    /// `a:documentation` text, keyed by the documented element or attribute name
    pub documentation: HashMap<(NameKind, String, String), String>,
}

impl GrammarModel {
    pub fn define(&self, id: DefineId) -> &Pattern {
        &self.defines[id.0].pattern
    }

    /// Name classes of the elements that may appear as the document element
    pub fn start_elements(&self) -> Vec<&NameClass> {
        let mut result = vec![];
        let mut seen = vec![];
        self.collect_elements(&self.start, &mut seen, &mut result);
        result
    }

    fn collect_elements<'a>(
        &'a self,
        p: &'a Pattern,
        seen: &mut Vec<DefineId>,
        result: &mut Vec<&'a NameClass>,
    ) {
        match p {
            Pattern::Choice(v) | Pattern::Interleave(v) | Pattern::Group(v) => {
                for p in v {
                    self.collect_elements(p, seen, result);
                }
            }
            Pattern::Mixed(p)
            | Pattern::Optional(p)
            | Pattern::ZeroOrMore(p)
            | Pattern::OneOrMore(p) => self.collect_elements(p, seen, result),
            Pattern::Element(nc, _) => result.push(nc),
            Pattern::Ref(id) => {
                if !seen.contains(id) {
                    seen.push(*id);
                    self.collect_elements(self.define(*id), seen, result);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum NameClass {
    Named {
        namespace_uri: String,
        name: String,
    },
    NsName {
        namespace_uri: String,
        except: Option<Box<NameClass>>,
    },
    AnyName {
        except: Option<Box<NameClass>>,
    },
    Alt {
        a: Box<NameClass>,
        b: Box<NameClass>,
    },
}
impl NameClass {
    pub fn named(namespace_uri: String, name: String) -> NameClass {
        NameClass::Named {
            namespace_uri,
            name,
        }
    }
    pub fn ns_name(namespace_uri: String, except: Option<NameClass>) -> NameClass {
        NameClass::NsName {
            namespace_uri,
            except: except.map(Box::new),
        }
    }
    pub fn any_name(except: Option<NameClass>) -> NameClass {
        NameClass::AnyName {
            except: except.map(Box::new),
        }
    }
    pub fn alt(a: NameClass, b: NameClass) -> NameClass {
        NameClass::Alt {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    pub fn contains(&self, namespace_uri: &str, local: &str) -> bool {
        match self {
            NameClass::Named {
                namespace_uri: ns,
                name,
            } => ns == namespace_uri && name == local,
            NameClass::NsName {
                namespace_uri: ns,
                except,
            } => {
                ns == namespace_uri
                    && except
                        .as_ref()
                        .map(|e| !e.contains(namespace_uri, local))
                        .unwrap_or(true)
            }
            NameClass::AnyName { except } => except
                .as_ref()
                .map(|e| !e.contains(namespace_uri, local))
                .unwrap_or(true),
            NameClass::Alt { a, b } => {
                a.contains(namespace_uri, local) || b.contains(namespace_uri, local)
            }
        }
    }

    /// The concrete names this class enumerates; wildcards contribute nothing since they
    /// cannot be offered as a single name.
    pub fn names(&self) -> Vec<NamePattern> {
        let mut result = vec![];
        self.collect_names(&mut result);
        result
    }

    fn collect_names(&self, result: &mut Vec<NamePattern>) {
        match self {
            NameClass::Named {
                namespace_uri,
                name,
            } => result.push(NamePattern::new(name, namespace_uri)),
            NameClass::Alt { a, b } => {
                a.collect_names(result);
                b.collect_names(result);
            }
            NameClass::NsName { .. } | NameClass::AnyName { .. } => {}
        }
    }

    /// Like `names()`, but wildcards are rendered as `*` / `ns:*` patterns so that error
    /// messages can still mention them.
    pub fn describe(&self) -> Vec<NamePattern> {
        match self {
            NameClass::Named { .. } => self.names(),
            NameClass::NsName { namespace_uri, .. } => vec![NamePattern::new("*", namespace_uri)],
            NameClass::AnyName { .. } => vec![NamePattern {
                name: "*".to_string(),
                ns: None,
            }],
            NameClass::Alt { a, b } => {
                let mut v = a.describe();
                v.extend(b.describe());
                v
            }
        }
    }
}

/// A name implicated by a violation or offered as a candidate.  An empty namespace is
/// represented as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamePattern {
    pub name: String,
    pub ns: Option<String>,
}

impl NamePattern {
    pub fn new(name: &str, ns: &str) -> NamePattern {
        NamePattern {
            name: name.to_string(),
            ns: if ns.is_empty() {
                None
            } else {
                Some(ns.to_string())
            },
        }
    }

    pub fn namespace(&self) -> &str {
        self.ns.as_deref().unwrap_or("")
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "\"{}\" ({})", self.name, ns),
            None => write!(f, "\"{}\"", self.name),
        }
    }
}
