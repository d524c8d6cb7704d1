//! The RELAX NG builtin datatype library plus the subset of XML Schema datatypes that
//! document grammars commonly reference

use crate::names::NameResolver;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use thiserror::Error;

pub const XSD_NAMESPACE_URI: &str = "http://www.w3.org/2001/XMLSchema-datatypes";

pub trait Datatype {
    fn is_valid(&self, value: &str, names: &NameResolver) -> bool;
}

pub fn normalize_whitespace(val: &str) -> String {
    let mut last_space = false;
    let mut out = String::new();
    for c in val.chars().skip_while(|c| c.is_ascii_whitespace()) {
        if c.is_ascii_whitespace() {
            last_space = true;
        } else {
            if last_space {
                out.push(' ');
            }
            out.push(c);
            last_space = false;
        }
    }
    out
}

fn replace_whitespace(val: &str) -> String {
    val.chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect()
}

lazy_static! {
    static ref LANG_RE: Regex = Regex::new(r"^[a-zA-Z]{1,8}(-[a-zA-Z0-9]{1,8})*$").unwrap();
    static ref INTEGER_RE: Regex = Regex::new(r"^[+-]?[0-9]+$").unwrap();
    static ref DECIMAL_RE: Regex = Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)$").unwrap();
    static ref DOUBLE_RE: Regex =
        Regex::new(r"^([+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+-]?[0-9]+)?|-?INF|NaN)$").unwrap();
    static ref DATE_RE: Regex =
        Regex::new(r"^-?[0-9]{4,}-(0[1-9]|1[0-2])-(0[1-9]|[12][0-9]|3[01])(Z|[+-][0-9]{2}:[0-9]{2})?$")
            .unwrap();
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum DatatypeValues {
    String(String),
    Token(String),
    QName { namespace_uri: String, local: String },
}

impl DatatypeValues {
    /// The literal an author would type to produce this value
    pub fn literal(&self) -> &str {
        match self {
            DatatypeValues::String(s) | DatatypeValues::Token(s) => s,
            DatatypeValues::QName { local, .. } => local,
        }
    }
}

impl Datatype for DatatypeValues {
    fn is_valid(&self, value: &str, names: &NameResolver) -> bool {
        match self {
            DatatypeValues::String(s) => s == value,
            DatatypeValues::Token(s) => s == &normalize_whitespace(value),
            DatatypeValues::QName {
                namespace_uri,
                local,
            } => {
                let value = normalize_whitespace(value);
                match names.resolve_name(&value, true) {
                    Some((ns, l)) => &ns == namespace_uri && l == local,
                    None => false,
                }
            }
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum XsdDatatype {
    String,
    NormalizedString,
    Token,
    NcName,
    Name,
    NmToken,
    NmTokens,
    QName,
    Id,
    IdRef,
    IdRefs,
    AnyUri,
    Language,
    Boolean,
    Integer,
    NonNegativeInteger,
    PositiveInteger,
    Decimal,
    Double,
    Date,
}

impl XsdDatatype {
    pub fn from_name(name: &str) -> Option<XsdDatatype> {
        Some(match name {
            "string" => XsdDatatype::String,
            "normalizedString" => XsdDatatype::NormalizedString,
            "token" => XsdDatatype::Token,
            "NCName" => XsdDatatype::NcName,
            "Name" => XsdDatatype::Name,
            "NMTOKEN" => XsdDatatype::NmToken,
            "NMTOKENS" => XsdDatatype::NmTokens,
            "QName" => XsdDatatype::QName,
            "ID" => XsdDatatype::Id,
            "IDREF" => XsdDatatype::IdRef,
            "IDREFS" => XsdDatatype::IdRefs,
            "anyURI" => XsdDatatype::AnyUri,
            "language" => XsdDatatype::Language,
            "boolean" => XsdDatatype::Boolean,
            "integer" => XsdDatatype::Integer,
            "nonNegativeInteger" => XsdDatatype::NonNegativeInteger,
            "positiveInteger" => XsdDatatype::PositiveInteger,
            "decimal" => XsdDatatype::Decimal,
            "double" => XsdDatatype::Double,
            "date" => XsdDatatype::Date,
            _ => return None,
        })
    }

    fn is_list(self) -> bool {
        matches!(self, XsdDatatype::NmTokens | XsdDatatype::IdRefs)
    }

    fn check(self, value: &str, names: &NameResolver) -> bool {
        match self {
            XsdDatatype::String | XsdDatatype::NormalizedString | XsdDatatype::Token => true,
            XsdDatatype::NcName | XsdDatatype::Id | XsdDatatype::IdRef => is_ncname(value),
            XsdDatatype::Name => is_name(value),
            XsdDatatype::NmToken => is_nmtoken(value),
            XsdDatatype::NmTokens => {
                !value.is_empty() && value.split(' ').all(is_nmtoken)
            }
            XsdDatatype::IdRefs => !value.is_empty() && value.split(' ').all(is_ncname),
            XsdDatatype::QName => match value.find(':') {
                Some(pos) => {
                    is_ncname(&value[..pos])
                        && is_ncname(&value[pos + 1..])
                        && names.is_bound(&value[..pos])
                }
                None => is_ncname(value),
            },
            XsdDatatype::AnyUri => !value.contains(' '),
            XsdDatatype::Language => LANG_RE.is_match(value),
            XsdDatatype::Boolean => matches!(value, "true" | "false" | "1" | "0"),
            XsdDatatype::Integer => INTEGER_RE.is_match(value),
            XsdDatatype::NonNegativeInteger => {
                INTEGER_RE.is_match(value)
                    && (!value.starts_with('-') || value[1..].chars().all(|c| c == '0'))
            }
            XsdDatatype::PositiveInteger => {
                INTEGER_RE.is_match(value)
                    && !value.starts_with('-')
                    && value.chars().any(|c| ('1'..='9').contains(&c))
            }
            XsdDatatype::Decimal => DECIMAL_RE.is_match(value),
            XsdDatatype::Double => DOUBLE_RE.is_match(value),
            XsdDatatype::Date => DATE_RE.is_match(value),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum LengthFacet {
    Unbounded,
    MinLength(usize),
    MaxLength(usize),
    MinMaxLength(usize, usize),
    Length(usize),
}
impl LengthFacet {
    fn is_valid(&self, actual: usize) -> bool {
        match self {
            LengthFacet::Unbounded => true,
            LengthFacet::MinLength(min) => *min <= actual,
            LengthFacet::MaxLength(max) => actual <= *max,
            LengthFacet::MinMaxLength(min, max) => *min <= actual && actual <= *max,
            LengthFacet::Length(len) => actual == *len,
        }
    }

    fn merge(&self, other: LengthFacet) -> Result<LengthFacet, FacetError> {
        let bounded = |min: usize, max: usize| {
            if min > max {
                Err(FacetError::Conflicting("minLength greater than maxLength"))
            } else {
                Ok(LengthFacet::MinMaxLength(min, max))
            }
        };
        match (self, other) {
            (LengthFacet::Unbounded, other) => Ok(other),
            (LengthFacet::MinLength(min), LengthFacet::MaxLength(max)) => bounded(*min, max),
            (LengthFacet::MaxLength(max), LengthFacet::MinLength(min)) => bounded(min, *max),
            _ => Err(FacetError::Conflicting("length")),
        }
    }
}

#[derive(Clone)]
pub struct PatternFacet(String, Regex);
impl PartialEq for PatternFacet {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for PatternFacet {}
impl std::hash::Hash for PatternFacet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}
impl fmt::Debug for PatternFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("PatternFacet").field(&self.0).finish()
    }
}
impl PatternFacet {
    pub fn new(source: &str) -> Result<PatternFacet, FacetError> {
        // XSD patterns are implicitly anchored at both ends
        Regex::new(&format!("^(?:{})$", source))
            .map(|re| PatternFacet(source.to_string(), re))
            .map_err(|e| FacetError::InvalidPattern(e.to_string()))
    }

    pub fn source(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum FacetError {
    #[error("conflicting facet: {0}")]
    Conflicting(&'static str),
    #[error("invalid pattern facet: {0}")]
    InvalidPattern(String),
    #[error("invalid length facet value {0:?}")]
    InvalidLength(String),
    #[error("unsupported facet {0:?}")]
    UnknownFacet(String),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Default)]
pub struct Facets {
    len: Option<LengthFacet>,
    patterns: Vec<PatternFacet>,
}

impl Facets {
    pub fn add(&mut self, name: &str, value: &str) -> Result<(), FacetError> {
        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FacetError::InvalidLength(v.to_string()))
        };
        let facet = match name {
            "pattern" => {
                self.patterns.push(PatternFacet::new(value)?);
                return Ok(());
            }
            "length" => LengthFacet::Length(parse(value)?),
            "minLength" => LengthFacet::MinLength(parse(value)?),
            "maxLength" => LengthFacet::MaxLength(parse(value)?),
            _ => return Err(FacetError::UnknownFacet(name.to_string())),
        };
        let current = self.len.take().unwrap_or(LengthFacet::Unbounded);
        self.len = Some(current.merge(facet)?);
        Ok(())
    }

    pub fn has_pattern(&self) -> bool {
        !self.patterns.is_empty()
    }

    fn is_valid(&self, value: &str, length: usize) -> bool {
        self.len.as_ref().map(|l| l.is_valid(length)).unwrap_or(true)
            && self.patterns.iter().all(|p| p.1.is_match(value))
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Datatypes {
    /// The builtin `string` type
    String,
    /// The builtin `token` type
    Token,
    Xsd(XsdDatatype, Facets),
}

impl Datatypes {
    /// Short human-readable name, used when the type is offered as a completion candidate
    pub fn describe(&self) -> String {
        match self {
            Datatypes::String => "string".to_string(),
            Datatypes::Token => "token".to_string(),
            Datatypes::Xsd(dt, facets) => match facets.patterns.first() {
                Some(p) => format!("{:?} matching /{}/", dt, p.source()),
                None => format!("{:?}", dt),
            },
        }
    }
}

impl Datatype for Datatypes {
    fn is_valid(&self, value: &str, names: &NameResolver) -> bool {
        match self {
            Datatypes::String | Datatypes::Token => true,
            Datatypes::Xsd(dt, facets) => {
                let value = match dt {
                    XsdDatatype::String => value.to_string(),
                    XsdDatatype::NormalizedString => replace_whitespace(value),
                    _ => normalize_whitespace(value),
                };
                let length = if dt.is_list() {
                    value.split(' ').filter(|s| !s.is_empty()).count()
                } else {
                    value.chars().count()
                };
                dt.check(&value, names) && facets.is_valid(&value, length)
            }
        }
    }
}

pub(crate) fn is_name_start_char(c: char) -> bool {
    matches!(c, 'A'..='Z'
        | '_'
        | 'a'..='z'
        | '\u{C0}'..='\u{D6}'
        | '\u{D8}'..='\u{F6}'
        | '\u{F8}'..='\u{2FF}'
        | '\u{370}'..='\u{37D}'
        | '\u{37F}'..='\u{1FFF}'
        | '\u{200C}'..='\u{200D}'
        | '\u{2070}'..='\u{218F}'
        | '\u{2C00}'..='\u{2FEF}'
        | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}'
        | '\u{FDF0}'..='\u{FFFD}'
        | '\u{10000}'..='\u{EFFFF}')
}

pub(crate) fn is_name_char(c: char) -> bool {
    is_name_start_char(c)
        || matches!(c, '-'
            | '.'
            | '0'..='9'
            | '\u{B7}'
            | '\u{0300}'..='\u{036F}'
            | '\u{203F}'..='\u{2040}')
}

pub fn is_ncname(val: &str) -> bool {
    let mut chars = val.chars();
    match chars.next() {
        Some(c) if is_name_start_char(c) => chars.all(is_name_char),
        _ => false,
    }
}

fn is_name(val: &str) -> bool {
    let mut chars = val.chars();
    match chars.next() {
        Some(c) if is_name_start_char(c) || c == ':' => chars.all(|c| is_name_char(c) || c == ':'),
        _ => false,
    }
}

fn is_nmtoken(val: &str) -> bool {
    !val.is_empty() && val.chars().all(|c| is_name_char(c) || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn xsd(dt: XsdDatatype, facets: &[(&str, &str)]) -> Datatypes {
        let mut f = Facets::default();
        for (name, value) in facets {
            f.add(name, value).unwrap();
        }
        Datatypes::Xsd(dt, f)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_whitespace(""), "");
        assert_eq!(normalize_whitespace("  "), "");
        assert_eq!(normalize_whitespace("a "), "a");
        assert_eq!(normalize_whitespace("\na\t a\r"), "a a");
    }

    #[test]
    fn token_value() {
        let names = NameResolver::default();
        let v = DatatypeValues::Token("a b".to_string());
        assert!(v.is_valid(" a\n b ", &names));
        assert!(!DatatypeValues::String("a b".to_string()).is_valid(" a b", &names));
    }

    #[test]
    fn integers() {
        let names = NameResolver::default();
        assert!(xsd(XsdDatatype::Integer, &[]).is_valid(" -12 ", &names));
        assert!(!xsd(XsdDatatype::Integer, &[]).is_valid("1.5", &names));
        assert!(!xsd(XsdDatatype::PositiveInteger, &[]).is_valid("000", &names));
        assert!(xsd(XsdDatatype::NonNegativeInteger, &[]).is_valid("-0", &names));
    }

    #[test]
    fn pattern_is_anchored() {
        let names = NameResolver::default();
        let dt = xsd(XsdDatatype::Token, &[("pattern", "[a-z]+")]);
        assert!(dt.is_valid("abc", &names));
        assert!(!dt.is_valid("abc1", &names));
    }

    #[test]
    fn length_facets() {
        let names = NameResolver::default();
        let dt = xsd(XsdDatatype::String, &[("minLength", "2"), ("maxLength", "3")]);
        assert!(dt.is_valid("ab", &names));
        assert!(!dt.is_valid("abcd", &names));
        let mut f = Facets::default();
        f.add("length", "1").unwrap();
        assert_matches!(f.add("length", "2"), Err(FacetError::Conflicting(_)));
    }

    #[test]
    fn length_bounds_in_either_order() {
        let names = NameResolver::default();
        let dt = xsd(XsdDatatype::String, &[("maxLength", "3"), ("minLength", "2")]);
        assert!(dt.is_valid("abc", &names));
        assert!(!dt.is_valid("a", &names));
        let mut f = Facets::default();
        f.add("maxLength", "1").unwrap();
        assert_matches!(f.add("minLength", "2"), Err(FacetError::Conflicting(_)));
        let mut f = Facets::default();
        f.add("minLength", "4").unwrap();
        assert_matches!(f.add("maxLength", "3"), Err(FacetError::Conflicting(_)));
    }

    #[test]
    fn qname_needs_bound_prefix() {
        let mut names = NameResolver::default();
        let dt = xsd(XsdDatatype::QName, &[]);
        assert!(!dt.is_valid("t:a", &names));
        names.enter_context();
        names.define_prefix("t", "urn:t");
        assert!(dt.is_valid("t:a", &names));
    }
}
