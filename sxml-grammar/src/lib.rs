//! Grammar-driven validation of a stream of XML events.
//!
//! A `Grammar` hands out `GrammarWalker`s; each walker consumes the events of one document
//! pass, reporting violations as it goes and answering which events could come next.

pub mod datatype;
pub mod model;
pub mod names;
mod rng;
mod walker;

pub use crate::datatype::FacetError;
pub use crate::model::{NameClass, NameKind, NamePattern};
pub use crate::names::{NameResolver, XML_NAMESPACE};
pub use crate::walker::RngGrammar;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema is not well-formed: {0}")]
    Xml(String),
    #[error("expected {0}")]
    Expected(&'static str),
    #[error("unexpected element <{0}> in schema")]
    UnexpectedElement(String),
    #[error("reference to undefined pattern {0:?}")]
    UndefinedReference(String),
    #[error("unknown namespace prefix {0:?}")]
    UnknownPrefix(String),
    #[error("unknown datatype {name:?} in library {library:?}")]
    UnknownDatatype { library: String, name: String },
    #[error(transparent)]
    Facet(#[from] FacetError),
    #[error("<{0}> is not supported")]
    Unsupported(&'static str),
}

/// One step of the document, as seen by the grammar.  Names are already namespace-resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event<'a> {
    EnterStartTag { ns: &'a str, local: &'a str },
    AttributeName { ns: &'a str, local: &'a str },
    AttributeValue(&'a str),
    LeaveStartTag,
    Text(&'a str),
    EndTag { ns: &'a str, local: &'a str },
}

impl Event<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::EnterStartTag { .. } => "enterStartTag",
            Event::AttributeName { .. } => "attributeName",
            Event::AttributeValue(_) => "attributeValue",
            Event::LeaveStartTag => "leaveStartTag",
            Event::Text(_) => "text",
            Event::EndTag { .. } => "endTag",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub message: String,
    /// names that were offending or expected, depending on the message
    pub names: Vec<NamePattern>,
}

impl Violation {
    pub fn new(message: &str, names: Vec<NamePattern>) -> Violation {
        Violation {
            message: message.to_string(),
            names,
        }
    }
}

/// An attribute value the grammar would accept
#[derive(Debug, Clone, PartialEq)]
pub enum ValueCandidate {
    Literal(String),
    /// Only a description is possible, e.g. the name of a datatype
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PossibleEvent {
    EnterStartTag(NameClass),
    AttributeName(NameClass),
    AttributeValue(ValueCandidate),
    LeaveStartTag,
    Text,
    EndTag,
}

pub trait GrammarWalker: Send {
    /// Feeds one event.  After an error the walker recovers so that later events are still
    /// checked sensibly.
    fn fire_event(&mut self, event: Event<'_>, names: &NameResolver) -> Result<(), Vec<Violation>>;
    fn possible(&self) -> Vec<PossibleEvent>;
    /// Checks that the document is complete
    fn end(&mut self) -> Result<(), Vec<Violation>>;
}

pub trait Grammar: Send + Sync {
    fn new_walker(&self) -> Box<dyn GrammarWalker>;
    /// Names allowed for the document element
    fn start_names(&self) -> Vec<NamePattern>;
    fn documentation(&self, _kind: NameKind, _name: &NamePattern) -> Option<&str> {
        None
    }
}
