//! Validation and completion for XML documents against RELAX NG grammars, with XInclude
//! expansion and an optional Schematron phase.
//!
//! A document is first flattened by resolving its `xi:include` elements (`xinclude`),
//! then driven through a grammar walker (`validate`).  Diagnostics always refer to the
//! document as written, even when they arise inside included text.  `session` ties the
//! phases together for documents open in an editor.

pub mod complete;
pub mod config;
pub mod error;
pub mod locate;
pub mod sax;
pub mod schematron;
pub mod session;
pub mod text;
pub mod validate;
pub mod xinclude;
pub mod xpath;

pub use crate::complete::{CompletionItem, FollowUp, ItemKind, RequestKind, Trigger};
pub use crate::config::Config;
pub use crate::error::{EngineError, FetchError};
pub use crate::session::{DiagnosticsSink, RngCompiler, SchemaCompiler, SessionRegistry};
pub use crate::text::{Position, Range, TextIndex};
pub use crate::validate::{Diagnostic, ErrorKind, Severity, ValidationResult};
pub use crate::xinclude::{DefaultFetcher, Fetcher, Flattened, Resolver};
