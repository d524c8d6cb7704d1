//! Open documents and the validation passes run over them.
//!
//! Each document owns its cached grammar and the flattened text of its latest validation.
//! A new validation of a document cancels the one still running, and results are only
//! ever published for the newest revision.

use crate::complete::{self, CompletionItem, Trigger};
use crate::config::Config;
use crate::error::{EngineError, FetchError};
use crate::locate::{schema_for, SchemaRefs};
use crate::schematron::{run_phase, Rules, SchematronFactory};
use crate::text::{Range, TextIndex};
use crate::validate::{validate, ErrorKind, Severity, ValidationResult};
use crate::xinclude::{Fetcher, Flattened, Resolver};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use sxml_grammar::{Grammar, RngGrammar, SchemaError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Turns a schema URI into a grammar
pub trait SchemaCompiler: Send + Sync {
    fn compile<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Arc<dyn Grammar>, CompileError>>;
}

/// Compiles RELAX NG schemas in the XML syntax
pub struct RngCompiler {
    fetcher: Arc<dyn Fetcher>,
}

impl RngCompiler {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> RngCompiler {
        RngCompiler { fetcher }
    }
}

impl SchemaCompiler for RngCompiler {
    fn compile<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Arc<dyn Grammar>, CompileError>> {
        async move {
            let text = self.fetcher.fetch(uri).await?;
            let grammar = RngGrammar::parse(&text)?;
            Ok(Arc::new(grammar) as Arc<dyn Grammar>)
        }
        .boxed()
    }
}

/// Where results go, typically an editor
pub trait DiagnosticsSink: Send + Sync {
    /// `schematron_pending` is set when a Schematron result for the same revision follows
    fn publish(&self, uri: &Url, revision: u64, result: &ValidationResult, schematron_pending: bool);
}

pub struct DocumentSession {
    pub uri: Url,
    pub language_id: String,
    pub revision: u64,
    pub text: Arc<TextIndex>,
    /// schema URI and the grammar compiled from it
    grammar: Option<(String, Arc<dyn Grammar>)>,
    /// revision the flattened text was made from
    flattened: Option<(u64, Arc<Flattened>)>,
    in_flight: Option<CancellationToken>,
}

impl DocumentSession {
    fn new(uri: Url, language_id: &str, text: String) -> DocumentSession {
        DocumentSession {
            text: Arc::new(TextIndex::new(uri.as_str(), text)),
            uri,
            language_id: language_id.to_string(),
            revision: 0,
            grammar: None,
            flattened: None,
            in_flight: None,
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
    }
}

pub struct SessionRegistry {
    config: Config,
    resolver: Resolver,
    fetcher: Arc<dyn Fetcher>,
    compiler: Arc<dyn SchemaCompiler>,
    schematron: Option<Arc<dyn SchematronFactory>>,
    sink: Arc<dyn DiagnosticsSink>,
    sessions: Mutex<HashMap<Url, DocumentSession>>,
}

impl SessionRegistry {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        compiler: Arc<dyn SchemaCompiler>,
        schematron: Option<Arc<dyn SchematronFactory>>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> SessionRegistry {
        SessionRegistry {
            resolver: Resolver::new(fetcher.clone(), &config),
            config,
            fetcher,
            compiler,
            schematron,
            sink,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(&self, uri: Url, language_id: &str, text: String) {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut old) = sessions.remove(&uri) {
            old.cancel_in_flight();
        }
        debug!(%uri, language_id, "opened");
        let session = DocumentSession::new(uri.clone(), language_id, text);
        sessions.insert(uri, session);
    }

    /// Replaces the text of an open document, returning the new revision
    pub async fn update(&self, uri: &Url, text: String) -> Result<u64, EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(uri)
            .ok_or_else(|| EngineError::NotOpen(uri.to_string()))?;
        session.cancel_in_flight();
        session.revision += 1;
        session.text = Arc::new(TextIndex::new(uri.as_str(), text));
        Ok(session.revision)
    }

    pub async fn close(&self, uri: &Url) {
        if let Some(mut session) = self.sessions.lock().await.remove(uri) {
            session.cancel_in_flight();
            debug!(%uri, "closed");
        }
    }

    pub async fn revision(&self, uri: &Url) -> Option<u64> {
        self.sessions.lock().await.get(uri).map(|s| s.revision)
    }

    /// Validates the current revision of `uri`, publishing the grammar result and then the
    /// result merged with any Schematron findings.  `EngineError::Cancelled` means a newer
    /// pass took over and nothing was published.
    pub async fn validate(&self, uri: &Url) -> Result<ValidationResult, EngineError> {
        let (revision, original, cached, cancel) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(uri)
                .ok_or_else(|| EngineError::NotOpen(uri.to_string()))?;
            session.cancel_in_flight();
            let cancel = CancellationToken::new();
            session.in_flight = Some(cancel.clone());
            (
                session.revision,
                session.text.clone(),
                session.grammar.clone(),
                cancel,
            )
        };
        debug!(%uri, revision, "validating");

        let schemas = schema_for(original.text(), uri, &self.config);
        let flattened = Arc::new(self.resolver.resolve(original.text(), uri, &cancel).await?);

        let mut grammar = None;
        let mut result = ValidationResult::default();
        if let Some(schema) = &schemas.relaxng {
            match cached {
                Some((cached_uri, g)) if &cached_uri == schema => grammar = Some(g),
                _ => match self.load_grammar(schema, &cancel).await? {
                    Ok(g) => grammar = Some(g),
                    Err(e) => {
                        warn!(%schema, "schema unusable: {}", e);
                        result = ValidationResult::single(
                            ErrorKind::SchemaInvalid,
                            Range::default(),
                            format!("Could not load schema {}: {}", schema, e),
                        );
                    }
                },
            }
        }
        if result.is_valid() {
            let text = flattened.clone();
            let index = original.clone();
            let g = grammar.clone();
            let token = cancel.clone();
            result = tokio::task::spawn_blocking(move || {
                validate(&text.text, &index, g.as_deref(), &token)
            })
            .await??;
        }

        let pending = self.schematron_applies(&schemas, &result);
        {
            let mut sessions = self.sessions.lock().await;
            let session = latest(&mut sessions, uri, revision, &cancel)?;
            session.flattened = Some((revision, flattened));
            if let (Some(schema), Some(g)) = (&schemas.relaxng, grammar) {
                session.grammar = Some((schema.clone(), g));
            }
            self.sink.publish(uri, revision, &result, pending);
        }
        info!(%uri, revision, "{}", result.status_message(pending));
        let (factory, href) = match (&self.schematron, &schemas.schematron) {
            (Some(factory), Some(href)) if pending => (factory, href),
            _ => return Ok(result),
        };

        match self
            .schematron_rules(href, schemas.embedded_schematron(), &cancel)
            .await
        {
            Ok(rules) => {
                let findings = run_phase(factory.as_ref(), rules, original, &cancel).await?;
                result.merge(findings);
            }
            Err(EngineError::Fetch(e)) => {
                warn!(%uri, "no Schematron rules: {}", e);
                result.push(
                    ErrorKind::NoError,
                    Severity::Information,
                    Range::default(),
                    format!("Could not fetch Schematron rules: {}", e),
                );
            }
            Err(e) => return Err(e),
        }
        {
            let mut sessions = self.sessions.lock().await;
            latest(&mut sessions, uri, revision, &cancel)?;
            self.sink.publish(uri, revision, &result, false);
        }
        Ok(result)
    }

    /// Completions at `offset` of the current text of `uri`, from the grammar and
    /// flattened text of the latest validation.  Nothing is offered before a grammar has
    /// been loaded.
    pub async fn complete(&self, uri: &Url, offset: usize, trigger: Trigger) -> Vec<CompletionItem> {
        let (text, grammar, flattened) = {
            let sessions = self.sessions.lock().await;
            let session = match sessions.get(uri) {
                Some(session) => session,
                None => return vec![],
            };
            let flattened = match &session.flattened {
                Some((revision, f)) if *revision == session.revision => Some(f.clone()),
                _ => None,
            };
            (
                session.text.clone(),
                session.grammar.as_ref().map(|(_, g)| g.clone()),
                flattened,
            )
        };
        let grammar = match grammar {
            Some(grammar) => grammar,
            None => return vec![],
        };
        let kind = match complete::detect_request(text.text(), offset, trigger) {
            Some(kind) => kind,
            None => return vec![],
        };
        match flattened {
            Some(f) => complete::complete(&f.text, grammar.as_ref(), f.to_flat_offset(offset), kind),
            None => complete::complete(text.text(), grammar.as_ref(), offset, kind),
        }
    }

    async fn load_grammar(
        &self,
        schema: &str,
        cancel: &CancellationToken,
    ) -> Result<Result<Arc<dyn Grammar>, CompileError>, EngineError> {
        let url = match Url::parse(schema) {
            Ok(url) => url,
            Err(e) => {
                return Ok(Err(CompileError::Fetch(FetchError::InvalidReference {
                    href: schema.to_string(),
                    message: e.to_string(),
                })))
            }
        };
        debug!(%url, "compiling schema");
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            compiled = self.compiler.compile(&url) => Ok(compiled),
        }
    }

    fn schematron_applies(&self, schemas: &SchemaRefs, result: &ValidationResult) -> bool {
        self.config.schematron
            && self.schematron.is_some()
            && schemas.schematron.is_some()
            && result.error_kind != ErrorKind::NotWellFormed
    }

    async fn schematron_rules(
        &self,
        href: &str,
        embedded: bool,
        cancel: &CancellationToken,
    ) -> Result<Rules, EngineError> {
        let url = Url::parse(href).map_err(|e| FetchError::InvalidReference {
            href: href.to_string(),
            message: e.to_string(),
        })?;
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            fetched = self.fetcher.fetch(&url) => fetched?,
        };
        Ok(if embedded {
            Rules::Embedded(text)
        } else {
            Rules::Standalone(text)
        })
    }
}

/// The session of `uri`, provided the pass for `revision` is still the newest one
fn latest<'a>(
    sessions: &'a mut HashMap<Url, DocumentSession>,
    uri: &Url,
    revision: u64,
    cancel: &CancellationToken,
) -> Result<&'a mut DocumentSession, EngineError> {
    match sessions.get_mut(uri) {
        Some(session) if session.revision == revision && !cancel.is_cancelled() => Ok(session),
        _ => {
            debug!(%uri, revision, "superseded");
            Err(EngineError::Cancelled)
        }
    }
}
