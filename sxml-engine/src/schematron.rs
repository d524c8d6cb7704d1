//! The secondary, rule-based validation phase.  The engine itself is supplied by the
//! embedder; this module runs it off the async runtime and turns its findings into
//! diagnostics.

use crate::error::EngineError;
use crate::locate::locate;
use crate::text::{Range, TextIndex};
use crate::validate::{ErrorKind, Severity, ValidationResult};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A failed assertion, located by a Clark-notation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub location: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchematronError {
    /// The document could not be parsed; the grammar phase reports this itself
    #[error("document is not well-formed: {0}")]
    NotWellFormed(String),
    #[error("unusable Schematron rules: {0}")]
    Rules(String),
    #[error("Schematron engine failure: {0}")]
    Engine(String),
}

pub trait SchematronEngine: Send {
    fn set_schematron(&mut self, rules: &str) -> Result<(), SchematronError>;
    /// Selects the rules embedded in a RelaxNG schema
    fn set_rng(&mut self, schema: &str) -> Result<(), SchematronError>;
    fn validate(&mut self, xml: &str) -> Result<Vec<Finding>, SchematronError>;
}

pub trait SchematronFactory: Send + Sync {
    fn create(&self) -> Box<dyn SchematronEngine>;
}

/// The rule source for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rules {
    Standalone(String),
    /// the text of a RelaxNG schema carrying Schematron rules
    Embedded(String),
}

fn check(
    mut engine: Box<dyn SchematronEngine>,
    rules: &Rules,
    xml: &str,
) -> Result<Vec<Finding>, SchematronError> {
    match rules {
        Rules::Standalone(text) => engine.set_schematron(text)?,
        Rules::Embedded(text) => engine.set_rng(text)?,
    }
    engine.validate(xml)
}

/// Runs the engine over `original` on a blocking thread.  Engine failures, including
/// panics, are logged and give an empty result; only cancellation is an error.
pub async fn run_phase(
    factory: &dyn SchematronFactory,
    rules: Rules,
    original: Arc<TextIndex>,
    cancel: &CancellationToken,
) -> Result<ValidationResult, EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    let engine = factory.create();
    let document = original.clone();
    let task = tokio::task::spawn_blocking(move || check(engine, &rules, document.text()));

    let outcome = tokio::select! {
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        joined = task => joined,
    };
    let findings = match outcome {
        Ok(Ok(findings)) => findings,
        Ok(Err(SchematronError::NotWellFormed(message))) => {
            debug!("skipping Schematron findings: {}", message);
            return Ok(ValidationResult::default());
        }
        Ok(Err(e)) => {
            warn!(document = original.name(), "Schematron validation failed: {}", e);
            return Ok(ValidationResult::default());
        }
        Err(e) => {
            error!(document = original.name(), "Schematron engine crashed: {}", e);
            return Ok(ValidationResult::default());
        }
    };

    let mut result = ValidationResult::default();
    for finding in findings {
        let range = locate(&original, &finding.location).unwrap_or_else(|| {
            debug!(location = %finding.location, "could not locate Schematron finding");
            Range::default()
        });
        let message = finding.text.split_whitespace().collect::<Vec<_>>().join(" ");
        result.push(
            ErrorKind::SchematronViolation,
            Severity::Error,
            range,
            message,
        );
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::text::Position;
    use assert_matches::assert_matches;
    use std::time::Duration;

    /// Reports a fixed set of findings, after an optional delay
    #[derive(Clone, Default)]
    pub(crate) struct CannedEngine {
        pub findings: Vec<Finding>,
        pub error: Option<SchematronError>,
        pub delay: Option<Duration>,
        pub panics: bool,
        pub expect_embedded: bool,
        selected: Option<Rules>,
    }

    impl CannedEngine {
        pub fn reporting(findings: &[(&str, &str)]) -> CannedEngine {
            CannedEngine {
                findings: findings
                    .iter()
                    .map(|(location, text)| Finding {
                        location: location.to_string(),
                        text: text.to_string(),
                    })
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl SchematronEngine for CannedEngine {
        fn set_schematron(&mut self, rules: &str) -> Result<(), SchematronError> {
            self.selected = Some(Rules::Standalone(rules.to_string()));
            Ok(())
        }

        fn set_rng(&mut self, schema: &str) -> Result<(), SchematronError> {
            self.selected = Some(Rules::Embedded(schema.to_string()));
            Ok(())
        }

        fn validate(&mut self, _xml: &str) -> Result<Vec<Finding>, SchematronError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.panics {
                panic!("engine blew up");
            }
            if self.expect_embedded && !matches!(self.selected, Some(Rules::Embedded(_))) {
                return Err(SchematronError::Rules("expected embedded rules".to_string()));
            }
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(self.findings.clone()),
            }
        }
    }

    impl SchematronFactory for CannedEngine {
        fn create(&self) -> Box<dyn SchematronEngine> {
            Box::new(self.clone())
        }
    }

    fn document() -> Arc<TextIndex> {
        Arc::new(TextIndex::new(
            "doc.xml",
            "<r>\n  <p id=\"a\"/>\n</r>".to_string(),
        ))
    }

    fn rules() -> Rules {
        Rules::Standalone("<schema/>".to_string())
    }

    #[tokio::test]
    async fn findings_are_located() {
        let engine = CannedEngine::reporting(&[
            ("/Q{}r/Q{}p[1]", "p needs\n   content"),
            ("/Q{}r/Q{}p[1]/@Q{}id", "bad id"),
            ("/Q{}r/Q{}x[1]", "somewhere"),
        ]);
        let result = run_phase(&engine, rules(), document(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.error_kind, ErrorKind::SchematronViolation);
        assert_eq!(result.error_count, 3);
        let d = &result.diagnostics;
        assert_eq!(d[0].message, "p needs content");
        assert_eq!(d[0].range.start, Position::new(1, 2));
        assert_eq!(
            d[1].range,
            Range::new(Position::new(1, 5), Position::new(1, 11))
        );
        assert_eq!(d[2].range, Range::default());
    }

    #[tokio::test]
    async fn embedded_rules() {
        let mut engine = CannedEngine::reporting(&[("/Q{}r", "checked")]);
        engine.expect_embedded = true;
        let result = run_phase(
            &engine,
            Rules::Embedded("<grammar/>".to_string()),
            document(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.error_count, 1);
        let result = run_phase(&engine, rules(), document(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn failures_give_no_findings() {
        let mut engine = CannedEngine::reporting(&[("/Q{}r", "x")]);
        engine.error = Some(SchematronError::NotWellFormed("eof".to_string()));
        let result = run_phase(&engine, rules(), document(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, ValidationResult::default());

        engine.error = None;
        engine.panics = true;
        let result = run_phase(&engine, rules(), document(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, ValidationResult::default());
    }

    #[tokio::test]
    async fn cancelled() {
        let mut engine = CannedEngine::reporting(&[("/Q{}r", "x")]);
        engine.delay = Some(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_matches!(
            run_phase(&engine, rules(), document(), &cancel).await,
            Err(EngineError::Cancelled)
        );
    }
}
