use codemap::CodeMap;
use codemap_diagnostic::{ColorConfig, Emitter, Level, SpanLabel, SpanStyle};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use structopt::StructOpt;
use sxml_engine::complete::{complete, detect_request};
use sxml_engine::locate::schema_for;
use sxml_engine::validate::validate;
use sxml_engine::xinclude::normalize_href;
use sxml_engine::{
    Config, DefaultFetcher, EngineError, ErrorKind, FetchError, Fetcher, Flattened, Resolver,
    RngCompiler, SchemaCompiler, Severity, TextIndex, Trigger, ValidationResult,
};
use sxml_grammar::Grammar;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, StructOpt)]
#[structopt(name = "sxml")]
enum Cli {
    /// Validates documents against their RELAX NG schemas
    Validate {
        /// Schema to use instead of the one each document names
        #[structopt(long)]
        schema: Option<String>,
        #[structopt(long, parse(from_os_str))]
        config: Option<PathBuf>,
        #[structopt(parse(from_os_str), required = true)]
        xml: Vec<PathBuf>,
    },
    /// Lists completions at a byte offset of a document
    Complete {
        #[structopt(long)]
        offset: usize,
        /// The character just typed; without it completion is treated as explicitly invoked
        #[structopt(long)]
        trigger: Option<char>,
        #[structopt(long)]
        schema: Option<String>,
        #[structopt(long, parse(from_os_str))]
        config: Option<PathBuf>,
        #[structopt(parse(from_os_str))]
        xml: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .init();

    let outcome = match Cli::from_args() {
        Cli::Validate {
            schema,
            config,
            xml,
        } => run_validate(schema, config, xml).await,
        Cli::Complete {
            offset,
            trigger,
            schema,
            config,
            xml,
        } => run_complete(offset, trigger, schema, config, xml).await,
    };
    match outcome {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            exit(2);
        }
    }
}

/// `RUST_LOG` directives when given and valid, otherwise warnings only
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

/// One document read from disk, with everything needed to check it
struct Loaded {
    index: TextIndex,
    uri: Url,
    flattened: Flattened,
    schema: Option<Url>,
}

struct Tool {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    schema: Option<Url>,
    cancel: CancellationToken,
}

impl Tool {
    fn new(config: Option<PathBuf>, schema: Option<String>) -> Result<Tool, EngineError> {
        let config = match config {
            Some(path) => Config::load(&path)?,
            None => Config::default(),
        };
        let schema = match schema {
            Some(href) => Some(normalize_href(&href, &working_dir()?)?),
            None => None,
        };
        Ok(Tool {
            config,
            fetcher: Arc::new(DefaultFetcher::default()),
            schema,
            cancel: CancellationToken::new(),
        })
    }

    async fn load(&self, path: &Path) -> Result<Loaded, EngineError> {
        let path = std::fs::canonicalize(path).map_err(|e| io_error(path, e))?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let uri = Url::from_file_path(&path).map_err(|_| FetchError::InvalidReference {
            href: path.display().to_string(),
            message: "not an absolute path".to_string(),
        })?;
        let schema = match &self.schema {
            Some(schema) => Some(schema.clone()),
            None => match schema_for(&text, &uri, &self.config).relaxng {
                Some(href) => Some(normalize_href(&href, &uri)?),
                None => None,
            },
        };
        let flattened = Resolver::new(self.fetcher.clone(), &self.config)
            .resolve(&text, &uri, &self.cancel)
            .await?;
        Ok(Loaded {
            index: TextIndex::new(&path.display().to_string(), text),
            uri,
            flattened,
            schema,
        })
    }

    async fn grammar(&self, schema: &Url) -> Result<Arc<dyn Grammar>, String> {
        debug!(%schema, "compiling schema");
        RngCompiler::new(self.fetcher.clone())
            .compile(schema)
            .await
            .map_err(|e| format!("Could not load schema {}: {}", schema, e))
    }
}

async fn run_validate(
    schema: Option<String>,
    config: Option<PathBuf>,
    xmls: Vec<PathBuf>,
) -> Result<bool, EngineError> {
    let tool = Tool::new(config, schema)?;
    let mut all_valid = true;
    for xml in xmls {
        let doc = tool.load(&xml).await?;
        debug!(uri = %doc.uri, "validating");
        let result = match &doc.schema {
            Some(schema) => match tool.grammar(schema).await {
                Ok(grammar) => validate(
                    &doc.flattened.text,
                    &doc.index,
                    Some(grammar.as_ref()),
                    &tool.cancel,
                )?,
                Err(message) => ValidationResult::single(
                    ErrorKind::SchemaInvalid,
                    Default::default(),
                    message,
                ),
            },
            None => validate(&doc.flattened.text, &doc.index, None, &tool.cancel)?,
        };
        emit(&doc.index, &result);
        println!("{}: {}", xml.display(), result.status_message(false));
        all_valid &= result.is_valid();
    }
    Ok(all_valid)
}

async fn run_complete(
    offset: usize,
    trigger: Option<char>,
    schema: Option<String>,
    config: Option<PathBuf>,
    xml: PathBuf,
) -> Result<bool, EngineError> {
    let tool = Tool::new(config, schema)?;
    let doc = tool.load(&xml).await?;
    let schema = match &doc.schema {
        Some(schema) => schema,
        None => {
            eprintln!("{}: no schema to complete from", xml.display());
            return Ok(false);
        }
    };
    let grammar = match tool.grammar(schema).await {
        Ok(grammar) => grammar,
        Err(message) => {
            eprintln!("{}", message);
            return Ok(false);
        }
    };
    let trigger = trigger.map(Trigger::Character).unwrap_or(Trigger::Invoked);
    let kind = match detect_request(doc.index.text(), offset, trigger) {
        Some(kind) => kind,
        None => return Ok(true),
    };
    let cursor = doc.flattened.to_flat_offset(offset);
    for item in complete(&doc.flattened.text, grammar.as_ref(), cursor, kind) {
        println!("{}\t{}", item.label, item.insert_text);
    }
    Ok(true)
}

/// Renders diagnostics against the document source
fn emit(index: &TextIndex, result: &ValidationResult) {
    if result.diagnostics.is_empty() {
        return;
    }
    let mut map = CodeMap::new();
    let file = map.add_file(index.name().to_string(), index.text().to_string());
    let diagnostics: Vec<_> = result
        .diagnostics
        .iter()
        .map(|d| {
            let start = index.offset_at(d.range.start.line, d.range.start.character);
            let end = index
                .offset_at(d.range.end.line, d.range.end.character)
                .max(start);
            codemap_diagnostic::Diagnostic {
                level: match d.severity {
                    Severity::Error => Level::Error,
                    Severity::Warning => Level::Warning,
                    Severity::Information => Level::Note,
                },
                message: d.message.clone(),
                code: None,
                spans: vec![SpanLabel {
                    span: file.span.subspan(start as u64, end as u64),
                    label: None,
                    style: SpanStyle::Primary,
                }],
            }
        })
        .collect();
    let mut emitter = Emitter::stderr(ColorConfig::Auto, Some(&map));
    emitter.emit(&diagnostics);
}

fn working_dir() -> Result<Url, EngineError> {
    let dir = std::env::current_dir().map_err(|e| io_error(Path::new("."), e))?;
    Url::from_directory_path(&dir).map_err(|_| {
        EngineError::Fetch(FetchError::InvalidReference {
            href: dir.display().to_string(),
            message: "not an absolute path".to_string(),
        })
    })
}

fn io_error(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::Fetch(FetchError::Io {
        url: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_follows_rust_log() {
        assert_eq!(log_filter(Some("sxml_engine=debug")).to_string(), "sxml_engine=debug");
        assert_eq!(log_filter(Some("debug")).to_string(), "debug");
        assert_eq!(log_filter(None).to_string(), "warn");
        assert_eq!(log_filter(Some("sxml_engine=loud")).to_string(), "warn");
    }
}
