//! Flattening of `xi:include` trees into one document.
//!
//! The result is kept as a sequence of [`Segment`]s; the text handed to the SAX source is
//! that sequence serialized, with every [`Marker`] written as a processing instruction
//! that the validation driver reads back to learn which file the following content came
//! from.

use crate::config::Config;
use crate::error::{EngineError, FetchError};
use crate::sax::{SaxError, SaxEvent, SaxSource, Tag, XmlSource};
use crate::validate::scan_doctype_entities;
use futures::future::{join_all, BoxFuture, FutureExt};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const XINCLUDE_NAMESPACE: &str = "http://www.w3.org/2001/XInclude";

const MAP_ENTER: &str = "xml-xi-map-enter";
const MAP_LEAVE: &str = "xml-xi-map-leave";
const NESTED_ENTER: &str = "xml-xi-nested-enter";
const NESTED_LEAVE: &str = "xml-xi-nested-leave";
const ERROR: &str = "xml-xi-error";
const NOTICE: &str = "xml-xi-notice";

/// Where an include element sits in the document that contains it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeSite {
    pub uri: String,
    /// 1-based
    pub line: usize,
    /// 0-based, in characters
    pub column: usize,
    /// byte span of the whole include element, close tag included
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    EnterInclude(IncludeSite),
    /// `resume` is the offset in the root document where its own text continues
    LeaveInclude { resume: usize },
    EnterNested { uri: String },
    LeaveNested,
    IncludeError { message: String, site: IncludeSite },
    Notice { message: String, site: IncludeSite },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// `origin` is the offset of `text` within the file it was taken from
    Literal { text: String, origin: usize },
    Marker(Marker),
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

fn write_site(f: &mut fmt::Formatter<'_>, site: &IncludeSite) -> fmt::Result {
    write!(
        f,
        " uri=\"{}\" parent-line=\"{}\" parent-col=\"{}\" parent-start=\"{}\" parent-end=\"{}\"",
        escape(&site.uri),
        site.line,
        site.column,
        site.start,
        site.end
    )
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::EnterInclude(site) => {
                write!(f, "<?{}", MAP_ENTER)?;
                write_site(f, site)?;
            }
            Marker::LeaveInclude { resume } => write!(f, "<?{} resume=\"{}\"", MAP_LEAVE, resume)?,
            Marker::EnterNested { uri } => write!(f, "<?{} uri=\"{}\"", NESTED_ENTER, escape(uri))?,
            Marker::LeaveNested => write!(f, "<?{}", NESTED_LEAVE)?,
            Marker::IncludeError { message, site } => {
                write!(f, "<?{} err=\"{}\"", ERROR, escape(message))?;
                write_site(f, site)?;
            }
            Marker::Notice { message, site } => {
                write!(f, "<?{} msg=\"{}\"", NOTICE, escape(message))?;
                write_site(f, site)?;
            }
        }
        f.write_str("?>")
    }
}

impl Marker {
    /// Reads back a marker from the target and body of a processing instruction; `None` for
    /// any other processing instruction
    pub fn parse(target: &str, body: &str) -> Option<Marker> {
        lazy_static! {
            static ref ATTR: Regex = Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap();
        }
        let attrs: Vec<(&str, String)> = ATTR
            .captures_iter(body)
            .filter_map(|c| Some((c.get(1)?.as_str(), unescape(c.get(2)?.as_str()))))
            .collect();
        let attr = |name: &str| {
            attrs
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
        };
        let number = |name: &str| attr(name).and_then(|v| v.parse::<usize>().ok());
        let site = || {
            Some(IncludeSite {
                uri: attr("uri").unwrap_or_default(),
                line: number("parent-line")?,
                column: number("parent-col")?,
                start: number("parent-start")?,
                end: number("parent-end")?,
            })
        };
        match target {
            MAP_ENTER => Some(Marker::EnterInclude(site()?)),
            MAP_LEAVE => Some(Marker::LeaveInclude {
                resume: number("resume")?,
            }),
            NESTED_ENTER => Some(Marker::EnterNested {
                uri: attr("uri").unwrap_or_default(),
            }),
            NESTED_LEAVE => Some(Marker::LeaveNested),
            ERROR => Some(Marker::IncludeError {
                message: attr("err")?,
                site: site()?,
            }),
            NOTICE => Some(Marker::Notice {
                message: attr("msg")?,
                site: site()?,
            }),
            _ => None,
        }
    }
}

/// A document with its includes resolved
#[derive(Debug, Clone)]
pub struct Flattened {
    pub segments: Vec<Segment>,
    pub text: String,
}

impl Flattened {
    pub fn new(segments: Vec<Segment>) -> Flattened {
        let mut text = String::new();
        for segment in &segments {
            match segment {
                Segment::Literal { text: t, .. } => text.push_str(t),
                Segment::Marker(m) => text.push_str(&m.to_string()),
            }
        }
        Flattened { segments, text }
    }

    pub fn unchanged(text: &str) -> Flattened {
        Flattened {
            segments: vec![Segment::Literal {
                text: text.to_string(),
                origin: 0,
            }],
            text: text.to_string(),
        }
    }

    pub fn has_includes(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Marker(_)))
    }

    /// Maps an offset in the root document to the flattened text.  Offsets that fall
    /// inside a replaced include element map to the end of its replacement.
    pub fn to_flat_offset(&self, offset: usize) -> usize {
        let mut flat = 0;
        let mut nesting = 0usize;
        let mut best = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal { text, origin } => {
                    if nesting == 0 {
                        if offset < *origin {
                            return best;
                        }
                        if offset <= origin + text.len() {
                            return flat + (offset - origin);
                        }
                    }
                    flat += text.len();
                }
                Segment::Marker(m) => {
                    match m {
                        Marker::EnterInclude(_) => nesting += 1,
                        Marker::LeaveInclude { .. } => nesting = nesting.saturating_sub(1),
                        _ => {}
                    }
                    flat += m.to_string().len();
                }
            }
            if nesting == 0 {
                best = flat;
            }
        }
        best
    }
}

/// Loads the text of an included resource
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>>;
}

/// Reads `file:` URLs from disk and `http:`/`https:` URLs over the network
#[derive(Default)]
pub struct DefaultFetcher {
    client: reqwest::Client,
}

impl Fetcher for DefaultFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
        async move {
            match url.scheme() {
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| FetchError::InvalidReference {
                            href: url.to_string(),
                            message: "not a local path".to_string(),
                        })?;
                    tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| FetchError::Io {
                            url: url.to_string(),
                            message: e.to_string(),
                        })
                }
                "http" | "https" => {
                    let http_err = |e: reqwest::Error| FetchError::Http {
                        url: url.to_string(),
                        message: e.to_string(),
                    };
                    let response = self
                        .client
                        .get(url.as_str())
                        .send()
                        .await
                        .map_err(http_err)?
                        .error_for_status()
                        .map_err(http_err)?;
                    response.text().await.map_err(http_err)
                }
                other => Err(FetchError::UnsupportedScheme(other.to_string())),
            }
        }
        .boxed()
    }
}

/// Turns an `href` into an absolute URL.  Absolute URLs are kept as they are, absolute
/// paths become `file:` URLs and anything else is relative to `base`.
pub fn normalize_href(href: &str, base: &Url) -> Result<Url, FetchError> {
    let invalid = |message: String| FetchError::InvalidReference {
        href: href.to_string(),
        message,
    };
    // a one-letter scheme is a Windows drive letter
    if let Ok(url) = Url::parse(href) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = Path::new(href);
    if path.is_absolute() {
        return Url::from_file_path(path).map_err(|_| invalid("not a usable path".to_string()));
    }
    base.join(href).map_err(|e| invalid(e.to_string()))
}

fn strip_xml_declaration(text: &str) -> &str {
    lazy_static! {
        static ref DECL: Regex = Regex::new(r"^\s*<\?xml(\s[^?]*(\?[^>][^?]*)*)?\?>\s*").unwrap();
    }
    match DECL.find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}

struct RawInclude {
    start: usize,
    end: usize,
    href: Option<String>,
}

/// Reads an included document through to its end; only well-formed documents are spliced
fn check_well_formed(content: &str) -> Result<(), SaxError> {
    let mut source = XmlSource::new(content);
    while let Some(event) = source.next_event() {
        if let SaxEvent::Doctype(doctype) = event? {
            for (name, value) in scan_doctype_entities(&doctype).unwrap_or_default() {
                source.define_entity(&name, &value);
            }
        }
    }
    Ok(())
}

fn is_include(tag: &Tag) -> bool {
    tag.uri == XINCLUDE_NAMESPACE && tag.local == "include"
}

/// The top-most include elements of `text`, or `None` if it is not well-formed.  Includes
/// inside an include element (in its fallback, say) go together with their parent.
fn find_includes(text: &str) -> Option<Vec<RawInclude>> {
    let mut src = XmlSource::new(text);
    let mut found = vec![];
    let mut open: Option<(RawInclude, usize)> = None;
    let mut depth = 0usize;
    while let Some(event) = src.next_event() {
        match event {
            Err(e) => {
                debug!(offset = e.offset(), "not resolving includes of malformed text: {}", e);
                return None;
            }
            Ok(SaxEvent::OpenTag(tag)) => {
                depth += 1;
                if open.is_none() && is_include(&tag) {
                    let include = RawInclude {
                        start: tag.start,
                        end: tag.end,
                        href: tag.attribute("", "href").map(|a| a.value.clone()),
                    };
                    if tag.self_closing {
                        found.push(include);
                    } else {
                        open = Some((include, depth));
                    }
                }
            }
            Ok(SaxEvent::CloseTag(_)) => {
                if matches!(&open, Some((_, d)) if *d == depth) {
                    if let Some((mut include, _)) = open.take() {
                        include.end = src.offset();
                        found.push(include);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(_) => {}
        }
    }
    Some(found)
}

fn line_col(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset];
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    (
        before.matches('\n').count() + 1,
        before[line_start..].chars().count(),
    )
}

pub struct Resolver {
    fetcher: Arc<dyn Fetcher>,
    max_depth: usize,
    enabled: bool,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: &Config) -> Resolver {
        Resolver {
            fetcher,
            max_depth: config.xinclude_depth,
            enabled: config.xinclude_support,
        }
    }

    /// Resolves every include of `text`, a document located at `base`.  Failed includes
    /// become error markers; only cancellation fails the whole resolution.
    pub async fn resolve(
        &self,
        text: &str,
        base: &Url,
        cancel: &CancellationToken,
    ) -> Result<Flattened, EngineError> {
        let segments = self
            .resolve_segments(text.to_string(), base.clone(), 0, cancel)
            .await?;
        Ok(Flattened::new(segments))
    }

    fn resolve_segments<'a>(
        &'a self,
        text: String,
        base: Url,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Segment>, EngineError>> {
        async move {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let includes = match find_includes(&text) {
                Some(includes) if !includes.is_empty() => includes,
                _ => return Ok(vec![Segment::Literal { text, origin: 0 }]),
            };
            let resolved = join_all(
                includes
                    .iter()
                    .map(|include| self.resolve_include(&text, include, &base, depth, cancel)),
            )
            .await;

            let mut segments = vec![];
            let mut pos = 0;
            for (include, parts) in includes.iter().zip(resolved) {
                if include.start > pos {
                    segments.push(Segment::Literal {
                        text: text[pos..include.start].to_string(),
                        origin: pos,
                    });
                }
                segments.extend(parts?);
                pos = include.end;
            }
            if pos < text.len() {
                segments.push(Segment::Literal {
                    text: text[pos..].to_string(),
                    origin: pos,
                });
            }
            Ok(segments)
        }
        .boxed()
    }

    async fn resolve_include(
        &self,
        text: &str,
        include: &RawInclude,
        base: &Url,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Segment>, EngineError> {
        let (line, column) = line_col(text, include.start);
        let site = |uri: String| IncludeSite {
            uri,
            line,
            column,
            start: include.start,
            end: include.end,
        };
        let href = include.href.clone().unwrap_or_default();
        let error = |message: String, uri: String| {
            vec![Segment::Marker(Marker::IncludeError {
                message,
                site: site(uri),
            })]
        };

        if depth >= self.max_depth {
            warn!(depth, %href, "maximum XInclude depth reached");
            return Ok(vec![Segment::Marker(Marker::Notice {
                message: "Maximum XInclude depth reached, skipping further includes.".to_string(),
                site: site(href),
            })]);
        }
        if !self.enabled {
            return Ok(vec![Segment::Marker(Marker::Notice {
                message: "XInclude resolution is turned off in settings.".to_string(),
                site: site(href),
            })]);
        }
        if include.href.is_none() {
            return Ok(error("xi:include has no href attribute".to_string(), href));
        }
        let url = match normalize_href(&href, base) {
            Ok(url) => url,
            Err(e) => return Ok(error(e.to_string(), href)),
        };

        debug!(%url, depth, "fetching XInclude");
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            fetched = self.fetcher.fetch(&url) => fetched,
        };
        let content = match fetched {
            Ok(content) => strip_xml_declaration(&content).to_string(),
            Err(e) => {
                warn!(%url, "could not fetch XInclude: {}", e);
                return Ok(error(e.to_string(), url.to_string()));
            }
        };
        if let Err(e) = check_well_formed(&content) {
            warn!(%url, "XInclude is not well-formed: {}", e);
            return Ok(error(
                format!("{} is not well-formed: {}", url, e),
                url.to_string(),
            ));
        }
        let nested = self
            .resolve_segments(content, url.clone(), depth + 1, cancel)
            .await?;

        let mut segments = Vec::with_capacity(nested.len() + 2);
        if depth == 0 {
            segments.push(Segment::Marker(Marker::EnterInclude(site(url.to_string()))));
            segments.extend(nested);
            segments.push(Segment::Marker(Marker::LeaveInclude {
                resume: include.end,
            }));
        } else {
            segments.push(Segment::Marker(Marker::EnterNested {
                uri: url.to_string(),
            }));
            segments.extend(nested);
            segments.push(Segment::Marker(Marker::LeaveNested));
        }
        Ok(segments)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    /// Serves documents from memory, keyed by URL
    #[derive(Default)]
    pub(crate) struct MemoryFetcher {
        pub docs: HashMap<String, String>,
    }

    impl MemoryFetcher {
        pub fn with(docs: &[(&str, &str)]) -> Arc<MemoryFetcher> {
            Arc::new(MemoryFetcher {
                docs: docs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        }
    }

    impl Fetcher for MemoryFetcher {
        fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
            let result = self.docs.get(url.as_str()).cloned().ok_or_else(|| FetchError::Io {
                url: url.to_string(),
                message: "No such file or directory".to_string(),
            });
            futures::future::ready(result).boxed()
        }
    }

    fn base() -> Url {
        Url::parse("file:///doc/main.xml").unwrap()
    }

    async fn flatten(fetcher: Arc<MemoryFetcher>, config: &Config, text: &str) -> Flattened {
        Resolver::new(fetcher, config)
            .resolve(text, &base(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn markers(f: &Flattened) -> Vec<&Marker> {
        f.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Marker(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn no_includes_is_unchanged() {
        let text = "<?xml version=\"1.0\"?>\n<a><b/></a>";
        let f = flatten(MemoryFetcher::with(&[]), &Config::default(), text).await;
        assert_eq!(f.text, text);
        assert!(!f.has_includes());
    }

    #[tokio::test]
    async fn include_is_spliced() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude">
  <xi:include href="part.xml"/>
</a>"#;
        let fetcher = MemoryFetcher::with(&[(
            "file:///doc/part.xml",
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<p>hi</p>",
        )]);
        let f = flatten(fetcher, &Config::default(), text).await;
        let m = markers(&f);
        assert_eq!(m.len(), 2);
        assert_matches!(m[0], Marker::EnterInclude(site) if site.line == 2 && site.column == 2
            && site.uri == "file:///doc/part.xml" && &text[site.start..site.end] == r#"<xi:include href="part.xml"/>"#);
        assert_matches!(m[1], Marker::LeaveInclude { resume } if &text[*resume..] == "\n</a>");
        assert!(f.text.contains("<p>hi</p><?xml-xi-map-leave"));
        assert!(!f.text.contains("<?xml version"));
    }

    #[tokio::test]
    async fn unreachable_include_is_an_error_marker() {
        let text = r#"<a><xi:include xmlns:xi="http://www.w3.org/2001/XInclude" href="missing.xml"/><b/></a>"#;
        let f = flatten(MemoryFetcher::with(&[]), &Config::default(), text).await;
        let m = markers(&f);
        assert_eq!(m.len(), 1);
        assert_matches!(m[0], Marker::IncludeError { message, site } if message.contains("missing.xml") && site.start == 3);
        assert!(f.text.ends_with("?><b/></a>"));
    }

    #[tokio::test]
    async fn malformed_include_is_an_error_marker() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="m.xml"/><b/></a>"#;
        let fetcher = MemoryFetcher::with(&[("file:///doc/m.xml", "<good>")]);
        let f = flatten(fetcher, &Config::default(), text).await;
        let m = markers(&f);
        assert_eq!(m.len(), 1);
        assert_matches!(m[0], Marker::IncludeError { message, site }
            if message.contains("not well-formed") && site.uri == "file:///doc/m.xml"
                && &text[site.start..site.end] == r#"<xi:include href="m.xml"/>"#);
        assert!(!f.text.contains("<good>"));
        assert!(f.text.ends_with("?><b/></a>"));
    }

    #[tokio::test]
    async fn included_doctype_entities_are_defined() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="e.xml"/></a>"#;
        let part = "<!DOCTYPE p [<!ENTITY who \"you\">]>\n<p>&who;</p>";
        let f = flatten(MemoryFetcher::with(&[("file:///doc/e.xml", part)]), &Config::default(), text).await;
        assert_matches!(markers(&f)[0], Marker::EnterInclude(_));
    }

    #[tokio::test]
    async fn depth_is_limited() {
        let doc = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="main.xml"/></a>"#;
        let config = Config {
            xinclude_depth: 3,
            ..Config::default()
        };
        let f = flatten(MemoryFetcher::with(&[("file:///doc/main.xml", doc)]), &config, doc).await;
        assert_eq!(f.text.matches(MAP_ENTER).count(), 1);
        assert_eq!(f.text.matches(NESTED_ENTER).count(), 2);
        assert_eq!(f.text.matches(NOTICE).count(), 1);
    }

    #[tokio::test]
    async fn disabled_support_gives_notice() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="x.xml"></xi:include></a>"#;
        let config = Config {
            xinclude_support: false,
            ..Config::default()
        };
        let f = flatten(MemoryFetcher::with(&[("file:///doc/x.xml", "<x/>")]), &config, text).await;
        let m = markers(&f);
        assert_eq!(m.len(), 1);
        assert_matches!(m[0], Marker::Notice { site, .. } if &text[site.end..] == "</a>");
        assert!(!f.text.contains("<x/>"));
    }

    #[tokio::test]
    async fn siblings_in_order() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="1.xml"/><xi:include href="2.xml"/></a>"#;
        let fetcher = MemoryFetcher::with(&[
            ("file:///doc/1.xml", "<one/>"),
            ("file:///doc/2.xml", "<two/>"),
        ]);
        let f = flatten(fetcher, &Config::default(), text).await;
        let one = f.text.find("<one/>").unwrap();
        let two = f.text.find("<two/>").unwrap();
        assert!(one < two);
        assert_eq!(f.text.matches(MAP_LEAVE).count(), 2);
    }

    #[tokio::test]
    async fn malformed_text_is_left_alone() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="1.xml"/>"#;
        let f = flatten(MemoryFetcher::with(&[("file:///doc/1.xml", "<one/>")]), &Config::default(), text).await;
        assert_eq!(f.text, text);
    }

    #[tokio::test]
    async fn cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = Resolver::new(MemoryFetcher::with(&[]), &Config::default())
            .resolve("<a/>", &base(), &cancel)
            .await;
        assert_matches!(r, Err(EngineError::Cancelled));
    }

    #[tokio::test]
    async fn reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part.xml"), "<part/>").unwrap();
        let main = dir.path().join("main.xml");
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="part.xml"/></a>"#;
        let base = Url::from_file_path(&main).unwrap();
        let f = Resolver::new(Arc::new(DefaultFetcher::default()), &Config::default())
            .resolve(text, &base, &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.text.contains("<part/>"));
    }

    #[test]
    fn marker_text_parses_back() {
        let m = Marker::IncludeError {
            message: "bad \"thing\" <here> & there".to_string(),
            site: IncludeSite {
                uri: "file:///a.xml".to_string(),
                line: 3,
                column: 4,
                start: 10,
                end: 40,
            },
        };
        let text = m.to_string();
        let body = &text[ERROR.len() + 3..text.len() - 2];
        assert_eq!(Marker::parse(ERROR, body), Some(m));
        assert_eq!(Marker::parse("xml-stylesheet", "href=\"a\""), None);
    }

    #[test]
    fn hrefs() {
        let base = base();
        assert_eq!(normalize_href("x/y.xml", &base).unwrap().as_str(), "file:///doc/x/y.xml");
        assert_eq!(
            normalize_href("http://example.com/a.xml", &base).unwrap().as_str(),
            "http://example.com/a.xml"
        );
        assert_eq!(normalize_href("/abs/a.xml", &base).unwrap().as_str(), "file:///abs/a.xml");
    }

    #[test]
    fn declaration_stripped() {
        assert_eq!(strip_xml_declaration("<?xml version='1.0'?>\n<a/>"), "<a/>");
        assert_eq!(
            strip_xml_declaration("<?xml-model href='s.rng'?><a/>"),
            "<?xml-model href='s.rng'?><a/>"
        );
    }

    #[tokio::test]
    async fn flat_offsets() {
        let text = r#"<a xmlns:xi="http://www.w3.org/2001/XInclude"><xi:include href="1.xml"/><b/></a>"#;
        let f = flatten(MemoryFetcher::with(&[("file:///doc/1.xml", "<one/>")]), &Config::default(), text).await;
        let b = text.find("<b/>").unwrap();
        assert_eq!(&f.text[f.to_flat_offset(b)..f.to_flat_offset(b) + 4], "<b/>");
        assert_eq!(f.to_flat_offset(3), 3);
        assert_eq!(f.to_flat_offset(text.len()), f.text.len());
    }
}
