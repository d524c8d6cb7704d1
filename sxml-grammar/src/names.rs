//! Namespace prefix bindings in scope at a point of the document

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug)]
pub struct NameResolver {
    contexts: Vec<Vec<(String, String)>>,
    entered: usize,
    left: usize,
}

impl Default for NameResolver {
    fn default() -> Self {
        NameResolver {
            contexts: vec![vec![("xml".to_string(), XML_NAMESPACE.to_string())]],
            entered: 0,
            left: 0,
        }
    }
}

impl NameResolver {
    pub fn enter_context(&mut self) {
        self.entered += 1;
        self.contexts.push(vec![]);
    }

    /// Pops the innermost context.  The base context holding the `xml` binding is never
    /// removed; returns `false` if there was nothing to pop.
    pub fn leave_context(&mut self) -> bool {
        if self.contexts.len() > 1 {
            self.left += 1;
            self.contexts.pop();
            true
        } else {
            false
        }
    }

    /// Binds `prefix` (empty for the default namespace) in the innermost context
    pub fn define_prefix(&mut self, prefix: &str, uri: &str) {
        if let Some(ctx) = self.contexts.last_mut() {
            ctx.retain(|(p, _)| p != prefix);
            ctx.push((prefix.to_string(), uri.to_string()));
        }
    }

    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.contexts
            .iter()
            .rev()
            .find_map(|ctx| ctx.iter().find(|(p, _)| p == prefix))
            .map(|(_, uri)| uri.as_str())
    }

    pub fn default_namespace(&self) -> &str {
        self.resolve("").unwrap_or("")
    }

    /// A non-empty prefix currently bound to `uri`, skipping bindings that an inner context
    /// has redefined
    pub fn prefix_for(&self, uri: &str) -> Option<&str> {
        for ctx in self.contexts.iter().rev() {
            for (prefix, bound) in ctx.iter().rev() {
                if !prefix.is_empty() && bound == uri && self.resolve(prefix) == Some(uri) {
                    return Some(prefix);
                }
            }
        }
        None
    }

    pub fn is_bound(&self, prefix: &str) -> bool {
        self.resolve(prefix).is_some()
    }

    /// Splits `qname` and resolves its prefix.  Unprefixed names take the default
    /// namespace only when `use_default` is set (elements do, attributes don't).
    pub fn resolve_name<'a>(&self, qname: &'a str, use_default: bool) -> Option<(String, &'a str)> {
        match qname.find(':') {
            Some(pos) => {
                let uri = self.resolve(&qname[..pos])?;
                Some((uri.to_string(), &qname[pos + 1..]))
            }
            None if use_default => Some((self.default_namespace().to_string(), qname)),
            None => Some((String::new(), qname)),
        }
    }

    pub fn depth(&self) -> usize {
        self.contexts.len() - 1
    }

    pub fn entered(&self) -> usize {
        self.entered
    }

    pub fn left(&self) -> usize {
        self.left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoping() {
        let mut r = NameResolver::default();
        assert_eq!(r.resolve("xml"), Some(XML_NAMESPACE));
        r.enter_context();
        r.define_prefix("", "urn:a");
        r.define_prefix("t", "urn:t");
        r.enter_context();
        r.define_prefix("t", "urn:other");
        assert_eq!(r.resolve("t"), Some("urn:other"));
        assert_eq!(r.prefix_for("urn:t"), None);
        assert_eq!(r.default_namespace(), "urn:a");
        assert!(r.leave_context());
        assert_eq!(r.prefix_for("urn:t"), Some("t"));
        assert!(r.leave_context());
        assert!(!r.leave_context());
        assert_eq!(r.entered(), r.left());
        assert_eq!(r.default_namespace(), "");
    }

    #[test]
    fn resolve_names() {
        let mut r = NameResolver::default();
        r.enter_context();
        r.define_prefix("", "urn:d");
        assert_eq!(r.resolve_name("a", true), Some(("urn:d".to_string(), "a")));
        assert_eq!(r.resolve_name("a", false), Some((String::new(), "a")));
        assert_eq!(r.resolve_name("q:a", true), None);
    }
}
