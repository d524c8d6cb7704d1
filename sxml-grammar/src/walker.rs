//! Derivative-based walker over a compiled `GrammarModel`.
//!
//! See https://relaxng.org/jclark/derivative.html for the algorithm.  Patterns are interned
//! in a `Schema` so that structurally identical derivatives share one id; each walker owns
//! its own copy of the schema since derivation keeps adding patterns.

use crate::datatype::{Datatype, DatatypeValues, Datatypes};
use crate::model::{DefineId, GrammarModel, NameClass, NameKind, NamePattern, Pattern};
use crate::names::NameResolver;
use crate::{Event, Grammar, GrammarWalker, PossibleEvent, ValueCandidate, Violation};
use fnv::{FnvHashMap, FnvHashSet};

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
struct PatId(u32);

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
enum Pat {
    Choice(PatId, PatId, bool),
    Interleave(PatId, PatId, bool),
    Group(PatId, PatId, bool),
    OneOrMore(PatId, bool),
    Empty,
    Text,
    NotAllowed,
    Attribute(NameClass, PatId),
    Element(NameClass, PatId),
    Datatype(Datatypes),
    DatatypeValue(DatatypeValues),
    DatatypeExcept(Datatypes, PatId),
    List(PatId),
    /// stands in for a define while its body is being compiled
    Placeholder(DefineId),
    After(PatId, PatId),
}

impl Pat {
    fn is_nullable(&self) -> bool {
        match self {
            Pat::Choice(_, _, nullable)
            | Pat::Interleave(_, _, nullable)
            | Pat::Group(_, _, nullable)
            | Pat::OneOrMore(_, nullable) => *nullable,
            Pat::Empty | Pat::Text => true,
            _ => false,
        }
    }

    fn set_nullable(&mut self) {
        match self {
            Pat::Choice(_, _, nullable)
            | Pat::Interleave(_, _, nullable)
            | Pat::Group(_, _, nullable)
            | Pat::OneOrMore(_, nullable) => *nullable = true,
            _ => {}
        }
    }
}

fn is_whitespace_str(s: &str) -> bool {
    s.chars().all(|c| matches!(c, '\x20' | '\x09' | '\x0d' | '\x0a'))
}

#[derive(Clone, Default)]
struct Schema {
    memo: FnvHashMap<Pat, PatId>,
    patterns: Vec<Pat>,
}

impl Schema {
    fn push(&mut self, p: Pat) -> PatId {
        if let Some(id) = self.memo.get(&p) {
            *id
        } else {
            let id = PatId(self.patterns.len() as u32);
            self.memo.insert(p.clone(), id);
            self.patterns.push(p);
            id
        }
    }
    fn get(&self, id: PatId) -> &Pat {
        &self.patterns[id.0 as usize]
    }
    fn patt(&self, id: PatId) -> Pat {
        self.get(id).clone()
    }
    fn nullable(&self, id: PatId) -> bool {
        self.get(id).is_nullable()
    }
    fn is_not_allowed(&self, id: PatId) -> bool {
        matches!(self.get(id), Pat::NotAllowed)
    }

    fn empty(&mut self) -> PatId {
        self.push(Pat::Empty)
    }
    fn text(&mut self) -> PatId {
        self.push(Pat::Text)
    }
    fn not_allowed(&mut self) -> PatId {
        self.push(Pat::NotAllowed)
    }

    /// true if `needle` is one of the choice-leaves of `haystack`
    fn has_choice_leaf(&self, haystack: PatId, needle: PatId) -> bool {
        if haystack == needle {
            return true;
        }
        match self.get(haystack) {
            Pat::Choice(l, r, _) => self.has_choice_leaf(*l, needle) || self.has_choice_leaf(*r, needle),
            _ => false,
        }
    }

    fn choice(&mut self, left: PatId, right: PatId) -> PatId {
        if self.is_not_allowed(left) {
            return right;
        }
        if self.is_not_allowed(right) || self.has_choice_leaf(left, right) {
            return left;
        }
        if self.has_choice_leaf(right, left) {
            return right;
        }
        let nullable = self.nullable(left) || self.nullable(right);
        self.push(Pat::Choice(left, right, nullable))
    }
    fn is_empty(&self, id: PatId) -> bool {
        matches!(self.get(id), Pat::Empty)
    }
    fn interleave(&mut self, left: PatId, right: PatId) -> PatId {
        if self.is_not_allowed(left) || self.is_not_allowed(right) {
            self.not_allowed()
        } else if self.is_empty(left) {
            right
        } else if self.is_empty(right) {
            left
        } else {
            let nullable = self.nullable(left) && self.nullable(right);
            self.push(Pat::Interleave(left, right, nullable))
        }
    }
    fn group(&mut self, left: PatId, right: PatId) -> PatId {
        if self.is_not_allowed(left) || self.is_not_allowed(right) {
            self.not_allowed()
        } else if self.is_empty(left) {
            right
        } else if self.is_empty(right) {
            left
        } else {
            let nullable = self.nullable(left) && self.nullable(right);
            self.push(Pat::Group(left, right, nullable))
        }
    }
    fn after(&mut self, p1: PatId, p2: PatId) -> PatId {
        if self.is_not_allowed(p1) || self.is_not_allowed(p2) {
            self.not_allowed()
        } else {
            self.push(Pat::After(p1, p2))
        }
    }
    fn one_or_more(&mut self, p: PatId) -> PatId {
        if self.is_not_allowed(p) {
            p
        } else {
            let nullable = self.nullable(p);
            self.push(Pat::OneOrMore(p, nullable))
        }
    }

    // -- compilation from the model --

    fn compile(
        &mut self,
        model: &GrammarModel,
        refs: &mut FnvHashMap<DefineId, PatId>,
        p: &Pattern,
    ) -> PatId {
        match p {
            Pattern::Choice(v) => self.fold(model, refs, v, Schema::choice),
            Pattern::Interleave(v) => self.fold(model, refs, v, Schema::interleave),
            Pattern::Group(v) => self.fold(model, refs, v, Schema::group),
            Pattern::Mixed(p) => {
                let p = self.compile(model, refs, p);
                let t = self.text();
                self.interleave(p, t)
            }
            Pattern::Empty => self.empty(),
            Pattern::Text => self.text(),
            Pattern::NotAllowed => self.not_allowed(),
            Pattern::Optional(p) => {
                let p = self.compile(model, refs, p);
                let e = self.empty();
                self.choice(p, e)
            }
            Pattern::ZeroOrMore(p) => {
                let p = self.compile(model, refs, p);
                let m = self.one_or_more(p);
                let e = self.empty();
                self.choice(m, e)
            }
            Pattern::OneOrMore(p) => {
                let p = self.compile(model, refs, p);
                self.one_or_more(p)
            }
            Pattern::Attribute(nc, p) => {
                let p = self.compile(model, refs, p);
                self.push(Pat::Attribute(nc.clone(), p))
            }
            Pattern::Element(nc, p) => {
                let p = self.compile(model, refs, p);
                self.push(Pat::Element(nc.clone(), p))
            }
            Pattern::Ref(id) => {
                if let Some(pid) = refs.get(id) {
                    return *pid;
                }
                let placeholder = self.push(Pat::Placeholder(*id));
                refs.insert(*id, placeholder);
                let body = self.compile(model, refs, model.define(*id));
                let resolved = match self.patt(body) {
                    // a reference cycle that never passes through an element
                    Pat::Placeholder(_) => Pat::NotAllowed,
                    p => p,
                };
                self.patterns[placeholder.0 as usize] = resolved;
                placeholder
            }
            Pattern::DatatypeValue { datatype } => self.push(Pat::DatatypeValue(datatype.clone())),
            Pattern::DatatypeName { datatype, except } => match except {
                Some(except) => {
                    let e = self.compile(model, refs, except);
                    self.push(Pat::DatatypeExcept(datatype.clone(), e))
                }
                None => self.push(Pat::Datatype(datatype.clone())),
            },
            Pattern::List(p) => {
                let p = self.compile(model, refs, p);
                self.push(Pat::List(p))
            }
        }
    }

    fn fold(
        &mut self,
        model: &GrammarModel,
        refs: &mut FnvHashMap<DefineId, PatId>,
        v: &[Pattern],
        combine: fn(&mut Schema, PatId, PatId) -> PatId,
    ) -> PatId {
        let mut iter = v.iter().rev();
        let mut right = match iter.next() {
            Some(p) => self.compile(model, refs, p),
            None => return self.empty(),
        };
        for left in iter {
            let left = self.compile(model, refs, left);
            right = combine(self, left, right);
        }
        right
    }

    /// Nullability flags computed while a define was still a placeholder may be stale;
    /// recompute them to a fixpoint and rebuild the intern table.
    fn finish(&mut self) {
        loop {
            let mut changed = false;
            for i in 0..self.patterns.len() {
                let nullable = match &self.patterns[i] {
                    Pat::Choice(a, b, false) => self.nullable(*a) || self.nullable(*b),
                    Pat::Interleave(a, b, false) | Pat::Group(a, b, false) => {
                        self.nullable(*a) && self.nullable(*b)
                    }
                    Pat::OneOrMore(p, false) => self.nullable(*p),
                    _ => false,
                };
                if nullable {
                    self.patterns[i].set_nullable();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.memo.clear();
        for (i, p) in self.patterns.iter().enumerate() {
            self.memo.entry(p.clone()).or_insert(PatId(i as u32));
        }
    }

    // -- derivatives --

    fn text_deriv(&mut self, id: PatId, text: &str, names: &NameResolver) -> PatId {
        match self.patt(id) {
            Pat::Choice(p1, p2, _) => {
                let a = self.text_deriv(p1, text, names);
                let b = self.text_deriv(p2, text, names);
                self.choice(a, b)
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = self.text_deriv(p1, text, names);
                let a = self.interleave(d1, p2);
                let d2 = self.text_deriv(p2, text, names);
                let b = self.interleave(p1, d2);
                self.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let d1 = self.text_deriv(p1, text, names);
                let g = self.group(d1, p2);
                if self.nullable(p1) {
                    let d2 = self.text_deriv(p2, text, names);
                    self.choice(g, d2)
                } else {
                    g
                }
            }
            Pat::After(p1, p2) => {
                let d = self.text_deriv(p1, text, names);
                self.after(d, p2)
            }
            Pat::OneOrMore(p, _) => {
                let d = self.text_deriv(p, text, names);
                let m = self.one_or_more(p);
                let e = self.empty();
                let rest = self.choice(m, e);
                self.group(d, rest)
            }
            Pat::Text => id,
            Pat::Datatype(dt) => {
                if dt.is_valid(text, names) {
                    self.empty()
                } else {
                    self.not_allowed()
                }
            }
            Pat::DatatypeValue(dt) => {
                if dt.is_valid(text, names) {
                    self.empty()
                } else {
                    self.not_allowed()
                }
            }
            Pat::DatatypeExcept(dt, except) => {
                let d = self.text_deriv(except, text, names);
                if dt.is_valid(text, names) && !self.nullable(d) {
                    self.empty()
                } else {
                    self.not_allowed()
                }
            }
            Pat::List(p) => {
                let mut p = p;
                for item in text.split_whitespace() {
                    p = self.text_deriv(p, item, names);
                    if self.is_not_allowed(p) {
                        return p;
                    }
                }
                if self.is_empty(p) {
                    p
                } else if self.nullable(p) {
                    // text may arrive in pieces, so a satisfied list stays open for more
                    let l = self.push(Pat::List(p));
                    let e = self.empty();
                    self.choice(l, e)
                } else {
                    self.push(Pat::List(p))
                }
            }
            Pat::Empty => {
                if is_whitespace_str(text) {
                    id
                } else {
                    self.not_allowed()
                }
            }
            Pat::Element(_, _) => {
                if is_whitespace_str(text) {
                    id
                } else {
                    self.not_allowed()
                }
            }
            Pat::NotAllowed | Pat::Attribute(_, _) | Pat::Placeholder(_) => self.not_allowed(),
        }
    }

    fn start_tag_open_deriv(&mut self, id: PatId, ns: &str, local: &str) -> PatId {
        match self.patt(id) {
            Pat::Choice(l, r, _) => {
                let d1 = self.start_tag_open_deriv(l, ns, local);
                let d2 = self.start_tag_open_deriv(r, ns, local);
                self.choice(d1, d2)
            }
            Pat::OneOrMore(p, _) => {
                let d = self.start_tag_open_deriv(p, ns, local);
                self.apply_after(d, &mut |s, pat| {
                    let m = s.one_or_more(p);
                    let e = s.empty();
                    let rest = s.choice(m, e);
                    s.group(pat, rest)
                })
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = self.start_tag_open_deriv(p1, ns, local);
                let c1 = self.apply_after(d1, &mut |s, pat| s.interleave(pat, p2));
                let d2 = self.start_tag_open_deriv(p2, ns, local);
                let c2 = self.apply_after(d2, &mut |s, pat| s.interleave(p1, pat));
                self.choice(c1, c2)
            }
            Pat::Group(p1, p2, _) => {
                let d1 = self.start_tag_open_deriv(p1, ns, local);
                let x = self.apply_after(d1, &mut |s, pat| s.group(pat, p2));
                if self.nullable(p1) {
                    let d2 = self.start_tag_open_deriv(p2, ns, local);
                    self.choice(x, d2)
                } else {
                    x
                }
            }
            Pat::Element(nc, content) => {
                if nc.contains(ns, local) {
                    let empty = self.empty();
                    self.after(content, empty)
                } else {
                    self.not_allowed()
                }
            }
            Pat::After(p1, p2) => {
                let d = self.start_tag_open_deriv(p1, ns, local);
                self.apply_after(d, &mut |s, pat| s.after(pat, p2))
            }
            _ => self.not_allowed(),
        }
    }

    // the f argument comes last here, unlike applyAfter() in the paper
    fn apply_after(
        &mut self,
        id: PatId,
        f: &mut dyn FnMut(&mut Schema, PatId) -> PatId,
    ) -> PatId {
        match self.patt(id) {
            Pat::After(p1, p2) => {
                let p2 = f(self, p2);
                self.after(p1, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let c1 = self.apply_after(p1, f);
                let c2 = self.apply_after(p2, f);
                self.choice(c1, c2)
            }
            _ => self.not_allowed(),
        }
    }

    /// With `value` of `None` any value is accepted, which answers whether the attribute
    /// name is allowed at all.
    fn att_deriv(
        &mut self,
        memo: &mut FnvHashMap<PatId, PatId>,
        id: PatId,
        ns: &str,
        local: &str,
        value: Option<&str>,
        names: &NameResolver,
    ) -> PatId {
        if let Some(result) = memo.get(&id) {
            return *result;
        }
        let v = match self.patt(id) {
            Pat::After(p1, p2) => {
                let d = self.att_deriv(memo, p1, ns, local, value, names);
                self.after(d, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let c1 = self.att_deriv(memo, p1, ns, local, value, names);
                let c2 = self.att_deriv(memo, p2, ns, local, value, names);
                self.choice(c1, c2)
            }
            Pat::Group(p1, p2, _) => {
                let d1 = self.att_deriv(memo, p1, ns, local, value, names);
                let s1 = self.group(d1, p2);
                let d2 = self.att_deriv(memo, p2, ns, local, value, names);
                let s2 = self.group(p1, d2);
                self.choice(s1, s2)
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = self.att_deriv(memo, p1, ns, local, value, names);
                let i1 = self.interleave(d1, p2);
                let d2 = self.att_deriv(memo, p2, ns, local, value, names);
                let i2 = self.interleave(p1, d2);
                self.choice(i1, i2)
            }
            Pat::OneOrMore(p, _) => {
                let s1 = self.att_deriv(memo, p, ns, local, value, names);
                let e = self.empty();
                let s2 = self.choice(id, e);
                self.group(s1, s2)
            }
            Pat::Attribute(nc, p) => {
                let matches = nc.contains(ns, local)
                    && value.map(|v| self.value_match(p, v, names)).unwrap_or(true);
                if matches {
                    self.empty()
                } else {
                    self.not_allowed()
                }
            }
            _ => self.not_allowed(),
        };
        memo.insert(id, v);
        v
    }

    fn value_match(&mut self, id: PatId, val: &str, names: &NameResolver) -> bool {
        if self.nullable(id) && is_whitespace_str(val) {
            true
        } else {
            let d = self.text_deriv(id, val, names);
            self.nullable(d)
        }
    }

    /// With `lenient` set, attributes still outstanding are treated as satisfied.
    fn start_tag_close_deriv(&mut self, id: PatId, lenient: bool) -> PatId {
        match self.patt(id) {
            Pat::After(p1, p2) => {
                let a1 = self.start_tag_close_deriv(p1, lenient);
                self.after(a1, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let c1 = self.start_tag_close_deriv(p1, lenient);
                let c2 = self.start_tag_close_deriv(p2, lenient);
                self.choice(c1, c2)
            }
            Pat::Group(p1, p2, _) => {
                let c1 = self.start_tag_close_deriv(p1, lenient);
                let c2 = self.start_tag_close_deriv(p2, lenient);
                self.group(c1, c2)
            }
            Pat::Interleave(p1, p2, _) => {
                let c1 = self.start_tag_close_deriv(p1, lenient);
                let c2 = self.start_tag_close_deriv(p2, lenient);
                self.interleave(c1, c2)
            }
            Pat::OneOrMore(p, _) => {
                let c = self.start_tag_close_deriv(p, lenient);
                self.one_or_more(c)
            }
            Pat::Attribute(_, _) if lenient => self.empty(),
            Pat::Attribute(_, _) => self.not_allowed(),
            _ => id,
        }
    }

    /// With `lenient` set, unfinished content is abandoned rather than rejected.
    fn end_tag_deriv(&mut self, id: PatId, lenient: bool) -> PatId {
        match self.patt(id) {
            Pat::Choice(p1, p2, _) => {
                let c1 = self.end_tag_deriv(p1, lenient);
                let c2 = self.end_tag_deriv(p2, lenient);
                self.choice(c1, c2)
            }
            Pat::After(p1, p2) => {
                if lenient || self.nullable(p1) {
                    p2
                } else {
                    self.not_allowed()
                }
            }
            _ => self.not_allowed(),
        }
    }

    // -- inspection, used for possible() and for error messages --

    fn content_heads(&self, id: PatId, seen: &mut FnvHashSet<PatId>, out: &mut Vec<PossibleEvent>) {
        if !seen.insert(id) {
            return;
        }
        match self.get(id) {
            Pat::Choice(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.content_heads(*p1, seen, out);
                self.content_heads(*p2, seen, out);
            }
            Pat::Group(p1, p2, _) => {
                self.content_heads(*p1, seen, out);
                if self.nullable(*p1) {
                    self.content_heads(*p2, seen, out);
                }
            }
            Pat::OneOrMore(p, _) => self.content_heads(*p, seen, out),
            Pat::After(p1, _) => {
                self.content_heads(*p1, seen, out);
                if self.nullable(*p1) {
                    out.push(PossibleEvent::EndTag);
                }
            }
            Pat::Element(nc, _) => out.push(PossibleEvent::EnterStartTag(nc.clone())),
            Pat::Text
            | Pat::Datatype(_)
            | Pat::DatatypeValue(_)
            | Pat::DatatypeExcept(_, _)
            | Pat::List(_) => out.push(PossibleEvent::Text),
            _ => {}
        }
    }

    fn attribute_heads(&self, id: PatId, seen: &mut FnvHashSet<PatId>, out: &mut Vec<NameClassAt>) {
        if !seen.insert(id) {
            return;
        }
        match self.get(id) {
            Pat::After(p, _) | Pat::OneOrMore(p, _) => self.attribute_heads(*p, seen, out),
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.attribute_heads(*p1, seen, out);
                self.attribute_heads(*p2, seen, out);
            }
            Pat::Attribute(nc, p) => out.push((nc.clone(), *p)),
            _ => {}
        }
    }

    fn value_candidates(&self, id: PatId, out: &mut Vec<PossibleEvent>) {
        match self.get(id) {
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.value_candidates(*p1, out);
                self.value_candidates(*p2, out);
            }
            Pat::OneOrMore(p, _) | Pat::List(p) => self.value_candidates(*p, out),
            Pat::DatatypeValue(v) => out.push(PossibleEvent::AttributeValue(
                ValueCandidate::Literal(v.literal().to_string()),
            )),
            Pat::Datatype(dt) | Pat::DatatypeExcept(dt, _) => out.push(
                PossibleEvent::AttributeValue(ValueCandidate::Pattern(dt.describe())),
            ),
            Pat::Text => out.push(PossibleEvent::AttributeValue(ValueCandidate::Pattern(
                "text".to_string(),
            ))),
            _ => {}
        }
    }

    /// Can the start tag be closed without further attributes?
    fn closeable(&self, id: PatId) -> bool {
        match self.get(id) {
            Pat::Choice(p1, p2, _) => self.closeable(*p1) || self.closeable(*p2),
            Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.closeable(*p1) && self.closeable(*p2)
            }
            Pat::After(p, _) | Pat::OneOrMore(p, _) => self.closeable(*p),
            Pat::Attribute(_, _) | Pat::NotAllowed => false,
            _ => true,
        }
    }

    fn missing_attributes(&self, id: PatId, out: &mut Vec<NamePattern>) {
        match self.get(id) {
            Pat::Choice(p1, p2, _) => {
                if !self.closeable(*p1) && !self.closeable(*p2) {
                    self.missing_attributes(*p1, out);
                    self.missing_attributes(*p2, out);
                }
            }
            Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.missing_attributes(*p1, out);
                self.missing_attributes(*p2, out);
            }
            Pat::After(p, _) | Pat::OneOrMore(p, _) => self.missing_attributes(*p, out),
            Pat::Attribute(nc, _) => out.extend(nc.describe()),
            _ => {}
        }
    }

    fn expected_elements(&self, id: PatId) -> Vec<NamePattern> {
        let mut heads = vec![];
        self.content_heads(id, &mut FnvHashSet::default(), &mut heads);
        let mut result: Vec<NamePattern> = vec![];
        for head in heads {
            if let PossibleEvent::EnterStartTag(nc) = head {
                for name in nc.describe() {
                    if !result.contains(&name) {
                        result.push(name);
                    }
                }
            }
        }
        result
    }
}

type NameClassAt = (NameClass, PatId);

/// A `Grammar` backed by a schema read from the RELAX NG XML syntax
pub struct RngGrammar {
    model: GrammarModel,
    schema: Schema,
    start: PatId,
}

impl RngGrammar {
    pub fn new(model: GrammarModel) -> RngGrammar {
        let mut schema = Schema::default();
        let mut refs = FnvHashMap::default();
        let start = schema.compile(&model, &mut refs, &model.start);
        schema.finish();
        RngGrammar {
            model,
            schema,
            start,
        }
    }

    pub fn parse(text: &str) -> Result<RngGrammar, crate::SchemaError> {
        crate::rng::parse(text).map(RngGrammar::new)
    }

    pub fn model(&self) -> &GrammarModel {
        &self.model
    }
}

impl Grammar for RngGrammar {
    fn new_walker(&self) -> Box<dyn GrammarWalker> {
        Box::new(DerivWalker {
            schema: self.schema.clone(),
            current: self.start,
            in_start_tag: false,
            pending_attribute: None,
            skip_value: false,
            ignored_depth: 0,
            depth: 0,
            last_was_start: false,
        })
    }

    fn start_names(&self) -> Vec<NamePattern> {
        let mut result: Vec<NamePattern> = vec![];
        for nc in self.model.start_elements() {
            for name in nc.names() {
                if !result.contains(&name) {
                    result.push(name);
                }
            }
        }
        result
    }

    fn documentation(&self, kind: NameKind, name: &NamePattern) -> Option<&str> {
        self.model
            .documentation
            .get(&(kind, name.namespace().to_string(), name.name.clone()))
            .map(String::as_str)
    }
}

struct DerivWalker {
    schema: Schema,
    current: PatId,
    in_start_tag: bool,
    pending_attribute: Option<(String, String)>,
    /// the value of a rejected attribute name is not checked
    skip_value: bool,
    /// nesting depth inside an element that the grammar rejected
    ignored_depth: usize,
    depth: usize,
    last_was_start: bool,
}

impl DerivWalker {
    fn enter_start_tag(&mut self, ns: &str, local: &str) -> Result<(), Vec<Violation>> {
        self.last_was_start = false;
        let d = self.schema.start_tag_open_deriv(self.current, ns, local);
        if self.schema.is_not_allowed(d) {
            self.ignored_depth = 1;
            if self.depth == 0 {
                // a wrong document element; don't also complain that the document is incomplete
                self.current = self.schema.empty();
            }
            return Err(vec![Violation::new(
                "tag not allowed here",
                vec![NamePattern::new(local, ns)],
            )]);
        }
        self.current = d;
        self.depth += 1;
        self.in_start_tag = true;
        self.pending_attribute = None;
        self.skip_value = false;
        Ok(())
    }

    fn attribute_name(
        &mut self,
        ns: &str,
        local: &str,
        names: &NameResolver,
    ) -> Result<(), Vec<Violation>> {
        let allowed = self.in_start_tag && {
            let mut memo = FnvHashMap::default();
            let d = self
                .schema
                .att_deriv(&mut memo, self.current, ns, local, None, names);
            !self.schema.is_not_allowed(d)
        };
        if !allowed {
            self.skip_value = true;
            self.pending_attribute = None;
            return Err(vec![Violation::new(
                "attribute not allowed here",
                vec![NamePattern::new(local, ns)],
            )]);
        }
        self.pending_attribute = Some((ns.to_string(), local.to_string()));
        Ok(())
    }

    fn attribute_value(&mut self, value: &str, names: &NameResolver) -> Result<(), Vec<Violation>> {
        if self.skip_value {
            self.skip_value = false;
            return Ok(());
        }
        let (ns, local) = match self.pending_attribute.take() {
            Some(name) => name,
            None => {
                return Err(vec![Violation::new(
                    "attribute value without attribute name",
                    vec![],
                )])
            }
        };
        let mut memo = FnvHashMap::default();
        let d = self
            .schema
            .att_deriv(&mut memo, self.current, &ns, &local, Some(value), names);
        if !self.schema.is_not_allowed(d) {
            self.current = d;
            return Ok(());
        }
        // consume the attribute anyway, so later attributes are checked in the right state
        let mut memo = FnvHashMap::default();
        let any = self
            .schema
            .att_deriv(&mut memo, self.current, &ns, &local, None, names);
        if !self.schema.is_not_allowed(any) {
            self.current = any;
        }
        Err(vec![Violation::new(
            "invalid attribute value",
            vec![NamePattern::new(&local, &ns)],
        )])
    }

    fn leave_start_tag(&mut self) -> Result<(), Vec<Violation>> {
        self.in_start_tag = false;
        self.pending_attribute = None;
        self.last_was_start = true;
        let d = self.schema.start_tag_close_deriv(self.current, false);
        if !self.schema.is_not_allowed(d) {
            self.current = d;
            return Ok(());
        }
        let mut missing = vec![];
        self.schema.missing_attributes(self.current, &mut missing);
        self.current = self.schema.start_tag_close_deriv(self.current, true);
        Err(vec![Violation::new("required attributes missing", missing)])
    }

    fn text(&mut self, text: &str, names: &NameResolver) -> Result<(), Vec<Violation>> {
        self.last_was_start = false;
        let d = self.schema.text_deriv(self.current, text, names);
        if !self.schema.is_not_allowed(d) {
            self.current = d;
            Ok(())
        } else if is_whitespace_str(text) {
            Ok(())
        } else {
            Err(vec![Violation::new("text not allowed here", vec![])])
        }
    }

    fn end_tag(&mut self, names: &NameResolver) -> Result<(), Vec<Violation>> {
        let mut current = self.current;
        if self.last_was_start {
            // "The case where the list of children is empty is treated as if there were a
            //  text node whose value were the empty string."
            let t = self.schema.text_deriv(current, "", names);
            if !self.schema.is_not_allowed(t) {
                current = t;
            }
        }
        self.last_was_start = false;
        self.depth = self.depth.saturating_sub(1);
        let d = self.schema.end_tag_deriv(current, false);
        if !self.schema.is_not_allowed(d) {
            self.current = d;
            return Ok(());
        }
        let expected = self.schema.expected_elements(current);
        self.current = self.schema.end_tag_deriv(current, true);
        let message = if expected.is_empty() {
            "content incomplete"
        } else {
            "tag required"
        };
        Err(vec![Violation::new(message, expected)])
    }
}

impl GrammarWalker for DerivWalker {
    fn fire_event(&mut self, event: Event<'_>, names: &NameResolver) -> Result<(), Vec<Violation>> {
        if self.ignored_depth > 0 {
            match event {
                Event::EnterStartTag { .. } => self.ignored_depth += 1,
                Event::EndTag { .. } => self.ignored_depth -= 1,
                _ => {}
            }
            return Ok(());
        }
        match event {
            Event::EnterStartTag { ns, local } => self.enter_start_tag(ns, local),
            Event::AttributeName { ns, local } => self.attribute_name(ns, local, names),
            Event::AttributeValue(value) => self.attribute_value(value, names),
            Event::LeaveStartTag => self.leave_start_tag(),
            Event::Text(text) => self.text(text, names),
            Event::EndTag { .. } => self.end_tag(names),
        }
    }

    fn possible(&self) -> Vec<PossibleEvent> {
        let mut out = vec![];
        if self.ignored_depth > 0 {
            return out;
        }
        let mut seen = FnvHashSet::default();
        if self.in_start_tag {
            let mut attributes = vec![];
            self.schema
                .attribute_heads(self.current, &mut seen, &mut attributes);
            match &self.pending_attribute {
                Some((ns, local)) => {
                    for (nc, value) in attributes {
                        if nc.contains(ns, local) {
                            self.schema.value_candidates(value, &mut out);
                        }
                    }
                }
                None => {
                    out.extend(
                        attributes
                            .into_iter()
                            .map(|(nc, _)| PossibleEvent::AttributeName(nc)),
                    );
                    if self.schema.closeable(self.current) {
                        out.push(PossibleEvent::LeaveStartTag);
                    }
                }
            }
        } else {
            self.schema.content_heads(self.current, &mut seen, &mut out);
        }
        out
    }

    fn end(&mut self) -> Result<(), Vec<Violation>> {
        if self.ignored_depth > 0 || self.in_start_tag || !self.schema.nullable(self.current) {
            Err(vec![Violation::new(
                "document incomplete",
                self.schema.expected_elements(self.current),
            )])
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Fixture {
        grammar: RngGrammar,
    }

    impl Fixture {
        fn correct(schema: &str) -> Fixture {
            match RngGrammar::parse(schema) {
                Ok(grammar) => Fixture { grammar },
                Err(e) => panic!("{:?}", e),
            }
        }

        fn run(&self, events: &[Event]) -> Result<(), Vec<Violation>> {
            let names = NameResolver::default();
            let mut walker = self.grammar.new_walker();
            let mut errors = vec![];
            for e in events {
                if let Err(v) = walker.fire_event(*e, &names) {
                    errors.extend(v);
                }
            }
            if let Err(v) = walker.end() {
                errors.extend(v);
            }
            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors)
            }
        }

        fn valid(&self, events: &[Event]) {
            if let Err(e) = self.run(events) {
                panic!("{:?}", e);
            }
        }

        fn invalid(&self, events: &[Event]) -> Vec<Violation> {
            match self.run(events) {
                Ok(()) => panic!("Invalid input was accepted by the walker"),
                Err(e) => e,
            }
        }
    }

    const RNG: &str = "xmlns=\"http://relaxng.org/ns/structure/1.0\"";

    fn open(local: &str) -> Event {
        Event::EnterStartTag { ns: "", local }
    }
    fn close(local: &str) -> Event {
        Event::EndTag { ns: "", local }
    }
    fn att(local: &str) -> Event {
        Event::AttributeName { ns: "", local }
    }

    #[test]
    fn empty_root() {
        Fixture::correct(&format!("<element {} name=\"root\"><empty/></element>", RNG)).valid(&[
            open("root"),
            Event::LeaveStartTag,
            close("root"),
        ]);
    }

    #[test]
    fn recur() {
        Fixture::correct(&format!(
            "<grammar {}><start><ref name=\"b\"/></start>\
             <define name=\"b\"><element name=\"a\"><optional><ref name=\"b\"/></optional></element></define></grammar>",
            RNG
        ))
        .valid(&[
            open("a"),
            Event::LeaveStartTag,
            open("a"),
            Event::LeaveStartTag,
            close("a"),
            close("a"),
        ]);
    }

    #[test]
    fn unexpected_child_reported_once() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"root\"><zeroOrMore><element name=\"good\"><empty/></element></zeroOrMore></element>",
            RNG
        ));
        let errors = f.invalid(&[
            open("root"),
            Event::LeaveStartTag,
            open("bad"),
            Event::LeaveStartTag,
            open("deeper"),
            Event::LeaveStartTag,
            close("deeper"),
            close("bad"),
            open("good"),
            Event::LeaveStartTag,
            close("good"),
            close("root"),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "tag not allowed here");
        assert_eq!(errors[0].names, vec![NamePattern::new("bad", "")]);
    }

    #[test]
    fn attr_group_incomplete() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"e\"><attribute name=\"a\"/><attribute name=\"b\"/></element>",
            RNG
        ));
        let errors = f.invalid(&[
            open("e"),
            att("a"),
            Event::AttributeValue(""),
            Event::LeaveStartTag,
            close("e"),
        ]);
        assert_matches!(&errors[..], [v] if v.message == "required attributes missing" && v.names == vec![NamePattern::new("b", "")]);
    }

    #[test]
    fn attr_unexpected_then_valid() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"a\"><attribute name=\"a\"><text/></attribute></element>",
            RNG
        ));
        let errors = f.invalid(&[
            open("a"),
            att("b"),
            Event::AttributeValue("x"),
            att("a"),
            Event::AttributeValue(""),
            Event::LeaveStartTag,
            close("a"),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "attribute not allowed here");
    }

    #[test]
    fn bad_value_is_recovered() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"a\"><attribute name=\"n\"><data type=\"integer\" \
             datatypeLibrary=\"http://www.w3.org/2001/XMLSchema-datatypes\"/></attribute></element>",
            RNG
        ));
        let errors = f.invalid(&[
            open("a"),
            att("n"),
            Event::AttributeValue("x"),
            Event::LeaveStartTag,
            close("a"),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "invalid attribute value");
    }

    #[test]
    fn token_element_may_be_empty() {
        Fixture::correct(&format!("<element {} name=\"foo\"><data type=\"token\"/></element>", RNG))
            .valid(&[open("foo"), Event::LeaveStartTag, close("foo")]);
    }

    #[test]
    fn list() {
        Fixture::correct(&format!(
            "<element {} name=\"e1\"><list><value>one</value><value>two</value></list></element>",
            RNG
        ))
        .valid(&[
            open("e1"),
            Event::LeaveStartTag,
            Event::Text("one two"),
            close("e1"),
        ]);
    }

    #[test]
    fn missing_child_required() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"a\"><element name=\"b\"><empty/></element></element>",
            RNG
        ));
        let errors = f.invalid(&[open("a"), Event::LeaveStartTag, close("a")]);
        assert_matches!(&errors[..], [v] if v.message == "tag required" && v.names == vec![NamePattern::new("b", "")]);
    }

    #[test]
    fn text_element_group() {
        Fixture::correct(&format!(
            "<element {} name=\"a\"><text/><element name=\"b\"><empty/></element></element>",
            RNG
        ))
        .valid(&[
            open("a"),
            Event::LeaveStartTag,
            Event::Text("foo "),
            open("b"),
            Event::LeaveStartTag,
            close("b"),
            close("a"),
        ]);
    }

    #[test]
    fn possible_children() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"root\"><choice><element name=\"x\"><empty/></element>\
             <element name=\"y\"><empty/></element></choice></element>",
            RNG
        ));
        let names = NameResolver::default();
        let mut w = f.grammar.new_walker();
        assert_matches!(&w.possible()[..], [PossibleEvent::EnterStartTag(_)]);
        w.fire_event(open("root"), &names).unwrap();
        w.fire_event(Event::LeaveStartTag, &names).unwrap();
        let elements: Vec<_> = w
            .possible()
            .into_iter()
            .filter_map(|p| match p {
                PossibleEvent::EnterStartTag(nc) => Some(nc.names()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(
            elements,
            vec![NamePattern::new("x", ""), NamePattern::new("y", "")]
        );
    }

    #[test]
    fn possible_values() {
        let f = Fixture::correct(&format!(
            "<element {} name=\"root\"><attribute name=\"type\"><choice>\
             <value>a</value><value>b</value><data type=\"token\"/></choice></attribute></element>",
            RNG
        ));
        let names = NameResolver::default();
        let mut w = f.grammar.new_walker();
        w.fire_event(open("root"), &names).unwrap();
        assert!(w.possible().contains(&PossibleEvent::AttributeName(NameClass::named(
            String::new(),
            "type".to_string()
        ))));
        assert!(!w.possible().contains(&PossibleEvent::LeaveStartTag));
        w.fire_event(att("type"), &names).unwrap();
        assert_eq!(
            w.possible(),
            vec![
                PossibleEvent::AttributeValue(ValueCandidate::Literal("a".to_string())),
                PossibleEvent::AttributeValue(ValueCandidate::Literal("b".to_string())),
                PossibleEvent::AttributeValue(ValueCandidate::Pattern("token".to_string())),
            ]
        );
    }

    #[test]
    fn start_names() {
        let f = Fixture::correct(&format!(
            "<grammar {} ns=\"http://www.tei-c.org/ns/1.0\"><start><ref name=\"tei\"/></start>\
             <define name=\"tei\"><element name=\"TEI\"><empty/></element></define></grammar>",
            RNG
        ));
        assert_eq!(
            f.grammar.start_names(),
            vec![NamePattern::new("TEI", "http://www.tei-c.org/ns/1.0")]
        );
    }

    #[test]
    fn wrong_root_reported_once() {
        let f = Fixture::correct(&format!("<element {} name=\"root\"><empty/></element>", RNG));
        let errors = f.invalid(&[open("other"), Event::LeaveStartTag, close("other")]);
        assert_eq!(errors.len(), 1);
    }
}
