//! Placeholder rewriting.
//!
//! Callers write parameters in one of several paramstyles; the server only
//! understands `$n`. [`rewrite`] scans the query once, skipping string
//! literals, quoted identifiers, dollar-quoted bodies and comments, and
//! produces the `$n` query together with an [`ArgMapping`] that turns the
//! caller's [`Params`] into the positional list the rewritten query expects.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;

use lru::LruCache;
use serde::Deserialize;

use super::error::{PgError, PgResult};
use super::types::PgValue;

/// Placeholder syntax used in caller-supplied query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamStyle {
    /// `:1` (numeric) or `:name` (named), detected per query.
    #[default]
    #[serde(alias = "named", alias = "numeric")]
    Colon,
    /// `?`
    Qmark,
    /// `%s`
    Format,
    /// `%(name)s`
    #[serde(rename = "pyformat")]
    PyFormat,
}

impl FromStr for ParamStyle {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        match s {
            "colon" | "named" | "numeric" => Ok(ParamStyle::Colon),
            "qmark" => Ok(ParamStyle::Qmark),
            "format" => Ok(ParamStyle::Format),
            "pyformat" => Ok(ParamStyle::PyFormat),
            other => Err(PgError::interface(format!("unknown paramstyle: {}", other))),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Arguments supplied with a query.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<PgValue>),
    Named(HashMap<String, PgValue>),
}

impl Params {
    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PgValue>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Into<PgValue>> From<Vec<T>> for Params {
    fn from(values: Vec<T>) -> Self {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<PgValue>, const N: usize> From<[T; N]> for Params {
    fn from(values: [T; N]) -> Self {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<PgValue>> From<HashMap<K, V>> for Params {
    fn from(values: HashMap<K, V>) -> Self {
        Params::named(values)
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

// ============================================================================
// Rewriting
// ============================================================================

/// How caller arguments become the positional Bind list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgMapping {
    /// Pass a sequence through unchanged; it must hold exactly `count` values.
    Positional { count: usize },
    /// Slot `i` takes the argument called `names[i]`.
    Named(Vec<String>),
}

impl ArgMapping {
    pub fn param_count(&self) -> usize {
        match self {
            ArgMapping::Positional { count } => *count,
            ArgMapping::Named(names) => names.len(),
        }
    }

    /// Arrange `params` in Bind order.
    pub fn apply(&self, params: Params) -> PgResult<Vec<PgValue>> {
        if self.param_count() == 0 && params.is_empty() {
            return Ok(Vec::new());
        }
        match (self, params) {
            (ArgMapping::Positional { count }, Params::Positional(values)) => {
                if values.len() != *count {
                    return Err(PgError::programming(format!(
                        "query expects {} parameters, {} supplied",
                        count,
                        values.len()
                    )));
                }
                Ok(values)
            }
            (ArgMapping::Named(names), Params::Named(mut values)) => {
                let mut out = Vec::with_capacity(names.len());
                // Names are unique, so each value can be moved out
                for name in names {
                    let value = values.remove(name).ok_or_else(|| {
                        PgError::programming(format!("missing value for parameter :{}", name))
                    })?;
                    out.push(value);
                }
                Ok(out)
            }
            (ArgMapping::Positional { .. }, Params::Named(_)) => Err(PgError::programming(
                "query uses positional placeholders but named parameters were supplied",
            )),
            (ArgMapping::Named(_), Params::Positional(_)) => Err(PgError::programming(
                "query uses named placeholders but positional parameters were supplied",
            )),
            (mapping, Params::None) => Err(PgError::programming(format!(
                "query expects {} parameters, none supplied",
                mapping.param_count()
            ))),
        }
    }
}

/// A query with `$n` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub query: String,
    pub mapping: ArgMapping,
}

/// Per-connection memo of rewrites, keyed by paramstyle and query text.
pub struct RewriteCache {
    cache: LruCache<(ParamStyle, String), Arc<Rewritten>>,
}

impl RewriteCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    pub fn rewrite(&mut self, query: &str, style: ParamStyle) -> PgResult<Arc<Rewritten>> {
        let key = (style, query.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let rewritten = Arc::new(rewrite(query, style)?);
        self.cache.put(key, Arc::clone(&rewritten));
        Ok(rewritten)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit() || b == b'$'
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ColonKind {
    Numeric,
    Named,
}

struct Rewriter<'a> {
    src: &'a [u8],
    query: &'a str,
    pos: usize,
    out: String,
    style: ParamStyle,
    /// Highest `:n`, or the number of `?` / `%s` seen
    positional: usize,
    names: Vec<String>,
    colon_kind: Option<ColonKind>,
}

/// Rewrite `query` from `style` placeholders to `$n`.
pub fn rewrite(query: &str, style: ParamStyle) -> PgResult<Rewritten> {
    let mut rw = Rewriter {
        src: query.as_bytes(),
        query,
        pos: 0,
        out: String::with_capacity(query.len() + 8),
        style,
        positional: 0,
        names: Vec::new(),
        colon_kind: None,
    };
    rw.run()?;

    let mapping = match (style, rw.colon_kind) {
        (ParamStyle::Colon, Some(ColonKind::Named)) | (ParamStyle::PyFormat, _)
            if rw.positional == 0 =>
        {
            ArgMapping::Named(rw.names)
        }
        _ => ArgMapping::Positional {
            count: rw.positional,
        },
    };
    Ok(Rewritten {
        query: rw.out,
        mapping,
    })
}

impl Rewriter<'_> {
    fn peek(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn prev(&self) -> Option<u8> {
        self.pos.checked_sub(1).map(|i| self.src[i])
    }

    /// Copy `src[start..end]` verbatim and move to `end`.
    fn copy_to(&mut self, start: usize, end: usize) {
        self.out.push_str(&self.query[start..end]);
        self.pos = end;
    }

    fn run(&mut self) -> PgResult<()> {
        let mut literal_start = 0;
        while let Some(b) = self.peek(0) {
            let start = self.pos;
            let skipped_to = match b {
                b'\'' => Some(self.skip_string()),
                b'"' => Some(self.skip_quoted(b'"')),
                b'$' => self.skip_dollar_quote(),
                b'-' if self.peek(1) == Some(b'-') => Some(self.skip_line_comment()),
                b'/' if self.peek(1) == Some(b'*') => Some(self.skip_block_comment()),
                _ => None,
            };
            if let Some(end) = skipped_to {
                self.pos = end;
                continue;
            }

            let replaced = match (self.style, b) {
                (ParamStyle::Colon, b':') => self.colon()?,
                (ParamStyle::Qmark, b'?') => {
                    self.pos += 1;
                    Some(self.next_positional())
                }
                (ParamStyle::Format | ParamStyle::PyFormat, b'%') => self.percent()?,
                _ => None,
            };
            match replaced {
                Some(text) => {
                    self.out.push_str(&self.query[literal_start..start]);
                    self.out.push_str(&text);
                    literal_start = self.pos;
                }
                None => {
                    if self.pos == start {
                        self.pos += 1;
                    }
                }
            }
        }
        let end = self.src.len();
        self.copy_to(literal_start, end);
        Ok(())
    }

    fn next_positional(&mut self) -> String {
        self.positional += 1;
        format!("${}", self.positional)
    }

    fn named_slot(&mut self, name: &str) -> String {
        let index = match self.names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_string());
                self.names.len() - 1
            }
        };
        format!("${}", index + 1)
    }

    /// `:n` or `:name`; `::` casts and `:=` pass through.
    fn colon(&mut self) -> PgResult<Option<String>> {
        let next = self.peek(1);
        if next == Some(b':') {
            self.pos += 2;
            return Ok(None);
        }
        if self.prev() == Some(b':') || next == Some(b'=') {
            self.pos += 1;
            return Ok(None);
        }

        let begin = self.pos + 1;
        let (kind, end) = match next {
            Some(d) if d.is_ascii_digit() => {
                let len = self.src[begin..].iter().take_while(|b| b.is_ascii_digit()).count();
                (ColonKind::Numeric, begin + len)
            }
            Some(c) if is_ident_start(c) => {
                let len = self.src[begin..]
                    .iter()
                    .take_while(|&&b| is_ident_start(b) || b.is_ascii_digit())
                    .count();
                (ColonKind::Named, begin + len)
            }
            _ => {
                self.pos += 1;
                return Ok(None);
            }
        };

        match self.colon_kind {
            Some(seen) if seen != kind => {
                return Err(PgError::interface(
                    "query mixes numeric and named placeholders",
                ))
            }
            _ => self.colon_kind = Some(kind),
        }

        let token = &self.query[begin..end];
        self.pos = end;
        Ok(Some(match kind {
            ColonKind::Numeric => {
                let n: usize = token
                    .parse()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| PgError::interface(format!("invalid placeholder :{}", token)))?;
                self.positional = self.positional.max(n);
                format!("${}", n)
            }
            ColonKind::Named => self.named_slot(token),
        }))
    }

    /// `%s`, `%%` and (pyformat) `%(name)s`.
    fn percent(&mut self) -> PgResult<Option<String>> {
        match self.peek(1) {
            Some(b'%') => {
                self.pos += 2;
                Ok(Some("%".to_string()))
            }
            Some(b's') => {
                if !self.names.is_empty() {
                    return Err(PgError::interface(
                        "query mixes %s and %(name)s placeholders",
                    ));
                }
                self.pos += 2;
                Ok(Some(self.next_positional()))
            }
            Some(b'(') if self.style == ParamStyle::PyFormat => {
                let begin = self.pos + 2;
                let close = self.src[begin..]
                    .iter()
                    .position(|&b| b == b')')
                    .map(|i| begin + i)
                    .filter(|&i| self.src.get(i + 1) == Some(&b's'))
                    .ok_or_else(|| PgError::interface("unterminated %(name)s placeholder"))?;
                if self.positional > 0 {
                    return Err(PgError::interface(
                        "query mixes %s and %(name)s placeholders",
                    ));
                }
                let name = self.query[begin..close].to_string();
                self.pos = close + 2;
                Ok(Some(self.named_slot(&name)))
            }
            // Modulo operator
            _ => {
                self.pos += 1;
                Ok(None)
            }
        }
    }

    /// `'...'` with `''` escapes, or `E'...'` with backslash escapes as well.
    fn skip_string(&self) -> usize {
        let escape_string = matches!(self.prev(), Some(b'E' | b'e'))
            && !self
                .pos
                .checked_sub(2)
                .is_some_and(|i| is_ident_char(self.src[i]));
        let mut i = self.pos + 1;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' if escape_string => i += 2,
                b'\'' if self.src.get(i + 1) == Some(&b'\'') => i += 2,
                b'\'' => return i + 1,
                _ => i += 1,
            }
        }
        self.src.len()
    }

    fn skip_quoted(&self, quote: u8) -> usize {
        let mut i = self.pos + 1;
        while i < self.src.len() {
            if self.src[i] == quote {
                if self.src.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return i + 1;
            }
            i += 1;
        }
        self.src.len()
    }

    /// `$tag$ ... $tag$`. `$1` and identifiers containing `$` are not quotes.
    fn skip_dollar_quote(&self) -> Option<usize> {
        if self.prev().is_some_and(is_ident_char) {
            return None;
        }
        let begin = self.pos + 1;
        let tag_len = match self.src.get(begin) {
            Some(b'$') => 0,
            Some(&c) if is_ident_start(c) => {
                let len = self.src[begin..]
                    .iter()
                    .take_while(|&&b| is_ident_start(b) || b.is_ascii_digit())
                    .count();
                if self.src.get(begin + len) != Some(&b'$') {
                    return None;
                }
                len
            }
            _ => return None,
        };
        let delimiter = &self.src[self.pos..begin + tag_len + 1];
        let body = begin + tag_len + 1;
        let end = self.src[body..]
            .windows(delimiter.len())
            .position(|w| w == delimiter)
            .map_or(self.src.len(), |i| body + i + delimiter.len());
        Some(end)
    }

    fn skip_line_comment(&self) -> usize {
        self.src[self.pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.src.len(), |i| self.pos + i + 1)
    }

    /// Block comments nest.
    fn skip_block_comment(&self) -> usize {
        let mut depth = 0usize;
        let mut i = self.pos;
        while i + 1 < self.src.len() {
            match (self.src[i], self.src[i + 1]) {
                (b'/', b'*') => {
                    depth += 1;
                    i += 2;
                }
                (b'*', b'/') => {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        return i;
                    }
                }
                _ => i += 1,
            }
        }
        self.src.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colon(query: &str) -> Rewritten {
        rewrite(query, ParamStyle::Colon).unwrap()
    }

    #[test]
    fn test_numeric_skips_quoted_identifier() {
        let rw = colon("SELECT :1, :2, \"field_:3\"");
        assert_eq!(rw.query, "SELECT $1, $2, \"field_:3\"");
        assert_eq!(rw.mapping, ArgMapping::Positional { count: 2 });
    }

    #[test]
    fn test_named_folds_repeats() {
        let rw = colon("SELECT :f_2, :f1 WHERE a=:f_2");
        assert_eq!(rw.query, "SELECT $1, $2 WHERE a=$1");
        let args = rw
            .mapping
            .apply(Params::named([("f_2", 1), ("f1", 2)]))
            .unwrap();
        assert_eq!(args, vec![PgValue::Int(1), PgValue::Int(2)]);
    }

    #[test]
    fn test_numeric_keeps_numerals() {
        let rw = colon("SELECT :2, :1, :2");
        assert_eq!(rw.query, "SELECT $2, $1, $2");
        assert_eq!(rw.mapping.param_count(), 2);
    }

    #[test]
    fn test_literals_comments_and_casts() {
        let query = "SELECT ':a', E'\\':b', $$ :c $$, $q$ :d $q$, x::int, y := 1 -- :e\n/* :f /* :g */ */ :h";
        let rw = colon(query);
        assert_eq!(
            rw.query,
            "SELECT ':a', E'\\':b', $$ :c $$, $q$ :d $q$, x::int, y := 1 -- :e\n/* :f /* :g */ */ $1"
        );
        assert_eq!(rw.mapping, ArgMapping::Named(vec!["h".to_string()]));
    }

    #[test]
    fn test_doubled_quotes() {
        let rw = colon("SELECT 'it''s :no', \"a\"\":no\" , :yes");
        assert_eq!(rw.query, "SELECT 'it''s :no', \"a\"\":no\" , $1");
    }

    #[test]
    fn test_positional_dollar_is_not_a_quote() {
        let rw = rewrite("SELECT $1, ?", ParamStyle::Qmark).unwrap();
        assert_eq!(rw.query, "SELECT $1, $1");
    }

    #[test]
    fn test_mixed_colon_styles_rejected() {
        let err = rewrite("SELECT :1, :name", ParamStyle::Colon).unwrap_err();
        assert!(err.is(crate::pg::error::ErrorKind::InterfaceError));
    }

    #[test]
    fn test_qmark() {
        let rw = rewrite("INSERT INTO t VALUES (?, ?, '?')", ParamStyle::Qmark).unwrap();
        assert_eq!(rw.query, "INSERT INTO t VALUES ($1, $2, '?')");
        assert_eq!(rw.mapping, ArgMapping::Positional { count: 2 });
    }

    #[test]
    fn test_format() {
        let rw = rewrite("SELECT %s, 5 % 3, '%s', 100%%", ParamStyle::Format).unwrap();
        assert_eq!(rw.query, "SELECT $1, 5 % 3, '%s', 100%");
        assert_eq!(rw.mapping, ArgMapping::Positional { count: 1 });
    }

    #[test]
    fn test_pyformat() {
        let rw = rewrite("SELECT %(a)s, %(b)s, %(a)s", ParamStyle::PyFormat).unwrap();
        assert_eq!(rw.query, "SELECT $1, $2, $1");
        assert_eq!(
            rw.mapping,
            ArgMapping::Named(vec!["a".to_string(), "b".to_string()])
        );
        let rw = rewrite("SELECT %s", ParamStyle::PyFormat).unwrap();
        assert_eq!(rw.mapping, ArgMapping::Positional { count: 1 });
    }

    #[test]
    fn test_argument_errors() {
        let mapping = ArgMapping::Positional { count: 2 };
        assert!(mapping.apply(Params::from([1])).is_err());
        assert!(mapping.apply(Params::None).is_err());
        assert!(mapping.apply(Params::named([("a", 1)])).is_err());

        let mapping = ArgMapping::Named(vec!["a".to_string()]);
        assert!(mapping.apply(Params::named([("b", 1)])).is_err());
        assert_eq!(
            mapping.apply(Params::named([("a", 1), ("extra", 2)])).unwrap(),
            vec![PgValue::Int(1)]
        );
        assert_eq!(
            ArgMapping::Positional { count: 0 }.apply(Params::None).unwrap(),
            Vec::<PgValue>::new()
        );
    }

    #[test]
    fn test_rewrite_cache_keys_on_style() {
        let mut cache = RewriteCache::new(4);
        let a = cache.rewrite("SELECT ?", ParamStyle::Qmark).unwrap();
        let b = cache.rewrite("SELECT ?", ParamStyle::Qmark).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.rewrite("SELECT ?", ParamStyle::Colon).unwrap();
        assert_eq!(c.query, "SELECT ?");
        assert_eq!(cache.len(), 2);
        assert!(cache.rewrite("SELECT :1, :x", ParamStyle::Colon).is_err());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let query = "UPDATE t SET a = :x, b = :y WHERE c = :x";
        assert_eq!(colon(query), colon(query));
    }
}
