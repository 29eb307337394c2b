//! Path template compiler.
//!
//! Turns a template such as `/users/:id(\d+)/files/:path*` into a [`PathPattern`]: an
//! anchored [`Regex`] plus the ordered list of parameter tokens whose capture groups it
//! contains. The same tokens drive [`PathPattern::matches`] (path → parameters) and
//! [`PathPattern::build`] (parameters → path), so the two directions cannot drift.
//!
//! | Template fragment | Meaning                                                   |
//! |-------------------|-----------------------------------------------------------|
//! | `:name`           | named parameter, one segment                              |
//! | `:name(\d+)`      | named parameter with a custom pattern                     |
//! | `(\d+)`           | unnamed parameter, keyed by its position (`0`, `1`, ...)  |
//! | `?` / `+` / `*`   | optional / one-or-more / zero-or-more modifier            |
//! | trailing `*`      | catch-all wildcard                                        |
//! | `\x`              | the literal character `x`                                 |
//!
//! A parameter preceded by `/` or `.` takes that character as its prefix. When the
//! prefix is followed by something other than itself (`/:a-:b`), the parameter is
//! *partial*: if it is optional and absent, its prefix is still part of the path.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use thiserror::Error;

/// Characters left intact when encoding a single path component.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Characters left intact when encoding a wildcard value, which may span segments.
const WILDCARD: &AsciiSet = &COMPONENT
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$');

/// Errors raised while compiling a template or building a path from it.
#[derive(Debug, Clone, Error)]
pub enum PatternError {
    #[error("unterminated capture group starting at offset {offset}")]
    UnterminatedGroup { offset: usize },

    #[error("empty capture group at offset {offset}")]
    EmptyGroup { offset: usize },

    #[error("capture group at offset {offset} contains a nested group")]
    NestedGroup { offset: usize },

    #[error("invalid parameter pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("parameter patterns must not define their own capturing groups")]
    CaptureMismatch,

    #[error("expected \"{key}\" to be defined")]
    Missing { key: String },

    #[error("expected \"{key}\" to not repeat")]
    NotRepeatable { key: String },

    #[error("expected \"{key}\" to not be empty")]
    EmptyRepeat { key: String },

    #[error("expected \"{key}\" to match \"{pattern}\", but received \"{value}\"")]
    Mismatch {
        key: String,
        pattern: String,
        value: String,
    },
}

/// Compilation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternOptions {
    /// Match letter case exactly. Off by default.
    pub sensitive: bool,
    /// Disallow the optional trailing delimiter. Off by default.
    pub strict: bool,
    /// Anchor at the end of the path. When `false` the pattern matches a prefix that
    /// is followed by a delimiter or the end of the path.
    pub end: bool,
    /// Default segment delimiter.
    pub delimiter: char,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            sensitive: false,
            strict: false,
            end: true,
            delimiter: '/',
        }
    }
}

/// Identifies a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Named(String),
    /// Unnamed capture, numbered in order of appearance.
    Index(usize),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Named(name) => f.write_str(name),
            Key::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A parameter slot in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamToken {
    pub key: Key,
    /// `/`, `.` or empty.
    pub prefix: String,
    /// Separator between repeated values.
    pub delimiter: char,
    pub optional: bool,
    pub repeat: bool,
    pub partial: bool,
    pub asterisk: bool,
    /// Regex source for a single value.
    pub pattern: String,
}

/// A parsed template fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Param(ParamToken),
}

/// A captured parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    One(String),
    /// Values of a repeat parameter, one per segment.
    Many(Vec<String>),
}

impl ParamValue {
    /// Returns the single value, or `None` for a repeat parameter.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::One(value) => Some(value),
            ParamValue::Many(_) => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::One(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::One(value)
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(values: Vec<&str>) -> Self {
        ParamValue::Many(values.into_iter().map(str::to_owned).collect())
    }
}

/// Parameters captured from, or substituted into, a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    map: BTreeMap<String, ParamValue>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    options: PatternOptions,
    tokens: Vec<Token>,
    regex: Regex,
    // Token index for capture group `i + 1`. Built from the same pass as `regex`.
    groups: Vec<usize>,
    // Anchored single-value validators, indexed like `tokens`.
    validators: Vec<Option<Regex>>,
}

impl PathPattern {
    /// Compiles `template`.
    ///
    /// # Errors
    ///
    /// Fails on malformed capture groups, on custom patterns that are not valid
    /// regular expressions, and on custom patterns that add capturing groups of their
    /// own. A compiled pattern never fails at match time.
    ///
    /// # Examples
    ///
    /// ```
    /// use rpcgate::router::pattern::{PathPattern, PatternOptions};
    ///
    /// let pattern = PathPattern::compile("/user/:id", PatternOptions::default()).unwrap();
    /// let params = pattern.matches("/user/42").unwrap();
    /// assert_eq!(params.get("id").and_then(|v| v.as_str()), Some("42"));
    /// ```
    pub fn compile(template: &str, options: PatternOptions) -> Result<Self, PatternError> {
        let tokens = parse(template, options.delimiter)?;
        let source = tokens_to_regex(&tokens, &options);
        let regex = Regex::new(&source)?;

        let groups: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| matches!(token, Token::Param(_)))
            .map(|(index, _)| index)
            .collect();
        if regex.captures_len() != groups.len() + 1 {
            return Err(PatternError::CaptureMismatch);
        }

        let validators = tokens
            .iter()
            .map(|token| match token {
                Token::Param(param) => Regex::new(&format!("^(?:{})$", param.pattern)).map(Some),
                Token::Literal(_) => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: template.to_owned(),
            options,
            tokens,
            regex,
            groups,
            validators,
        })
    }

    /// Returns the template this pattern was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn options(&self) -> PatternOptions {
        self.options
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Returns the parameter tokens in capture-group order.
    pub fn keys(&self) -> impl Iterator<Item = &ParamToken> {
        self.groups.iter().filter_map(|&index| match &self.tokens[index] {
            Token::Param(param) => Some(param),
            Token::Literal(_) => None,
        })
    }

    /// Returns the generated regular expression source.
    pub fn regex_source(&self) -> &str {
        self.regex.as_str()
    }

    /// Matches `path`, returning the percent-decoded parameters.
    ///
    /// Repeat parameters are split on their delimiter. Optional parameters that did
    /// not participate in the match are absent from the result.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let captures = self.regex.captures(path)?;
        let mut params = PathParams::new();

        for (param, group) in self.keys().zip(1..) {
            let Some(raw) = captures.get(group) else {
                continue;
            };
            let value = if param.repeat {
                ParamValue::Many(raw.as_str().split(param.delimiter).map(decode).collect())
            } else {
                ParamValue::One(decode(raw.as_str()))
            };
            params.insert(param.key.to_string(), value);
        }

        Some(params)
    }

    /// Builds a path by substituting `params` into the template.
    ///
    /// # Errors
    ///
    /// - [`PatternError::Missing`] — a required parameter has no value.
    /// - [`PatternError::NotRepeatable`] — a list was given for a single-value parameter.
    /// - [`PatternError::EmptyRepeat`] — an empty list was given for a required repeat parameter.
    /// - [`PatternError::Mismatch`] — an encoded value fails the parameter's pattern.
    pub fn build(&self, params: &PathParams) -> Result<String, PatternError> {
        let mut path = String::new();

        for (token, validator) in self.tokens.iter().zip(&self.validators) {
            let param = match token {
                Token::Literal(text) => {
                    path.push_str(text);
                    continue;
                }
                Token::Param(param) => param,
            };
            let key = param.key.to_string();

            match params.get(&key) {
                None => {
                    if !param.optional {
                        return Err(PatternError::Missing { key });
                    }
                    if param.partial {
                        path.push_str(&param.prefix);
                    }
                }
                Some(ParamValue::Many(values)) => {
                    if !param.repeat {
                        return Err(PatternError::NotRepeatable { key });
                    }
                    if values.is_empty() {
                        if param.optional {
                            continue;
                        }
                        return Err(PatternError::EmptyRepeat { key });
                    }
                    for (index, value) in values.iter().enumerate() {
                        let segment = utf8_percent_encode(value, COMPONENT).to_string();
                        check_segment(validator.as_ref(), param, &key, &segment)?;
                        if index == 0 {
                            path.push_str(&param.prefix);
                        } else {
                            path.push(param.delimiter);
                        }
                        path.push_str(&segment);
                    }
                }
                Some(ParamValue::One(value)) => {
                    let set = if param.asterisk { WILDCARD } else { COMPONENT };
                    let segment = utf8_percent_encode(value, set).to_string();
                    check_segment(validator.as_ref(), param, &key, &segment)?;
                    path.push_str(&param.prefix);
                    path.push_str(&segment);
                }
            }
        }

        Ok(path)
    }
}

fn check_segment(
    validator: Option<&Regex>,
    param: &ParamToken,
    key: &str,
    segment: &str,
) -> Result<(), PatternError> {
    match validator {
        Some(re) if !re.is_match(segment) => Err(PatternError::Mismatch {
            key: key.to_owned(),
            pattern: param.pattern.clone(),
            value: segment.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Splits a template into literal and parameter tokens.
///
/// # Errors
///
/// See [`PathPattern::compile`].
pub fn parse(template: &str, default_delimiter: char) -> Result<Vec<Token>, PatternError> {
    let chars: Vec<(usize, char)> = template.char_indices().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut next_index = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;

        if c == '\\' {
            if let Some(&(_, escaped)) = chars.get(i + 1) {
                literal.push(escaped);
                i += 2;
                continue;
            }
        }

        let Some(scan) = scan_param(&chars, i)? else {
            literal.push(c);
            i += 1;
            continue;
        };

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        let next = chars.get(scan.end).map(|&(_, c)| c);
        let partial = matches!((scan.prefix, next), (Some(p), Some(n)) if n != p);
        let delimiter = scan.prefix.unwrap_or(default_delimiter);
        let key = match scan.name {
            Some(name) => Key::Named(name),
            None => {
                next_index += 1;
                Key::Index(next_index - 1)
            }
        };
        let pattern = match scan.group {
            Some(group) => escape_group(&group),
            None if scan.asterisk => ".*".to_owned(),
            None => format!("[^{}]+?", regex::escape(&delimiter.to_string())),
        };

        tokens.push(Token::Param(ParamToken {
            key,
            prefix: scan.prefix.map(String::from).unwrap_or_default(),
            delimiter,
            optional: matches!(scan.modifier, Some('?' | '*')),
            repeat: matches!(scan.modifier, Some('+' | '*')),
            partial,
            asterisk: scan.asterisk,
            pattern,
        }));
        i = scan.end;
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    Ok(tokens)
}

struct ParamScan {
    prefix: Option<char>,
    name: Option<String>,
    group: Option<String>,
    modifier: Option<char>,
    asterisk: bool,
    end: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// Tries to read a parameter starting at `start`. `Ok(None)` means the character at
// `start` is plain literal text.
fn scan_param(chars: &[(usize, char)], start: usize) -> Result<Option<ParamScan>, PatternError> {
    let at = |i: usize| chars.get(i).map(|&(_, c)| c);
    let mut i = start;

    let prefix = match at(i) {
        Some(c @ ('/' | '.')) => {
            i += 1;
            Some(c)
        }
        _ => None,
    };

    let mut name = None;
    let mut group = None;

    match at(i) {
        Some(':') => {
            let name_start = i + 1;
            let mut j = name_start;
            while at(j).is_some_and(is_word_char) {
                j += 1;
            }
            if j == name_start {
                return Ok(None);
            }
            name = Some(chars[name_start..j].iter().map(|&(_, c)| c).collect());
            i = j;
            if at(i) == Some('(') {
                let (pattern, end) = scan_group(chars, i)?;
                group = Some(pattern);
                i = end;
            }
        }
        Some('(') => {
            let (pattern, end) = scan_group(chars, i)?;
            group = Some(pattern);
            i = end;
        }
        Some('*') => {
            return Ok(Some(ParamScan {
                prefix,
                name: None,
                group: None,
                modifier: None,
                asterisk: true,
                end: i + 1,
            }));
        }
        _ => return Ok(None),
    }

    let modifier = match at(i) {
        Some(m @ ('?' | '+' | '*')) => {
            i += 1;
            Some(m)
        }
        _ => None,
    };

    Ok(Some(ParamScan {
        prefix,
        name,
        group,
        modifier,
        asterisk: false,
        end: i,
    }))
}

// Reads `( ... )` starting at the opening parenthesis. Returns the inner pattern and
// the index just past the closing parenthesis.
fn scan_group(chars: &[(usize, char)], open: usize) -> Result<(String, usize), PatternError> {
    let offset = chars[open].0;
    let mut content = String::new();
    let mut i = open + 1;

    loop {
        match chars.get(i).map(|&(_, c)| c) {
            None => return Err(PatternError::UnterminatedGroup { offset }),
            Some('\\') => {
                let Some(&(_, escaped)) = chars.get(i + 1) else {
                    return Err(PatternError::UnterminatedGroup { offset });
                };
                content.push('\\');
                content.push(escaped);
                i += 2;
            }
            Some('(') => return Err(PatternError::NestedGroup { offset }),
            Some(')') if content.is_empty() => return Err(PatternError::EmptyGroup { offset }),
            Some(')') => return Ok((content, i + 1)),
            Some(c) => {
                content.push(c);
                i += 1;
            }
        }
    }
}

// `$` inside a custom pattern is a literal dollar sign, not an anchor.
fn escape_group(group: &str) -> String {
    let mut out = String::with_capacity(group.len());
    let mut chars = group.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '$' => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out
}

fn tokens_to_regex(tokens: &[Token], options: &PatternOptions) -> String {
    let delimiter = regex::escape(&options.delimiter.to_string());
    let mut route = String::new();

    for token in tokens {
        match token {
            Token::Literal(text) => route.push_str(&regex::escape(text)),
            Token::Param(param) => {
                let prefix = regex::escape(&param.prefix);
                let mut capture = format!("(?:{})", param.pattern);
                if param.repeat {
                    capture = format!("{capture}(?:{prefix}{capture})*");
                }
                let capture = match (param.optional, param.partial) {
                    (true, false) => format!("(?:{prefix}({capture}))?"),
                    (true, true) => format!("{prefix}({capture})?"),
                    (false, _) => format!("{prefix}({capture})"),
                };
                route.push_str(&capture);
            }
        }
    }

    let ends_with_delimiter = route.ends_with(&delimiter);
    if !options.strict && ends_with_delimiter {
        route.truncate(route.len() - delimiter.len());
    }

    // The tails below stand in for the look-ahead forms `(?:/(?=$))?` and `(?=/|$)`;
    // only capture groups are observed, so consuming the delimiter is equivalent.
    match (options.strict, options.end) {
        (false, true) => route.push_str(&format!("(?:{delimiter})?$")),
        (false, false) => route.push_str(&format!("(?:{delimiter}|$)")),
        (true, true) => route.push('$'),
        (true, false) if ends_with_delimiter => {}
        (true, false) => route.push_str(&format!("(?:{delimiter}|$)")),
    }

    let flags = if options.sensitive { "" } else { "(?i)" };
    format!("{flags}^{route}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(template: &str) -> PathPattern {
        PathPattern::compile(template, PatternOptions::default()).unwrap()
    }

    fn one(params: &PathParams, key: &str) -> Option<String> {
        params.get(key).and_then(|v| v.as_str()).map(str::to_owned)
    }

    // ── parse ─────────────────────────────────────────────────────────────────

    #[test]
    fn parse_named_parameter() {
        let tokens = parse("/user/:id", '/').unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], Token::Literal("/user".into()));
        match &tokens[1] {
            Token::Param(p) => {
                assert_eq!(p.key, Key::Named("id".into()));
                assert_eq!(p.prefix, "/");
                assert_eq!(p.pattern, "[^/]+?");
                assert!(!p.optional && !p.repeat && !p.partial && !p.asterisk);
            }
            other => panic!("expected param, got {other:?}"),
        }
    }

    #[test]
    fn parse_modifiers() {
        let tokens = parse("/:a?/:b+/:c*", '/').unwrap();
        let flags: Vec<_> = tokens
            .iter()
            .map(|t| match t {
                Token::Param(p) => (p.optional, p.repeat),
                Token::Literal(_) => panic!("unexpected literal"),
            })
            .collect();
        assert_eq!(flags, vec![(true, false), (false, true), (true, true)]);
    }

    #[test]
    fn parse_unnamed_groups_are_numbered() {
        let tokens = parse("/(\\d+)/x/(\\w+)", '/').unwrap();
        let keys: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Param(p) => Some(p.key.clone()),
                Token::Literal(_) => None,
            })
            .collect();
        assert_eq!(keys, vec![Key::Index(0), Key::Index(1)]);
    }

    #[test]
    fn parse_partial_parameter() {
        let tokens = parse("/:from-:to", '/').unwrap();
        match &tokens[0] {
            Token::Param(p) => assert!(p.partial),
            other => panic!("expected param, got {other:?}"),
        }
        // `:to` has no prefix of its own.
        match &tokens[2] {
            Token::Param(p) => {
                assert!(!p.partial);
                assert_eq!(p.prefix, "");
            }
            other => panic!("expected param, got {other:?}"),
        }
    }

    #[test]
    fn parse_escaped_characters_are_literal() {
        let tokens = parse("/price\\:usd/\\(x\\)", '/').unwrap();
        assert_eq!(tokens, vec![Token::Literal("/price:usd/(x)".into())]);
    }

    #[test]
    fn parse_lone_colon_is_literal() {
        let tokens = parse("/a:/b", '/').unwrap();
        assert_eq!(tokens, vec![Token::Literal("/a:/b".into())]);
    }

    #[test]
    fn malformed_groups_fail_at_compile_time() {
        let opts = PatternOptions::default();
        assert!(matches!(
            PathPattern::compile("/user/:id(\\d+", opts),
            Err(PatternError::UnterminatedGroup { offset: 9 })
        ));
        assert!(matches!(
            PathPattern::compile("/user/:id()", opts),
            Err(PatternError::EmptyGroup { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/user/:id((a)|b)", opts),
            Err(PatternError::NestedGroup { .. })
        ));
        assert!(matches!(
            PathPattern::compile("/user/:id([a-)", opts),
            Err(PatternError::Regex(_))
        ));
    }

    // ── matches ───────────────────────────────────────────────────────────────

    #[test]
    fn named_parameter_matches() {
        let p = compile("/user/:id");
        let params = p.matches("/user/42").unwrap();
        assert_eq!(one(&params, "id").as_deref(), Some("42"));
        assert!(p.matches("/user").is_none());
        assert!(p.matches("/user/42/extra").is_none());
    }

    #[test]
    fn trailing_slash_tolerated_unless_strict() {
        let loose = compile("/user/:id");
        assert!(loose.matches("/user/42/").is_some());

        let strict = PathPattern::compile(
            "/user/:id",
            PatternOptions {
                strict: true,
                ..PatternOptions::default()
            },
        )
        .unwrap();
        assert!(strict.matches("/user/42").is_some());
        assert!(strict.matches("/user/42/").is_none());
    }

    #[test]
    fn trailing_slash_in_template() {
        let loose = compile("/user/");
        assert!(loose.matches("/user").is_some());
        assert!(loose.matches("/user/").is_some());

        let strict = PathPattern::compile(
            "/user/",
            PatternOptions {
                strict: true,
                ..PatternOptions::default()
            },
        )
        .unwrap();
        assert!(strict.matches("/user/").is_some());
        assert!(strict.matches("/user").is_none());
    }

    #[test]
    fn optional_parameter_matches_with_and_without_value() {
        let p = compile("/user/:id?");
        assert_eq!(one(&p.matches("/user/7").unwrap(), "id").as_deref(), Some("7"));

        let params = p.matches("/user").unwrap();
        assert!(params.get("id").is_none());
        assert!(p.matches("/user/").is_some());
    }

    #[test]
    fn non_terminal_matching_requires_delimiter_boundary() {
        let p = PathPattern::compile(
            "/api",
            PatternOptions {
                end: false,
                ..PatternOptions::default()
            },
        )
        .unwrap();
        assert!(p.matches("/api").is_some());
        assert!(p.matches("/api/").is_some());
        assert!(p.matches("/api/math/add").is_some());
        assert!(p.matches("/apix").is_none());
    }

    #[test]
    fn non_terminal_parameter_expands_to_segment() {
        let p = PathPattern::compile(
            "/:service",
            PatternOptions {
                end: false,
                ..PatternOptions::default()
            },
        )
        .unwrap();
        let params = p.matches("/math/add").unwrap();
        assert_eq!(one(&params, "service").as_deref(), Some("math"));
    }

    #[test]
    fn repeat_parameters_become_lists() {
        let p = compile("/files/:path+");
        assert_eq!(
            p.matches("/files/a/b/c").unwrap().get("path"),
            Some(&ParamValue::from(vec!["a", "b", "c"]))
        );
        assert!(p.matches("/files").is_none());

        let p = compile("/files/:path*");
        assert!(p.matches("/files").unwrap().get("path").is_none());
        assert_eq!(
            p.matches("/files/a").unwrap().get("path"),
            Some(&ParamValue::from(vec!["a"]))
        );
    }

    #[test]
    fn custom_pattern_constrains_value() {
        let p = compile("/user/:id(\\d+)");
        assert!(p.matches("/user/123").is_some());
        assert!(p.matches("/user/abc").is_none());
    }

    #[test]
    fn unnamed_group_is_indexed() {
        let p = compile("/v(\\d+)/status");
        let params = p.matches("/v2/status").unwrap();
        assert_eq!(one(&params, "0").as_deref(), Some("2"));
    }

    #[test]
    fn trailing_asterisk_is_catch_all() {
        let p = compile("/static/*");
        let params = p.matches("/static/css/site.css").unwrap();
        assert_eq!(one(&params, "0").as_deref(), Some("css/site.css"));
    }

    #[test]
    fn values_are_percent_decoded() {
        let p = compile("/greet/:name");
        let params = p.matches("/greet/J%C3%BCrgen%20M").unwrap();
        assert_eq!(one(&params, "name").as_deref(), Some("Jürgen M"));
    }

    #[test]
    fn matching_is_case_insensitive_by_default() {
        let p = compile("/Health");
        assert!(p.matches("/health").is_some());

        let sensitive = PathPattern::compile(
            "/Health",
            PatternOptions {
                sensitive: true,
                ..PatternOptions::default()
            },
        )
        .unwrap();
        assert!(sensitive.matches("/health").is_none());
        assert!(sensitive.matches("/Health").is_some());
    }

    #[test]
    fn dot_prefixed_parameter() {
        let p = compile("/file/:name.:ext");
        let params = p.matches("/file/archive.tar.gz").unwrap();
        assert_eq!(one(&params, "name").as_deref(), Some("archive.tar"));
        assert_eq!(one(&params, "ext").as_deref(), Some("gz"));
    }

    #[test]
    fn literal_dollar_in_custom_pattern() {
        let p = compile("/price/:amount(\\d+$)");
        assert!(p.matches("/price/10$").is_some());
        assert!(p.matches("/price/10").is_none());
    }

    // ── build ─────────────────────────────────────────────────────────────────

    #[test]
    fn build_substitutes_values() {
        let p = compile("/user/:id/posts/:post");
        let mut params = PathParams::new();
        params.insert("id", "7");
        params.insert("post", "hello world");
        assert_eq!(p.build(&params).unwrap(), "/user/7/posts/hello%20world");
    }

    #[test]
    fn build_rejects_missing_required() {
        let p = compile("/user/:id");
        assert!(matches!(
            p.build(&PathParams::new()),
            Err(PatternError::Missing { key }) if key == "id"
        ));
    }

    #[test]
    fn build_skips_absent_optional_but_keeps_partial_prefix() {
        let p = compile("/user/:id?");
        assert_eq!(p.build(&PathParams::new()).unwrap(), "/user");

        let p = compile("/range/:from?-:to");
        let mut params = PathParams::new();
        params.insert("to", "9");
        assert_eq!(p.build(&params).unwrap(), "/range/-9");
    }

    #[test]
    fn build_repeat_rules() {
        let required = compile("/files/:path+");
        let mut params = PathParams::new();
        params.insert("path", Vec::<&str>::new());
        assert!(matches!(
            required.build(&params),
            Err(PatternError::EmptyRepeat { .. })
        ));

        let optional = compile("/files/:path*");
        assert_eq!(optional.build(&params).unwrap(), "/files");

        let single = compile("/files/:path");
        let mut params = PathParams::new();
        params.insert("path", vec!["a", "b"]);
        assert!(matches!(
            single.build(&params),
            Err(PatternError::NotRepeatable { .. })
        ));
        assert_eq!(required.build(&params).unwrap(), "/files/a/b");
    }

    #[test]
    fn build_validates_against_pattern() {
        let p = compile("/user/:id(\\d+)");
        let mut params = PathParams::new();
        params.insert("id", "abc");
        assert!(matches!(
            p.build(&params),
            Err(PatternError::Mismatch { value, .. }) if value == "abc"
        ));
    }

    #[test]
    fn build_wildcard_keeps_slashes() {
        let p = compile("/static/*");
        let mut params = PathParams::new();
        params.insert("0", "css/site main.css");
        assert_eq!(p.build(&params).unwrap(), "/static/css/site%20main.css");
    }

    #[test]
    fn build_then_match_round_trips() {
        let cases: Vec<(&str, Vec<(&str, ParamValue)>)> = vec![
            ("/user/:id", vec![("id", "42".into())]),
            ("/user/:id", vec![("id", "a b/c?d".into())]),
            ("/user/:id(\\d+)/:tab?", vec![("id", "9".into()), ("tab", "posts".into())]),
            ("/user/:id(\\d+)/:tab?", vec![("id", "9".into())]),
            ("/files/:path+", vec![("path", vec!["docs", "read me.md"].into())]),
            ("/files/:path*", vec![]),
            ("/:lang.:ext", vec![("lang", "Grüße".into()), ("ext", "txt".into())]),
            ("/v(\\d+)/items/:item", vec![("0", "3".into()), ("item", "x".into())]),
            ("/assets/*", vec![("0", "img/logo.svg".into())]),
        ];

        for (template, values) in cases {
            let pattern = compile(template);
            let mut params = PathParams::new();
            for (key, value) in values {
                params.insert(key, value);
            }
            let path = pattern.build(&params).unwrap();
            let matched = pattern
                .matches(&path)
                .unwrap_or_else(|| panic!("{template}: built path {path} did not match"));
            assert_eq!(matched, params, "{template} via {path}");
        }
    }
}
