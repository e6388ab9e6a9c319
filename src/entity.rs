//! Parsed ESI tags
//!
//! An [`Entity`] is one `<esi:include .../>` occurrence. The scanner creates
//! it with the raw tag interior and its offsets; [`Entity::parse_raw`] fills
//! in the structured fields from the attribute list.

use crate::circuit_breaker::CircuitBreaker;
use crate::condition::Condition;
use crate::error::{EsiError, Result};
use crate::template::Value;
use bytes::Bytes;
use std::ops::Deref;
use std::time::Duration;
use tracing::{debug, warn};

const FORWARD_ALL: &str = "all";

/// Fragment response headers never copied onto the page, even under `all`
///
/// The page's framing belongs to the origin response; Content-Length is
/// rewritten from the replacements instead.
const NOT_RETURNABLE: &[&str] = &[
    "content-length",
    "content-type",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Whether a fragment response header may be added to the page response
pub fn is_returnable(name: &str) -> bool {
    !NOT_RETURNABLE.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// One `src` value within an entity
#[derive(Debug)]
pub struct Resource {
    index: usize,
    value: Value,
    is_url: bool,
    breaker: CircuitBreaker,
}

impl Resource {
    pub fn new(index: usize, raw: &str) -> Result<Self> {
        Ok(Resource {
            index,
            value: Value::compile(raw)?,
            is_url: raw.contains("://"),
            breaker: CircuitBreaker::new(),
        })
    }

    /// Declaration order, which is also fallback priority
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The literal URL, if the value is not a template
    pub fn url(&self) -> Option<&str> {
        match &self.value {
            Value::Literal(s) => Some(s),
            Value::Template(_) => None,
        }
    }

    pub fn is_template(&self) -> bool {
        self.value.is_template()
    }

    /// Network fetch (`scheme://...`) as opposed to a configured alias
    pub fn is_url(&self) -> bool {
        self.is_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Header forwarding policy for one direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPolicy {
    pub all: bool,
    pub names: Vec<String>,
}

impl HeaderPolicy {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == FORWARD_ALL {
            return HeaderPolicy {
                all: true,
                names: Vec::new(),
            };
        }
        HeaderPolicy {
            all: false,
            names: raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }

    /// Whether `name` passes this policy (case-insensitive)
    pub fn allows(&self, name: &str) -> bool {
        self.all || self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// One ESI tag occurrence
#[derive(Debug)]
pub struct Entity {
    raw_tag: Bytes,
    tag_start: usize,
    tag_end: usize,
    resources: Vec<Resource>,
    key: Option<Value>,
    ttl: Duration,
    timeout: Duration,
    on_error: Option<String>,
    forward_headers: HeaderPolicy,
    return_headers: HeaderPolicy,
    condition: Option<Condition>,
    parse_error: Option<EsiError>,
}

impl Entity {
    /// Create an unparsed entity for the tag spanning `[tag_start, tag_end)`
    pub fn new(raw_tag: Bytes, tag_start: usize, tag_end: usize) -> Self {
        Entity {
            raw_tag,
            tag_start,
            tag_end,
            resources: Vec::new(),
            key: None,
            ttl: Duration::ZERO,
            timeout: Duration::ZERO,
            on_error: None,
            forward_headers: HeaderPolicy::default(),
            return_headers: HeaderPolicy::default(),
            condition: None,
            parse_error: None,
        }
    }

    /// Populate the structured fields from the raw tag
    ///
    /// On failure the error is also kept on the entity so that resolution
    /// can render the `onerror` fallback instead of aborting the page.
    /// `onerror` is extracted before anything else can fail.
    pub fn parse_raw(&mut self) -> Result<()> {
        let result = self.parse_fields();
        if let Err(err) = &result {
            warn!(
                "Failed to parse ESI tag at {}..{}: {}",
                self.tag_start, self.tag_end, err
            );
            self.parse_error = Some(err.clone());
        }
        result
    }

    fn parse_fields(&mut self) -> Result<()> {
        let raw = std::str::from_utf8(&self.raw_tag)
            .map_err(|e| EsiError::ParseError(format!("tag is not valid UTF-8: {}", e)))?
            .to_string();

        let (kind, rest) = split_tag_kind(&raw);
        let attributes = parse_attributes(rest)?;

        if let Some((_, v)) = attributes.iter().find(|(k, _)| k == "onerror") {
            self.on_error = Some(v.clone());
        }

        if kind != "include" {
            return Err(EsiError::ParseError(format!(
                "unsupported ESI tag kind: {:?}",
                kind
            )));
        }

        for (name, value) in &attributes {
            match name.as_str() {
                "src" => {
                    let index = self.resources.len();
                    self.resources.push(Resource::new(index, value)?);
                }
                "key" => self.key = Some(Value::compile(value)?),
                "onerror" => {}
                "condition" => self.condition = Some(Condition::parse(value)?),
                "timeout" => self.timeout = parse_duration(value)?,
                "ttl" => self.ttl = parse_duration(value)?,
                "forwardheaders" => self.forward_headers = HeaderPolicy::parse(value),
                "returnheaders" => self.return_headers = HeaderPolicy::parse(value),
                other => debug!("Ignoring unknown ESI attribute {:?}", other),
            }
        }

        if self.resources.is_empty() {
            return Err(EsiError::ParseError(
                "ESI include requires at least one src".to_string(),
            ));
        }

        Ok(())
    }

    pub fn raw_tag(&self) -> &[u8] {
        &self.raw_tag
    }

    pub fn tag_start(&self) -> usize {
        self.tag_start
    }

    pub fn tag_end(&self) -> usize {
        self.tag_end
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Zero means "use the configured default"
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Zero means "use the configured default"
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn on_error(&self) -> Option<&str> {
        self.on_error.as_deref()
    }

    pub fn forward_headers(&self) -> &HeaderPolicy {
        &self.forward_headers
    }

    pub fn return_headers(&self) -> &HeaderPolicy {
        &self.return_headers
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn parse_error(&self) -> Option<&EsiError> {
        self.parse_error.as_ref()
    }

    /// Short human-readable form for logs and errors
    pub fn describe(&self) -> String {
        format!(
            "{}@{}..{}",
            String::from_utf8_lossy(&self.raw_tag).trim(),
            self.tag_start,
            self.tag_end
        )
    }
}

/// All tags found in one page, in stream order
#[derive(Debug, Default)]
pub struct Entities(Vec<Entity>);

impl Entities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every entity, keeping the ones that fail with their error
    ///
    /// # Returns
    /// The number of entities that failed to parse
    pub fn parse_all(&mut self) -> usize {
        self.0
            .iter_mut()
            .map(|e| e.parse_raw())
            .filter(Result::is_err)
            .count()
    }

    pub fn into_inner(self) -> Vec<Entity> {
        self.0
    }
}

impl From<Vec<Entity>> for Entities {
    fn from(entities: Vec<Entity>) -> Self {
        Entities(entities)
    }
}

impl Deref for Entities {
    type Target = [Entity];

    fn deref(&self) -> &[Entity] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Entities {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn split_tag_kind(raw: &str) -> (&str, &str) {
    let raw = raw.trim_start();
    match raw.find(|c: char| c.is_ascii_whitespace()) {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, ""),
    }
}

/// Tokenize `name="value"` pairs
///
/// Values may be double-quoted, single-quoted or bare. Names are lowercased.
/// A name without `=` is skipped.
pub fn parse_attributes(input: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        let Some(&(name_start, _)) = chars.peek() else {
            break;
        };

        let mut name_end = input.len();
        let mut has_value = false;
        while let Some(&(i, c)) = chars.peek() {
            if c == '=' {
                name_end = i;
                has_value = true;
                chars.next();
                break;
            }
            if c.is_whitespace() {
                name_end = i;
                break;
            }
            chars.next();
        }
        let name = input[name_start..name_end].to_ascii_lowercase();

        if !has_value {
            continue;
        }

        let value = match chars.peek().copied() {
            Some((i, q)) if q == '"' || q == '\'' => {
                chars.next();
                let mut end = None;
                for (j, c) in chars.by_ref() {
                    if c == q {
                        end = Some(j);
                        break;
                    }
                }
                let end = end.ok_or_else(|| {
                    EsiError::ParseError(format!("unterminated quote for attribute {:?}", name))
                })?;
                input[i + 1..end].to_string()
            }
            Some((i, _)) => {
                let mut end = input.len();
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_whitespace() {
                        end = j;
                        break;
                    }
                    chars.next();
                }
                input[i..end].to_string()
            }
            None => String::new(),
        };

        if !name.is_empty() {
            out.push((name, value));
        }
    }

    Ok(out)
}

/// Parse a duration like `300ms`, `1.5s` or `2m30s`
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `0` is accepted; any
/// other number needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || EsiError::ParseError(format!("invalid duration: {:?}", input));

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total as u64))
}
