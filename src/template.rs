//! Placeholder templates for `src`, `key` and `condition` values
//!
//! A value containing `{{` is compiled into a template. Each `{{ token }}`
//! segment is a placeholder resolved against the inbound request:
//!
//! - `H<name>`: request header, case-insensitive
//! - `C<name>`: cookie, case-sensitive
//! - `F<name>`: form field from the query string or urlencoded body, case-sensitive
//! - `method`, `scheme`, `host`, `hostonly`, `path`, `query`, `uri`, `remote`,
//!   `when` (`02/Jan/2006:15:04:05 -0700` style), `when_unix`
//!
//! The token may also be written in single-brace form, `{{ {Hx-user} }}`.
//! Unknown or missing placeholders render as the caller-supplied empty value.

use crate::error::{EsiError, Result};
use http::{HeaderMap, Method, Uri};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// The parts of an inbound request that templates and conditions can read
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: Method,
    scheme: String,
    host: String,
    uri: Uri,
    headers: HeaderMap,
    remote: String,
    cookies: HashMap<String, String>,
    form: HashMap<String, String>,
    deadline: Option<Instant>,
}

impl RequestInfo {
    /// Build from the request line and headers
    ///
    /// Cookies are parsed from the `Cookie` header and form values from the
    /// query string. The host comes from the URI authority, falling back to
    /// the `Host` header.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let host = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                headers
                    .get(http::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let cookies = parse_cookies(&headers);
        let form = uri
            .query()
            .map(|q| parse_form(q.as_bytes()))
            .unwrap_or_default();

        RequestInfo {
            method,
            scheme,
            host,
            uri,
            headers,
            remote: String::new(),
            cookies,
            form,
            deadline: None,
        }
    }

    /// Build from `http::request::Parts`
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone())
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Merge an `application/x-www-form-urlencoded` body into the form values
    ///
    /// Body values win over query values with the same name.
    pub fn with_form_body(mut self, body: &[u8]) -> Self {
        self.form.extend(parse_form(body));
        self
    }

    /// Bound every fetch made on behalf of this request
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Time left before the request deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolve a single placeholder token
    pub fn placeholder(&self, token: &str) -> Option<String> {
        if let Some(name) = token.strip_prefix('H') {
            if !name.is_empty() {
                return self.header(name).map(str::to_string);
            }
        }
        if let Some(name) = token.strip_prefix('C') {
            if !name.is_empty() {
                return self.cookie(name).map(str::to_string);
            }
        }
        if let Some(name) = token.strip_prefix('F') {
            if !name.is_empty() {
                return self.form_value(name).map(str::to_string);
            }
        }

        match token {
            "method" => Some(self.method.as_str().to_string()),
            "scheme" => Some(self.scheme.clone()),
            "host" => Some(self.host.clone()),
            "hostonly" => Some(
                self.host
                    .rsplit_once(':')
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| self.host.clone()),
            ),
            "path" => Some(self.path().to_string()),
            "query" => Some(self.query().to_string()),
            "uri" => Some(
                self.uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| self.path().to_string()),
            ),
            "remote" => Some(self.remote.clone()),
            "when" => Some(chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z").to_string()),
            "when_unix" => Some(chrono::Utc::now().timestamp().to_string()),
            _ => None,
        }
    }
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(http::header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, val)) = pair.trim().split_once('=') {
                cookies.insert(name.trim().to_string(), val.trim().to_string());
            }
        }
    }
    cookies
}

fn parse_form(input: &[u8]) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for (k, v) in url::form_urlencoded::parse(input) {
        form.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }
    form
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder(String),
}

/// A compiled placeholder template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    /// Compile a template
    ///
    /// # Returns
    /// * `Err(EsiError::ParseError)` on an unterminated `{{` or an empty placeholder
    pub fn compile(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find(OPEN) {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + OPEN.len()..];
            let close = after.find(CLOSE).ok_or_else(|| {
                EsiError::ParseError(format!("unterminated placeholder in {:?}", source))
            })?;

            let mut token = after[..close].trim();
            if let Some(inner) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                token = inner.trim();
            }
            if token.is_empty() {
                return Err(EsiError::ParseError(format!(
                    "empty placeholder in {:?}",
                    source
                )));
            }
            parts.push(Part::Placeholder(token.to_string()));
            rest = &after[close + CLOSE.len()..];
        }

        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Template {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder tokens in declaration order
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Placeholder(t) => Some(t.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Render against a request, substituting `empty` for unresolved placeholders
    pub fn render(&self, req: &RequestInfo, empty: &str) -> String {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Placeholder(token) => match req.placeholder(token) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(empty),
                },
            }
        }
        out
    }
}

/// A literal value or a compiled template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Literal(String),
    Template(Template),
}

impl Value {
    /// Compile `raw` into a template if it contains the template delimiter
    pub fn compile(raw: &str) -> Result<Self> {
        if raw.contains(OPEN) {
            Ok(Value::Template(Template::compile(raw)?))
        } else {
            Ok(Value::Literal(raw.to_string()))
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, Value::Template(_))
    }

    /// The value as written in the tag
    pub fn source(&self) -> &str {
        match self {
            Value::Literal(s) => s,
            Value::Template(t) => t.source(),
        }
    }

    pub fn render(&self, req: &RequestInfo, empty: &str) -> String {
        match self {
            Value::Literal(s) => s.clone(),
            Value::Template(t) => t.render(req, empty),
        }
    }
}
