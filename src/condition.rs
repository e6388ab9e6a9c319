//! `condition` attribute evaluation
//!
//! Grammar: `lhs == rhs`, `lhs != rhs`, or a single operand checked for
//! truthiness. Operands may be templates and may be wrapped in single or
//! double quotes. An operand is falsy when it renders empty, `0` or `false`.

use crate::error::{EsiError, Result};
use crate::template::{RequestInfo, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

/// A compiled condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    lhs: Value,
    rhs: Option<(Op, Value)>,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(EsiError::ParseError("empty condition".to_string()));
        }

        let split = [("==", Op::Eq), ("!=", Op::Ne)]
            .into_iter()
            .filter_map(|(sym, op)| trimmed.find(sym).map(|idx| (idx, sym.len(), op)))
            .min_by_key(|(idx, _, _)| *idx);

        let (lhs, rhs) = match split {
            Some((idx, len, op)) => {
                let lhs = operand(&trimmed[..idx])?;
                let rhs = operand(&trimmed[idx + len..])?;
                (lhs, Some((op, rhs)))
            }
            None => (operand(trimmed)?, None),
        };

        Ok(Condition {
            source: source.to_string(),
            lhs,
            rhs,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, req: &RequestInfo) -> bool {
        let lhs = self.lhs.render(req, "");
        match &self.rhs {
            Some((Op::Eq, rhs)) => lhs == rhs.render(req, ""),
            Some((Op::Ne, rhs)) => lhs != rhs.render(req, ""),
            None => is_truthy(&lhs),
        }
    }
}

fn operand(raw: &str) -> Result<Value> {
    let raw = raw.trim();
    let unquoted = ['"', '\'']
        .into_iter()
        .find_map(|q| raw.strip_prefix(q).and_then(|r| r.strip_suffix(q)))
        .unwrap_or(raw);
    Value::compile(unquoted)
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method, Uri};

    fn request() -> RequestInfo {
        let mut headers = HeaderMap::new();
        headers.insert("x-tier", HeaderValue::from_static("gold"));
        headers.insert("x-flag", HeaderValue::from_static("0"));
        let uri: Uri = "/page?preview=true".parse().unwrap();
        RequestInfo::new(Method::GET, uri, headers)
    }

    #[test]
    fn test_equality() {
        let c = Condition::parse("{{Hx-tier}} == 'gold'").unwrap();
        assert!(c.evaluate(&request()));
        let c = Condition::parse("{{Hx-tier}} == \"silver\"").unwrap();
        assert!(!c.evaluate(&request()));
    }

    #[test]
    fn test_inequality() {
        let c = Condition::parse("{{Hx-tier}} != silver").unwrap();
        assert!(c.evaluate(&request()));
    }

    #[test]
    fn test_truthiness() {
        assert!(Condition::parse("{{Fpreview}}").unwrap().evaluate(&request()));
        assert!(!Condition::parse("{{Hx-flag}}").unwrap().evaluate(&request()));
        assert!(!Condition::parse("{{Hmissing}}").unwrap().evaluate(&request()));
        assert!(!Condition::parse("false").unwrap().evaluate(&request()));
        assert!(Condition::parse("yes").unwrap().evaluate(&request()));
    }

    #[test]
    fn test_empty_condition_rejected() {
        assert!(Condition::parse("   ").is_err());
    }

    #[test]
    fn test_bad_template_rejected() {
        assert!(Condition::parse("{{Hx == a").is_err());
    }
}
