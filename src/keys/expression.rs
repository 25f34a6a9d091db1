//! Key expressions evaluated against a request fact.
//!
//! The built-in [`TemplateExpression`] evaluator understands terms joined
//! with `+`:
//!
//! - `'literal'` or `"literal"`
//! - `header('X-Tenant')`
//! - `attribute('user_id')`
//! - `remote_addr` (client address, honoring `X-Forwarded-For`)
//! - `route`
//!
//! For example `'tenant:' + header('X-Tenant') + ':' + attribute('user_id')`.

use std::sync::Arc;

use dashmap::DashMap;

use super::fact::RequestFact;
use crate::error::{QuotaError, Result};

/// Evaluates a key expression to an identity string.
pub trait ExpressionEvaluator: Send + Sync {
    /// `Ok(None)` when the expression is valid but yields nothing.
    fn evaluate(&self, expression: &str, fact: &dyn RequestFact) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Literal(String),
    Header(String),
    Attribute(String),
    RemoteAddr,
    Route,
}

/// Template evaluator with a cache of parsed expressions.
#[derive(Debug, Default)]
pub struct TemplateExpression {
    parsed: DashMap<String, Arc<Vec<Term>>>,
}

impl TemplateExpression {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, expression: &str) -> Result<Arc<Vec<Term>>> {
        if let Some(terms) = self.parsed.get(expression) {
            return Ok(Arc::clone(terms.value()));
        }
        let terms = Arc::new(parse(expression)?);
        self.parsed.insert(expression.to_string(), Arc::clone(&terms));
        Ok(terms)
    }
}

impl ExpressionEvaluator for TemplateExpression {
    fn evaluate(&self, expression: &str, fact: &dyn RequestFact) -> Result<Option<String>> {
        let terms = self.compile(expression)?;

        let mut value = String::new();
        let mut dynamic_found = false;
        for term in terms.iter() {
            let part = match term {
                Term::Literal(s) => {
                    value.push_str(s);
                    continue;
                }
                Term::Header(name) => fact.header(name),
                Term::Attribute(name) => fact.attribute(name),
                Term::RemoteAddr => fact.client_ip(),
                Term::Route => Some(fact.route_scope()),
            };
            if let Some(part) = part.filter(|p| !p.is_empty()) {
                dynamic_found = true;
                value.push_str(part);
            }
        }

        // literals alone do not identify a client
        let has_dynamic = terms.iter().any(|t| !matches!(t, Term::Literal(_)));
        if value.is_empty() || (has_dynamic && !dynamic_found) {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }
}

fn invalid(expression: &str, reason: &str) -> QuotaError {
    QuotaError::KeyResolution(format!("invalid key expression '{}': {}", expression, reason))
}

fn parse(expression: &str) -> Result<Vec<Term>> {
    let mut terms = Vec::new();
    for raw in split_terms(expression).map_err(|reason| invalid(expression, reason))? {
        let term = raw.trim();
        if term.is_empty() {
            return Err(invalid(expression, "empty term"));
        }
        terms.push(parse_term(term).ok_or_else(|| invalid(expression, "unrecognized term"))?);
    }
    Ok(terms)
}

/// Split on `+` outside of quotes.
fn split_terms(expression: &str) -> std::result::Result<Vec<&str>, &'static str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in expression.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '+') => {
                parts.push(&expression[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal");
    }
    parts.push(&expression[start..]);
    Ok(parts)
}

fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    let first = s.chars().next()?;
    if (first == '\'' || first == '"') && s.len() >= 2 && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn call_argument<'a>(term: &'a str, function: &str) -> Option<&'a str> {
    let rest = term.strip_prefix(function)?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    unquote(inner)
}

fn parse_term(term: &str) -> Option<Term> {
    if let Some(literal) = unquote(term) {
        return Some(Term::Literal(literal.to_string()));
    }
    match term {
        "remote_addr" => return Some(Term::RemoteAddr),
        "route" => return Some(Term::Route),
        _ => {}
    }
    if let Some(name) = call_argument(term, "header") {
        return Some(Term::Header(name.to_string()));
    }
    call_argument(term, "attribute").map(|name| Term::Attribute(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::HttpFact;

    fn fact() -> HttpFact {
        HttpFact::new("/orders/{id}")
            .with_peer_str("10.0.0.1")
            .with_header("X-Tenant", "acme")
            .with_attribute("user_id", "42")
    }

    #[test]
    fn test_evaluate_template() {
        let evaluator = TemplateExpression::new();
        let value = evaluator
            .evaluate("'tenant:' + header('X-Tenant') + \":\" + attribute('user_id')", &fact())
            .unwrap();
        assert_eq!(value.as_deref(), Some("tenant:acme:42"));
    }

    #[test]
    fn test_evaluate_builtins() {
        let evaluator = TemplateExpression::new();
        assert_eq!(
            evaluator.evaluate("remote_addr", &fact()).unwrap().as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(
            evaluator.evaluate("route", &fact()).unwrap().as_deref(),
            Some("/orders/{id}")
        );
    }

    #[test]
    fn test_missing_values_yield_none() {
        let evaluator = TemplateExpression::new();
        assert_eq!(evaluator.evaluate("header('X-Missing')", &fact()).unwrap(), None);
        assert_eq!(
            evaluator.evaluate("'user:' + attribute('missing')", &fact()).unwrap(),
            None
        );
    }

    #[test]
    fn test_plus_inside_literal() {
        let evaluator = TemplateExpression::new();
        assert_eq!(
            evaluator.evaluate("'a+b' + header('x-tenant')", &fact()).unwrap().as_deref(),
            Some("a+bacme")
        );
    }

    #[test]
    fn test_invalid_expressions() {
        let evaluator = TemplateExpression::new();
        for bad in ["header(X-Tenant)", "'open", "a + ", "request.getHeader('x')"] {
            let err = evaluator.evaluate(bad, &fact()).unwrap_err();
            assert!(matches!(err, QuotaError::KeyResolution(_)), "{}", bad);
        }
    }

    #[test]
    fn test_parsed_expressions_are_cached() {
        let evaluator = TemplateExpression::new();
        evaluator.evaluate("route", &fact()).unwrap();
        evaluator.evaluate("route", &fact()).unwrap();
        assert_eq!(evaluator.parsed.len(), 1);
    }
}
