//! Client identification.
//!
//! A [`KeyResolver`] turns a [`RequestFact`] and a route's
//! [`RateLimitSpec`](crate::ratelimit::RateLimitSpec) into the key a bucket
//! is stored under, either through a static [`KeyStrategy`] or a named
//! [`RuleEngine`].

mod expression;
mod fact;
mod resolver;
mod rules;

pub use expression::{ExpressionEvaluator, TemplateExpression};
pub use fact::{HttpFact, RequestFact, FORWARDED_FOR_HEADER};
pub use resolver::{KeyResolutionSpec, KeyResolver, KeyStrategy, DEFAULT_KEY_HEADER, KEY_PREFIX};
pub use rules::{
    HeaderRule, HeaderRuleEngine, RuleEngine, RuleEngineError, RuleEngineRegistry, RuleOutcome, RuleSource,
};
