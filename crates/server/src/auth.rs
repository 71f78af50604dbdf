use std::collections::HashSet;

use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE, REFERER, USER_AGENT},
    HeaderMap, HeaderValue,
};
use tracing::debug;

use crate::config::{AgentRules, AuthConfig, AuthMode};

pub const TOKEN_HEADER: &str = "x-courier-token";
const ACCEPTED_CONTENT_TYPES: [&str; 3] = [
    "application/json",
    "application/x-www-form-urlencoded",
    "text/plain",
];

/// What a gate gets to see of a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub headers: &'a HeaderMap,
}

impl<'a> RequestMeta<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self { headers }
    }

    fn header(&self, name: impl axum::http::header::AsHeaderName) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

pub trait AuthGate: Send + Sync {
    fn is_trusted_caller(&self, meta: &RequestMeta<'_>) -> bool;
}

/// Bearer tokens for dashboards. An empty token set trusts everyone.
#[derive(Debug, Clone)]
pub struct TokenGate {
    tokens: HashSet<String>,
}

impl TokenGate {
    pub fn new(tokens: HashSet<String>) -> Self {
        Self { tokens }
    }

    fn validate(&self, header: Option<&HeaderValue>) -> bool {
        let raw = match header.and_then(|value| value.to_str().ok()) {
            Some(value) => value.trim(),
            None => return false,
        };

        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();

        self.tokens.contains(token)
    }
}

impl AuthGate for TokenGate {
    fn is_trusted_caller(&self, meta: &RequestMeta<'_>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        self.validate(meta.headers.get(AUTHORIZATION))
            || self.validate(meta.headers.get(TOKEN_HEADER))
    }
}

/// Header screening for game agents.
#[derive(Debug, Clone)]
pub struct AgentGate {
    rules: AgentRules,
}

impl AgentGate {
    pub fn new(rules: AgentRules) -> Self {
        Self { rules }
    }
}

impl AuthGate for AgentGate {
    fn is_trusted_caller(&self, meta: &RequestMeta<'_>) -> bool {
        let rules = &self.rules;

        let user_agent = meta.header(USER_AGENT).unwrap_or_default();
        if !rules
            .user_agents
            .iter()
            .any(|allowed| user_agent.contains(allowed.as_str()))
        {
            debug!(user_agent, "Rejected: user agent not allowed");
            return false;
        }

        if rules
            .blocked_agents
            .iter()
            .any(|blocked| user_agent.contains(blocked.as_str()))
        {
            debug!(user_agent, "Rejected: automation user agent");
            return false;
        }

        if let Some(header) = rules
            .blocked_headers
            .iter()
            .find(|name| meta.headers.contains_key(name.as_str()))
        {
            debug!(header = %header, "Rejected: blocked header present");
            return false;
        }

        let content_type = meta.header(CONTENT_TYPE).unwrap_or_default();
        if !ACCEPTED_CONTENT_TYPES
            .iter()
            .any(|accepted| content_type.contains(accepted))
        {
            debug!(content_type, "Rejected: content type");
            return false;
        }

        if let Some(referer) = meta.header(REFERER) {
            if !rules
                .allowed_referers
                .iter()
                .any(|allowed| referer.contains(allowed.as_str()))
            {
                debug!(referer, "Rejected: referer");
                return false;
            }
        }

        true
    }
}

/// Trusted if any member trusts the caller.
pub struct AnyOf(pub Vec<Box<dyn AuthGate>>);

impl AuthGate for AnyOf {
    fn is_trusted_caller(&self, meta: &RequestMeta<'_>) -> bool {
        self.0.iter().any(|gate| gate.is_trusted_caller(meta))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl AuthGate for OpenGate {
    fn is_trusted_caller(&self, _meta: &RequestMeta<'_>) -> bool {
        true
    }
}

pub fn build_gate(config: &AuthConfig) -> Box<dyn AuthGate> {
    match config.mode {
        AuthMode::Off => Box::new(OpenGate),
        AuthMode::Tokens => Box::new(TokenGate::new(config.tokens.clone())),
        AuthMode::Agent => Box::new(AgentGate::new(config.agent.clone())),
        AuthMode::Any => {
            let agent: Box<dyn AuthGate> = Box::new(AgentGate::new(config.agent.clone()));
            if config.tokens.is_empty() {
                agent
            } else {
                Box::new(AnyOf(vec![
                    Box::new(TokenGate::new(config.tokens.clone())),
                    agent,
                ]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn studio() -> Vec<(&'static str, &'static str)> {
        vec![
            ("user-agent", "Roblox/WinInet RobloxStudio/0.600"),
            ("content-type", "application/json"),
        ]
    }

    #[test]
    fn token_gate_accepts_bearer_and_custom_header() {
        let gate = TokenGate::new(HashSet::from(["s3cret".to_string()]));
        let bearer = headers(&[("authorization", "Bearer s3cret")]);
        let custom = headers(&[("x-courier-token", "s3cret")]);
        let wrong = headers(&[("authorization", "Bearer nope")]);

        assert!(gate.is_trusted_caller(&RequestMeta::new(&bearer)));
        assert!(gate.is_trusted_caller(&RequestMeta::new(&custom)));
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&wrong)));
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&HeaderMap::new())));
    }

    #[test]
    fn empty_token_set_trusts_everyone() {
        let gate = TokenGate::new(HashSet::new());
        assert!(gate.is_trusted_caller(&RequestMeta::new(&HeaderMap::new())));
    }

    #[test]
    fn agent_gate_screens_headers() {
        let gate = AgentGate::new(AgentRules::default());
        assert!(gate.is_trusted_caller(&RequestMeta::new(&headers(&studio()))));

        let mut postman = studio();
        postman.push(("postman-token", "abc"));
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&headers(&postman))));

        let curl = headers(&[
            ("user-agent", "curl/8.0 RobloxApp"),
            ("content-type", "application/json"),
        ]);
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&curl)));

        let mut foreign = studio();
        foreign.push(("referer", "https://evil.example"));
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&headers(&foreign))));

        let mut local = studio();
        local.push(("referer", "http://localhost:3000/"));
        assert!(gate.is_trusted_caller(&RequestMeta::new(&headers(&local))));

        let no_content_type = headers(&[("user-agent", "RobloxStudio")]);
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&no_content_type)));
    }

    #[test]
    fn any_mode_lets_tokens_or_agents_through() {
        let config = AuthConfig {
            mode: AuthMode::Any,
            tokens: HashSet::from(["dash".to_string()]),
            agent: AgentRules::default(),
        };
        let gate = build_gate(&config);

        let dashboard = headers(&[("authorization", "Bearer dash")]);
        assert!(gate.is_trusted_caller(&RequestMeta::new(&dashboard)));
        assert!(gate.is_trusted_caller(&RequestMeta::new(&headers(&studio()))));
        assert!(!gate.is_trusted_caller(&RequestMeta::new(&HeaderMap::new())));
    }
}
