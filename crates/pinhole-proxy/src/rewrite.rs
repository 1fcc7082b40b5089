//! Traffic rewriting.
//!
//! The pipeline consults a [`Rewriter`] for every request, response and
//! WebSocket frame. [`NoRewrite`] leaves traffic alone; [`RewriteRules`]
//! applies an ordered list of URL-matched rules loaded from JSON.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::message::{Direction, HttpRequest, HttpResponse, Upstream, WebSocketFrame};

/// What to do with a request after rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Send the (possibly modified) request upstream.
    Forward,
    /// Answer locally without contacting the upstream.
    Respond(HttpResponse),
}

/// What to do with a frame after rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Relay the frame.
    Forward,
    /// Swallow the frame.
    Drop,
}

/// Mutation hook consulted by the handler stage.
pub trait Rewriter: Send + Sync {
    /// Inspects or rewrites a request before it is forwarded.
    fn rewrite_request(&self, _upstream: &Upstream, _request: &mut HttpRequest) -> RequestAction {
        RequestAction::Forward
    }

    /// Inspects or rewrites a response before it reaches the client.
    fn rewrite_response(
        &self,
        _upstream: &Upstream,
        _request: &HttpRequest,
        _response: &mut HttpResponse,
    ) {
    }

    /// Inspects or rewrites a WebSocket frame before it is relayed.
    fn rewrite_frame(&self, _direction: Direction, _frame: &mut WebSocketFrame) -> FrameAction {
        FrameAction::Forward
    }
}

/// Rewriter that forwards everything untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRewrite;

impl Rewriter for NoRewrite {}

/// A single rewrite step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RewriteAction {
    /// Set (replace) a request header.
    SetRequestHeader { name: String, value: String },
    /// Remove a request header.
    RemoveRequestHeader { name: String },
    /// Replace the request body.
    ReplaceRequestBody { body: String },
    /// Set (replace) a response header.
    SetResponseHeader { name: String, value: String },
    /// Remove a response header.
    RemoveResponseHeader { name: String },
    /// Replace the response body.
    ReplaceResponseBody { body: String },
    /// Override the response status code.
    SetResponseStatus { status: u16 },
    /// Answer with `302 Found` pointing at `location`.
    Redirect { location: String },
    /// Answer locally with a fixed response.
    Respond {
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: String,
    },
}

/// A URL-matched list of actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Display name.
    pub name: String,
    /// Disabled rules are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// URL pattern; `*` matches any run of characters. Matched
    /// case-insensitively against `scheme://host[:port]/path?query`.
    pub url: String,
    /// Actions applied in order.
    #[serde(default)]
    pub actions: Vec<RewriteAction>,
}

fn default_enabled() -> bool {
    true
}

impl RewriteRule {
    /// Creates an enabled rule with no actions.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            url: url.into(),
            actions: Vec::new(),
        }
    }

    /// Appends an action (builder style).
    pub fn with_action(mut self, action: RewriteAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Sets whether this rule is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn to_regex_pattern(&self) -> String {
        let body = self
            .url
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        format!("(?i)^{body}$")
    }
}

struct CompiledRule {
    rule: RewriteRule,
    pattern: Regex,
}

/// Ordered rule list applied by URL.
pub struct RewriteRules {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for RewriteRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|c| &c.rule.name))
            .finish()
    }
}

impl RewriteRules {
    /// Compiles the rules' URL patterns.
    pub fn new(rules: Vec<RewriteRule>) -> std::result::Result<Self, regex::Error> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.to_regex_pattern())?;
                Ok(CompiledRule { rule, pattern })
            })
            .collect::<std::result::Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Parses a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<RewriteRule> =
            serde_json::from_str(json).map_err(|e| ProxyError::Config(e.to_string()))?;
        Self::new(rules).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Loads a JSON rule file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json(&json)
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn matching<'a>(&'a self, url: &'a str) -> impl Iterator<Item = &'a RewriteRule> + 'a {
        self.rules
            .iter()
            .filter(move |c| c.rule.enabled && c.pattern.is_match(url))
            .map(|c| &c.rule)
    }
}

impl Rewriter for RewriteRules {
    fn rewrite_request(&self, upstream: &Upstream, request: &mut HttpRequest) -> RequestAction {
        let url = upstream.url(request.origin_form());
        for rule in self.matching(&url) {
            tracing::debug!(rule = %rule.name, url = %url, "Rewrite rule matched request");
            for action in &rule.actions {
                match action {
                    RewriteAction::SetRequestHeader { name, value } => {
                        request.headers.insert(name.as_str(), value.as_str());
                    }
                    RewriteAction::RemoveRequestHeader { name } => {
                        request.headers.remove(name);
                    }
                    RewriteAction::ReplaceRequestBody { body } => {
                        request.body = Bytes::from(body.clone());
                    }
                    RewriteAction::Redirect { location } => {
                        return RequestAction::Respond(
                            HttpResponse::new(302)
                                .with_header("Location", location.as_str())
                                .with_body(Bytes::new()),
                        );
                    }
                    RewriteAction::Respond {
                        status,
                        headers,
                        body,
                    } => {
                        let mut response = HttpResponse::new(*status);
                        for (name, value) in headers {
                            response.headers.append(name.as_str(), value.as_str());
                        }
                        return RequestAction::Respond(response.with_body(Bytes::from(body.clone())));
                    }
                    _ => {}
                }
            }
        }
        RequestAction::Forward
    }

    fn rewrite_response(
        &self,
        upstream: &Upstream,
        request: &HttpRequest,
        response: &mut HttpResponse,
    ) {
        let url = upstream.url(request.origin_form());
        for rule in self.matching(&url) {
            for action in &rule.actions {
                match action {
                    RewriteAction::SetResponseHeader { name, value } => {
                        response.headers.insert(name.as_str(), value.as_str());
                    }
                    RewriteAction::RemoveResponseHeader { name } => {
                        response.headers.remove(name);
                    }
                    RewriteAction::ReplaceResponseBody { body } => {
                        response.headers.remove("content-encoding");
                        response.body = Bytes::from(body.clone());
                    }
                    RewriteAction::SetResponseStatus { status } => {
                        response.status = *status;
                        response.reason = crate::message::canonical_reason(*status).to_string();
                    }
                    _ => {}
                }
            }
        }
    }
}
