//! Route table for service-style programs.
//!
//! A running program registers handlers against path templates such as
//! `/users/{id}`. Templates are compiled once into a [`RoutePattern`] and
//! matched segment by segment against synthetic requests. The first pattern
//! that matches, in registration order, handles the request.

use crate::error::{Fault, RouteError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Content type reported for handlers registered without an explicit one.
pub const DEFAULT_RESPONSE_TYPE: &str = "text/plain";

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Verb {
    /// Parse a verb (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, RouteError> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(RouteError::UnknownVerb(s.to_string())),
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    /// Whether requests with this verb conventionally carry a body.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled path template bound to a verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    template: String,
    verb: Verb,
    segments: Vec<Segment>,
    parameter_names: Vec<String>,
}

impl RoutePattern {
    /// Compile a template made of literal segments and `{name}` placeholders.
    pub fn compile(verb: Verb, template: &str) -> Result<Self, RouteError> {
        if !template.starts_with('/') {
            return Err(RouteError::MissingLeadingSlash(template.to_string()));
        }

        let raw_segments = path_segments(template)
            .ok_or_else(|| RouteError::EmptySegment(template.to_string()))?;

        let mut segments = Vec::new();
        let mut parameter_names: Vec<String> = Vec::new();
        for raw in raw_segments {
            if let Some(inner) = raw.strip_prefix('{') {
                let name = inner.strip_suffix('}').unwrap_or_default();
                if !is_parameter_name(name) {
                    return Err(RouteError::MalformedPlaceholder {
                        template: template.to_string(),
                        segment: raw.to_string(),
                    });
                }
                if parameter_names.iter().any(|n| n == name) {
                    return Err(RouteError::DuplicateParameter {
                        template: template.to_string(),
                        name: name.to_string(),
                    });
                }
                parameter_names.push(name.to_string());
                segments.push(Segment::Param(name.to_string()));
            } else if raw.contains('{') || raw.contains('}') {
                return Err(RouteError::MalformedPlaceholder {
                    template: template.to_string(),
                    segment: raw.to_string(),
                });
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        Ok(Self {
            template: template.to_string(),
            verb,
            segments,
            parameter_names,
        })
    }

    /// The template this pattern was compiled from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The verb this pattern answers to.
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Placeholder names in declaration order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// Number of path segments a request must have to match.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Match a request, returning the bound parameters on success.
    ///
    /// Paths are not normalized: a request with an empty segment (`//`, a
    /// trailing `/`) or without a leading `/` matches nothing.
    pub fn matches(&self, verb: Verb, path: &str) -> Option<RouteParams> {
        if verb != self.verb {
            return None;
        }
        let parts = path_segments(strip_query(path))?;
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = RouteParams::default();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push(name.clone(), part.to_string()),
            }
        }
        Some(params)
    }
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(p, _)| p)
}

/// Segments of an absolute path; `/` has none. `None` when the leading slash
/// is missing or any segment is empty.
fn path_segments(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

fn is_parameter_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Path parameters bound by a match, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteParams(Vec<(String, String)>);

impl RouteParams {
    fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    /// Look a parameter up by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Positional values.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    /// `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a handler returns: a response body or a fault.
pub type HandlerResult = Result<String, Fault>;

type NoArgsFn = dyn Fn() -> HandlerResult + Send + Sync;
type BodyFn = dyn Fn(&str) -> HandlerResult + Send + Sync;
type ParamsFn = dyn Fn(&RouteParams, Option<&str>) -> HandlerResult + Send + Sync;

/// A registered handler, tagged by the shape of arguments it accepts.
///
/// The shape is fixed at registration so dispatch is a plain match.
#[derive(Clone)]
pub enum Handler {
    /// Takes nothing.
    NoArgs(Arc<NoArgsFn>),
    /// Takes the request body only.
    Body(Arc<BodyFn>),
    /// Takes path parameters and, when `wants_body` is set, the body.
    Params {
        wants_body: bool,
        call: Arc<ParamsFn>,
    },
}

impl Handler {
    pub fn no_args(f: impl Fn() -> HandlerResult + Send + Sync + 'static) -> Self {
        Self::NoArgs(Arc::new(f))
    }

    pub fn with_body(f: impl Fn(&str) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self::Body(Arc::new(f))
    }

    pub fn with_params(f: impl Fn(&RouteParams) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self::Params {
            wants_body: false,
            call: Arc::new(move |params, _| f(params)),
        }
    }

    pub fn with_params_and_body(
        f: impl Fn(&RouteParams, &str) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self::Params {
            wants_body: true,
            call: Arc::new(move |params, body| f(params, body.unwrap_or_default())),
        }
    }

    /// Whether the handler's shape includes a body argument.
    pub fn wants_body(&self) -> bool {
        match self {
            Self::NoArgs(_) => false,
            Self::Body(_) => true,
            Self::Params { wants_body, .. } => *wants_body,
        }
    }

    fn invoke(&self, params: &RouteParams, body: Option<&str>) -> HandlerResult {
        match self {
            Self::NoArgs(f) => f(),
            Self::Body(f) => f(body.unwrap_or_default()),
            Self::Params { call, .. } => call(params, body),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoArgs(_) => write!(f, "Handler::NoArgs"),
            Self::Body(_) => write!(f, "Handler::Body"),
            Self::Params { wants_body, .. } => {
                write!(f, "Handler::Params {{ wants_body: {} }}", wants_body)
            }
        }
    }
}

/// A registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: RoutePattern,
    handler: Handler,
    response_type: String,
}

impl Route {
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    /// Public description used for discovery reporting.
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            pattern: self.pattern.template.clone(),
            verb: self.pattern.verb,
            response_type: self.response_type.clone(),
        }
    }
}

/// Discovery record for a registered route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub pattern: String,
    pub verb: Verb,
    pub response_type: String,
}

/// A successful match: the route plus bound parameters.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: RouteParams,
}

/// Result of dispatching a request through the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler produced a body.
    Handled { body: String, response_type: String },
    /// No pattern matched the verb and path.
    NotFound,
    /// The matching handler faulted.
    Faulted(Fault),
}

/// Ordered collection of routes registered by one program execution.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    latest_body: Mutex<Option<String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with the default response type.
    pub fn register(&mut self, verb: Verb, template: &str, handler: Handler) -> Result<(), RouteError> {
        self.register_typed(verb, template, DEFAULT_RESPONSE_TYPE, handler)
    }

    /// Register a handler that reports `response_type` on discovery.
    pub fn register_typed(
        &mut self,
        verb: Verb,
        template: &str,
        response_type: &str,
        handler: Handler,
    ) -> Result<(), RouteError> {
        let pattern = RoutePattern::compile(verb, template)?;
        if matches!(handler, Handler::Params { .. }) && pattern.parameter_names.is_empty() {
            return Err(RouteError::ShapeMismatch(template.to_string()));
        }
        tracing::debug!(
            verb = %verb,
            template = %template,
            params = pattern.parameter_names.len(),
            "Route registered"
        );
        self.routes.push(Route {
            pattern,
            handler,
            response_type: response_type.to_string(),
        });
        Ok(())
    }

    /// Find the first route matching `verb` and `path`.
    pub fn match_route(&self, verb: Verb, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            route
                .pattern
                .matches(verb, path)
                .map(|params| RouteMatch { route, params })
        })
    }

    /// Route a request to its handler.
    ///
    /// Handler panics are caught and reported as [`Fault::Panicked`].
    pub fn dispatch(&self, verb: Verb, path: &str, body: Option<&str>) -> DispatchOutcome {
        let ambient = self.ambient_body(verb, body);

        let Some(RouteMatch { route, params }) = self.match_route(verb, path) else {
            tracing::debug!(verb = %verb, path = %path, "No route matched");
            return DispatchOutcome::NotFound;
        };

        let body = if route.handler.wants_body() {
            body.map(str::to_string).or(ambient)
        } else {
            None
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            route.handler.invoke(&params, body.as_deref())
        }))
        .unwrap_or_else(|payload| Err(Fault::from_panic(payload)));

        match result {
            Ok(body) => DispatchOutcome::Handled {
                body,
                response_type: route.response_type.clone(),
            },
            Err(fault) => {
                tracing::debug!(template = %route.pattern.template, error = %fault, "Handler faulted");
                DispatchOutcome::Faulted(fault)
            }
        }
    }

    /// Record the body of body-carrying requests and return the latest one.
    fn ambient_body(&self, verb: Verb, body: Option<&str>) -> Option<String> {
        let mut latest = self
            .latest_body
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if verb.carries_body() {
            *latest = Some(body.unwrap_or_default().to_string());
        }
        latest.clone()
    }

    /// Body of the most recent POST/PUT/PATCH request, if any.
    pub fn latest_body(&self) -> Option<String> {
        self.latest_body
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Registered routes in insertion order.
    pub fn describe(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(Route::info).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &'static str) -> Handler {
        Handler::no_args(move || Ok(s.to_string()))
    }

    #[test]
    fn test_verb_parsing() {
        assert_eq!(Verb::parse("get").unwrap(), Verb::Get);
        assert_eq!("PATCH".parse::<Verb>().unwrap(), Verb::Patch);
        assert!(Verb::parse("FETCH").is_err());
        assert!(Verb::Post.carries_body());
        assert!(!Verb::Delete.carries_body());
    }

    #[test]
    fn test_compile_template() {
        let pattern = RoutePattern::compile(Verb::Get, "/users/{id}/posts/{post_id}").unwrap();
        assert_eq!(pattern.segment_count(), 4);
        assert_eq!(pattern.parameter_names(), ["id", "post_id"]);
    }

    #[test]
    fn test_compile_rejects_duplicates_and_malformed() {
        assert_eq!(
            RoutePattern::compile(Verb::Get, "/a/{id}/b/{id}"),
            Err(RouteError::DuplicateParameter {
                template: "/a/{id}/b/{id}".into(),
                name: "id".into()
            })
        );
        assert!(matches!(
            RoutePattern::compile(Verb::Get, "/a/{id"),
            Err(RouteError::MalformedPlaceholder { .. })
        ));
        assert!(matches!(
            RoutePattern::compile(Verb::Get, "/a/x{id}"),
            Err(RouteError::MalformedPlaceholder { .. })
        ));
        assert!(RoutePattern::compile(Verb::Get, "users").is_err());
    }

    #[test]
    fn test_match_determinism() {
        let mut table = RouteTable::new();
        table
            .register(
                Verb::Get,
                "/users/{id}",
                Handler::with_params(|p| Ok(format!("user {}", p.get("id").unwrap_or("?")))),
            )
            .unwrap();

        let m = table.match_route(Verb::Get, "/users/42").expect("should match");
        assert_eq!(m.params.get("id"), Some("42"));
        assert!(table.match_route(Verb::Post, "/users/42").is_none());
        assert!(table.match_route(Verb::Get, "/users/42/extra").is_none());
        assert!(table.match_route(Verb::Get, "/Users/42").is_none());
    }

    #[test]
    fn test_empty_segments_never_match() {
        let mut table = RouteTable::new();
        table
            .register(
                Verb::Get,
                "/users/{id}",
                Handler::with_params(|p| Ok(p.get("id").unwrap_or_default().to_string())),
            )
            .unwrap();

        assert!(table.match_route(Verb::Get, "/users//42").is_none());
        assert!(table.match_route(Verb::Get, "/users/42/").is_none());
        assert!(table.match_route(Verb::Get, "users/42").is_none());
        assert!(table.match_route(Verb::Get, "/users/42").is_some());

        assert_eq!(
            RoutePattern::compile(Verb::Get, "/a//b"),
            Err(RouteError::EmptySegment("/a//b".into()))
        );
        assert_eq!(
            RoutePattern::compile(Verb::Get, "/a/"),
            Err(RouteError::EmptySegment("/a/".into()))
        );
    }

    #[test]
    fn test_root_and_query() {
        let mut table = RouteTable::new();
        table.register(Verb::Get, "/", text("Hello World!")).unwrap();

        assert_eq!(
            table.dispatch(Verb::Get, "/?q=1", None),
            DispatchOutcome::Handled {
                body: "Hello World!".into(),
                response_type: DEFAULT_RESPONSE_TYPE.into()
            }
        );
        assert_eq!(table.dispatch(Verb::Delete, "/", None), DispatchOutcome::NotFound);
    }

    #[test]
    fn test_first_registration_wins() {
        let mut table = RouteTable::new();
        table.register(Verb::Get, "/items/new", text("literal")).unwrap();
        table
            .register(Verb::Get, "/items/{id}", Handler::with_params(|_| Ok("param".into())))
            .unwrap();

        match table.dispatch(Verb::Get, "/items/new", None) {
            DispatchOutcome::Handled { body, .. } => assert_eq!(body, "literal"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_params_handler_requires_placeholders() {
        let mut table = RouteTable::new();
        let err = table
            .register(Verb::Get, "/plain", Handler::with_params(|_| Ok(String::new())))
            .unwrap_err();
        assert_eq!(err, RouteError::ShapeMismatch("/plain".into()));
    }

    #[test]
    fn test_body_injection() {
        let mut table = RouteTable::new();
        table
            .register(Verb::Post, "/echo", Handler::with_body(|b| Ok(b.to_uppercase())))
            .unwrap();
        table
            .register(
                Verb::Put,
                "/items/{id}",
                Handler::with_params_and_body(|p, b| {
                    Ok(format!("{}={}", p.get("id").unwrap_or_default(), b))
                }),
            )
            .unwrap();
        table
            .register(Verb::Get, "/last", Handler::with_body(|b| Ok(b.to_string())))
            .unwrap();

        match table.dispatch(Verb::Post, "/echo", Some("hi")) {
            DispatchOutcome::Handled { body, .. } => assert_eq!(body, "HI"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        match table.dispatch(Verb::Put, "/items/7", Some("blue")) {
            DispatchOutcome::Handled { body, .. } => assert_eq!(body, "7=blue"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        // GET carries no body, so the ambient body from the last PUT is injected
        match table.dispatch(Verb::Get, "/last", None) {
            DispatchOutcome::Handled { body, .. } => assert_eq!(body, "blue"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(table.latest_body().as_deref(), Some("blue"));
    }

    #[test]
    fn test_handler_faults_are_contained() {
        let mut table = RouteTable::new();
        table
            .register(Verb::Get, "/raise", Handler::no_args(|| Err(Fault::Raised("nope".into()))))
            .unwrap();
        table
            .register(Verb::Get, "/panic", Handler::no_args(|| panic!("handler exploded")))
            .unwrap();

        assert_eq!(
            table.dispatch(Verb::Get, "/raise", None),
            DispatchOutcome::Faulted(Fault::Raised("nope".into()))
        );
        assert_eq!(
            table.dispatch(Verb::Get, "/panic", None),
            DispatchOutcome::Faulted(Fault::Panicked("handler exploded".into()))
        );
    }

    #[test]
    fn test_describe_preserves_order() {
        let mut table = RouteTable::new();
        table.register(Verb::Get, "/b", text("b")).unwrap();
        table
            .register_typed(Verb::Post, "/a", "application/json", text("{}"))
            .unwrap();

        let routes = table.describe();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].pattern, "/b");
        assert_eq!(routes[1].verb, Verb::Post);
        assert_eq!(routes[1].response_type, "application/json");
    }
}
