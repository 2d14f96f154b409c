//! Tree-walking interpreter for compiled scripts.

use crate::error::Fault;
use crate::program::{EntryPoint, ProgramHost};
use crate::routes::{Handler, HandlerResult};
use crate::syntax::{Instruction, ResponseDecl, RouteDecl, Statement, StatementKind, SyntaxTree};
use std::time::Duration;

/// Placeholder name bound to the request body in response templates.
pub(crate) const BODY_PLACEHOLDER: &str = "body";

/// A compiled script: the instrumented tree plus nothing else.
#[derive(Debug)]
pub(crate) struct ScriptProgram {
    tree: SyntaxTree,
}

impl ScriptProgram {
    pub fn new(tree: SyntaxTree) -> Self {
        Self { tree }
    }
}

impl EntryPoint for ScriptProgram {
    fn main(&self, host: &mut ProgramHost) -> Result<(), Fault> {
        tracing::debug!(file = %self.tree.file, "Script started");
        run_block(&self.tree.statements, host)
    }
}

fn run_block(block: &[Statement], host: &mut ProgramHost) -> Result<(), Fault> {
    for statement in block {
        run_statement(statement, host)?;
    }
    Ok(())
}

fn run_statement(statement: &Statement, host: &mut ProgramHost) -> Result<(), Fault> {
    match &statement.kind {
        StatementKind::Instruction(instruction) => run_instruction(instruction, host),
        StatementKind::Block(body) => run_block(body, host),
        StatementKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            if *condition {
                run_block(then_branch, host)
            } else if let Some(else_branch) = else_branch {
                run_block(else_branch, host)
            } else {
                Ok(())
            }
        }
        StatementKind::Repeat {
            count: Some(count),
            body,
        } => {
            for _ in 0..*count {
                host.check_cancelled()?;
                run_block(body, host)?;
            }
            Ok(())
        }
        StatementKind::Repeat { count: None, body } => loop {
            host.check_cancelled()?;
            run_block(body, host)?;
            std::thread::yield_now();
        },
        StatementKind::Try { body, catch_body } => match run_block(body, host) {
            Err(Fault::Cancelled) => Err(Fault::Cancelled),
            Err(fault) => {
                tracing::debug!(line = statement.span.line, error = %fault, "Fault caught");
                run_block(catch_body, host)
            }
            Ok(()) => Ok(()),
        },
        StatementKind::Scoped { resource, body } => {
            tracing::debug!(resource = %resource, "Resource acquired");
            let result = run_block(body, host);
            tracing::debug!(resource = %resource, "Resource released");
            result
        }
        StatementKind::Switch {
            subject,
            cases,
            default,
        } => match cases.iter().find(|case| case.value == *subject) {
            Some(case) => run_block(&case.body, host),
            None => match default {
                Some(body) => run_block(body, host),
                None => Ok(()),
            },
        },
        StatementKind::Checkpoint { file, line } => host.checkpoint(file, *line),
    }
}

fn run_instruction(instruction: &Instruction, host: &mut ProgramHost) -> Result<(), Fault> {
    match instruction {
        Instruction::Print(text) => {
            host.log(text.clone());
            Ok(())
        }
        Instruction::Sleep(ms) => host.sleep(Duration::from_millis(*ms)),
        Instruction::Fail(message) => Err(Fault::Raised(message.clone())),
        Instruction::Route(decl) => {
            host.map_typed(decl.verb, &decl.template, response_type(&decl.response), handler_for(decl))
        }
        Instruction::Publish => {
            host.publish_routes();
            Ok(())
        }
    }
}

fn response_type(response: &ResponseDecl) -> &'static str {
    match response {
        ResponseDecl::Json(_) => "application/json",
        ResponseDecl::Text(_) | ResponseDecl::Fail(_) => "text/plain",
    }
}

/// Pick the handler shape from what the route template and response mention.
pub(crate) fn handler_for(decl: &RouteDecl) -> Handler {
    let has_params = !placeholders(&decl.template).is_empty();
    let wants_body = placeholders(response_text(&decl.response)).contains(&BODY_PLACEHOLDER);
    let response = decl.response.clone();

    match (has_params, wants_body) {
        (false, false) => Handler::no_args(move || respond(&response, |_: &str| None)),
        (false, true) => Handler::with_body(move |body| {
            respond(&response, |name: &str| {
                (name == BODY_PLACEHOLDER).then(|| body.to_string())
            })
        }),
        (true, false) => Handler::with_params(move |params| {
            respond(&response, |name: &str| params.get(name).map(str::to_string))
        }),
        (true, true) => Handler::with_params_and_body(move |params, body| {
            respond(&response, |name: &str| {
                if name == BODY_PLACEHOLDER {
                    Some(body.to_string())
                } else {
                    params.get(name).map(str::to_string)
                }
            })
        }),
    }
}

pub(crate) fn response_text(response: &ResponseDecl) -> &str {
    match response {
        ResponseDecl::Text(text) | ResponseDecl::Json(text) | ResponseDecl::Fail(text) => text,
    }
}

fn respond(response: &ResponseDecl, lookup: impl Fn(&str) -> Option<String>) -> HandlerResult {
    match response {
        ResponseDecl::Text(text) | ResponseDecl::Json(text) => Ok(render(text, lookup)),
        ResponseDecl::Fail(message) => Err(Fault::Raised(render(message, lookup))),
    }
}

/// Substitute `{name}` placeholders. Unknown names and non-identifier
/// braces (such as JSON objects) are left as written.
pub(crate) fn render(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_identifier(&after[..end]) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Identifier placeholders mentioned in `text`, in order.
pub(crate) fn placeholders(text: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_identifier(&after[..end]) => {
                names.push(&after[..end]);
                rest = &after[end + 1..];
            }
            _ => rest = after,
        }
    }
    names
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
