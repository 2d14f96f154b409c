//! Built-in script toolchain.
//!
//! A small line-oriented language that makes the control plane usable end to
//! end without an external compiler:
//!
//! ```text
//! # comments start with '#'
//! route GET /users/{id} => "User {id}"
//! route POST /echo => json {"echo": "{body}"}
//! publish
//! repeat 3 {
//!   print "tick"
//!   sleep 100
//! }
//! loop {
//!   sleep 1000
//! }
//! ```
//!
//! Statements: `print`, `sleep`, `fail`, `route`, `publish`, and the compound
//! forms `repeat n`, `loop`, `if true|false` / `else`, `try` / `catch`,
//! `using "name"`, `switch n` with `case k` / `default`, and bare `{ }`.

mod parser;
mod program;

use crate::routes::RoutePattern;
use crate::syntax::{Instruction, RouteDecl, Statement, StatementKind, SyntaxTree};
use crate::toolchain::{CompileOutput, Diagnostic, Toolchain};
use program::{placeholders, response_text, ScriptProgram, BODY_PLACEHOLDER};
use std::sync::Arc;

/// [`Toolchain`] for sandpit scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptToolchain;

impl ScriptToolchain {
    pub fn new() -> Self {
        Self
    }
}

impl Toolchain for ScriptToolchain {
    fn parse(&self, file: &str, source: &str) -> Result<SyntaxTree, Vec<Diagnostic>> {
        parser::parse(file, source)
    }

    fn compile(&self, tree: &SyntaxTree, references: &[String]) -> CompileOutput {
        let mut diagnostics = Vec::new();
        if !references.is_empty() {
            diagnostics.push(Diagnostic::warning(
                &tree.file,
                1,
                format!("references are not used by scripts: {}", references.join(", ")),
            ));
        }
        check_block(&tree.file, &tree.statements, &mut diagnostics);

        if diagnostics.iter().any(Diagnostic::is_error) {
            return CompileOutput::failure(diagnostics);
        }
        CompileOutput::success(Arc::new(ScriptProgram::new(tree.clone())), diagnostics)
    }
}

fn check_block(file: &str, block: &[Statement], diagnostics: &mut Vec<Diagnostic>) {
    for statement in block {
        if let StatementKind::Instruction(Instruction::Route(decl)) = &statement.kind {
            check_route(file, statement.span.line, decl, diagnostics);
        }
        for child in statement.child_blocks() {
            check_block(file, child, diagnostics);
        }
    }
}

/// Route templates must compile and responses may only name bound values.
fn check_route(file: &str, line: u32, decl: &RouteDecl, diagnostics: &mut Vec<Diagnostic>) {
    let pattern = match RoutePattern::compile(decl.verb, &decl.template) {
        Ok(pattern) => pattern,
        Err(e) => {
            diagnostics.push(Diagnostic::error(file, line, e.to_string()));
            return;
        }
    };

    for name in placeholders(response_text(&decl.response)) {
        let bound = name == BODY_PLACEHOLDER || pattern.parameter_names().iter().any(|p| p == name);
        if !bound {
            diagnostics.push(Diagnostic::error(
                file,
                line,
                format!("unknown placeholder '{{{}}}' in response of {} {}", name, decl.verb, decl.template),
            ));
        }
    }
}
