//! Statement tree consumed by the instrumenter and the compiler.
//!
//! Front ends parse source into a [`SyntaxTree`]. Compound statements own
//! nested statement lists; [`Statement::child_blocks_mut`] exposes them
//! uniformly so tree rewrites need one walk rather than one visitor method
//! per statement kind.

use crate::routes::Verb;

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A parsed compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxTree {
    pub file: String,
    pub statements: Vec<Statement>,
}

impl SyntaxTree {
    pub fn new(file: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            file: file.into(),
            statements,
        }
    }

    /// Number of checkpoint statements anywhere in the tree.
    pub fn checkpoint_count(&self) -> usize {
        fn count(block: &[Statement]) -> usize {
            block
                .iter()
                .map(|s| {
                    let own = usize::from(matches!(s.kind, StatementKind::Checkpoint { .. }));
                    own + s.child_blocks().into_iter().map(|b| count(b)).sum::<usize>()
                })
                .sum()
        }
        count(&self.statements)
    }
}

/// One statement with the position of its first token.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub span: Span,
    pub kind: StatementKind,
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// A leaf instruction.
    Instruction(Instruction),
    /// A plain nested block.
    Block(Vec<Statement>),
    If {
        condition: bool,
        then_branch: Vec<Statement>,
        else_branch: Option<Vec<Statement>>,
    },
    /// Bounded (`Some`) or unbounded (`None`) loop.
    Repeat {
        count: Option<u64>,
        body: Vec<Statement>,
    },
    Try {
        body: Vec<Statement>,
        catch_body: Vec<Statement>,
    },
    /// A block bracketed by acquiring and releasing a named resource.
    Scoped {
        resource: String,
        body: Vec<Statement>,
    },
    Switch {
        subject: i64,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Statement>>,
    },
    /// Inserted by the instrumenter: may block on the debugger.
    Checkpoint { file: String, line: u32 },
}

/// One `case` arm of a switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: i64,
    pub body: Vec<Statement>,
}

/// Leaf instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Emit a log line.
    Print(String),
    /// Sleep cooperatively for the given milliseconds.
    Sleep(u64),
    /// Raise a fault with a message.
    Fail(String),
    /// Register a route handler.
    Route(RouteDecl),
    /// End the registration phase early.
    Publish,
}

/// A route registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecl {
    pub verb: Verb,
    pub template: String,
    pub response: ResponseDecl,
}

/// What a declared route answers with.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseDecl {
    /// Plain text with `{param}` / `{body}` substitution.
    Text(String),
    /// JSON text with `{param}` / `{body}` substitution.
    Json(String),
    /// The handler faults with this message.
    Fail(String),
}

impl Statement {
    pub fn new(span: Span, kind: StatementKind) -> Self {
        Self { span, kind }
    }

    /// A checkpoint standing in front of a statement at `file:line`.
    pub fn checkpoint(file: &str, span: Span) -> Self {
        Self {
            span,
            kind: StatementKind::Checkpoint {
                file: file.to_string(),
                line: span.line,
            },
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, StatementKind::Checkpoint { .. })
    }

    /// Whether this is a checkpoint for exactly `file:line`.
    pub fn is_checkpoint_at(&self, file: &str, line: u32) -> bool {
        matches!(&self.kind, StatementKind::Checkpoint { file: f, line: l } if f == file && *l == line)
    }

    /// Nested statement lists, in source order.
    pub fn child_blocks(&self) -> Vec<&Vec<Statement>> {
        match &self.kind {
            StatementKind::Instruction(_) | StatementKind::Checkpoint { .. } => Vec::new(),
            StatementKind::Block(body)
            | StatementKind::Repeat { body, .. }
            | StatementKind::Scoped { body, .. } => vec![body],
            StatementKind::If {
                then_branch,
                else_branch,
                ..
            } => std::iter::once(then_branch).chain(else_branch).collect(),
            StatementKind::Try { body, catch_body } => vec![body, catch_body],
            StatementKind::Switch { cases, default, .. } => cases
                .iter()
                .map(|c| &c.body)
                .chain(default)
                .collect(),
        }
    }

    /// Mutable access to nested statement lists, in source order.
    pub fn child_blocks_mut(&mut self) -> Vec<&mut Vec<Statement>> {
        match &mut self.kind {
            StatementKind::Instruction(_) | StatementKind::Checkpoint { .. } => Vec::new(),
            StatementKind::Block(body)
            | StatementKind::Repeat { body, .. }
            | StatementKind::Scoped { body, .. } => vec![body],
            StatementKind::If {
                then_branch,
                else_branch,
                ..
            } => std::iter::once(then_branch).chain(else_branch).collect(),
            StatementKind::Try { body, catch_body } => vec![body, catch_body],
            StatementKind::Switch { cases, default, .. } => cases
                .iter_mut()
                .map(|c| &mut c.body)
                .chain(default)
                .collect(),
        }
    }
}
