//! Line-oriented parser for sandpit scripts.
//!
//! One statement per line. Compound statements open with a trailing `{` and
//! close with a lone `}`; `} else {` and `} catch {` switch branches.

use crate::routes::Verb;
use crate::syntax::{
    Instruction, ResponseDecl, RouteDecl, Span, Statement, StatementKind, SwitchCase, SyntaxTree,
};
use crate::toolchain::Diagnostic;
use std::str::FromStr;

/// Parse `source` into a syntax tree, or every error found.
pub(crate) fn parse(file: &str, source: &str) -> Result<SyntaxTree, Vec<Diagnostic>> {
    let mut parser = Parser::new(file);
    for (index, line) in source.lines().enumerate() {
        parser.line(index as u32 + 1, line);
    }
    parser.finish()
}

#[derive(Debug)]
enum FrameKind {
    Root,
    Block,
    If {
        condition: bool,
        then_branch: Option<Vec<Statement>>,
    },
    Repeat {
        count: Option<u64>,
    },
    Try {
        body: Option<Vec<Statement>>,
    },
    Scoped {
        resource: String,
    },
    Switch {
        subject: i64,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Statement>>,
    },
    Case {
        value: i64,
    },
    Default,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    span: Span,
    statements: Vec<Statement>,
}

struct Parser<'a> {
    file: &'a str,
    frames: Vec<Frame>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    fn new(file: &'a str) -> Self {
        Self {
            file,
            frames: vec![Frame {
                kind: FrameKind::Root,
                span: Span::new(1, 1),
                statements: Vec::new(),
            }],
            diagnostics: Vec::new(),
        }
    }

    fn line(&mut self, number: u32, raw: &str) {
        let code = strip_comment(raw);
        let text = code.trim();
        if text.is_empty() {
            return;
        }
        let column = (code.len() - code.trim_start().len()) as u32 + 1;
        if let Err(message) = self.statement(Span::new(number, column), text) {
            self.diagnostics
                .push(Diagnostic::error(self.file, number, message));
        }
    }

    fn statement(&mut self, span: Span, text: &str) -> Result<(), String> {
        if text == "}" {
            return self.close();
        }
        if let Some(rest) = text.strip_prefix('}') {
            return self.continue_block(rest.trim());
        }
        if self.in_switch() {
            return self.switch_arm(span, text);
        }

        let (keyword, rest) = split_keyword(text);
        match keyword {
            "print" | "sleep" | "fail" | "route" | "publish" => {
                let instruction = parse_instruction(keyword, rest)?;
                self.push(Statement::new(span, StatementKind::Instruction(instruction)));
                Ok(())
            }
            _ => match text.strip_suffix('{') {
                Some(header) => self.open(span, header.trim()),
                None => Err(format!("unknown statement '{}'", keyword)),
            },
        }
    }

    fn open(&mut self, span: Span, header: &str) -> Result<(), String> {
        let (keyword, arg) = split_keyword(header);
        let kind = match keyword {
            "" => FrameKind::Block,
            "repeat" => FrameKind::Repeat {
                count: Some(parse_number(arg, "repeat count")?),
            },
            "loop" => {
                expect_no_argument("loop", arg)?;
                FrameKind::Repeat { count: None }
            }
            "if" => FrameKind::If {
                condition: parse_bool(arg)?,
                then_branch: None,
            },
            "try" => {
                expect_no_argument("try", arg)?;
                FrameKind::Try { body: None }
            }
            "using" => FrameKind::Scoped {
                resource: parse_string(arg)?,
            },
            "switch" => FrameKind::Switch {
                subject: parse_number(arg, "switch subject")?,
                cases: Vec::new(),
                default: None,
            },
            other => return Err(format!("unknown block statement '{}'", other)),
        };
        self.frames.push(Frame {
            kind,
            span,
            statements: Vec::new(),
        });
        Ok(())
    }

    fn switch_arm(&mut self, span: Span, text: &str) -> Result<(), String> {
        let header = text
            .strip_suffix('{')
            .ok_or_else(|| "expected 'case <n> {' or 'default {' inside switch".to_string())?;
        let (keyword, arg) = split_keyword(header.trim());
        let kind = match keyword {
            "case" => FrameKind::Case {
                value: parse_number(arg, "case value")?,
            },
            "default" => {
                expect_no_argument("default", arg)?;
                FrameKind::Default
            }
            _ => return Err("expected 'case <n> {' or 'default {' inside switch".into()),
        };
        self.frames.push(Frame {
            kind,
            span,
            statements: Vec::new(),
        });
        Ok(())
    }

    /// Handle `} else {` and `} catch {`.
    fn continue_block(&mut self, rest: &str) -> Result<(), String> {
        let keyword = rest
            .strip_suffix('{')
            .map(str::trim)
            .ok_or_else(|| format!("unexpected '{}' after '}}'", rest))?;
        let Some(frame) = self.frames.last_mut() else {
            return Err("unmatched '}'".into());
        };
        match (keyword, &mut frame.kind) {
            ("else", FrameKind::If { then_branch, .. }) if then_branch.is_none() => {
                *then_branch = Some(std::mem::take(&mut frame.statements));
                Ok(())
            }
            ("catch", FrameKind::Try { body }) if body.is_none() => {
                *body = Some(std::mem::take(&mut frame.statements));
                Ok(())
            }
            ("else", _) => Err("'else' without a matching 'if'".into()),
            ("catch", _) => Err("'catch' without a matching 'try'".into()),
            (other, _) => Err(format!("unexpected '{}' after '}}'", other)),
        }
    }

    fn close(&mut self) -> Result<(), String> {
        if self.frames.len() <= 1 {
            return Err("unmatched '}'".into());
        }
        let Some(Frame {
            kind,
            span,
            statements,
        }) = self.frames.pop()
        else {
            return Err("unmatched '}'".into());
        };

        let kind = match kind {
            FrameKind::Case { value } => return self.attach_case(value, statements),
            FrameKind::Default => return self.attach_default(statements),
            FrameKind::Root => return Err("unmatched '}'".into()),
            FrameKind::Block => StatementKind::Block(statements),
            FrameKind::If {
                condition,
                then_branch: None,
            } => StatementKind::If {
                condition,
                then_branch: statements,
                else_branch: None,
            },
            FrameKind::If {
                condition,
                then_branch: Some(then_branch),
            } => StatementKind::If {
                condition,
                then_branch,
                else_branch: Some(statements),
            },
            FrameKind::Repeat { count } => StatementKind::Repeat {
                count,
                body: statements,
            },
            FrameKind::Try { body: None } => StatementKind::Try {
                body: statements,
                catch_body: Vec::new(),
            },
            FrameKind::Try { body: Some(body) } => StatementKind::Try {
                body,
                catch_body: statements,
            },
            FrameKind::Scoped { resource } => StatementKind::Scoped {
                resource,
                body: statements,
            },
            FrameKind::Switch {
                subject,
                cases,
                default,
            } => StatementKind::Switch {
                subject,
                cases,
                default,
            },
        };
        self.push(Statement::new(span, kind));
        Ok(())
    }

    fn attach_case(&mut self, value: i64, body: Vec<Statement>) -> Result<(), String> {
        match self.frames.last_mut().map(|f| &mut f.kind) {
            Some(FrameKind::Switch { cases, .. }) => {
                if cases.iter().any(|c| c.value == value) {
                    return Err(format!("duplicate case {}", value));
                }
                cases.push(SwitchCase { value, body });
                Ok(())
            }
            _ => Err("'case' outside of switch".into()),
        }
    }

    fn attach_default(&mut self, body: Vec<Statement>) -> Result<(), String> {
        match self.frames.last_mut().map(|f| &mut f.kind) {
            Some(FrameKind::Switch { default, .. }) => {
                if default.is_some() {
                    return Err("duplicate default".into());
                }
                *default = Some(body);
                Ok(())
            }
            _ => Err("'default' outside of switch".into()),
        }
    }

    fn in_switch(&self) -> bool {
        matches!(
            self.frames.last().map(|f| &f.kind),
            Some(FrameKind::Switch { .. })
        )
    }

    fn push(&mut self, statement: Statement) {
        if let Some(frame) = self.frames.last_mut() {
            frame.statements.push(statement);
        }
    }

    fn finish(mut self) -> Result<SyntaxTree, Vec<Diagnostic>> {
        while self.frames.len() > 1 {
            if let Some(frame) = self.frames.pop() {
                self.diagnostics
                    .push(Diagnostic::error(self.file, frame.span.line, "unclosed block"));
            }
        }
        if !self.diagnostics.is_empty() {
            self.diagnostics.sort_by_key(|d| d.line);
            return Err(self.diagnostics);
        }
        let statements = self
            .frames
            .pop()
            .map(|root| root.statements)
            .unwrap_or_default();
        Ok(SyntaxTree::new(self.file, statements))
    }
}

fn parse_instruction(keyword: &str, rest: &str) -> Result<Instruction, String> {
    match keyword {
        "print" => Ok(Instruction::Print(parse_string(rest)?)),
        "sleep" => Ok(Instruction::Sleep(parse_number(rest, "sleep duration")?)),
        "fail" => Ok(Instruction::Fail(parse_string(rest)?)),
        "publish" => {
            expect_no_argument("publish", rest)?;
            Ok(Instruction::Publish)
        }
        "route" => parse_route(rest).map(Instruction::Route),
        other => Err(format!("unknown statement '{}'", other)),
    }
}

/// `<VERB> <template> => "text" | json <text> | fail "message"`
fn parse_route(rest: &str) -> Result<RouteDecl, String> {
    let (target, response) = rest
        .split_once("=>")
        .ok_or_else(|| "expected 'route <VERB> <template> => <response>'".to_string())?;

    let mut parts = target.split_whitespace();
    let (Some(verb), Some(template), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected 'route <VERB> <template> => <response>'".into());
    };
    let verb = Verb::parse(verb).map_err(|e| e.to_string())?;

    let response = response.trim();
    let response = if response.starts_with('"') {
        ResponseDecl::Text(parse_string(response)?)
    } else {
        match split_keyword(response) {
            ("json", text) if !text.is_empty() => ResponseDecl::Json(text.to_string()),
            ("json", _) => return Err("json response needs a body".into()),
            ("fail", message) => ResponseDecl::Fail(parse_string(message)?),
            _ => return Err("expected a quoted response, 'json <text>' or 'fail \"message\"'".into()),
        }
    };

    Ok(RouteDecl {
        verb,
        template: template.to_string(),
        response,
    })
}

/// Parse a whole argument as one double-quoted string.
fn parse_string(text: &str) -> Result<String, String> {
    let text = text.trim();
    let mut chars = text.chars();
    if chars.next() != Some('"') {
        return Err(format!("expected a quoted string, found '{}'", text));
    }

    let mut value = String::new();
    let mut escaped = false;
    while let Some(c) = chars.next() {
        match (escaped, c) {
            (true, 'n') => value.push('\n'),
            (true, 't') => value.push('\t'),
            (true, other) => value.push(other),
            (false, '\\') => {
                escaped = true;
                continue;
            }
            (false, '"') => {
                let trailing = chars.as_str().trim();
                if !trailing.is_empty() {
                    return Err(format!("unexpected '{}' after string", trailing));
                }
                return Ok(value);
            }
            (false, other) => value.push(other),
        }
        escaped = false;
    }
    Err("unterminated string".into())
}

fn parse_number<T: FromStr>(text: &str, what: &str) -> Result<T, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("invalid {}: '{}'", what, text.trim()))
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected 'true' or 'false', found '{}'", other)),
    }
}

fn expect_no_argument(keyword: &str, arg: &str) -> Result<(), String> {
    if arg.is_empty() {
        Ok(())
    } else {
        Err(format!("'{}' takes no argument", keyword))
    }
}

fn split_keyword(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim()),
        None => (text, ""),
    }
}

/// Cut a trailing `#` comment, ignoring `#` inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}
