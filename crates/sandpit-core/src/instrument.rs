//! Checkpoint instrumentation.
//!
//! Rewrites a [`SyntaxTree`] so that every statement located at an active
//! breakpoint is immediately preceded by a checkpoint statement. Compound
//! statements qualify at their header line, independently of their bodies.
//! Running the instrumenter again over its own output inserts nothing new.

use crate::debugger::BreakpointSet;
use crate::syntax::{Statement, SyntaxTree};

/// Inserts checkpoints for a fixed breakpoint snapshot.
#[derive(Debug)]
pub struct Instrumenter<'a> {
    breakpoints: &'a BreakpointSet,
}

impl<'a> Instrumenter<'a> {
    pub fn new(breakpoints: &'a BreakpointSet) -> Self {
        Self { breakpoints }
    }

    /// Instrument `tree` in place. Returns the number of checkpoints inserted.
    pub fn instrument(&self, tree: &mut SyntaxTree) -> usize {
        if self.breakpoints.is_empty() {
            return 0;
        }
        let inserted = self.walk(&tree.file, &mut tree.statements);
        tracing::debug!(file = %tree.file, inserted, "Instrumented syntax tree");
        inserted
    }

    fn walk(&self, file: &str, block: &mut Vec<Statement>) -> usize {
        let mut inserted = 0;
        let mut i = 0;
        while i < block.len() {
            for child in block[i].child_blocks_mut() {
                inserted += self.walk(file, child);
            }
            if self.is_eligible(file, &block[i]) && !preceded_by_checkpoint(file, block, i) {
                wrap_with_checkpoint(file, block, i);
                inserted += 1;
                i += 1;
            }
            i += 1;
        }
        inserted
    }

    fn is_eligible(&self, file: &str, statement: &Statement) -> bool {
        !statement.is_checkpoint() && self.breakpoints.contains(file, statement.span.line)
    }
}

fn preceded_by_checkpoint(file: &str, block: &[Statement], index: usize) -> bool {
    let line = block[index].span.line;
    index > 0 && block[index - 1].is_checkpoint_at(file, line)
}

fn wrap_with_checkpoint(file: &str, block: &mut Vec<Statement>, index: usize) {
    let span = block[index].span;
    block.insert(index, Statement::checkpoint(file, span));
}

/// Convenience wrapper around [`Instrumenter::instrument`].
pub fn instrument(tree: &mut SyntaxTree, breakpoints: &BreakpointSet) -> usize {
    Instrumenter::new(breakpoints).instrument(tree)
}
