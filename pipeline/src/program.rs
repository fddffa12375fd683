//! Programs: ordered operation lists with an execution cursor.
//!
//! A program snapshots the process-wide engine options when it is created
//! and restores them when it is dropped, so `set` operations never leak
//! into the next program executed in the same process.

use crate::error::Result;
use crate::operation::Operation;
use crate::options::{self, EngineOptions};
use crate::parser::parse_operations;

/// An ordered list of operations plus the execution cursor.
#[derive(Debug)]
pub struct Program {
    pub operations: Vec<Operation>,
    /// Index of the next operation to execute.
    pub cursor: usize,
    snapshot: EngineOptions,
}

impl Program {
    pub fn new() -> Self {
        Program {
            operations: Vec::new(),
            cursor: 0,
            snapshot: options::current(),
        }
    }

    /// Parse a semicolon-separated operation string into a program.
    pub fn from_source(source: &str) -> Result<Self> {
        let operations = parse_operations(source)?;
        Ok(Program {
            operations,
            cursor: 0,
            snapshot: options::current(),
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn add_operation(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Remove the first operation equal to `operation`; duplicates later
    /// in the list are left in place. Returns whether anything was
    /// removed.
    pub fn remove_operation(&mut self, operation: &Operation) -> bool {
        match self.operations.iter().position(|o| o == operation) {
            Some(index) => {
                self.operations.remove(index);
                if self.cursor > index {
                    self.cursor -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// The operation at the cursor, if any work remains.
    pub fn current(&self) -> Option<&Operation> {
        self.operations.get(self.cursor)
    }

    /// Peek `offset` operations past the cursor without consuming.
    pub fn peek(&self, offset: usize) -> Option<&Operation> {
        self.operations.get(self.cursor + offset)
    }

    pub fn advance(&mut self, count: usize) {
        self.cursor += count;
    }

    pub fn finished(&self) -> bool {
        self.cursor >= self.operations.len()
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        options::restore(self.snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::ComparisonOp;

    #[test]
    fn parses_and_tracks_cursor() {
        let mut program = Program::from_source("t>15;t<40;keep(t)").unwrap();
        assert_eq!(program.len(), 3);
        assert!(program.current().is_some());
        program.advance(3);
        assert!(program.finished());
    }

    #[test]
    fn remove_operation_removes_first_match_only() {
        let duplicate = Operation::ComparisonFilter {
            variable: "t".to_string(),
            op: ComparisonOp::Gt,
            value: 1.0,
            unit: None,
        };
        let mut program = Program::new();
        program.add_operation(duplicate.clone());
        program.add_operation(Operation::BinFull);
        program.add_operation(duplicate.clone());

        assert!(program.remove_operation(&duplicate));
        assert_eq!(program.len(), 2);
        assert_eq!(program.operations[0], Operation::BinFull);
        assert_eq!(program.operations[1], duplicate);

        assert!(program.remove_operation(&duplicate));
        assert!(!program.remove_operation(&duplicate));
    }

    #[test]
    fn drop_restores_option_snapshot() {
        let _guard = crate::options::TEST_GUARD.lock().unwrap();
        let before = crate::options::current();
        {
            let _program = Program::from_source("set(afgl86, enabled)").unwrap();
            crate::options::apply_set("afgl86", "enabled").unwrap();
        }
        assert_eq!(crate::options::current(), before);
    }
}
