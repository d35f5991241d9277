//! Renders the final statement list to aligned assembly text.
//!
//! Runs strictly after `finalize_code`, so every deferred slot reachable
//! from the statement list must already be filled; one that is not fails
//! the render. Output is a pure function of the statement list.

use crate::error::AsmError;
use crate::stmt::Statement;

#[derive(Debug, Clone)]
pub struct Formatter {
    /// Columns per indent level.
    pub indent: usize,
}

impl Default for Formatter {
    fn default() -> Self {
        Self { indent: 4 }
    }
}

impl Formatter {
    pub fn new(indent: usize) -> Self {
        Self { indent }
    }

    pub fn format(&self, code: &[Statement]) -> Result<String, AsmError> {
        let mut out: Vec<String> = Vec::with_capacity(code.len());
        let mut column = 0usize;
        for stmt in code {
            let prefix = stmt.prefix.flatten()?;
            let op = stmt.op.flatten()?;
            if stmt.indent < 0 {
                let dedent = self.indent * stmt.indent.unsigned_abs() as usize;
                column = column.saturating_sub(dedent);
            }
            let mut line = format!("{prefix:<column$}");
            if !op.is_empty() {
                if !line.is_empty() && !line.ends_with(' ') {
                    line.push(' ');
                }
                line.push_str(&op);
            }
            if !stmt.operands.is_empty() {
                let mut rendered = Vec::with_capacity(stmt.operands.len());
                for operand in &stmt.operands {
                    rendered.push(operand.flatten()?);
                }
                line.push(' ');
                line.push_str(&rendered.join(" "));
            }
            let mut line = line.trim_end().to_string();
            if stmt.semi {
                line.push(';');
            }
            out.push(line);
            if stmt.indent > 0 {
                column += self.indent * stmt.indent as usize;
            }
        }
        Ok(out.join("\n"))
    }
}
