//! Diagnostic records and readable formatting of canonical forms.
//!
//! The detector never aborts: failures are appended to a [`DiagnosticSink`]
//! and the caller receives them alongside an empty result. Formatting
//! helpers here resolve mark references through the arena so messages show
//! the full nested structure instead of bare mark indices.

use std::fmt;
use std::fmt::Write;

use crate::ast::{Expr, ExprKind, Span};
use crate::error::ErrorKind;
use crate::iter::{IterSplit, IterSum, MarkArena, MarkId};

/// Severity of a diagnostic record. Every detector failure is an error;
/// warnings are for conditions that do not empty the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
        }
    }
}

/// A failure record tagged with the offending sub-expression's span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub span: Span,
    pub kind: ErrorKind,
}

impl Diagnostic {
    pub fn new(level: Level, span: Span, kind: ErrorKind) -> Self {
        Diagnostic { level, span, kind }
    }

    pub fn error(span: Span, kind: ErrorKind) -> Self {
        Diagnostic::new(Level::Error, span, kind)
    }

    pub fn warning(span: Span, kind: ErrorKind) -> Self {
        Diagnostic::new(Level::Warning, span, kind)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.span.is_generated() {
            write!(f, "{}: {}", self.level, self.kind)
        } else {
            write!(f, "{} at {}: {}", self.level, self.span, self.kind)
        }
    }
}

/// Accumulates diagnostics for one top-level detection call.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        DiagnosticSink::default()
    }

    pub fn emit(&mut self, diagnostic: Diagnostic) {
        log::debug!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

/// Render a mark with its source resolved through the arena.
pub fn format_mark(marks: &MarkArena, mark: MarkId) -> String {
    match marks.get(mark) {
        Some(node) => format!(
            "IterMark({}, extent={})",
            format_expr(marks, &node.source),
            format_expr(marks, &node.extent)
        ),
        None => format!("IterMark({})", mark),
    }
}

/// Render a split, resolving its source mark.
pub fn format_split(marks: &MarkArena, split: &IterSplit) -> String {
    format!(
        "IterSplit({}, lower_factor={}, extent={}, scale={})",
        format_mark(marks, split.source),
        format_expr(marks, &split.lower_factor),
        format_expr(marks, &split.extent),
        format_expr(marks, &split.scale)
    )
}

/// Render a sum, resolving nested marks.
pub fn format_sum(marks: &MarkArena, sum: &IterSum) -> String {
    let mut out = String::from("IterSum(");
    for arg in &sum.args {
        let _ = write!(out, "{} + ", format_split(marks, arg));
    }
    let _ = write!(out, "{})", format_expr(marks, &sum.base));
    out
}

/// Render an arbitrary expression, resolving canonical nodes through the
/// arena; plain nodes use their `Display` form.
pub fn format_expr(marks: &MarkArena, expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::IterSplit(split) => format_split(marks, split),
        ExprKind::IterSum(sum) => format_sum(marks, sum),
        _ => expr.to_string(),
    }
}
