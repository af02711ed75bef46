//! Host integer expression tree.
//!
//! Expressions are plain value trees: every node carries its kind, a data
//! type and a source span. Structural equality and hashing ignore spans, so
//! two expressions that print the same compare equal regardless of where
//! they came from. The two canonical kinds produced by the detector
//! ([`IterSplit`]/[`IterSum`], see the `iter` module) are ordinary variants
//! of [`ExprKind`] so the rewriter can thread them through sub-expressions.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, Neg, Sub};

use crate::iter::{IterSplit, IterSum};

/// Source location span tracking (line, column) start and end positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn new(start_line: usize, start_col: usize, end_line: usize, end_col: usize) -> Self {
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// A span for synthesised nodes (all zeros).
    pub fn generated() -> Self {
        Span::new(0, 0, 0, 0)
    }

    /// Check if this is a generated span (all zeros).
    pub fn is_generated(&self) -> bool {
        self.start_line == 0 && self.start_col == 0 && self.end_line == 0 && self.end_col == 0
    }

    /// Merge two spans to create a span covering both. Generated spans are
    /// transparent: merging with one yields the other side unchanged.
    pub fn merge(&self, other: &Span) -> Span {
        if self.is_generated() {
            return *other;
        }
        if other.is_generated() {
            return *self;
        }
        let (start_line, start_col) = if self.start_line < other.start_line
            || (self.start_line == other.start_line && self.start_col <= other.start_col)
        {
            (self.start_line, self.start_col)
        } else {
            (other.start_line, other.start_col)
        };
        let (end_line, end_col) = if self.end_line > other.end_line
            || (self.end_line == other.end_line && self.end_col >= other.end_col)
        {
            (self.end_line, self.end_col)
        } else {
            (other.end_line, other.end_col)
        };
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}..{}", self.start_line, self.start_col, self.end_col)
        } else {
            write!(
                f,
                "{}:{}..{}:{}",
                self.start_line, self.start_col, self.end_line, self.end_col
            )
        }
    }
}

/// Scalar data type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int(u8),
    UInt(u8),
    Float(u8),
    Bool,
}

impl DType {
    pub const I32: DType = DType::Int(32);
    pub const I64: DType = DType::Int(64);

    /// Whether this type may appear in an index position.
    pub fn is_index(&self) -> bool {
        matches!(self, DType::Int(_) | DType::UInt(_))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Int(bits) => write!(f, "i{}", bits),
            DType::UInt(bits) => write!(f, "u{}", bits),
            DType::Float(bits) => write!(f, "f{}", bits),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// A named variable. Two variables are the same iterator when their names
/// and types match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
    pub dtype: DType,
}

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var {
            name: name.into(),
            dtype: DType::I32,
        }
    }

    pub fn with_dtype(name: impl Into<String>, dtype: DType) -> Self {
        Var {
            name: name.into(),
            dtype,
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    Var(Var),
    IntImm(i64),
    BoolImm(bool),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    FloorDiv(Box<Expr>, Box<Expr>),
    FloorMod(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    /// Canonical slice of an iterator mark.
    IterSplit(Box<IterSplit>),
    /// Canonical sum of slices plus a base offset.
    IterSum(Box<IterSum>),
}

/// An integer (or boolean) expression node.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub dtype: DType,
    pub span: Span,
}

// Equality and hashing are structural over (kind, dtype); spans are
// presentation only.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.kind == other.kind
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dtype.hash(state);
        self.kind.hash(state);
    }
}

/// Floor division on machine integers (rounds toward negative infinity).
pub fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Floor modulo on machine integers (result has the divisor's sign).
pub fn floor_mod_i64(a: i64, b: i64) -> i64 {
    a - floor_div_i64(a, b) * b
}

impl Expr {
    pub fn new(kind: ExprKind, dtype: DType, span: Span) -> Self {
        Expr { kind, dtype, span }
    }

    pub fn var(v: Var) -> Self {
        let dtype = v.dtype;
        Expr::new(ExprKind::Var(v), dtype, Span::generated())
    }

    pub fn int(value: i64) -> Self {
        Expr::int_typed(value, DType::I32)
    }

    pub fn int_typed(value: i64, dtype: DType) -> Self {
        Expr::new(ExprKind::IntImm(value), dtype, Span::generated())
    }

    pub fn bool_imm(value: bool) -> Self {
        Expr::new(ExprKind::BoolImm(value), DType::Bool, Span::generated())
    }

    pub fn zero(dtype: DType) -> Self {
        Expr::int_typed(0, dtype)
    }

    pub fn one(dtype: DType) -> Self {
        Expr::int_typed(1, dtype)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self.kind {
            ExprKind::IntImm(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match &self.kind {
            ExprKind::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_const_int() == Some(0)
    }

    pub fn is_one(&self) -> bool {
        self.as_const_int() == Some(1)
    }

    pub fn is_const_true(&self) -> bool {
        matches!(self.kind, ExprKind::BoolImm(true)) || self.is_one()
    }

    /// Whether this node is one of the canonical iterator kinds.
    pub fn is_canonical(&self) -> bool {
        matches!(self.kind, ExprKind::IterSplit(_) | ExprKind::IterSum(_))
    }

    /// Immediate sub-expressions of this node.
    pub fn children(&self) -> Vec<&Expr> {
        use ExprKind::*;
        match &self.kind {
            Var(_) | IntImm(_) | BoolImm(_) => vec![],
            Add(a, b) | Sub(a, b) | Mul(a, b) | FloorDiv(a, b) | FloorMod(a, b) | Min(a, b)
            | Max(a, b) | Eq(a, b) | Lt(a, b) | Le(a, b) | Gt(a, b) | Ge(a, b) | And(a, b) => {
                vec![&**a, &**b]
            }
            IterSplit(s) => vec![&s.lower_factor, &s.extent, &s.scale],
            IterSum(s) => {
                let mut out: Vec<&Expr> = Vec::with_capacity(s.args.len() * 3 + 1);
                for arg in &s.args {
                    out.push(&arg.lower_factor);
                    out.push(&arg.extent);
                    out.push(&arg.scale);
                }
                out.push(&s.base);
                out
            }
        }
    }

    /// Whether any variable satisfying `pred` occurs in the expression.
    pub fn uses_var(&self, pred: &impl Fn(&Var) -> bool) -> bool {
        if let ExprKind::Var(v) = &self.kind {
            if pred(v) {
                return true;
            }
        }
        self.children().iter().any(|c| c.uses_var(pred))
    }

    /// Node count, used to order predicate constraints by complexity.
    pub fn num_nodes(&self) -> usize {
        1 + self.children().iter().map(|c| c.num_nodes()).sum::<usize>()
    }

    /// Floor division, folding integer literals and division by one.
    pub fn floordiv(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            if b != 0 {
                return Expr::int_typed(floor_div_i64(a, b), self.dtype);
            }
        }
        if rhs.is_one() {
            return self;
        }
        if self.is_zero() {
            return self;
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::FloorDiv(Box::new(self), Box::new(rhs)), dtype, span)
    }

    /// Floor modulo, folding integer literals and modulo by one.
    pub fn floormod(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            if b != 0 {
                return Expr::int_typed(floor_mod_i64(a, b), self.dtype);
            }
        }
        if rhs.is_one() || self.is_zero() {
            return Expr::zero(self.dtype);
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::FloorMod(Box::new(self), Box::new(rhs)), dtype, span)
    }

    pub fn min(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            return Expr::int_typed(a.min(b), self.dtype);
        }
        if self == rhs {
            return self;
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::Min(Box::new(self), Box::new(rhs)), dtype, span)
    }

    pub fn max(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            return Expr::int_typed(a.max(b), self.dtype);
        }
        if self == rhs {
            return self;
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::Max(Box::new(self), Box::new(rhs)), dtype, span)
    }

    pub fn equals(self, rhs: Expr) -> Expr {
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::Eq(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::Lt(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::Le(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::Gt(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::Ge(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }

    pub fn and(self, rhs: Expr) -> Expr {
        if self.is_const_true() {
            return rhs;
        }
        if rhs.is_const_true() {
            return self;
        }
        let span = self.span.merge(&rhs.span);
        Expr::new(ExprKind::And(Box::new(self), Box::new(rhs)), DType::Bool, span)
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            return Expr::int_typed(a + b, self.dtype);
        }
        if self.is_zero() {
            return rhs;
        }
        if rhs.is_zero() {
            return self;
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::Add(Box::new(self), Box::new(rhs)), dtype, span)
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            return Expr::int_typed(a - b, self.dtype);
        }
        if rhs.is_zero() {
            return self;
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::Sub(Box::new(self), Box::new(rhs)), dtype, span)
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        if let (Some(a), Some(b)) = (self.as_const_int(), rhs.as_const_int()) {
            return Expr::int_typed(a * b, self.dtype);
        }
        if self.is_one() {
            return rhs;
        }
        if rhs.is_one() {
            return self;
        }
        if self.is_zero() || rhs.is_zero() {
            return Expr::zero(self.dtype);
        }
        let (dtype, span) = (self.dtype, self.span.merge(&rhs.span));
        Expr::new(ExprKind::Mul(Box::new(self), Box::new(rhs)), dtype, span)
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        if let Some(v) = self.as_const_int() {
            return Expr::int_typed(-v, self.dtype);
        }
        Expr::zero(self.dtype) - self
    }
}

impl Add<i64> for Expr {
    type Output = Expr;

    fn add(self, rhs: i64) -> Expr {
        let c = Expr::int_typed(rhs, self.dtype);
        self + c
    }
}

impl Sub<i64> for Expr {
    type Output = Expr;

    fn sub(self, rhs: i64) -> Expr {
        let c = Expr::int_typed(rhs, self.dtype);
        self - c
    }
}

impl Mul<i64> for Expr {
    type Output = Expr;

    fn mul(self, rhs: i64) -> Expr {
        let c = Expr::int_typed(rhs, self.dtype);
        self * c
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Expr {
        Expr::var(v)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ExprKind::*;
        match &self.kind {
            Var(v) => write!(f, "{}", v),
            IntImm(v) => write!(f, "{}", v),
            BoolImm(v) => write!(f, "{}", v),
            Add(a, b) => write!(f, "({} + {})", a, b),
            Sub(a, b) => write!(f, "({} - {})", a, b),
            Mul(a, b) => write!(f, "({}*{})", a, b),
            FloorDiv(a, b) => write!(f, "floordiv({}, {})", a, b),
            FloorMod(a, b) => write!(f, "floormod({}, {})", a, b),
            Min(a, b) => write!(f, "min({}, {})", a, b),
            Max(a, b) => write!(f, "max({}, {})", a, b),
            Eq(a, b) => write!(f, "({} == {})", a, b),
            Lt(a, b) => write!(f, "({} < {})", a, b),
            Le(a, b) => write!(f, "({} <= {})", a, b),
            Gt(a, b) => write!(f, "({} > {})", a, b),
            Ge(a, b) => write!(f, "({} >= {})", a, b),
            And(a, b) => write!(f, "({} && {})", a, b),
            IterSplit(s) => write!(f, "{}", s),
            IterSum(s) => write!(f, "{}", s),
        }
    }
}
