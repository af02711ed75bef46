//! Arithmetic analyzer.
//!
//! The detector only needs three queries: `simplify`, `can_prove`, and
//! `can_prove_equal`. They are backed by a linear-combination normal form
//! over opaque atoms: an integer expression is flattened into
//! `constant + sum(coeff * atom)` where an atom is anything the linearizer
//! cannot see through (a variable, a non-exact floor division, a product of
//! two non-constants). Equality of two expressions is then equality of their
//! normal forms; comparisons and divisibility facts fold when the difference
//! is a bare constant.

use indexmap::IndexMap;

use crate::ast::{floor_div_i64, floor_mod_i64, Expr, ExprKind};

/// Linear combination `constant + sum(coeff_i * atom_i)`.
#[derive(Debug, Clone, Default)]
struct LinForm {
    terms: IndexMap<Expr, i64>,
    constant: i64,
}

impl LinForm {
    fn constant(value: i64) -> Self {
        LinForm {
            terms: IndexMap::new(),
            constant: value,
        }
    }

    fn atom(expr: Expr) -> Self {
        let mut terms = IndexMap::new();
        terms.insert(expr, 1);
        LinForm { terms, constant: 0 }
    }

    fn is_constant(&self) -> bool {
        self.terms.values().all(|c| *c == 0)
    }

    fn add_scaled(&mut self, other: &LinForm, factor: i64) {
        for (atom, coeff) in &other.terms {
            *self.terms.entry(atom.clone()).or_insert(0) += coeff * factor;
        }
        self.constant += other.constant * factor;
    }

    fn scaled(&self, factor: i64) -> LinForm {
        let mut out = LinForm::constant(0);
        out.add_scaled(self, factor);
        out
    }

    fn difference(&self, other: &LinForm) -> LinForm {
        let mut out = self.clone();
        out.add_scaled(other, -1);
        out
    }

    /// Constant value of `self`, when every atom coefficient is zero.
    fn as_constant(&self) -> Option<i64> {
        if self.is_constant() {
            Some(self.constant)
        } else {
            None
        }
    }
}

/// Integer arithmetic oracle used as a black box by the detector.
#[derive(Debug, Default)]
pub struct Analyzer {}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {}
    }

    /// Normalise an expression. Integer expressions are rebuilt from their
    /// linear normal form; boolean expressions fold comparisons whose sides
    /// differ by a constant.
    pub fn simplify(&self, expr: &Expr) -> Expr {
        match &expr.kind {
            ExprKind::BoolImm(_) => expr.clone(),
            ExprKind::Eq(a, b) => self.simplify_cmp(expr, a, b, |d| d == 0, Expr::equals),
            ExprKind::Lt(a, b) => self.simplify_cmp(expr, a, b, |d| d < 0, Expr::lt),
            ExprKind::Le(a, b) => self.simplify_cmp(expr, a, b, |d| d <= 0, Expr::le),
            ExprKind::Gt(a, b) => self.simplify_cmp(expr, a, b, |d| d > 0, Expr::gt),
            ExprKind::Ge(a, b) => self.simplify_cmp(expr, a, b, |d| d >= 0, Expr::ge),
            ExprKind::And(a, b) => {
                let sa = self.simplify(a);
                let sb = self.simplify(b);
                match (&sa.kind, &sb.kind) {
                    (ExprKind::BoolImm(false), _) | (_, ExprKind::BoolImm(false)) => {
                        Expr::bool_imm(false)
                    }
                    (ExprKind::BoolImm(true), _) => sb,
                    (_, ExprKind::BoolImm(true)) => sa,
                    _ => sa.and(sb),
                }
            }
            ExprKind::IterSplit(_) | ExprKind::IterSum(_) => expr.clone(),
            _ if expr.dtype.is_index() => {
                let form = self.linearize(expr);
                self.rebuild(&form, expr)
            }
            _ => expr.clone(),
        }
    }

    /// Whether the boolean expression is provably true.
    pub fn can_prove(&self, expr: &Expr) -> bool {
        self.simplify(expr).is_const_true()
    }

    /// Whether two integer expressions are provably equal.
    pub fn can_prove_equal(&self, lhs: &Expr, rhs: &Expr) -> bool {
        if lhs == rhs {
            return true;
        }
        if !lhs.dtype.is_index() || !rhs.dtype.is_index() {
            return false;
        }
        let diff = self.linearize(lhs).difference(&self.linearize(rhs));
        diff.as_constant() == Some(0)
    }

    fn simplify_cmp(
        &self,
        orig: &Expr,
        a: &Expr,
        b: &Expr,
        decide: impl Fn(i64) -> bool,
        rebuild: impl Fn(Expr, Expr) -> Expr,
    ) -> Expr {
        if !a.dtype.is_index() || !b.dtype.is_index() {
            return orig.clone();
        }
        let diff = self.linearize(a).difference(&self.linearize(b));
        match diff.as_constant() {
            Some(d) => Expr::bool_imm(decide(d)),
            None => rebuild(self.simplify(a), self.simplify(b)).with_span(orig.span),
        }
    }

    fn linearize(&self, expr: &Expr) -> LinForm {
        match &expr.kind {
            ExprKind::IntImm(v) => LinForm::constant(*v),
            ExprKind::Add(a, b) => {
                let mut form = self.linearize(a);
                form.add_scaled(&self.linearize(b), 1);
                form
            }
            ExprKind::Sub(a, b) => {
                let mut form = self.linearize(a);
                form.add_scaled(&self.linearize(b), -1);
                form
            }
            ExprKind::Mul(a, b) => {
                let la = self.linearize(a);
                let lb = self.linearize(b);
                if let Some(c) = la.as_constant() {
                    lb.scaled(c)
                } else if let Some(c) = lb.as_constant() {
                    la.scaled(c)
                } else {
                    LinForm::atom(self.simplify(a) * self.simplify(b))
                }
            }
            ExprKind::FloorDiv(a, b) => {
                let la = self.linearize(a);
                if let Some(d) = self.linearize(b).as_constant() {
                    if d != 0 {
                        if let Some(form) = exact_floordiv(&la, d) {
                            return form;
                        }
                    }
                }
                LinForm::atom(self.simplify(a).floordiv(self.simplify(b)))
            }
            ExprKind::FloorMod(a, b) => {
                let la = self.linearize(a);
                if let Some(d) = self.linearize(b).as_constant() {
                    if d != 0 && la.terms.values().all(|c| c % d == 0) {
                        return LinForm::constant(floor_mod_i64(la.constant, d));
                    }
                }
                LinForm::atom(self.simplify(a).floormod(self.simplify(b)))
            }
            ExprKind::Min(a, b) => {
                let la = self.linearize(a);
                let lb = self.linearize(b);
                match la.difference(&lb).as_constant() {
                    Some(d) if d <= 0 => la,
                    Some(_) => lb,
                    None => LinForm::atom(self.simplify(a).min(self.simplify(b))),
                }
            }
            ExprKind::Max(a, b) => {
                let la = self.linearize(a);
                let lb = self.linearize(b);
                match la.difference(&lb).as_constant() {
                    Some(d) if d >= 0 => la,
                    Some(_) => lb,
                    None => LinForm::atom(self.simplify(a).max(self.simplify(b))),
                }
            }
            _ => LinForm::atom(expr.clone()),
        }
    }

    fn rebuild(&self, form: &LinForm, orig: &Expr) -> Expr {
        let mut acc: Option<Expr> = None;
        for (atom, coeff) in &form.terms {
            if *coeff == 0 {
                continue;
            }
            let term = if *coeff == 1 {
                atom.clone()
            } else {
                atom.clone() * Expr::int_typed(*coeff, orig.dtype)
            };
            acc = Some(match acc {
                Some(prev) => prev + term,
                None => term,
            });
        }
        let result = match acc {
            Some(prev) if form.constant != 0 => prev + Expr::int_typed(form.constant, orig.dtype),
            Some(prev) => prev,
            None => Expr::int_typed(form.constant, orig.dtype),
        };
        result.with_span(orig.span)
    }
}

/// `floordiv(d*k + c, d) = k + floordiv(c, d)` whenever every atom
/// coefficient is divisible by `d`; `k` is an integer so the identity holds
/// for any remainder constant.
fn exact_floordiv(form: &LinForm, d: i64) -> Option<LinForm> {
    if !form.terms.values().all(|c| c % d == 0) {
        return None;
    }
    let mut out = LinForm::constant(floor_div_i64(form.constant, d));
    for (atom, coeff) in &form.terms {
        if *coeff != 0 {
            out.terms.insert(atom.clone(), coeff / d);
        }
    }
    Some(out)
}
