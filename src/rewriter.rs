//! Canonical rewriter.
//!
//! [`IterMapRewriter`] walks a host expression and rewrites it into the
//! canonical split/sum algebra. Fusion of weighted sums into synthetic
//! iterator marks happens in [`IterMapRewriter::try_fuse_iters`], the only
//! place where marks are minted; everything else either reuses the memoised
//! mark for a flattened form or fails.
//!
//! Failures never abort the walk: they bump an unresolved counter, emit a
//! diagnostic and hand back the original expression, so a single pass
//! collects every reason a mapping is not affine.

use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use log::trace;

use crate::analyzer::Analyzer;
use crate::ast::{Expr, ExprKind, Span, Var};
use crate::detect::IterRanges;
use crate::diags::{format_expr, format_mark, format_sum, Diagnostic, DiagnosticSink};
use crate::error::ErrorKind;
use crate::iter::{
    split_equal, IterMarkNode, IterSplit, IterSum, MarkArena, MarkId, SplitCollector, SumKey,
};

/// Memoised fusion record: the flattened form maps to this mark plus the
/// offset its structured form has been shifted by.
#[derive(Debug, Clone)]
struct MarkWithOffset {
    mark: MarkId,
    offset: Expr,
}

pub struct IterMapRewriter<'a> {
    analyzer: &'a Analyzer,
    sink: &'a mut DiagnosticSink,
    marks: MarkArena,
    /// Pre-built canonical form of each input iterator.
    var_map: IndexMap<Var, Expr>,
    /// Marks of the input iterators, in declaration order.
    input_marks: Vec<MarkId>,
    /// flattened form -> (mark, offset)
    sum_fuse_map: FxHashMap<SumKey, MarkWithOffset>,
    /// structured form -> flattened form
    flattened_map: FxHashMap<SumKey, IterSum>,
    /// Flattened forms of predicate-constrained iterators, in rewrite order
    /// (shortest first; the longest-match search in fusion relies on it).
    constrained_iters_flattened: Vec<IterSum>,
    /// Marks embedded in another mark's structured form. Their extents are
    /// load-bearing for the enclosing fusion and must not change afterwards.
    frozen: FxHashSet<MarkId>,
    unresolved_count: usize,
}

impl<'a> IterMapRewriter<'a> {
    pub fn new(
        analyzer: &'a Analyzer,
        sink: &'a mut DiagnosticSink,
        input_iters: &IterRanges,
    ) -> Self {
        let mut marks = MarkArena::new();
        let mut var_map = IndexMap::new();
        let mut input_marks = Vec::new();
        for (var, range) in input_iters {
            let var_expr = Expr::var(var.clone());
            let dtype = var_expr.dtype;
            if range.extent.is_one() {
                // A degenerate iterator only contributes its minimum.
                let sum = IterSum::new(Vec::new(), range.min.clone());
                var_map.insert(var.clone(), sum.into_expr(dtype));
            } else if range.min.is_zero() {
                let mark = marks.alloc(IterMarkNode::new(var_expr, range.extent.clone()));
                var_map.insert(var.clone(), IterSplit::whole(mark, &marks).into_expr(dtype));
                input_marks.push(mark);
            } else {
                let source = var_expr - range.min.clone();
                let mark = marks.alloc(IterMarkNode::new(source, range.extent.clone()));
                let sum = IterSum::new(vec![IterSplit::whole(mark, &marks)], range.min.clone());
                var_map.insert(var.clone(), sum.into_expr(dtype));
                input_marks.push(mark);
            }
        }
        IterMapRewriter {
            analyzer,
            sink,
            marks,
            var_map,
            input_marks,
            sum_fuse_map: FxHashMap::default(),
            flattened_map: FxHashMap::default(),
            constrained_iters_flattened: Vec::new(),
            frozen: FxHashSet::default(),
            unresolved_count: 0,
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved_count
    }

    pub fn marks(&self) -> &MarkArena {
        &self.marks
    }

    pub fn into_marks(self) -> MarkArena {
        self.marks
    }

    /// Rewrite an index expression into its fused canonical sum.
    pub fn rewrite(&mut self, expr: &Expr) -> IterSum {
        trace!("rewrite {}", expr);
        let mutated = self.direct_mutate(expr);
        let sum = Self::to_iter_sum(mutated);
        self.normalize_to_iter_with_offset(sum, expr.span)
    }

    /// Rewrite a predicate-constrained iterator expression, tightening the
    /// extent of its fused mark by the induced bounds.
    pub fn rewrite_iter_constraint(
        &mut self,
        expr: &Expr,
        lower: Option<Expr>,
        upper: Option<Expr>,
    ) -> IterSum {
        trace!("rewrite constraint {}", expr);
        let mutated = self.direct_mutate(expr);
        let sum = Self::to_iter_sum(mutated);
        self.normalize_to_iter_on_bound_expr(sum, lower, upper, expr.span)
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    fn direct_mutate(&mut self, expr: &Expr) -> Expr {
        match &expr.kind {
            ExprKind::Var(v) => match self.var_map.get(v) {
                Some(canonical) => canonical.clone(),
                None => expr.clone(),
            },
            ExprKind::Add(a, b) => self.rewrite_add(expr, a, b),
            ExprKind::Sub(a, b) => self.rewrite_sub(expr, a, b),
            ExprKind::Mul(a, b) => self.rewrite_mul(expr, a, b),
            ExprKind::FloorDiv(a, b) => self.rewrite_floordiv(expr, a, b),
            ExprKind::FloorMod(a, b) => self.rewrite_floormod(expr, a, b),
            _ => self.fallback_mutate(expr),
        }
    }

    /// Mutation for positions that cannot absorb a canonical node: if the
    /// result is canonical the expression is unresolvable.
    fn checked_mutate(&mut self, expr: &Expr) -> Expr {
        let result = self.direct_mutate(expr);
        if result.is_canonical() {
            self.fail(
                expr.span,
                ErrorKind::CanonicalInBadPosition(format_expr(&self.marks, expr)),
            );
        }
        result
    }

    /// Default rebuild of an unhandled node kind with checked children.
    fn fallback_mutate(&mut self, expr: &Expr) -> Expr {
        use ExprKind::*;
        let (a, b) = match &expr.kind {
            Add(a, b) | Sub(a, b) | Mul(a, b) | FloorDiv(a, b) | FloorMod(a, b) | Min(a, b)
            | Max(a, b) | Eq(a, b) | Lt(a, b) | Le(a, b) | Gt(a, b) | Ge(a, b) | And(a, b) => {
                (a, b)
            }
            _ => return expr.clone(),
        };
        let na = self.checked_mutate(a);
        let nb = self.checked_mutate(b);
        if na == **a && nb == **b {
            return expr.clone();
        }
        let (na, nb) = (Box::new(na), Box::new(nb));
        let kind = match &expr.kind {
            Add(..) => Add(na, nb),
            Sub(..) => Sub(na, nb),
            Mul(..) => Mul(na, nb),
            FloorDiv(..) => FloorDiv(na, nb),
            FloorMod(..) => FloorMod(na, nb),
            Min(..) => Min(na, nb),
            Max(..) => Max(na, nb),
            Eq(..) => Eq(na, nb),
            Lt(..) => Lt(na, nb),
            Le(..) => Le(na, nb),
            Gt(..) => Gt(na, nb),
            Ge(..) => Ge(na, nb),
            And(..) => And(na, nb),
            _ => unreachable!("fallback_mutate only rebuilds binary nodes"),
        };
        Expr::new(kind, expr.dtype, expr.span)
    }

    fn rewrite_add(&mut self, expr: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        if !expr.dtype.is_index() {
            return self.fallback_mutate(expr);
        }
        let a = self.direct_mutate(a0);
        let b = self.direct_mutate(b0);
        if a.as_const_int().is_some() && b.as_const_int().is_some() {
            return (a + b).with_span(expr.span);
        }
        if !a.is_canonical() && !b.is_canonical() {
            if a == *a0 && b == *b0 {
                return expr.clone();
            }
            return Expr::new(ExprKind::Add(Box::new(a), Box::new(b)), expr.dtype, expr.span);
        }
        let mut ret = Self::to_iter_sum(a);
        match b.kind {
            ExprKind::IterSum(s) => Self::add_sum_to_lhs(&mut ret, &s, 1),
            ExprKind::IterSplit(s) => Self::add_split_to_lhs(&mut ret, *s, 1),
            kind => {
                let plain = Expr::new(kind, b.dtype, b.span);
                ret.base = ret.base.clone() + plain;
            }
        }
        ret.into_expr(expr.dtype).with_span(expr.span)
    }

    fn rewrite_sub(&mut self, expr: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        if !expr.dtype.is_index() {
            return self.fallback_mutate(expr);
        }
        let a = self.direct_mutate(a0);
        let b = self.direct_mutate(b0);
        if a.as_const_int().is_some() && b.as_const_int().is_some() {
            return (a - b).with_span(expr.span);
        }
        if !a.is_canonical() && !b.is_canonical() {
            if a == *a0 && b == *b0 {
                return expr.clone();
            }
            return Expr::new(ExprKind::Sub(Box::new(a), Box::new(b)), expr.dtype, expr.span);
        }
        let mut ret = Self::to_iter_sum(a);
        match b.kind {
            ExprKind::IterSum(s) => Self::add_sum_to_lhs(&mut ret, &s, -1),
            ExprKind::IterSplit(s) => Self::add_split_to_lhs(&mut ret, *s, -1),
            kind => {
                let plain = Expr::new(kind, b.dtype, b.span);
                ret.base = ret.base.clone() - plain;
            }
        }
        ret.into_expr(expr.dtype).with_span(expr.span)
    }

    fn rewrite_mul(&mut self, expr: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        if !expr.dtype.is_index() {
            return self.fallback_mutate(expr);
        }
        let a = self.direct_mutate(a0);
        let b = self.direct_mutate(b0);
        if a.as_const_int().is_some() && b.as_const_int().is_some() {
            return (a * b).with_span(expr.span);
        }
        if !a.is_canonical() && !b.is_canonical() {
            if a == *a0 && b == *b0 {
                return expr.clone();
            }
            return Expr::new(ExprKind::Mul(Box::new(a), Box::new(b)), expr.dtype, expr.span);
        }
        if a.is_canonical() && b.is_canonical() {
            self.fail(
                expr.span,
                ErrorKind::MultiplyIterators(format_expr(&self.marks, expr)),
            );
            return expr.clone();
        }
        let (canonical, other) = if a.is_canonical() { (a, b) } else { (b, a) };
        match canonical.kind {
            ExprKind::IterSum(mut s) => {
                Self::mul_to_lhs(&mut s, &other);
                s.into_expr(expr.dtype).with_span(expr.span)
            }
            ExprKind::IterSplit(mut s) => {
                s.scale = s.scale * other;
                s.into_expr(expr.dtype).with_span(expr.span)
            }
            _ => unreachable!("canonical node is a split or a sum"),
        }
    }

    fn rewrite_floordiv(&mut self, expr: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        if !expr.dtype.is_index() {
            return self.fallback_mutate(expr);
        }
        let a = self.direct_mutate(a0);
        let b = self.direct_mutate(b0);
        if a.as_const_int().is_some() && b.as_const_int().is_some() {
            return a.floordiv(b).with_span(expr.span);
        }
        if !a.is_canonical() && !b.is_canonical() {
            if a == *a0 && b == *b0 {
                return expr.clone();
            }
            return Expr::new(
                ExprKind::FloorDiv(Box::new(a), Box::new(b)),
                expr.dtype,
                expr.span,
            );
        }
        if b.is_canonical() {
            self.fail(
                expr.span,
                ErrorKind::DivideByIterator(format_expr(&self.marks, expr)),
            );
            return expr.clone();
        }
        match a.kind {
            ExprKind::IterSum(s) => match self.try_fuse_iters(&s, expr.span) {
                Some(fused) => {
                    if !fused.base.is_zero() {
                        self.fail(
                            expr.span,
                            ErrorKind::NonZeroBase {
                                op: "floordiv",
                                sum: format_sum(&self.marks, &s),
                            },
                        );
                        return expr.clone();
                    }
                    match fused.args.into_iter().next() {
                        Some(split) => self.split_floor_div_const(split, b, expr),
                        None => unreachable!("fusion yields exactly one split"),
                    }
                }
                None => {
                    self.fail(expr.span, ErrorKind::FuseFailed(format_sum(&self.marks, &s)));
                    expr.clone()
                }
            },
            ExprKind::IterSplit(s) => self.split_floor_div_const(*s, b, expr),
            _ => unreachable!("canonical node is a split or a sum"),
        }
    }

    fn rewrite_floormod(&mut self, expr: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        if !expr.dtype.is_index() {
            return self.fallback_mutate(expr);
        }
        let a = self.direct_mutate(a0);
        let b = self.direct_mutate(b0);
        if a.as_const_int().is_some() && b.as_const_int().is_some() {
            return a.floormod(b).with_span(expr.span);
        }
        if !a.is_canonical() && !b.is_canonical() {
            if a == *a0 && b == *b0 {
                return expr.clone();
            }
            return Expr::new(
                ExprKind::FloorMod(Box::new(a), Box::new(b)),
                expr.dtype,
                expr.span,
            );
        }
        if b.is_canonical() {
            self.fail(
                expr.span,
                ErrorKind::ModByIterator(format_expr(&self.marks, expr)),
            );
            return expr.clone();
        }
        match a.kind {
            ExprKind::IterSum(s) => match self.try_fuse_iters(&s, expr.span) {
                Some(fused) => {
                    if !fused.base.is_zero() {
                        self.fail(
                            expr.span,
                            ErrorKind::NonZeroBase {
                                op: "floormod",
                                sum: format_sum(&self.marks, &s),
                            },
                        );
                        return expr.clone();
                    }
                    match fused.args.into_iter().next() {
                        Some(split) => self.split_floor_mod_const(split, b, expr),
                        None => unreachable!("fusion yields exactly one split"),
                    }
                }
                None => {
                    self.fail(expr.span, ErrorKind::FuseFailed(format_sum(&self.marks, &s)));
                    expr.clone()
                }
            },
            ExprKind::IterSplit(s) => self.split_floor_mod_const(*s, b, expr),
            _ => unreachable!("canonical node is a split or a sum"),
        }
    }

    /// `floordiv(split, rhs)` for a constant-foldable `rhs`.
    fn split_floor_div_const(&mut self, mut lhs: IterSplit, mut rhs: Expr, orig: &Expr) -> Expr {
        if rhs.is_one() {
            return lhs.into_expr(orig.dtype);
        }
        if !lhs.scale.is_one() {
            if self.can_prove_divisible(&lhs.scale, &rhs) {
                // floordiv(x*c1*c2, c2) = x*c1
                lhs.scale = lhs.scale.clone().floordiv(rhs);
                return lhs.into_expr(orig.dtype);
            } else if self.can_prove_divisible(&rhs, &lhs.scale) {
                // floordiv(x*c1, c1*c2) = floordiv(x, c2)
                rhs = rhs.floordiv(lhs.scale.clone());
                lhs.scale = Expr::one(orig.dtype);
            } else {
                self.fail(
                    orig.span,
                    ErrorKind::NotDivisible {
                        lhs: format_expr(&self.marks, &rhs),
                        rhs: lhs.scale.to_string(),
                        context: "floordiv",
                    },
                );
                return orig.clone();
            }
        }
        // lhs denotes floormod(floordiv(source, lower_factor), extent); dividing
        // by rhs shifts the window up by rhs and shrinks the extent accordingly.
        if self.can_prove_divisible(&lhs.extent, &rhs) {
            lhs.lower_factor = lhs.lower_factor.clone() * rhs.clone();
            lhs.extent = self.analyzer.simplify(&lhs.extent.clone().floordiv(rhs));
            lhs.into_expr(orig.dtype)
        } else {
            self.fail(
                orig.span,
                ErrorKind::NotDivisible {
                    lhs: lhs.extent.to_string(),
                    rhs: rhs.to_string(),
                    context: "floordiv",
                },
            );
            orig.clone()
        }
    }

    /// `floormod(split, rhs)` for a constant-foldable `rhs`.
    fn split_floor_mod_const(&mut self, mut lhs: IterSplit, mut rhs: Expr, orig: &Expr) -> Expr {
        if rhs.is_one() {
            return Expr::zero(orig.dtype).with_span(orig.span);
        }
        if !lhs.scale.is_one() {
            if self.can_prove_divisible(&lhs.scale, &rhs) {
                // floormod(x*c1*c2, c1) = 0
                return Expr::zero(orig.dtype).with_span(orig.span);
            } else if self.can_prove_divisible(&rhs, &lhs.scale) {
                // floormod(x*c1, c1*c2) = floormod(x, c2)*c1
                rhs = rhs.floordiv(lhs.scale.clone());
            } else {
                self.fail(
                    orig.span,
                    ErrorKind::NotDivisible {
                        lhs: format_expr(&self.marks, &rhs),
                        rhs: lhs.scale.to_string(),
                        context: "floormod",
                    },
                );
                return orig.clone();
            }
        }
        if self.can_prove_divisible(&lhs.extent, &rhs) {
            // Keep the window, truncate the extent.
            lhs.extent = rhs;
            lhs.into_expr(orig.dtype)
        } else {
            self.fail(
                orig.span,
                ErrorKind::NotDivisible {
                    lhs: lhs.extent.to_string(),
                    rhs: rhs.to_string(),
                    context: "floormod",
                },
            );
            orig.clone()
        }
    }

    // -------------------------------------------------------------------------
    // Canonical sum algebra
    // -------------------------------------------------------------------------

    fn to_iter_sum(expr: Expr) -> IterSum {
        match expr.kind {
            ExprKind::IterSum(s) => *s,
            ExprKind::IterSplit(s) => {
                let zero = Expr::zero(expr.dtype);
                IterSum::new(vec![*s], zero)
            }
            kind => IterSum::new(Vec::new(), Expr::new(kind, expr.dtype, expr.span)),
        }
    }

    /// Merge a split into a sum: add scales on a matching
    /// `(source, lower_factor, extent)` triple, append otherwise.
    fn add_split_to_lhs(lhs: &mut IterSum, mut rhs: IterSplit, sign: i64) {
        for lvalue in lhs.args.iter_mut() {
            if lvalue.source == rhs.source
                && lvalue.lower_factor == rhs.lower_factor
                && lvalue.extent == rhs.extent
            {
                lvalue.scale = if sign > 0 {
                    lvalue.scale.clone() + rhs.scale
                } else {
                    lvalue.scale.clone() - rhs.scale
                };
                return;
            }
        }
        if sign < 0 {
            rhs.scale = -rhs.scale;
        }
        lhs.args.push(rhs);
    }

    fn add_sum_to_lhs(lhs: &mut IterSum, rhs: &IterSum, sign: i64) {
        for arg in &rhs.args {
            Self::add_split_to_lhs(lhs, arg.clone(), sign);
        }
        lhs.base = if sign > 0 {
            lhs.base.clone() + rhs.base.clone()
        } else {
            lhs.base.clone() - rhs.base.clone()
        };
    }

    fn mul_to_lhs(lhs: &mut IterSum, rhs: &Expr) {
        for arg in lhs.args.iter_mut() {
            arg.scale = arg.scale.clone() * rhs.clone();
        }
        lhs.base = lhs.base.clone() * rhs.clone();
    }

    // -------------------------------------------------------------------------
    // Normalisation
    // -------------------------------------------------------------------------

    fn normalize_to_iter_with_offset(&mut self, sum: IterSum, span: Span) -> IterSum {
        if sum.args.is_empty() {
            return sum;
        }
        match self.try_fuse_iters(&sum, span) {
            Some(fused) => fused,
            None => {
                self.fail(span, ErrorKind::FuseFailed(format_sum(&self.marks, &sum)));
                sum
            }
        }
    }

    /// Normalise an expression known to satisfy `lower <= expr < upper` and
    /// tighten the extent of its fused mark accordingly.
    fn normalize_to_iter_on_bound_expr(
        &mut self,
        mut expr: IterSum,
        mut lower: Option<Expr>,
        mut upper: Option<Expr>,
        span: Span,
    ) -> IterSum {
        let base = expr.base.clone();
        if !base.is_zero() {
            expr.base = Expr::zero(base.dtype);
            lower = lower.map(|lo| lo - base.clone());
            upper = upper.map(|hi| hi - base.clone());
        }
        if expr.args.is_empty() {
            return expr;
        }
        let fused = self.try_fuse_iters(&expr, span);
        if let Some(fused) = fused {
            debug_assert_eq!(fused.args.len(), 1);
            if fused.args[0].scale.is_one() {
                let split = fused.args[0].clone();
                let structured = match self.marks.get(split.source).and_then(|m| m.source_sum()) {
                    Some(s) => s.clone(),
                    None => unreachable!("fused mark source is a sum"),
                };
                let flattened = match self.flattened_map.get(&SumKey(structured.clone())) {
                    Some(f) => f.clone(),
                    None => unreachable!("structured form is registered on mint"),
                };
                let record = match self.sum_fuse_map.get(&SumKey(flattened.clone())) {
                    Some(r) => r.clone(),
                    None => unreachable!("flattened form is registered on mint"),
                };
                let mark = record.mark;
                let mark_extent = match self.marks.get(mark) {
                    Some(node) => node.extent.clone(),
                    None => unreachable!("mark is arena-resident"),
                };
                let mut iter_min = record.offset.clone();
                let mut iter_max = iter_min.clone() + mark_extent.clone();
                if let Some(lo) = &lower {
                    iter_min = lo.clone().max(iter_min);
                }
                if let Some(hi) = &upper {
                    iter_max = hi.clone().min(iter_max);
                }
                let new_extent = self.analyzer.simplify(&(iter_max - iter_min.clone()));
                // Re-tightening is the intersection of bounds and fine on its
                // own, but once the mark has been fused into a larger one its
                // extent is baked into that fusion's scales.
                let changes = !self.analyzer.can_prove_equal(&iter_min, &record.offset)
                    || !self.analyzer.can_prove_equal(&new_extent, &mark_extent);
                if changes && self.frozen.contains(&mark) {
                    self.fail(span, ErrorKind::ConstraintRetightened(format_mark(&self.marks, mark)));
                    return expr;
                }
                if !iter_min.is_zero() {
                    // Shift the structured form and re-key its registration.
                    self.flattened_map.remove(&SumKey(structured.clone()));
                    let mut shifted = structured;
                    shifted.base = -iter_min.clone();
                    let dtype = shifted.base.dtype;
                    if let Some(node) = self.marks.get_mut(mark) {
                        node.source = shifted.clone().into_expr(dtype);
                    }
                    self.flattened_map.insert(SumKey(shifted), flattened.clone());
                }
                if let Some(node) = self.marks.get_mut(mark) {
                    node.extent = new_extent;
                }
                self.sum_fuse_map.insert(
                    SumKey(flattened.clone()),
                    MarkWithOffset {
                        mark,
                        offset: iter_min.clone(),
                    },
                );
                // Remember the flattened form for constraint checking and
                // for the longest-match search during fusion.
                self.constrained_iters_flattened.push(flattened);
                expr.args = vec![split];
                expr.base = base + iter_min;
                return expr;
            }
        }
        self.fail(
            span,
            ErrorKind::BoundNonCanonical {
                sum: format_sum(&self.marks, &expr),
                lower: lower.map_or_else(|| "-inf".to_string(), |e| e.to_string()),
                upper: upper.map_or_else(|| "+inf".to_string(), |e| e.to_string()),
            },
        );
        expr
    }

    // -------------------------------------------------------------------------
    // Fusion
    // -------------------------------------------------------------------------

    /// Try to express `sum(x_i * s_i) + base` as a single split of one
    /// (possibly fresh) fused mark. The terms must form a contiguous scale
    /// ladder `s, s*e1, s*e1*e2, ...` in some order; memoised constraints may
    /// stand in for whole groups of terms, with their offsets accumulated
    /// into the returned base.
    fn try_fuse_iters(&mut self, expr: &IterSum, span: Span) -> Option<IterSum> {
        let n = expr.args.len();
        let dtype = expr.base.dtype;
        let mut visited = vec![false; n];
        let mut flattened_iters: Vec<IterSplit> = Vec::with_capacity(n);
        let mut grouped_iters: Vec<IterSplit> = Vec::new();
        // The term with the smallest literal scale anchors the ladder.
        let mut base_scale: Option<i64> = None;
        let mut base_index = 0;
        for (i, arg) in expr.args.iter().enumerate() {
            if let Some(value) = arg.scale.as_const_int() {
                if base_scale.map_or(true, |best| value < best) {
                    base_scale = Some(value);
                    base_index = i;
                }
            }
        }
        let base_scale = match base_scale {
            Some(value) => value,
            None => {
                self.sink.emit(Diagnostic::error(
                    span,
                    ErrorKind::NoBaseScale(format_sum(&self.marks, expr)),
                ));
                return None;
            }
        };
        let base_scale_expr = Expr::int_typed(base_scale, dtype);
        let mut expected_extra_base = Expr::zero(dtype);
        let mut expected_scale = base_scale_expr.clone();
        let mut i = 0;
        while i < n {
            // Find an unused term carrying the expected scale.
            let mut j = if i == 0 { base_index } else { 0 };
            while j < n {
                if !visited[j]
                    && self
                        .analyzer
                        .can_prove_equal(&expr.args[j].scale, &expected_scale)
                {
                    break;
                }
                j += 1;
            }
            if j == n {
                self.sink.emit(Diagnostic::error(
                    span,
                    ErrorKind::ScaleNotFound {
                        scale: expected_scale.to_string(),
                        sum: format_sum(&self.marks, expr),
                    },
                ));
                return None;
            }
            // Longest memoised constraint whose innermost split matches the
            // current term; constraints are stored shortest-first, so the
            // last match is the longest.
            let mut constraint_to_match: Option<IterSum> = None;
            for candidate in &self.constrained_iters_flattened {
                if let Some(innermost) = candidate.args.last() {
                    if split_equal(&expr.args[j], innermost, false)
                        && constraint_to_match
                            .as_ref()
                            .map_or(true, |c| c.args.len() < candidate.args.len())
                    {
                        constraint_to_match = Some(candidate.clone());
                    }
                }
            }
            if let Some(constraint) = constraint_to_match {
                // Consume every term of the constraint, innermost first; each
                // must appear with the constraint's scale times the ladder's.
                for carg in constraint.args.iter().rev() {
                    let mut k = 0;
                    while k < n {
                        if !visited[k]
                            && split_equal(&expr.args[k], carg, false)
                            && self.analyzer.can_prove_equal(
                                &(carg.scale.clone() * expected_scale.clone()),
                                &expr.args[k].scale,
                            )
                        {
                            break;
                        }
                        k += 1;
                    }
                    if k == n {
                        self.sink.emit(Diagnostic::error(
                            span,
                            ErrorKind::ConstraintMismatch(format_sum(&self.marks, &constraint)),
                        ));
                        return None;
                    }
                    visited[k] = true;
                    flattened_iters.push(expr.args[k].clone());
                }
                let record = match self.sum_fuse_map.get(&SumKey(constraint.clone())) {
                    Some(r) => r.clone(),
                    None => unreachable!("constrained iter is memoised on tightening"),
                };
                grouped_iters.push(IterSplit::whole_scaled(
                    record.mark,
                    &self.marks,
                    expected_scale.clone(),
                ));
                expected_extra_base =
                    expected_extra_base + record.offset.clone() * expected_scale.clone();
                let mark_extent = match self.marks.get(record.mark) {
                    Some(node) => node.extent.clone(),
                    None => unreachable!("mark is arena-resident"),
                };
                expected_scale = expected_scale * mark_extent;
                i += constraint.args.len();
            } else {
                visited[j] = true;
                flattened_iters.push(expr.args[j].clone());
                grouped_iters.push(expr.args[j].clone());
                expected_scale = expected_scale * expr.args[j].extent.clone();
                i += 1;
            }
        }
        // Both forms list splits from outermost to innermost.
        flattened_iters.reverse();
        grouped_iters.reverse();
        let flattened_form = IterSum::new(flattened_iters, Expr::zero(dtype));
        let structured_form = IterSum::new(grouped_iters, Expr::zero(dtype));
        if let Some(record) = self.sum_fuse_map.get(&SumKey(flattened_form.clone())) {
            let record = record.clone();
            let memoised = record.offset.clone() * base_scale_expr.clone();
            if !self.analyzer.can_prove_equal(&expected_extra_base, &memoised) {
                self.sink.emit(Diagnostic::error(
                    span,
                    ErrorKind::InconsistentOffset(expected_extra_base.to_string()),
                ));
                return None;
            }
            Some(IterSum::new(
                vec![IterSplit::whole_scaled(record.mark, &self.marks, base_scale_expr)],
                expr.base.clone() + expected_extra_base,
            ))
        } else {
            for arg in &structured_form.args {
                self.frozen.insert(arg.source);
            }
            let extent = expected_scale.clone().floordiv(base_scale_expr.clone());
            let mark = self
                .marks
                .alloc(IterMarkNode::new(structured_form.clone().into_expr(dtype), extent));
            trace!("fused {} -> {}", format_sum(&self.marks, expr), format_mark(&self.marks, mark));
            self.sum_fuse_map.insert(
                SumKey(flattened_form.clone()),
                MarkWithOffset {
                    mark,
                    offset: Expr::zero(dtype),
                },
            );
            self.flattened_map.insert(SumKey(structured_form), flattened_form);
            Some(IterSum::new(
                vec![IterSplit::whole_scaled(mark, &self.marks, base_scale_expr)],
                expr.base.clone() + expected_extra_base,
            ))
        }
    }

    // -------------------------------------------------------------------------
    // Global checks
    // -------------------------------------------------------------------------

    /// Check that the flattened forms of any two predicate constraints are
    /// either nested or disjoint.
    pub fn check_constraints(&mut self, pred_span: Span) -> bool {
        for i in 0..self.constrained_iters_flattened.len() {
            for j in i + 1..self.constrained_iters_flattened.len() {
                // state: 0 start, -1 disjoint so far, 1 nested so far
                let mut state = 0i32;
                for arg1 in &self.constrained_iters_flattened[i].args {
                    let found = self.constrained_iters_flattened[j]
                        .args
                        .iter()
                        .any(|arg2| split_equal(arg1, arg2, true));
                    if state == 0 {
                        state = if found { 1 } else { -1 };
                    } else if (state == -1 && found) || (state == 1 && !found) {
                        let shown =
                            format_sum(&self.marks, &self.constrained_iters_flattened[i]);
                        self.sink.emit(Diagnostic::error(
                            pred_span,
                            ErrorKind::IllegalConstraints(shown),
                        ));
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Verify that the splits referencing every reachable mark are
    /// independent (and, in bijective mode, exhaustive over both the mark
    /// extents and the input iterators).
    pub fn check_mapping(&mut self, results: &[IterSum], require_bijective: bool) -> bool {
        let collector = SplitCollector::collect(&self.marks, results);
        for &mark in &collector.visit_order {
            let splits = collector.splits_of(mark).to_vec();
            if self.try_normalize_splits(mark, &splits, require_bijective).is_none() {
                let shown = format_mark(&self.marks, mark);
                self.sink.emit(Diagnostic::error(
                    self.mark_span(mark),
                    ErrorKind::MarkNotNormalizable(shown),
                ));
                return false;
            }
        }
        if require_bijective {
            for mark in self.input_marks.clone() {
                if !collector.is_visited(mark) {
                    let shown = format_mark(&self.marks, mark);
                    self.sink.emit(Diagnostic::error(
                        self.mark_span(mark),
                        ErrorKind::InputIterUnused(shown),
                    ));
                    return false;
                }
            }
        }
        true
    }

    /// Order the splits of a mark into a gapless (or, without bijectivity,
    /// divisibility-compatible) chain of ascending lower factors. Returns
    /// the splits from outermost to innermost, or `None` on any violation.
    fn try_normalize_splits(
        &mut self,
        mark: MarkId,
        splits: &[IterSplit],
        require_bijective: bool,
    ) -> Option<Vec<IterSplit>> {
        let mark_node = self.marks.get(mark)?.clone();
        let span = mark_node.source.span;
        let mut used = vec![false; splits.len()];
        let mut iters: Vec<IterSplit> = Vec::with_capacity(splits.len());
        let mut expected_lower_factor = Expr::one(mark_node.extent.dtype);
        for _ in 0..splits.len() {
            let mut j = 0;
            while j < splits.len() {
                if !used[j]
                    && self
                        .analyzer
                        .can_prove_equal(&splits[j].lower_factor, &expected_lower_factor)
                {
                    break;
                }
                j += 1;
            }
            if j == splits.len() {
                if require_bijective {
                    let shown = format_mark(&self.marks, mark);
                    self.sink.emit(Diagnostic::error(
                        span,
                        ErrorKind::IncompleteSplit {
                            mark: shown,
                            expected: expected_lower_factor.to_string(),
                        },
                    ));
                    return None;
                }
                // A gap is fine as long as every remaining lower factor is a
                // multiple of the skipped one; continue at the smallest.
                j = match self.search_skip_lower_factor(splits, &used, &expected_lower_factor) {
                    Some(index) => index,
                    None => {
                        let shown = format_mark(&self.marks, mark);
                        self.sink.emit(Diagnostic::error(
                            span,
                            ErrorKind::SkipSplitNotFound {
                                mark: shown,
                                expected: expected_lower_factor.to_string(),
                            },
                        ));
                        return None;
                    }
                };
            }
            used[j] = true;
            iters.push(splits[j].clone());
            expected_lower_factor = splits[j].lower_factor.clone() * splits[j].extent.clone();
        }
        // With bijectivity the chain must cover the extent exactly;
        // otherwise covering a divisor of it is enough.
        let covered = if require_bijective {
            self.analyzer
                .can_prove_equal(&expected_lower_factor, &mark_node.extent)
        } else {
            self.can_prove_divisible(&mark_node.extent, &expected_lower_factor)
        };
        if !covered {
            let shown = format_mark(&self.marks, mark);
            self.sink.emit(Diagnostic::error(
                span,
                ErrorKind::SplitsDoNotCover {
                    mark: shown,
                    expected: expected_lower_factor.to_string(),
                },
            ));
            return None;
        }
        iters.reverse();
        Some(iters)
    }

    /// Smallest unused lower factor, provided every unused lower factor is
    /// divisible by the skipped `expected_lower_factor`.
    fn search_skip_lower_factor(
        &self,
        splits: &[IterSplit],
        used: &[bool],
        expected_lower_factor: &Expr,
    ) -> Option<usize> {
        let mut result: Option<usize> = None;
        for (i, split) in splits.iter().enumerate() {
            if used[i] {
                continue;
            }
            if !self.can_prove_divisible(&split.lower_factor, expected_lower_factor) {
                return None;
            }
            if result.map_or(true, |r| {
                self.can_prove_divisible(&splits[r].lower_factor, &split.lower_factor)
            }) {
                result = Some(i);
            }
        }
        result
    }

    fn can_prove_divisible(&self, lhs: &Expr, rhs: &Expr) -> bool {
        if let (Some(a), Some(b)) = (lhs.as_const_int(), rhs.as_const_int()) {
            return b != 0 && a % b == 0;
        }
        self.analyzer.can_prove_equal(lhs, rhs)
            || self.analyzer.can_prove(
                &lhs.clone()
                    .floormod(rhs.clone())
                    .equals(Expr::zero(lhs.dtype)),
            )
    }

    fn mark_span(&self, mark: MarkId) -> Span {
        self.marks
            .get(mark)
            .map(|node| node.source.span)
            .unwrap_or_else(Span::generated)
    }

    fn fail(&mut self, span: Span, kind: ErrorKind) {
        self.unresolved_count += 1;
        self.sink.emit(Diagnostic::error(span, kind));
    }
}
