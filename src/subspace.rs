//! Subspace division.
//!
//! Factors each canonical sum into `outer * extent(inner) + inner` with
//! respect to a designated inner set of input iterators, by message passing
//! over splits and sums. When a predicate has tightened a fused mark so
//! that its extent no longer matches the product of its splits, the divided
//! half picks up an explicit `< extent` predicate instead.

use fxhash::{FxHashMap, FxHashSet};

use crate::analyzer::Analyzer;
use crate::ast::{DType, Expr, ExprKind, Span, Var};
use crate::diags::{format_split, format_sum, Diagnostic, DiagnosticSink};
use crate::error::ErrorKind;
use crate::iter::{IterMarkNode, IterSplit, IterSum, MarkArena, SplitCollector};
use crate::lowering;

/// One divided binding: `outer * inner_extent + inner`. Both halves are
/// canonical expressions (a split or a sum).
#[derive(Debug, Clone)]
pub struct DivisionResult {
    pub outer: Expr,
    pub inner: Expr,
    pub outer_extent: Expr,
    pub inner_extent: Expr,
}

impl DivisionResult {
    fn new(outer: Expr, outer_extent: Expr, inner: Expr, inner_extent: Expr) -> Self {
        DivisionResult {
            outer,
            inner,
            outer_extent,
            inner_extent,
        }
    }

    fn inner_only(iter: Expr, extent: Expr) -> Self {
        let dtype = extent.dtype;
        DivisionResult::new(empty_sum(dtype), Expr::one(dtype), iter, extent)
    }

    fn outer_only(iter: Expr, extent: Expr) -> Self {
        let dtype = extent.dtype;
        DivisionResult::new(iter, extent, empty_sum(dtype), Expr::one(dtype))
    }

    /// Entirely in the outer subspace.
    pub fn is_outer(&self) -> bool {
        self.inner_extent.is_one()
    }

    /// Entirely in the inner subspace.
    pub fn is_inner(&self) -> bool {
        self.outer_extent.is_one()
    }
}

fn empty_sum(dtype: DType) -> Expr {
    IterSum::new(Vec::new(), Expr::zero(dtype)).into_expr(dtype)
}

pub struct SubspaceDivider<'a> {
    analyzer: &'a Analyzer,
    sink: &'a mut DiagnosticSink,
    marks: &'a mut MarkArena,
    collector: SplitCollector,
    sub_iters: FxHashSet<Var>,
    /// Memoised division of every encountered split: all splits of a mark
    /// are divided together on first contact.
    split_map: FxHashMap<IterSplit, DivisionResult>,
    outer_preds: Expr,
    inner_preds: Expr,
    unresolved_count: usize,
}

impl<'a> SubspaceDivider<'a> {
    pub fn new(
        analyzer: &'a Analyzer,
        sink: &'a mut DiagnosticSink,
        marks: &'a mut MarkArena,
        collector: SplitCollector,
        sub_iters: FxHashSet<Var>,
    ) -> Self {
        SubspaceDivider {
            analyzer,
            sink,
            marks,
            collector,
            sub_iters,
            split_map: FxHashMap::default(),
            outer_preds: Expr::bool_imm(true),
            inner_preds: Expr::bool_imm(true),
            unresolved_count: 0,
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved_count
    }

    pub fn outer_preds(&self) -> &Expr {
        &self.outer_preds
    }

    pub fn inner_preds(&self) -> &Expr {
        &self.inner_preds
    }

    /// Divide a canonical sum against the extent of the mark it fills.
    pub fn divide_iter_sum(&mut self, expr: &IterSum, mark_extent: &Expr) -> DivisionResult {
        let dtype = expr.base.dtype;
        if expr.args.is_empty() {
            // A bare base is inner: outer*1 + base.
            let inner = IterSum::new(Vec::new(), expr.base.clone()).into_expr(dtype);
            return DivisionResult::new(empty_sum(dtype), Expr::one(dtype), inner, Expr::one(dtype));
        }
        if expr.args.len() == 1 {
            // arg + base: if arg = Y*E(X)+X then arg + base = Y*E(X) + (X + base).
            if !expr.args[0].scale.is_one() {
                return self.fail(
                    expr.base.span,
                    ErrorKind::ExpectScaleOne(format_split(self.marks, &expr.args[0])),
                );
            }
            let mut result = self.divide_iter_split(&expr.args[0]);
            if !expr.base.is_zero() {
                result = Self::add_base(result, expr.base.clone());
            }
            return result;
        }
        // arg1 + ... + argn + base divides only when a contiguous run of
        // inner args (innermost first) is followed by outer args only.
        let mut extent = Expr::one(dtype);
        let mut outer_args: Vec<IterSplit> = Vec::new();
        let mut inner_args: Vec<IterSplit> = Vec::new();
        let mut inner = true;
        let mut scale_is_one = false;
        for arg in expr.args.iter().rev() {
            if arg.scale.is_one() {
                scale_is_one = true;
            }
            let arg_division = self.divide_iter_split(arg);
            let new_arg;
            if arg_division.is_inner() {
                if !inner {
                    return self.fail(
                        expr.base.span,
                        ErrorKind::InterleavedSubspace(format_sum(self.marks, expr)),
                    );
                }
                new_arg = self.as_split(&arg_division.inner, &arg_division.inner_extent);
                inner_args.push(new_arg.clone());
            } else if arg_division.is_outer() {
                new_arg = self.as_split(&arg_division.outer, &arg_division.outer_extent);
                outer_args.push(new_arg.clone());
                inner = false;
            } else {
                return self.fail(
                    expr.base.span,
                    ErrorKind::NeitherInnerNorOuter(format_split(self.marks, arg)),
                );
            }
            extent = extent * new_arg.extent.clone();
        }
        if !scale_is_one {
            return self.fail(
                expr.base.span,
                ErrorKind::ExpectScaleOne(format_sum(self.marks, expr)),
            );
        }
        let (outer_source, outer_extent) =
            Self::mark_from_args_and_base(&outer_args, Expr::zero(dtype));
        let (inner_source, inner_extent) =
            Self::mark_from_args_and_base(&inner_args, expr.base.clone());
        if !self.analyzer.can_prove_equal(&extent, mark_extent) {
            // The mark was tightened by a predicate: the division must stay
            // wholly on one side and carries the bound explicitly.
            if inner_args.is_empty() {
                let lowered = lowering::lower_sum(self.analyzer, self.marks, &outer_source);
                self.outer_preds = self.outer_preds.clone().and(lowered.lt(mark_extent.clone()));
                return DivisionResult::outer_only(
                    outer_source.into_expr(dtype),
                    mark_extent.clone(),
                );
            } else if outer_args.is_empty() {
                let lowered = lowering::lower_sum(self.analyzer, self.marks, &inner_source);
                self.inner_preds = self.inner_preds.clone().and(lowered.lt(mark_extent.clone()));
                return DivisionResult::inner_only(
                    inner_source.into_expr(dtype),
                    mark_extent.clone(),
                );
            }
            return self.fail(
                expr.base.span,
                ErrorKind::PredicateDivision(format_sum(self.marks, expr)),
            );
        }
        DivisionResult::new(
            outer_source.into_expr(dtype),
            outer_extent,
            inner_source.into_expr(dtype),
            inner_extent,
        )
    }

    fn divide_iter_split(&mut self, expr: &IterSplit) -> DivisionResult {
        if let Some(result) = self.split_map.get(expr) {
            return result.clone();
        }
        let node = match self.marks.get(expr.source) {
            Some(node) => node.clone(),
            None => unreachable!("split references a mark outside the arena"),
        };
        let dtype = node.extent.dtype;
        let splits = self.collector.splits_of(expr.source).to_vec();
        match &node.source.kind {
            ExprKind::Var(var) => {
                // Splits of an input iterator land entirely on its side.
                let is_inner = self.sub_iters.contains(var);
                for split in &splits {
                    let as_expr = split.clone().into_expr(dtype);
                    let result = if is_inner {
                        DivisionResult::inner_only(as_expr, split.extent.clone())
                    } else {
                        DivisionResult::outer_only(as_expr, split.extent.clone())
                    };
                    self.split_map.insert(split.clone(), result);
                }
            }
            ExprKind::IterSum(sum) => {
                // source = Y*E(X) + X; the splits divide when a prefix of the
                // ascending lower-factor chain multiplies out to E(X).
                let sum = sum.clone();
                let mark_division = self.divide_iter_sum(&sum, &node.extent);
                if splits.len() == 1 {
                    return mark_division;
                }
                let outer_mark = self.marks.alloc(IterMarkNode::new(
                    mark_division.outer.clone(),
                    mark_division.outer_extent.clone(),
                ));
                let inner_mark = self.marks.alloc(IterMarkNode::new(
                    mark_division.inner.clone(),
                    mark_division.inner_extent.clone(),
                ));
                let mut encountered_boundary = mark_division.is_outer();
                let mut used = vec![false; splits.len()];
                let mut inner_iters: Vec<IterSplit> = Vec::new();
                let mut outer_iters: Vec<IterSplit> = Vec::new();
                let mut expected_lower_factor = Expr::one(dtype);
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
                        return self.fail(
                            node.source.span,
                            ErrorKind::LowerFactorNotFound {
                                mark: format_sum(self.marks, &sum),
                                expected: expected_lower_factor.to_string(),
                            },
                        );
                    }
                    used[j] = true;
                    if !encountered_boundary {
                        inner_iters.push(splits[j].clone());
                    } else {
                        outer_iters.push(splits[j].clone());
                    }
                    expected_lower_factor =
                        splits[j].lower_factor.clone() * splits[j].extent.clone();
                    if self
                        .analyzer
                        .can_prove_equal(&expected_lower_factor, &mark_division.inner_extent)
                    {
                        encountered_boundary = true;
                    }
                }
                if !encountered_boundary {
                    return self.fail(
                        node.source.span,
                        ErrorKind::NoSubspaceBoundary(format_split(self.marks, expr)),
                    );
                }
                // Inner splits keep their window inside the inner half;
                // outer splits rebase onto the outer half.
                for inner_iter in &inner_iters {
                    let mut new_iter = inner_iter.clone();
                    new_iter.source = inner_mark;
                    self.split_map.insert(
                        inner_iter.clone(),
                        DivisionResult::inner_only(
                            new_iter.into_expr(dtype),
                            inner_iter.extent.clone(),
                        ),
                    );
                }
                for outer_iter in &outer_iters {
                    let mut new_iter = outer_iter.clone();
                    new_iter.source = outer_mark;
                    new_iter.lower_factor = outer_iter
                        .lower_factor
                        .clone()
                        .floordiv(outer_iters[0].lower_factor.clone());
                    self.split_map.insert(
                        outer_iter.clone(),
                        DivisionResult::outer_only(
                            new_iter.into_expr(dtype),
                            outer_iter.extent.clone(),
                        ),
                    );
                }
            }
            _ => {
                return self.fail(
                    node.source.span,
                    ErrorKind::UnsupportedDivisionSource(format_split(self.marks, expr)),
                );
            }
        }
        match self.split_map.get(expr) {
            Some(result) => result.clone(),
            None => unreachable!("splits of a mark are divided together"),
        }
    }

    /// Wrap a division half into a split, minting a mark for sums.
    fn as_split(&mut self, expr: &Expr, extent: &Expr) -> IterSplit {
        match &expr.kind {
            ExprKind::IterSplit(s) => (**s).clone(),
            ExprKind::IterSum(s) => {
                let mark = self
                    .marks
                    .alloc(IterMarkNode::new(s.clone().into_expr(expr.dtype), extent.clone()));
                IterSplit::whole(mark, self.marks)
            }
            _ => unreachable!("division halves are canonical"),
        }
    }

    /// Re-scale args (given inner to outer) into a sum and its total extent.
    fn mark_from_args_and_base(args: &[IterSplit], base: Expr) -> (IterSum, Expr) {
        let dtype = base.dtype;
        let mut extent = Expr::one(dtype);
        let mut scaled: Vec<IterSplit> = Vec::with_capacity(args.len());
        for arg in args {
            let mut arg = arg.clone();
            arg.scale = extent.clone();
            extent = extent * arg.extent.clone();
            scaled.push(arg);
        }
        scaled.reverse();
        (IterSum::new(scaled, base), extent)
    }

    fn add_base(division: DivisionResult, base: Expr) -> DivisionResult {
        let mut result = division;
        let dtype = base.dtype;
        match result.inner.kind.clone() {
            ExprKind::IterSplit(s) => {
                result.inner = IterSum::new(vec![*s], base).into_expr(dtype);
            }
            ExprKind::IterSum(s) => {
                let shifted = IterSum::new(s.args, s.base + base);
                result.inner = shifted.into_expr(dtype);
            }
            _ => {}
        }
        result
    }

    fn fail(&mut self, span: Span, kind: ErrorKind) -> DivisionResult {
        self.unresolved_count += 1;
        self.sink.emit(Diagnostic::error(span, kind));
        let dtype = DType::I32;
        DivisionResult::new(
            empty_sum(dtype),
            Expr::zero(dtype),
            empty_sum(dtype),
            Expr::zero(dtype),
        )
    }
}
