//! Public entry points of the detector.
//!
//! Each call constructs its own analyzer, rewriter and diagnostic sink;
//! nothing is shared across calls. Failures surface as an empty result plus
//! the sink's records.

use fxhash::FxHashSet;
use indexmap::IndexMap;
use log::debug;

use crate::analyzer::Analyzer;
use crate::ast::{Expr, Span, Var};
use crate::constraint::match_bound_constraints;
use crate::diags::{Diagnostic, DiagnosticSink};
use crate::error::ErrorKind;
use crate::iter::{IterMarkNode, IterSum, MarkArena, SplitCollector};
use crate::lowering;
use crate::rewriter::IterMapRewriter;
use crate::subspace::SubspaceDivider;

/// Half-open range `[min, min + extent)` of an input iterator.
#[derive(Debug, Clone)]
pub struct IterRange {
    pub min: Expr,
    pub extent: Expr,
}

impl IterRange {
    pub fn new(min: Expr, extent: Expr) -> Self {
        IterRange { min, extent }
    }
}

/// Input iterators with their ranges, in declaration order.
pub type IterRanges = IndexMap<Var, IterRange>;

/// Result of [`detect_iter_map`]: the canonical sums (one per index, empty
/// on failure), the arena holding every mark they reference, and the
/// diagnostics explaining any failure.
#[derive(Debug)]
pub struct AffineIterMap {
    pub marks: MarkArena,
    pub indices: Vec<IterSum>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AffineIterMap {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Result of [`subspace_divide`]: an `(outer, inner)` mark pair per binding
/// plus the predicates collected for halves that carry a tightened bound.
#[derive(Debug)]
pub struct SubspaceDivision {
    pub marks: MarkArena,
    pub pairs: Vec<(IterMarkNode, IterMarkNode)>,
    pub outer_predicate: Expr,
    pub inner_predicate: Expr,
    pub diagnostics: Vec<Diagnostic>,
}

impl SubspaceDivision {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Detect whether every index is an affine (fused/split/scaled) map of the
/// input iterators under `predicate`. With `require_bijective` the mapping
/// must additionally use every input iterator and cover each mark exactly.
pub fn detect_iter_map(
    indices: &[Expr],
    input_iters: &IterRanges,
    predicate: &Expr,
    require_bijective: bool,
) -> AffineIterMap {
    let analyzer = Analyzer::new();
    let mut sink = DiagnosticSink::new();
    let (marks, sums) = detect_impl(
        indices,
        input_iters,
        predicate,
        require_bijective,
        &analyzer,
        &mut sink,
    );
    AffineIterMap {
        marks,
        indices: sums,
        diagnostics: sink.into_diagnostics(),
    }
}

/// Detect and lower back: on success the indices come back in canonical
/// shape, on failure they come back unchanged.
pub fn iter_map_simplify(
    indices: &[Expr],
    input_iters: &IterRanges,
    predicate: &Expr,
    require_bijective: bool,
) -> Vec<Expr> {
    let analyzer = Analyzer::new();
    let mut sink = DiagnosticSink::new();
    let (marks, sums) = detect_impl(
        indices,
        input_iters,
        predicate,
        require_bijective,
        &analyzer,
        &mut sink,
    );
    if sums.is_empty() {
        return indices.to_vec();
    }
    sums.iter()
        .map(|sum| lowering::lower_sum(&analyzer, &marks, sum))
        .collect()
}

/// Factor every binding into `outer * extent(inner) + inner` with respect
/// to the `sub_iters` inner iterator set.
pub fn subspace_divide(
    bindings: &[Expr],
    input_iters: &IterRanges,
    sub_iters: &[Var],
    predicate: &Expr,
    require_bijective: bool,
) -> SubspaceDivision {
    let analyzer = Analyzer::new();
    let mut sink = DiagnosticSink::new();
    let (mut marks, maps) = detect_impl(
        bindings,
        input_iters,
        predicate,
        require_bijective,
        &analyzer,
        &mut sink,
    );
    let mut pairs = Vec::with_capacity(maps.len());
    let mut outer_predicate = Expr::bool_imm(true);
    let mut inner_predicate = Expr::bool_imm(true);
    if !maps.is_empty() {
        let collector = SplitCollector::collect(&marks, &maps);
        let sub_set: FxHashSet<Var> = sub_iters.iter().cloned().collect();
        let mut divider =
            SubspaceDivider::new(&analyzer, &mut sink, &mut marks, collector, sub_set);
        let mut failed = false;
        for expr in &maps {
            let zero = Expr::zero(expr.base.dtype);
            let result = divider.divide_iter_sum(expr, &zero);
            if divider.unresolved_count() > 0 {
                failed = true;
                break;
            }
            pairs.push((
                IterMarkNode::new(result.outer, result.outer_extent),
                IterMarkNode::new(result.inner, result.inner_extent),
            ));
        }
        if failed {
            pairs.clear();
        } else {
            outer_predicate = divider.outer_preds().clone();
            inner_predicate = divider.inner_preds().clone();
        }
    }
    SubspaceDivision {
        marks,
        pairs,
        outer_predicate,
        inner_predicate,
        diagnostics: sink.into_diagnostics(),
    }
}

fn detect_impl(
    indices: &[Expr],
    input_iters: &IterRanges,
    predicate: &Expr,
    require_bijective: bool,
    analyzer: &Analyzer,
    sink: &mut DiagnosticSink,
) -> (MarkArena, Vec<IterSum>) {
    if !iter_range_sanity_check(input_iters) {
        sink.emit(Diagnostic::error(Span::generated(), ErrorKind::BadIterRanges));
        return (MarkArena::new(), Vec::new());
    }
    let mut constraints = match_bound_constraints(predicate, input_iters);
    if !predicate.is_const_true() && constraints.is_empty() {
        sink.emit(Diagnostic::error(
            predicate.span,
            ErrorKind::PredicateNotParsed(predicate.to_string()),
        ));
        return (MarkArena::new(), Vec::new());
    }
    // Rewrite constraints shortest-first: a constraint over a larger
    // expression contains its sub-constraints' iterators, so their marks
    // must exist before it is visited.
    for constraint in &mut constraints {
        constraint.expr_size = constraint.iter.num_nodes();
    }
    constraints.sort_by_key(|constraint| constraint.expr_size);

    let mut rewriter = IterMapRewriter::new(analyzer, sink, input_iters);
    for constraint in &constraints {
        rewriter.rewrite_iter_constraint(
            &constraint.iter,
            constraint.lower_bound.clone(),
            constraint.upper_bound.clone(),
        );
        if rewriter.unresolved_count() > 0 {
            return (rewriter.into_marks(), Vec::new());
        }
    }
    if !rewriter.check_constraints(predicate.span) {
        return (rewriter.into_marks(), Vec::new());
    }
    let mut results = Vec::with_capacity(indices.len());
    for index in indices {
        results.push(rewriter.rewrite(index));
        if rewriter.unresolved_count() > 0 {
            return (rewriter.into_marks(), Vec::new());
        }
    }
    if !rewriter.check_mapping(&results, require_bijective) {
        let marks = rewriter.into_marks();
        sink.emit(Diagnostic::error(predicate.span, ErrorKind::NotIndependent));
        return (marks, Vec::new());
    }
    debug!("detected affine iter map over {} indices", results.len());
    (rewriter.into_marks(), results)
}

/// Iterator ranges must not mention other input iterators.
fn iter_range_sanity_check(input_iters: &IterRanges) -> bool {
    let uses_input = |v: &Var| input_iters.contains_key(v);
    for range in input_iters.values() {
        if range.min.uses_var(&uses_input) || range.extent.uses_var(&uses_input) {
            return false;
        }
    }
    true
}
