//! End-to-end tests for affine iteration-map detection.

use crate::analyzer::Analyzer;
use crate::ast::{DType, Expr, ExprKind, Var};
use crate::detect::{detect_iter_map, iter_map_simplify, AffineIterMap, IterRange, IterRanges};
use crate::error::ErrorKind;
use crate::iter::IterSum;
use crate::lowering;

fn var(name: &str) -> Var {
    Var::new(name)
}

fn v(name: &str) -> Expr {
    Expr::var(var(name))
}

fn c(value: i64) -> Expr {
    Expr::int(value)
}

fn ranges(dims: &[(&str, i64, i64)]) -> IterRanges {
    dims.iter()
        .map(|(name, min, extent)| (var(name), IterRange::new(c(*min), c(*extent))))
        .collect()
}

fn truth() -> Expr {
    Expr::bool_imm(true)
}

/// The structured sum backing the mark of a canonical sum's only split.
fn structured_form<'a>(map: &'a AffineIterMap, index: usize) -> &'a IterSum {
    let split = &map.indices[index].args[0];
    map.marks
        .get(split.source)
        .and_then(|mark| mark.source_sum())
        .expect("fused mark has a structured sum source")
}

fn mark_extent(map: &AffineIterMap, index: usize) -> Expr {
    let split = &map.indices[index].args[0];
    map.marks.get(split.source).expect("mark").extent.clone()
}

/// Analyzer-checked round trip: lowering the detected form yields the
/// original index under the input range assumptions.
fn assert_lowers_to(map: &AffineIterMap, index: usize, expected: &Expr) {
    let analyzer = Analyzer::new();
    let lowered = lowering::lower_sum(&analyzer, &map.marks, &map.indices[index]);
    assert!(
        analyzer.can_prove_equal(&lowered, expected),
        "lowered form {} is not {}",
        lowered,
        expected
    );
}

fn has_error(map: &AffineIterMap, pred: impl Fn(&ErrorKind) -> bool) -> bool {
    map.diagnostics.iter().any(|d| pred(&d.kind))
}

// =============================================================================
// Successful detections
// =============================================================================

#[test]
fn detects_single_iterator() {
    let iters = ranges(&[("i", 0, 4)]);
    let map = detect_iter_map(&[v("i")], &iters, &truth(), true);
    assert_eq!(map.indices.len(), 1);
    assert!(map.indices[0].base.is_zero());
    assert_eq!(map.indices[0].args.len(), 1);
    assert!(map.indices[0].args[0].scale.is_one());
    assert_eq!(mark_extent(&map, 0), c(4));
    assert_lowers_to(&map, 0, &v("i"));
}

#[test]
fn fuses_contiguous_scales() {
    // i*10 + j*2 + k with extents 4, 5, 2 is one fused iterator of extent 40.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let index = v("i") * 10 + v("j") * 2 + v("k");
    let map = detect_iter_map(&[index.clone()], &iters, &truth(), true);
    assert_eq!(map.indices.len(), 1);
    let sum = &map.indices[0];
    assert!(sum.base.is_zero());
    assert_eq!(sum.args.len(), 1);
    assert!(sum.args[0].scale.is_one());
    assert!(sum.args[0].lower_factor.is_one());
    assert_eq!(mark_extent(&map, 0), c(40));
    // The structured form lists the splits outermost first.
    let structured = structured_form(&map, 0);
    let scales: Vec<Expr> = structured.args.iter().map(|a| a.scale.clone()).collect();
    assert_eq!(scales, vec![c(10), c(2), c(1)]);
    assert_lowers_to(&map, 0, &index);
}

#[test]
fn fuses_under_predicate() {
    // i*9 + j*2 + k with j*2 + k < 9: the inner pair fuses into a mark of
    // extent 9 and the whole map has extent 36.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let index = v("i") * 9 + v("j") * 2 + v("k");
    let predicate = (v("j") * 2 + v("k")).lt(c(9));
    let map = detect_iter_map(&[index.clone()], &iters, &predicate, true);
    assert_eq!(map.indices.len(), 1);
    assert_eq!(mark_extent(&map, 0), c(36));
    let structured = structured_form(&map, 0);
    assert_eq!(structured.args.len(), 2);
    assert_eq!(structured.args[0].scale, c(9));
    assert!(structured.args[1].scale.is_one());
    // The second split is the fused j*2 + k mark, tightened to extent 9.
    let inner = map
        .marks
        .get(structured.args[1].source)
        .expect("inner mark");
    assert_eq!(inner.extent, c(9));
    assert_lowers_to(&map, 0, &index);
}

#[test]
fn fuses_with_offset_bounds() {
    // 1 <= j*2 + k < 9 shifts the fused inner mark by one: extent 8,
    // offset 1, and the detected sum carries base 1.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let index = v("i") * 8 + v("j") * 2 + v("k");
    let inner_expr = v("j") * 2 + v("k");
    let predicate = inner_expr.clone().ge(c(1)).and(inner_expr.lt(c(9)));
    let map = detect_iter_map(&[index.clone()], &iters, &predicate, true);
    assert_eq!(map.indices.len(), 1);
    assert_eq!(map.indices[0].base, c(1));
    assert_eq!(mark_extent(&map, 0), c(32));
    let structured = structured_form(&map, 0);
    let inner = map
        .marks
        .get(structured.args[1].source)
        .expect("inner mark");
    assert_eq!(inner.extent, c(8));
    // The shift shows up as the structured form's negated base.
    let inner_structured = inner.source_sum().expect("inner structured form");
    assert_eq!(inner_structured.base, c(-1));
    assert_lowers_to(&map, 0, &index);
}

#[test]
fn shares_mark_between_div_and_mod() {
    // y/4 and y%4 slice the same source iterator without overlap.
    let iters = ranges(&[("y", 0, 8)]);
    let indices = [v("y").floordiv(c(4)), v("y").floormod(c(4))];
    let map = detect_iter_map(&indices, &iters, &truth(), true);
    assert_eq!(map.indices.len(), 2);
    let div_split = &structured_form(&map, 0).args[0];
    let mod_split = &structured_form(&map, 1).args[0];
    assert_eq!(div_split.source, mod_split.source);
    assert_eq!(div_split.lower_factor, c(4));
    assert_eq!(div_split.extent, c(2));
    assert!(mod_split.lower_factor.is_one());
    assert_eq!(mod_split.extent, c(4));
    let source = map.marks.get(div_split.source).expect("source mark");
    assert_eq!(source.extent, c(8));
    assert_lowers_to(&map, 0, &indices[0]);
    assert_lowers_to(&map, 1, &indices[1]);
}

#[test]
fn allows_incomplete_cover_without_bijectivity() {
    let iters = ranges(&[("y", 0, 8)]);
    let indices = [v("y").floordiv(c(4))];
    let partial = detect_iter_map(&indices, &iters, &truth(), false);
    assert_eq!(partial.indices.len(), 1);
    // The same binding cannot be bijective: y%4 is missing.
    let bijective = detect_iter_map(&indices, &iters, &truth(), true);
    assert!(bijective.is_empty());
    assert!(!bijective.diagnostics.is_empty());
}

#[test]
fn skips_middle_split_without_bijectivity() {
    // y in [0, 24) sliced as [y/6, y%2] skips the middle (y/2)%3 slice;
    // legal when bijectivity is not required.
    let iters = ranges(&[("y", 0, 24)]);
    let indices = [v("y").floordiv(c(6)), v("y").floormod(c(2))];
    let map = detect_iter_map(&indices, &iters, &truth(), false);
    assert_eq!(map.indices.len(), 2);
    assert!(detect_iter_map(&indices, &iters, &truth(), true).is_empty());
}

#[test]
fn detects_constant_index() {
    let iters = ranges(&[("i", 0, 4)]);
    let map = detect_iter_map(&[c(7)], &iters, &truth(), false);
    assert_eq!(map.indices.len(), 1);
    assert!(map.indices[0].args.is_empty());
    assert_eq!(map.indices[0].base, c(7));
}

#[test]
fn carries_nonzero_range_minimum() {
    let iters = ranges(&[("x", 1, 4)]);
    let map = detect_iter_map(&[v("x")], &iters, &truth(), false);
    assert_eq!(map.indices.len(), 1);
    assert_eq!(map.indices[0].base, c(1));
    assert_lowers_to(&map, 0, &v("x"));
}

#[test]
fn degenerate_extent_one_iterator_is_constant() {
    let iters = ranges(&[("u", 3, 1), ("i", 0, 4)]);
    let map = detect_iter_map(&[v("u") + v("i")], &iters, &truth(), false);
    assert_eq!(map.indices.len(), 1);
    assert_eq!(map.indices[0].base, c(3));
    assert_lowers_to(&map, 0, &(v("i") + c(3)));
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn rejects_overlapping_splits() {
    // x and x + 1 produce two overlapping identity slices.
    let iters = ranges(&[("x", 0, 8)]);
    let map = detect_iter_map(&[v("x"), v("x") + 1], &iters, &truth(), true);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::IncompleteSplit { .. })));
}

#[test]
fn rejects_multiplied_iterators() {
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5)]);
    let map = detect_iter_map(&[v("i") * v("j")], &iters, &truth(), false);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::MultiplyIterators(_))));
}

#[test]
fn rejects_division_by_iterator() {
    let iters = ranges(&[("i", 0, 4), ("j", 0, 8)]);
    let div = detect_iter_map(&[v("j").floordiv(v("i"))], &iters, &truth(), false);
    assert!(div.is_empty());
    assert!(has_error(&div, |kind| matches!(kind, ErrorKind::DivideByIterator(_))));
    let modulo = detect_iter_map(&[v("j").floormod(v("i"))], &iters, &truth(), false);
    assert!(modulo.is_empty());
    assert!(has_error(&modulo, |kind| matches!(kind, ErrorKind::ModByIterator(_))));
}

#[test]
fn rejects_unprovable_divisibility() {
    // 3 does not divide the extent 8.
    let iters = ranges(&[("y", 0, 8)]);
    let map = detect_iter_map(&[v("y").floordiv(c(3))], &iters, &truth(), false);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::NotDivisible { .. })));
}

#[test]
fn bijective_mode_requires_every_iterator() {
    let iters = ranges(&[("x", 0, 8), ("y", 0, 6)]);
    let indices = [v("x").floordiv(c(4)), v("x").floormod(c(4))];
    let map = detect_iter_map(&indices, &iters, &truth(), true);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::InputIterUnused(_))));
    assert_eq!(detect_iter_map(&indices, &iters, &truth(), false).indices.len(), 2);
}

#[test]
fn failure_is_monotonic() {
    // One bad index empties the whole result.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5)]);
    let map = detect_iter_map(&[v("i"), v("i") * v("j")], &iters, &truth(), false);
    assert!(map.is_empty());
}

#[test]
fn rejects_canonical_node_in_non_index_position() {
    let iters = ranges(&[("i", 0, 4)]);
    let f = Expr::var(Var::with_dtype("f", DType::Float(32)));
    // The addition types as float, so the rewritten iterator leaks into a
    // non-index position.
    let index = Expr::new(
        ExprKind::Add(Box::new(f), Box::new(v("i"))),
        DType::Float(32),
        crate::ast::Span::generated(),
    );
    let map = detect_iter_map(&[index], &iters, &truth(), false);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::CanonicalInBadPosition(_))));
}

#[test]
fn rejects_unparseable_predicate() {
    let iters = ranges(&[("i", 0, 4)]);
    let map = detect_iter_map(&[v("i")], &iters, &v("i").equals(c(1)), false);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::PredicateNotParsed(_))));
}

#[test]
fn rejects_self_referential_ranges() {
    let mut iters = IterRanges::new();
    iters.insert(var("j"), IterRange::new(v("k"), c(4)));
    iters.insert(var("k"), IterRange::new(c(0), c(2)));
    let map = detect_iter_map(&[v("j")], &iters, &truth(), false);
    assert!(map.is_empty());
    assert!(has_error(&map, |kind| matches!(kind, ErrorKind::BadIterRanges)));
}

// =============================================================================
// iter_map_simplify
// =============================================================================

#[test]
fn simplify_round_trips_affine_indices() {
    let analyzer = Analyzer::new();
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let index = v("i") * 10 + v("j") * 2 + v("k");
    let simplified = iter_map_simplify(&[index.clone()], &iters, &truth(), true);
    assert_eq!(simplified.len(), 1);
    assert!(analyzer.can_prove_equal(&simplified[0], &index));
}

#[test]
fn simplify_returns_input_on_failure() {
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5)]);
    let index = v("i") * v("j");
    let unchanged = iter_map_simplify(&[index.clone()], &iters, &truth(), false);
    assert_eq!(unchanged, vec![index]);
}
