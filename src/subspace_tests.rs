//! Tests for subspace division.

use crate::analyzer::Analyzer;
use crate::ast::{Expr, Var};
use crate::detect::{subspace_divide, IterRange, IterRanges, SubspaceDivision};
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

/// `outer * extent(inner) + inner` must lower back to the original binding.
fn assert_composes_to(division: &SubspaceDivision, index: usize, expected: &Expr) {
    let analyzer = Analyzer::new();
    let (outer, inner) = &division.pairs[index];
    let outer_expr = lowering::lower_expr(&analyzer, &division.marks, &outer.source);
    let inner_expr = lowering::lower_expr(&analyzer, &division.marks, &inner.source);
    let composed = outer_expr * inner.extent.clone() + inner_expr;
    assert!(
        analyzer.can_prove_equal(&composed, expected),
        "composition {} is not {}",
        composed,
        expected
    );
}

#[test]
fn divides_fused_binding() {
    // i*10 + j*2 + k against inner {j, k}: outer extent 4, inner extent 10.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let binding = v("i") * 10 + v("j") * 2 + v("k");
    let division = subspace_divide(
        &[binding.clone()],
        &iters,
        &[var("j"), var("k")],
        &truth(),
        true,
    );
    assert_eq!(division.pairs.len(), 1);
    let (outer, inner) = &division.pairs[0];
    assert_eq!(outer.extent, c(4));
    assert_eq!(inner.extent, c(10));
    assert!(division.outer_predicate.is_const_true());
    assert!(division.inner_predicate.is_const_true());
    assert_composes_to(&division, 0, &binding);
}

#[test]
fn divides_with_inner_singleton() {
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let binding = v("i") * 10 + v("j") * 2 + v("k");
    let division = subspace_divide(&[binding.clone()], &iters, &[var("k")], &truth(), true);
    assert_eq!(division.pairs.len(), 1);
    let (outer, inner) = &division.pairs[0];
    assert_eq!(outer.extent, c(20));
    assert_eq!(inner.extent, c(2));
    assert_composes_to(&division, 0, &binding);
}

#[test]
fn rejects_interleaved_subspaces() {
    // With only j inner, the ordering outer(i), inner(j), outer(k) cannot be
    // written as outer * E + inner.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let binding = v("i") * 10 + v("j") * 2 + v("k");
    let division = subspace_divide(&[binding], &iters, &[var("j")], &truth(), true);
    assert!(division.is_empty());
    assert!(!division.diagnostics.is_empty());
}

#[test]
fn predicate_bound_moves_into_inner_predicate() {
    // The fused j*2 + k mark is tightened to extent 9, which no product of
    // split extents matches, so the inner half carries the bound instead.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let binding = v("i") * 9 + v("j") * 2 + v("k");
    let predicate = (v("j") * 2 + v("k")).lt(c(9));
    let division = subspace_divide(
        &[binding.clone()],
        &iters,
        &[var("j"), var("k")],
        &predicate,
        true,
    );
    assert_eq!(division.pairs.len(), 1);
    let (outer, inner) = &division.pairs[0];
    assert_eq!(outer.extent, c(4));
    assert_eq!(inner.extent, c(9));
    // The inner predicate is exactly the tightened bound.
    assert_eq!(division.inner_predicate, (v("j") * 2 + v("k")).lt(c(9)));
    assert!(division.outer_predicate.is_const_true());
    assert_composes_to(&division, 0, &binding);
}

#[test]
fn divides_sliced_bindings_of_one_side() {
    // Both slices of x land in the inner subspace, with empty outer halves.
    let iters = ranges(&[("x", 0, 8)]);
    let bindings = [v("x").floordiv(c(4)), v("x").floormod(c(4))];
    let division = subspace_divide(&bindings, &iters, &[var("x")], &truth(), true);
    assert_eq!(division.pairs.len(), 2);
    assert!(division.pairs[0].0.extent.is_one());
    assert_eq!(division.pairs[0].1.extent, c(2));
    assert!(division.pairs[1].0.extent.is_one());
    assert_eq!(division.pairs[1].1.extent, c(4));
    assert_composes_to(&division, 0, &bindings[0]);
    assert_composes_to(&division, 1, &bindings[1]);
}
