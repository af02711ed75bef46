//! Tests for the predicate splitter.

use crate::analyzer::Analyzer;
use crate::ast::{DType, Expr, Var};
use crate::constraint::match_bound_constraints;
use crate::detect::{IterRange, IterRanges};

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

#[test]
fn single_upper_bound() {
    let iters = ranges(&[("j", 0, 5), ("k", 0, 2)]);
    let pred = (v("j") * 2 + v("k")).lt(c(9));
    let constraints = match_bound_constraints(&pred, &iters);
    assert_eq!(constraints.len(), 1);
    assert_eq!(constraints[0].iter, v("j") * 2 + v("k"));
    assert_eq!(constraints[0].lower_bound, None);
    assert_eq!(constraints[0].upper_bound, Some(c(9)));
}

#[test]
fn inclusive_bounds_shift_by_one() {
    let iters = ranges(&[("j", 0, 5)]);
    // j <= 4 becomes j < 5
    let le = match_bound_constraints(&v("j").le(c(4)), &iters);
    assert_eq!(le[0].upper_bound, Some(c(5)));
    // j > 1 becomes 2 <= j
    let gt = match_bound_constraints(&v("j").gt(c(1)), &iters);
    assert_eq!(gt[0].lower_bound, Some(c(2)));
    // j >= 1 stays 1 <= j
    let ge = match_bound_constraints(&v("j").ge(c(1)), &iters);
    assert_eq!(ge[0].lower_bound, Some(c(1)));
}

#[test]
fn bound_on_the_left() {
    let iters = ranges(&[("j", 0, 5)]);
    // 3 < j becomes 4 <= j
    let constraints = match_bound_constraints(&c(3).lt(v("j")), &iters);
    assert_eq!(constraints[0].iter, v("j"));
    assert_eq!(constraints[0].lower_bound, Some(c(4)));
}

#[test]
fn conjunction_peels_every_comparison() {
    let iters = ranges(&[("j", 0, 5), ("k", 0, 2)]);
    let expr = v("j") * 2 + v("k");
    let pred = expr.clone().ge(c(1)).and(expr.clone().lt(c(9)));
    let constraints = match_bound_constraints(&pred, &iters);
    assert_eq!(constraints.len(), 2);
    assert_eq!(constraints[0].upper_bound, Some(c(9)));
    assert_eq!(constraints[1].lower_bound, Some(c(1)));
}

#[test]
fn splits_iterators_from_both_sides() {
    let analyzer = Analyzer::new();
    let iters = ranges(&[("j", 0, 5), ("k", 0, 2)]);
    // j < k + 1 pivots to (j - k) < 1
    let pred = v("j").lt(v("k") + 1);
    let constraints = match_bound_constraints(&pred, &iters);
    assert_eq!(constraints.len(), 1);
    assert!(analyzer.can_prove_equal(&constraints[0].iter, &(v("j") - v("k"))));
    let upper = constraints[0].upper_bound.clone().expect("upper bound");
    assert!(analyzer.can_prove_equal(&upper, &c(1)));
}

#[test]
fn rejects_non_integer_operands() {
    let iters = ranges(&[("j", 0, 5)]);
    let f = Expr::var(Var::with_dtype("f", DType::Float(32)));
    assert!(match_bound_constraints(&f.lt(v("j")), &iters).is_empty());
}

#[test]
fn rejects_unsupported_comparisons() {
    let iters = ranges(&[("j", 0, 5)]);
    // equality is not a bound constraint
    assert!(match_bound_constraints(&v("j").equals(c(1)), &iters).is_empty());
    // one bad conjunct poisons the whole predicate
    let pred = v("j").lt(c(3)).and(v("j").equals(c(1)));
    assert!(match_bound_constraints(&pred, &iters).is_empty());
}

#[test]
fn trivial_predicate_yields_nothing() {
    let iters = ranges(&[("j", 0, 5)]);
    assert!(match_bound_constraints(&Expr::bool_imm(true), &iters).is_empty());
}
