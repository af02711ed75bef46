//! Tests for the arithmetic analyzer.

use crate::analyzer::Analyzer;
use crate::ast::{Expr, Var};

fn v(name: &str) -> Expr {
    Expr::var(Var::new(name))
}

fn c(value: i64) -> Expr {
    Expr::int(value)
}

#[test]
fn folds_constant_differences() {
    let analyzer = Analyzer::new();
    let expr = (v("x") + c(2)) - (v("x") + c(1));
    assert_eq!(analyzer.simplify(&expr), c(1));
}

#[test]
fn cancels_common_terms() {
    let analyzer = Analyzer::new();
    let lhs = v("x") * 3 + v("y") - v("x") * 2;
    let rhs = v("x") + v("y");
    assert!(analyzer.can_prove_equal(&lhs, &rhs));
    assert!(!analyzer.can_prove_equal(&lhs, &v("y")));
}

#[test]
fn collects_repeated_atoms() {
    let analyzer = Analyzer::new();
    let expr = v("x") + v("x");
    assert_eq!(analyzer.simplify(&expr), v("x") * 2);
}

#[test]
fn proves_constant_offset_comparisons() {
    let analyzer = Analyzer::new();
    assert!(analyzer.can_prove(&(v("x") + c(1)).gt(v("x"))));
    assert!(analyzer.can_prove(&v("x").le(v("x"))));
    assert!(!analyzer.can_prove(&v("x").lt(v("x"))));
    // No range information: an unconstrained variable proves nothing.
    assert!(!analyzer.can_prove(&v("j").lt(c(9))));
}

#[test]
fn sees_through_exact_floordiv() {
    let analyzer = Analyzer::new();
    let expr = (v("x") * 4).floordiv(c(4));
    assert_eq!(analyzer.simplify(&expr), v("x"));
    let residue = (v("x") * 4).floormod(c(4));
    assert!(analyzer.simplify(&residue).is_zero());
}

#[test]
fn proves_divisibility_via_floormod() {
    let analyzer = Analyzer::new();
    let claim = (v("x") * 6).floormod(c(3)).equals(c(0));
    assert!(analyzer.can_prove(&claim));
    let wrong = (v("x") * 5).floormod(c(3)).equals(c(0));
    assert!(!analyzer.can_prove(&wrong));
}

#[test]
fn orders_min_max_at_constant_distance() {
    let analyzer = Analyzer::new();
    assert_eq!(analyzer.simplify(&v("x").min(v("x") + 3)), v("x"));
    assert_eq!(analyzer.simplify(&v("x").max(v("x") + 3)), v("x") + 3);
    // Incomparable operands stay symbolic.
    let kept = analyzer.simplify(&v("x").min(v("y")));
    assert_eq!(kept, v("x").min(v("y")));
}

#[test]
fn conjunction_folding() {
    let analyzer = Analyzer::new();
    let proven = c(1).lt(c(2)).and((v("x") + c(1)).gt(v("x")));
    assert!(analyzer.can_prove(&proven));
    let open = c(1).lt(c(2)).and(v("x").lt(c(2)));
    assert!(!analyzer.can_prove(&open));
}
