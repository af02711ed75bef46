//! Tests for affine iteration-map inversion.

use crate::ast::{Expr, Var};
use crate::detect::{detect_iter_map, IterRange, IterRanges};
use crate::error::ErrorKind;
use crate::inverse::inverse_affine_iter_map;
use crate::iter::{IterMarkNode, IterSplit, IterSum, MarkArena};

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

#[test]
fn inverts_identity_map() {
    let iters = ranges(&[("x", 0, 8)]);
    let map = detect_iter_map(&[v("x")], &iters, &truth(), true);
    let inverse =
        inverse_affine_iter_map(&map.marks, &map.indices, &[v("out")]).expect("invertible");
    assert_eq!(inverse.len(), 1);
    assert_eq!(inverse[&var("x")], v("out"));
}

#[test]
fn inverts_fused_map() {
    // detect(i*5 + j) then invert: i = out/5, j = out%5.
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5)]);
    let map = detect_iter_map(&[v("i") * 5 + v("j")], &iters, &truth(), true);
    let inverse =
        inverse_affine_iter_map(&map.marks, &map.indices, &[v("out")]).expect("invertible");
    assert_eq!(inverse[&var("i")], v("out").floordiv(c(5)));
    assert_eq!(inverse[&var("j")], v("out").floormod(c(5)));
}

#[test]
fn inverts_three_way_fusion() {
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5), ("k", 0, 2)]);
    let map = detect_iter_map(&[v("i") * 10 + v("j") * 2 + v("k")], &iters, &truth(), true);
    let inverse =
        inverse_affine_iter_map(&map.marks, &map.indices, &[v("out")]).expect("invertible");
    assert_eq!(inverse[&var("i")], v("out").floordiv(c(10)));
    assert_eq!(
        inverse[&var("j")],
        v("out").floordiv(c(2)).floormod(c(5))
    );
    assert_eq!(inverse[&var("k")], v("out").floormod(c(2)));
}

#[test]
fn accumulates_contributions_through_shared_mark() {
    // [y/4, y%4] shares the mark of y: y = a*4 + b.
    let iters = ranges(&[("y", 0, 8)]);
    let indices = [v("y").floordiv(c(4)), v("y").floormod(c(4))];
    let map = detect_iter_map(&indices, &iters, &truth(), true);
    let inverse =
        inverse_affine_iter_map(&map.marks, &map.indices, &[v("a"), v("b")]).expect("invertible");
    assert_eq!(inverse[&var("y")], v("b") + v("a") * 4);
}

#[test]
fn round_trips_through_detection() {
    // Feeding the original index back as the output expresses each iterator
    // in terms of itself: i becomes floordiv(i*5 + j, 5).
    let iters = ranges(&[("i", 0, 4), ("j", 0, 5)]);
    let index = v("i") * 5 + v("j");
    let map = detect_iter_map(&[index.clone()], &iters, &truth(), true);
    let inverse = inverse_affine_iter_map(&map.marks, &map.indices, &[index]).expect("invertible");
    assert_eq!(inverse[&var("i")], (v("i") * 5 + v("j")).floordiv(c(5)));
    assert_eq!(inverse[&var("j")], (v("i") * 5 + v("j")).floormod(c(5)));
}

#[test]
fn rejects_output_arity_mismatch() {
    let iters = ranges(&[("x", 0, 8)]);
    let map = detect_iter_map(&[v("x")], &iters, &truth(), true);
    let err = inverse_affine_iter_map(&map.marks, &map.indices, &[]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::OutputArityMismatch { .. }));
}

#[test]
fn rejects_unsorted_scales() {
    // A hand-built multi-arg sum whose scales ascend is not a fuse pattern.
    let mut marks = MarkArena::new();
    let y = marks.alloc(IterMarkNode::new(v("y"), c(20)));
    let bad_source = IterSum::new(
        vec![
            IterSplit::new(y, c(1), c(4), c(1)),
            IterSplit::new(y, c(4), c(5), c(4)),
        ],
        c(0),
    );
    let fused = marks.alloc(IterMarkNode::new(
        bad_source.into_expr(crate::ast::DType::I32),
        c(20),
    ));
    let iter_map = [IterSum::new(vec![IterSplit::whole(fused, &marks)], c(0))];
    let err = inverse_affine_iter_map(&marks, &iter_map, &[v("out")]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnsortedInverseScales(_)));
}
