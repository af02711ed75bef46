//! Predicate splitter.
//!
//! Breaks a conjunction of integer comparisons into per-expression
//! `lower <= e < upper` constraints. Any comparison that does not fit the
//! supported shapes makes the whole predicate unusable, in which case the
//! result is empty and the caller decides whether that is fatal.

use crate::analyzer::Analyzer;
use crate::ast::{Expr, ExprKind, Var};
use crate::detect::IterRanges;

/// A range constraint `lower_bound <= iter < upper_bound` on one iterator
/// expression. Either bound may be absent.
#[derive(Debug, Clone)]
pub struct IterConstraint {
    pub iter: Expr,
    pub lower_bound: Option<Expr>,
    pub upper_bound: Option<Expr>,
    /// Node count of `iter`; constraints are visited shortest first.
    pub expr_size: usize,
}

struct Comparison {
    lhs: Expr,
    rhs: Expr,
    is_greater: bool,
    is_equal: bool,
}

fn as_comparison(expr: &Expr) -> Option<Comparison> {
    let (a, b, is_greater, is_equal) = match &expr.kind {
        ExprKind::Lt(a, b) => (a, b, false, false),
        ExprKind::Le(a, b) => (a, b, false, true),
        ExprKind::Gt(a, b) => (a, b, true, false),
        ExprKind::Ge(a, b) => (a, b, true, true),
        _ => return None,
    };
    Some(Comparison {
        lhs: (**a).clone(),
        rhs: (**b).clone(),
        is_greater,
        is_equal,
    })
}

/// Split `pred` into bound constraints over the input iterators. Returns an
/// empty list when any conjunct fails to match.
pub fn match_bound_constraints(pred: &Expr, input_iters: &IterRanges) -> Vec<IterConstraint> {
    let analyzer = Analyzer::new();
    let uses_itervar = |v: &Var| input_iters.contains_key(v);
    let mut result = Vec::new();
    let mut pred = pred.clone();
    loop {
        // Peel one comparison off the conjunction, trying the right-hand
        // conjunct first.
        let (cmp, rest) = match &pred.kind {
            ExprKind::And(a, b) => {
                if let Some(cmp) = as_comparison(b) {
                    (cmp, Some((**a).clone()))
                } else if let Some(cmp) = as_comparison(a) {
                    (cmp, Some((**b).clone()))
                } else {
                    return Vec::new();
                }
            }
            _ => match as_comparison(&pred) {
                Some(cmp) => (cmp, None),
                None => return Vec::new(),
            },
        };
        // Only integer comparisons produce usable bounds.
        if !cmp.lhs.dtype.is_index() || !cmp.rhs.dtype.is_index() {
            return Vec::new();
        }
        let mut lhs_expr = cmp.lhs.clone();
        let mut rhs_expr = cmp.rhs.clone();
        // Decide which side is the iterator expression. When both sides
        // mention iterators, split the difference into iterator-aware and
        // iterator-free parts, accumulating the bound on the right.
        let bound_at_left = if cmp.lhs.as_const_int().is_some() || !cmp.lhs.uses_var(&uses_itervar)
        {
            true
        } else if cmp.rhs.as_const_int().is_some() || !cmp.rhs.uses_var(&uses_itervar) {
            false
        } else {
            let dtype = cmp.lhs.dtype;
            let mut iter_acc = Expr::zero(dtype);
            let mut bound_acc = Expr::zero(dtype);
            extract_parts(&cmp.lhs, true, &mut iter_acc, &mut bound_acc, &uses_itervar);
            extract_parts(&cmp.rhs, false, &mut iter_acc, &mut bound_acc, &uses_itervar);
            lhs_expr = analyzer.simplify(&iter_acc);
            rhs_expr = analyzer.simplify(&bound_acc);
            false
        };
        // Convert to the exclusive-upper / inclusive-lower form.
        let (iter, lower_bound, upper_bound) = if cmp.is_greater {
            if bound_at_left {
                // bound > iter
                let upper = if cmp.is_equal { lhs_expr + 1 } else { lhs_expr };
                (rhs_expr, None, Some(upper))
            } else {
                // iter > bound
                let lower = if cmp.is_equal { rhs_expr } else { rhs_expr + 1 };
                (lhs_expr, Some(lower), None)
            }
        } else if bound_at_left {
            // bound < iter
            let lower = if cmp.is_equal { lhs_expr } else { lhs_expr + 1 };
            (rhs_expr, Some(lower), None)
        } else {
            // iter < bound
            let upper = if cmp.is_equal { rhs_expr + 1 } else { rhs_expr };
            (lhs_expr, None, Some(upper))
        };
        result.push(IterConstraint {
            iter,
            lower_bound,
            upper_bound,
            expr_size: 0,
        });
        match rest {
            Some(r) => pred = r,
            None => break,
        }
    }
    result
}

/// Walk `+`/`-` structure, adding iterator-mentioning parts to `iter_acc`
/// and (negated) iterator-free parts to `bound_acc`.
fn extract_parts(
    part: &Expr,
    sign: bool,
    iter_acc: &mut Expr,
    bound_acc: &mut Expr,
    uses_itervar: &impl Fn(&Var) -> bool,
) {
    match &part.kind {
        ExprKind::Add(a, b) => {
            extract_parts(a, sign, iter_acc, bound_acc, uses_itervar);
            extract_parts(b, sign, iter_acc, bound_acc, uses_itervar);
        }
        ExprKind::Sub(a, b) => {
            extract_parts(a, sign, iter_acc, bound_acc, uses_itervar);
            extract_parts(b, !sign, iter_acc, bound_acc, uses_itervar);
        }
        _ if part.uses_var(uses_itervar) => {
            *iter_acc = if sign {
                iter_acc.clone() + part.clone()
            } else {
                iter_acc.clone() - part.clone()
            };
        }
        _ => {
            *bound_acc = if sign {
                bound_acc.clone() - part.clone()
            } else {
                bound_acc.clone() + part.clone()
            };
        }
    }
}
