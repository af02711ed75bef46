//! Lowering of canonical forms back to plain integer expressions.

use crate::analyzer::Analyzer;
use crate::ast::{Expr, ExprKind};
use crate::iter::{IterSplit, IterSum, MarkArena};

/// Lower a canonical sum to a plain expression: the lowered splits summed
/// up, plus the base.
pub fn lower_sum(analyzer: &Analyzer, marks: &MarkArena, sum: &IterSum) -> Expr {
    let mut result = Expr::zero(sum.base.dtype);
    for arg in &sum.args {
        result = result + lower_split(analyzer, marks, arg);
    }
    result + sum.base.clone()
}

/// Lower a single split. The three shapes are proof-gated: an identity
/// slice lowers to `source * scale`, an outermost slice drops the modulo,
/// anything else keeps the full `floormod(floordiv(..))` form.
pub fn lower_split(analyzer: &Analyzer, marks: &MarkArena, split: &IterSplit) -> Expr {
    let node = match marks.get(split.source) {
        Some(node) => node,
        None => unreachable!("split references a mark outside the arena"),
    };
    let source = match &node.source.kind {
        ExprKind::Var(_) => node.source.clone(),
        ExprKind::IterSum(s) => lower_sum(analyzer, marks, s),
        _ => lower_expr(analyzer, marks, &node.source),
    };
    if split.lower_factor.is_one() && analyzer.can_prove_equal(&split.extent, &node.extent) {
        source * split.scale.clone()
    } else if analyzer.can_prove_equal(
        &node.extent,
        &(split.lower_factor.clone() * split.extent.clone()),
    ) {
        source.floordiv(split.lower_factor.clone()) * split.scale.clone()
    } else {
        source
            .floordiv(split.lower_factor.clone())
            .floormod(split.extent.clone())
            * split.scale.clone()
    }
}

/// Lower an arbitrary expression, converting canonical nodes wherever they
/// appear.
pub fn lower_expr(analyzer: &Analyzer, marks: &MarkArena, expr: &Expr) -> Expr {
    use ExprKind::*;
    match &expr.kind {
        IterSplit(s) => lower_split(analyzer, marks, s),
        IterSum(s) => lower_sum(analyzer, marks, s),
        Var(_) | IntImm(_) | BoolImm(_) => expr.clone(),
        _ => {
            let children: Vec<Expr> = expr
                .children()
                .into_iter()
                .map(|c| lower_expr(analyzer, marks, c))
                .collect();
            let (a, b) = (Box::new(children[0].clone()), Box::new(children[1].clone()));
            let kind = match &expr.kind {
                Add(..) => Add(a, b),
                Sub(..) => Sub(a, b),
                Mul(..) => Mul(a, b),
                FloorDiv(..) => FloorDiv(a, b),
                FloorMod(..) => FloorMod(a, b),
                Min(..) => Min(a, b),
                Max(..) => Max(a, b),
                Eq(..) => Eq(a, b),
                Lt(..) => Lt(a, b),
                Le(..) => Le(a, b),
                Gt(..) => Gt(a, b),
                Ge(..) => Ge(a, b),
                And(..) => And(a, b),
                _ => unreachable!("leaf kinds are handled above"),
            };
            Expr::new(kind, expr.dtype, expr.span)
        }
    }
}
