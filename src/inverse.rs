//! Inversion of affine iteration maps.
//!
//! Given symbolic values for the detected outputs, recover the value of each
//! input iterator by back-propagation: outputs feed their sums, sums feed
//! their splits (undoing the fuse pattern with floordiv/floormod), splits
//! feed their source marks, and input-variable sources terminate in the
//! result map.
//!
//! The accumulator is keyed per mark: a mark's source sum is the only node
//! that can be shared between outputs, while every split has exactly one
//! owner sum, so a split's single contribution is forwarded immediately.

use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;

use crate::analyzer::Analyzer;
use crate::ast::{Expr, ExprKind, Span, Var};
use crate::diags::{format_sum, Diagnostic};
use crate::error::ErrorKind;
use crate::iter::{IterSplit, IterSum, MarkArena, MarkId};

/// Recover each input iterator from the `outputs` of a detected map.
/// Requires one output expression per canonical sum.
pub fn inverse_affine_iter_map(
    marks: &MarkArena,
    iter_map: &[IterSum],
    outputs: &[Expr],
) -> Result<IndexMap<Var, Expr>, Diagnostic> {
    if iter_map.len() != outputs.len() {
        return Err(Diagnostic::error(
            Span::generated(),
            ErrorKind::OutputArityMismatch {
                sums: iter_map.len(),
                outputs: outputs.len(),
            },
        ));
    }
    let analyzer = Analyzer::new();
    let mut inverter = Inverter {
        analyzer: &analyzer,
        marks,
        back: FxHashMap::default(),
        inverse: IndexMap::new(),
    };
    // Outputs first, then fused marks parents-before-children, so every sum
    // sees its full accumulated value before propagating.
    let order = reverse_topology_order(marks, iter_map);
    for (sum, output) in iter_map.iter().zip(outputs) {
        inverter.visit_sum(sum, output.clone())?;
    }
    for mark in order {
        let source_sum = marks.get(mark).and_then(|node| node.source_sum()).cloned();
        if let Some(sum) = source_sum {
            let input = inverter
                .back
                .remove(&mark)
                .unwrap_or_else(|| Expr::zero(sum.base.dtype));
            inverter.visit_sum(&sum, input)?;
        }
    }
    Ok(inverter.inverse)
}

/// Fused marks ordered so that a mark precedes every mark its source sum
/// references (depth-first post-order from the roots, reversed).
fn reverse_topology_order(marks: &MarkArena, iter_map: &[IterSum]) -> Vec<MarkId> {
    let mut seen = FxHashSet::default();
    let mut order = Vec::new();
    for sum in iter_map {
        for split in &sum.args {
            topo_visit(marks, split.source, &mut seen, &mut order);
        }
    }
    order.reverse();
    order
}

fn topo_visit(
    marks: &MarkArena,
    mark: MarkId,
    seen: &mut FxHashSet<MarkId>,
    order: &mut Vec<MarkId>,
) {
    if !seen.insert(mark) {
        return;
    }
    if let Some(sum) = marks.get(mark).and_then(|node| node.source_sum()) {
        for split in &sum.args {
            topo_visit(marks, split.source, seen, order);
        }
        order.push(mark);
    }
}

struct Inverter<'a> {
    analyzer: &'a Analyzer,
    marks: &'a MarkArena,
    /// Accumulated back-propagated value per fused mark.
    back: FxHashMap<MarkId, Expr>,
    inverse: IndexMap<Var, Expr>,
}

impl<'a> Inverter<'a> {
    fn visit_sum(&mut self, sum: &IterSum, value: Expr) -> Result<(), Diagnostic> {
        if sum.args.is_empty() {
            return Ok(());
        }
        let input = value - sum.base.clone();
        if sum.args.len() == 1 {
            return self.visit_split(&sum.args[0], input);
        }
        // A multi-arg sum must be a fuse pattern with descending scales;
        // each component is carved out with floordiv/floormod. The
        // outermost component needs no floormod: an in-range value divided
        // by its scale is already below its extent.
        self.check_fuse_pattern(sum)?;
        for (index, split) in sum.args.iter().enumerate() {
            let quotient = input.clone().floordiv(split.scale.clone());
            let component = if index == 0 {
                quotient
            } else {
                quotient.floormod(split.extent.clone())
            };
            self.visit_split(split, component)?;
        }
        Ok(())
    }

    fn visit_split(&mut self, split: &IterSplit, value: Expr) -> Result<(), Diagnostic> {
        let input = value * split.lower_factor.clone();
        let node = match self.marks.get(split.source) {
            Some(node) => node,
            None => unreachable!("split references a mark outside the arena"),
        };
        match &node.source.kind {
            ExprKind::IterSum(_) => {
                let entry = self
                    .back
                    .entry(split.source)
                    .or_insert_with(|| Expr::zero(input.dtype));
                *entry = entry.clone() + input;
                Ok(())
            }
            ExprKind::Var(var) => {
                if let Some(previous) = self.inverse.get_mut(var) {
                    *previous = previous.clone() + input;
                } else {
                    self.inverse.insert(var.clone(), input);
                }
                Ok(())
            }
            _ => Err(Diagnostic::error(
                node.source.span,
                ErrorKind::UninvertibleSource(node.source.to_string()),
            )),
        }
    }

    fn check_fuse_pattern(&self, sum: &IterSum) -> Result<(), Diagnostic> {
        let mut expected = match sum.args.last() {
            Some(split) => split.scale.clone(),
            None => return Ok(()),
        };
        for split in sum.args.iter().rev() {
            if !self.analyzer.can_prove_equal(&split.scale, &expected) {
                return Err(Diagnostic::error(
                    Span::generated(),
                    ErrorKind::UnsortedInverseScales(format_sum(self.marks, sum)),
                ));
            }
            expected = expected * split.extent.clone();
        }
        Ok(())
    }
}
