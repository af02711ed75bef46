//! Canonical iterator data model.
//!
//! An [`IterMarkNode`] stands for "a value in `[0, extent)` defined by
//! `source`", where the source is either an input iterator variable (possibly
//! offset by its range minimum) or a fused [`IterSum`]. Marks are compared by
//! identity, not structure: they live in a [`MarkArena`] and are referenced
//! by [`MarkId`] everywhere, so two structurally identical marks stay
//! distinct iterators.
//!
//! An [`IterSplit`] denotes `floormod(floordiv(mark, lower_factor), extent) * scale`;
//! an [`IterSum`] denotes the sum of its splits plus a base offset.

use std::fmt;
use std::hash::{Hash, Hasher};

use fxhash::{FxHashMap, FxHashSet};

use crate::ast::{DType, Expr, ExprKind, Span};

/// Identity of an iterator mark inside a [`MarkArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkId(pub u32);

impl fmt::Display for MarkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An iterator mark: a value in `[0, extent)` defined by `source`.
#[derive(Debug, Clone)]
pub struct IterMarkNode {
    /// Defining expression: an input iterator (possibly `var - min`) or a
    /// fused canonical sum.
    pub source: Expr,
    /// Non-negative extent of the mark.
    pub extent: Expr,
}

impl IterMarkNode {
    pub fn new(source: Expr, extent: Expr) -> Self {
        IterMarkNode { source, extent }
    }

    /// The structured sum form of the source, if the mark is a fused iterator.
    pub fn source_sum(&self) -> Option<&IterSum> {
        match &self.source.kind {
            ExprKind::IterSum(sum) => Some(sum),
            _ => None,
        }
    }
}

/// Arena owning every mark minted during one detection.
///
/// A [`MarkId`] is the mark's identity: two structurally identical marks in
/// different slots are different iterators, which is exactly what keeps a
/// fused iterator distinct from an accidental lookalike. Ids are dense
/// indices in mint order, so the memoisation tables can hash them directly.
#[derive(Debug, Default)]
pub struct MarkArena {
    marks: Vec<IterMarkNode>,
}

impl MarkArena {
    pub fn new() -> Self {
        MarkArena::default()
    }

    /// Mint a new mark and hand back its identity.
    pub fn alloc(&mut self, node: IterMarkNode) -> MarkId {
        let id = MarkId(self.marks.len() as u32);
        self.marks.push(node);
        id
    }

    pub fn get(&self, id: MarkId) -> Option<&IterMarkNode> {
        self.marks.get(id.0 as usize)
    }

    /// Mutable access to a mark. Marks are immutable once minted except for
    /// the one-shot source/extent update when a predicate tightens them.
    pub fn get_mut(&mut self, id: MarkId) -> Option<&mut IterMarkNode> {
        self.marks.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Marks in mint order.
    pub fn iter(&self) -> impl Iterator<Item = (MarkId, &IterMarkNode)> {
        self.marks
            .iter()
            .enumerate()
            .map(|(index, node)| (MarkId(index as u32), node))
    }
}

/// A scaled slice of an iterator mark:
/// `floormod(floordiv(source, lower_factor), extent) * scale`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IterSplit {
    pub source: MarkId,
    pub lower_factor: Expr,
    pub extent: Expr,
    pub scale: Expr,
}

impl IterSplit {
    pub fn new(source: MarkId, lower_factor: Expr, extent: Expr, scale: Expr) -> Self {
        IterSplit {
            source,
            lower_factor,
            extent,
            scale,
        }
    }

    /// The identity slice of a mark: the whole `[0, extent)` range, scale 1.
    pub fn whole(source: MarkId, marks: &MarkArena) -> Self {
        let dtype = marks
            .get(source)
            .map(|m| m.extent.dtype)
            .unwrap_or(DType::I32);
        IterSplit::whole_scaled(source, marks, Expr::one(dtype))
    }

    /// The identity slice of a mark with an explicit scale.
    pub fn whole_scaled(source: MarkId, marks: &MarkArena, scale: Expr) -> Self {
        let extent = marks
            .get(source)
            .map(|m| m.extent.clone())
            .unwrap_or_else(|| Expr::one(scale.dtype));
        IterSplit {
            source,
            lower_factor: Expr::one(scale.dtype),
            extent,
            scale,
        }
    }

    pub fn into_expr(self, dtype: DType) -> Expr {
        Expr::new(ExprKind::IterSplit(Box::new(self)), dtype, Span::generated())
    }
}

impl fmt::Display for IterSplit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "split({}, lower_factor={}, extent={}, scale={})",
            self.source, self.lower_factor, self.extent, self.scale
        )
    }
}

/// A sum of splits plus a base offset. Order of `args` is presentation only;
/// canonical forms list splits from outermost to innermost.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IterSum {
    pub args: Vec<IterSplit>,
    pub base: Expr,
}

impl IterSum {
    pub fn new(args: Vec<IterSplit>, base: Expr) -> Self {
        IterSum { args, base }
    }

    pub fn into_expr(self, dtype: DType) -> Expr {
        Expr::new(ExprKind::IterSum(Box::new(self)), dtype, Span::generated())
    }
}

impl fmt::Display for IterSum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sum(")?;
        for arg in &self.args {
            write!(f, "{} + ", arg)?;
        }
        write!(f, "{})", self.base)
    }
}

/// Structural equality over splits, optionally ignoring the scale.
pub fn split_equal(lhs: &IterSplit, rhs: &IterSplit, check_scale: bool) -> bool {
    lhs.source == rhs.source
        && lhs.lower_factor == rhs.lower_factor
        && lhs.extent == rhs.extent
        && (!check_scale || lhs.scale == rhs.scale)
}

/// Memoisation key for sums.
///
/// The hash is deliberately coarser than equality: it combines the number of
/// args with each arg's source mark index only, so structurally different
/// sums may collide and equality arbitrates. Equality is full structural
/// equality of the wrapped sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumKey(pub IterSum);

impl Hash for SumKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.args.len().hash(state);
        for arg in &self.0.args {
            arg.source.hash(state);
        }
    }
}

/// Collects, for every mark reachable from a set of canonical sums, the
/// outgoing splits that reference it. Used to check that the splits of each
/// mark are independent, and by subspace division.
#[derive(Debug, Default)]
pub struct SplitCollector {
    /// Marks in first-visit order.
    pub visit_order: Vec<MarkId>,
    visited: FxHashSet<MarkId>,
    /// Each mark to the splits that reference it.
    pub mark_splits: FxHashMap<MarkId, Vec<IterSplit>>,
}

impl SplitCollector {
    pub fn collect(marks: &MarkArena, indices: &[IterSum]) -> Self {
        let mut collector = SplitCollector::default();
        for sum in indices {
            for split in &sum.args {
                collector.visit(marks, split.source);
                collector
                    .mark_splits
                    .entry(split.source)
                    .or_default()
                    .push(split.clone());
            }
        }
        collector
    }

    pub fn is_visited(&self, mark: MarkId) -> bool {
        self.visited.contains(&mark)
    }

    /// The splits referencing a mark (empty if none were collected).
    pub fn splits_of(&self, mark: MarkId) -> &[IterSplit] {
        self.mark_splits.get(&mark).map(Vec::as_slice).unwrap_or(&[])
    }

    fn visit(&mut self, marks: &MarkArena, mark: MarkId) {
        if !self.visited.insert(mark) {
            return;
        }
        self.visit_order.push(mark);
        let source_sum = marks.get(mark).and_then(|m| m.source_sum()).cloned();
        if let Some(sum) = source_sum {
            for split in &sum.args {
                self.visit(marks, split.source);
                self.mark_splits
                    .entry(split.source)
                    .or_default()
                    .push(split.clone());
            }
        }
    }
}
