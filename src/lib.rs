pub mod analyzer;
pub mod ast;
pub mod constraint;
pub mod detect;
pub mod diags;
pub mod error;
pub mod inverse;
pub mod iter;
pub mod lowering;
pub mod rewriter;
pub mod subspace;

#[cfg(test)]
mod analyzer_tests;
#[cfg(test)]
mod constraint_tests;
#[cfg(test)]
mod detect_tests;
#[cfg(test)]
mod inverse_tests;
#[cfg(test)]
mod subspace_tests;

pub use ast::{DType, Expr, ExprKind, Span, Var};
pub use detect::{
    detect_iter_map, iter_map_simplify, subspace_divide, AffineIterMap, IterRange, IterRanges,
    SubspaceDivision,
};
pub use diags::{Diagnostic, Level};
pub use error::ErrorKind;
pub use inverse::inverse_affine_iter_map;
pub use iter::{IterMarkNode, IterSplit, IterSum, MarkArena, MarkId};
