//! Failure kinds recorded during detection.
//!
//! None of these abort the analysis: each one is wrapped in a
//! [`crate::diags::Diagnostic`] and surfaces as an empty detection result.
//! Structural kinds mean the input is outside the supported algebra;
//! invariant kinds mean the algebra matched locally but a global check
//! (coverage, bijectivity, constraint compatibility) failed.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("iterator expression appears in an unsupported position: {0}")]
    CanonicalInBadPosition(String),

    #[error("cannot multiply two iterators: {0}")]
    MultiplyIterators(String),

    #[error("cannot divide by an iterator: {0}")]
    DivideByIterator(String),

    #[error("cannot mod by an iterator: {0}")]
    ModByIterator(String),

    #[error("cannot prove {lhs} divisible by {rhs} in {context}")]
    NotDivisible {
        lhs: String,
        rhs: String,
        context: &'static str,
    },

    #[error("fuse iters failed, cannot find a valid base scale in {0}")]
    NoBaseScale(String),

    #[error("fuse iters failed, cannot find expected scale {scale} in {sum}")]
    ScaleNotFound { scale: String, sum: String },

    #[error("fuse iters failed, cannot match flattened iters against constraint {0}")]
    ConstraintMismatch(String),

    #[error("fuse iters failed, extra offset of {0} is not consistent with the memoised mark")]
    InconsistentOffset(String),

    #[error("failed to fuse iter sum {0}")]
    FuseFailed(String),

    #[error("cannot {op} an iter sum with non-zero base: {sum}")]
    NonZeroBase { op: &'static str, sum: String },

    #[error("failed to normalize {sum} on predicate bound [{lower}, {upper})")]
    BoundNonCanonical {
        sum: String,
        lower: String,
        upper: String,
    },

    #[error("predicate tightens an already tightened iterator: {0}")]
    ConstraintRetightened(String),

    #[error("failed to collect constraints from iteration predicate: {0}")]
    PredicateNotParsed(String),

    #[error("iteration constraints are neither disjoint nor nested: {0}")]
    IllegalConstraints(String),

    #[error("iterator ranges must not reference other input iterators")]
    BadIterRanges,

    #[error("incomplete split of {mark} in bijective checking, expected lower factor {expected}")]
    IncompleteSplit { mark: String, expected: String },

    #[error("no split of {mark} skips to lower factor {expected}")]
    SkipSplitNotFound { mark: String, expected: String },

    #[error("splits of {mark} do not cover its extent, accumulated lower factor {expected}")]
    SplitsDoNotCover { mark: String, expected: String },

    #[error("failed to normalize the splits of iter mark {0}")]
    MarkNotNormalizable(String),

    #[error("the mapping is not bijective: input iterator {0} is unused")]
    InputIterUnused(String),

    #[error("iterators are not independent")]
    NotIndependent,

    #[error("expected split scale 1 in subspace division, got {0}")]
    ExpectScaleOne(String),

    #[error("subspace division of {0} interleaves inner and outer iterators")]
    InterleavedSubspace(String),

    #[error("subspace division of {0} is neither inner nor outer")]
    NeitherInnerNorOuter(String),

    #[error("no subspace division exists when a predicate constrains {0}")]
    PredicateDivision(String),

    #[error("cannot find lower factor {expected} among the splits of {mark}")]
    LowerFactorNotFound { mark: String, expected: String },

    #[error("cannot find the inner/outer boundary of {0}")]
    NoSubspaceBoundary(String),

    #[error("source of {0} is neither an input iterator nor a fused sum")]
    UnsupportedDivisionSource(String),

    #[error("inversion expects a fused sum with descending scales: {0}")]
    UnsortedInverseScales(String),

    #[error("inversion reached a non-invertible source expression: {0}")]
    UninvertibleSource(String),

    #[error("inversion needs one output per canonical sum, got {outputs} for {sums}")]
    OutputArityMismatch { sums: usize, outputs: usize },
}
