//! Reduction operators and buffers.
//!
//! A reduction combines one buffer per participant element-wise. Every
//! element uses the same operator ([`ReduceOps::Uniform`]) or its own
//! operator ([`ReduceOps::Mixed`]), the composite reduce that lets one
//! collective carry sums, maxima and minima side by side.

use keel_core::{Int, KeelError, KeelResult, Real};
use std::sync::Arc;

// =============================================================================
// Operators
// =============================================================================

/// Element-wise reduction operator.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all contributions.
    Sum = 0,
    /// Largest contribution.
    Max = 1,
    /// Smallest contribution.
    Min = 2,
}

impl ReduceOp {
    /// Combine two integers.
    #[inline]
    pub fn apply_int(self, a: Int, b: Int) -> Int {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }

    /// Combine two reals.
    #[inline]
    pub fn apply_real(self, a: Real, b: Real) -> Real {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// Combine two complex values stored as (re, im) pairs.
    ///
    /// Max and min compare real parts.
    #[inline]
    pub fn apply_complex(self, a: (Real, Real), b: (Real, Real)) -> (Real, Real) {
        match self {
            ReduceOp::Sum => (a.0 + b.0, a.1 + b.1),
            ReduceOp::Max => {
                if b.0 > a.0 {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Min => {
                if b.0 < a.0 {
                    b
                } else {
                    a
                }
            }
        }
    }
}

/// Operator selection for a whole buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceOps {
    /// One operator for every element.
    Uniform(ReduceOp),
    /// One operator per element.
    Mixed(Arc<[ReduceOp]>),
}

impl ReduceOps {
    /// Build the cheapest selection describing per-slot operators.
    pub fn from_slots(ops: &[ReduceOp]) -> Self {
        match ops.first() {
            None => ReduceOps::Uniform(ReduceOp::Sum),
            Some(&first) if ops.iter().all(|&op| op == first) => ReduceOps::Uniform(first),
            Some(_) => ReduceOps::Mixed(Arc::from(ops)),
        }
    }

    /// Operator applied to element `index`.
    #[inline]
    pub fn op_at(&self, index: usize) -> ReduceOp {
        match self {
            ReduceOps::Uniform(op) => *op,
            ReduceOps::Mixed(ops) => ops[index],
        }
    }

    /// Whether this is a composite reduce.
    #[inline]
    pub fn is_mixed(&self) -> bool {
        matches!(self, ReduceOps::Mixed(_))
    }

    /// Check that the selection covers a buffer of `len` elements.
    pub fn validate(&self, len: usize) -> KeelResult<()> {
        match self {
            ReduceOps::Mixed(ops) if ops.len() != len => Err(KeelError::usage(format!(
                "composite reduce has {} operators for {} values",
                ops.len(),
                len
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Buffers
// =============================================================================

/// A participant's contribution to a reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceData {
    /// Integer values.
    Int(Vec<Int>),
    /// Real values.
    Real(Vec<Real>),
    /// Complex values as (re, im) pairs.
    Complex(Vec<(Real, Real)>),
}

impl ReduceData {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ReduceData::Int(v) => v.len(),
            ReduceData::Real(v) => v.len(),
            ReduceData::Complex(v) => v.len(),
        }
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the element type.
    pub fn kind(&self) -> &'static str {
        match self {
            ReduceData::Int(_) => "integer",
            ReduceData::Real(_) => "real",
            ReduceData::Complex(_) => "complex",
        }
    }

    /// Fold `other` into `self` element-wise.
    pub fn combine(&mut self, other: &ReduceData, ops: &ReduceOps) -> KeelResult<()> {
        if self.len() != other.len() {
            return Err(KeelError::comm(format!(
                "reduction length mismatch: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        ops.validate(self.len())?;

        match (self, other) {
            (ReduceData::Int(acc), ReduceData::Int(rhs)) => {
                for (i, (a, b)) in acc.iter_mut().zip(rhs).enumerate() {
                    *a = ops.op_at(i).apply_int(*a, *b);
                }
            }
            (ReduceData::Real(acc), ReduceData::Real(rhs)) => {
                for (i, (a, b)) in acc.iter_mut().zip(rhs).enumerate() {
                    *a = ops.op_at(i).apply_real(*a, *b);
                }
            }
            (ReduceData::Complex(acc), ReduceData::Complex(rhs)) => {
                for (i, (a, b)) in acc.iter_mut().zip(rhs).enumerate() {
                    *a = ops.op_at(i).apply_complex(*a, *b);
                }
            }
            (acc, rhs) => {
                return Err(KeelError::comm(format!(
                    "reduction type mismatch: {} vs {}",
                    acc.kind(),
                    rhs.kind()
                )));
            }
        }
        Ok(())
    }

    /// Unwrap integer values.
    pub fn into_int(self) -> KeelResult<Vec<Int>> {
        match self {
            ReduceData::Int(v) => Ok(v),
            other => Err(KeelError::wrong_type(format!(
                "expected integer reduction, got {}",
                other.kind()
            ))),
        }
    }

    /// Unwrap real values.
    pub fn into_real(self) -> KeelResult<Vec<Real>> {
        match self {
            ReduceData::Real(v) => Ok(v),
            other => Err(KeelError::wrong_type(format!(
                "expected real reduction, got {}",
                other.kind()
            ))),
        }
    }

    /// Unwrap complex values.
    pub fn into_complex(self) -> KeelResult<Vec<(Real, Real)>> {
        match self {
            ReduceData::Complex(v) => Ok(v),
            other => Err(KeelError::wrong_type(format!(
                "expected complex reduction, got {}",
                other.kind()
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
