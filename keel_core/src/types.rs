//! Numeric types shared by the object substrate.

/// Integer type of composed data and index arrays.
pub type Int = i64;

/// Real floating-point type.
pub type Real = f64;

/// Scalar type of numerical entities.
///
/// Real-valued; complex entities reduce their values as real pairs.
pub type Scalar = f64;
