//! Debug-build argument checks.
//!
//! The checks are heuristics that catch stale or mistyped handles early; they
//! are not a substitute for memory safety. In optimized builds every check
//! returns `Ok(())` without looking at its arguments.
//!
//! The logically-collective checks verify that every participant passed the
//! same value. One max-reduction of `(-v, v)` yields `(-min, max)`; the value
//! agrees everywhere exactly when `min == max`. The outcome is the same on
//! every participant, so a mismatch is reported on all of them.

use crate::object::registry::{ClassId, class_registry};
use crate::object::{KeelObject, ObjectHeader};
use keel_comm::{ReduceData, ReduceOp, ReduceOps, compare};
use keel_core::{Int, KeelError, KeelResult, Real};

const CHECKS_ENABLED: bool = cfg!(debug_assertions);

// =============================================================================
// Handle Checks
// =============================================================================

fn check_header(header: &ObjectHeader, arg: u32) -> KeelResult<()> {
    let address = header as *const ObjectHeader as usize;
    if address % std::mem::align_of::<ObjectHeader>() != 0 {
        return Err(KeelError::invalid(format!(
            "misaligned object: parameter #{}",
            arg
        )));
    }
    let class = header.class_id();
    if class.is_freed() {
        return Err(KeelError::invalid(format!(
            "object already free: parameter #{}",
            arg
        )));
    }
    if !class_registry().contains(class) {
        return Err(KeelError::invalid(format!(
            "invalid class id {}: parameter #{}",
            class.raw(),
            arg
        )));
    }
    Ok(())
}

/// Check that `obj` is present and looks like a live object.
pub fn valid_header(obj: Option<&dyn KeelObject>, arg: u32) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    let obj = obj.ok_or(KeelError::NullHandle { arg })?;
    check_header(obj.header(), arg)
}

/// Check that `obj` is a live object of `class`.
pub fn valid_header_specific(obj: Option<&dyn KeelObject>, class: ClassId, arg: u32) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    valid_header(obj, arg)?;
    let header = obj.ok_or(KeelError::NullHandle { arg })?.header();
    if header.class_id() != class {
        return Err(KeelError::wrong_type(format!(
            "expected {}, got {}: parameter #{}",
            class_registry().name_of(class).as_deref().unwrap_or("unknown class"),
            header.class_name(),
            arg
        )));
    }
    Ok(())
}

/// Check that `obj` is a live object of `class` with implementation
/// `type_name`.
pub fn valid_header_specific_type(
    obj: Option<&dyn KeelObject>,
    class: ClassId,
    type_name: &str,
    arg: u32,
) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    valid_header_specific(obj, class, arg)?;
    let header = obj.ok_or(KeelError::NullHandle { arg })?.header();
    if !header.type_compare(type_name) {
        return Err(KeelError::wrong_subtype(format!(
            "expected {} of type {}, got {}: parameter #{}",
            header.class_name(),
            type_name,
            header.type_name().as_deref().unwrap_or("none"),
            arg
        )));
    }
    Ok(())
}

/// Check that the implementation of `obj` has been chosen.
pub fn valid_type(obj: &dyn KeelObject, arg: u32) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    if obj.header().type_name().is_none() {
        return Err(KeelError::usage(format!(
            "object type of {} not set: parameter #{}",
            obj.header().class_name(),
            arg
        )));
    }
    Ok(())
}

// =============================================================================
// Pairwise Checks
// =============================================================================

/// Check that two objects are of the same class.
pub fn check_same_type(a: &dyn KeelObject, arg_a: u32, b: &dyn KeelObject, arg_b: u32) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    if a.header().class_id() != b.header().class_id() {
        return Err(KeelError::wrong_type(format!(
            "objects not of same type: parameters #{} and #{}",
            arg_a, arg_b
        )));
    }
    Ok(())
}

/// Check that two objects live on compatible communicators.
pub fn check_same_comm(a: &dyn KeelObject, arg_a: u32, b: &dyn KeelObject, arg_b: u32) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    let ca = a.header().comm()?;
    let cb = b.header().comm()?;
    if !compare(&*ca, &*cb).is_compatible() {
        return Err(KeelError::not_same_comm(format!(
            "parameters #{} and #{}",
            arg_a, arg_b
        )));
    }
    Ok(())
}

/// Both [`check_same_type`] and [`check_same_comm`].
pub fn check_same_type_and_comm(
    a: &dyn KeelObject,
    arg_a: u32,
    b: &dyn KeelObject,
    arg_b: u32,
) -> KeelResult<()> {
    check_same_type(a, arg_a, b, arg_b)?;
    check_same_comm(a, arg_a, b, arg_b)
}

/// Check that an index array is sorted ascending.
pub fn check_sorted(indices: &[Int]) -> KeelResult<()> {
    if !CHECKS_ENABLED {
        return Ok(());
    }
    if let Some(i) = indices.windows(2).position(|w| w[0] > w[1]) {
        return Err(KeelError::usage(format!(
            "input array needs to be sorted: entry {} is {} but entry {} is {}",
            i,
            indices[i],
            i + 1,
            indices[i + 1]
        )));
    }
    Ok(())
}

// =============================================================================
// Logically Collective Checks
// =============================================================================

fn collective_checks_enabled() -> bool {
    CHECKS_ENABLED && keel_core::config().check_collective_arguments
}

fn check_agreement(obj: &dyn KeelObject, encoded: Int, what: &str, arg: u32) -> KeelResult<()> {
    let comm = obj.header().comm()?;
    let reduced = comm
        .all_reduce(
            ReduceData::Int(vec![encoded.wrapping_neg(), encoded]),
            ReduceOps::Uniform(ReduceOp::Max),
        )?
        .into_int()?;
    let (neg_min, max) = (reduced[0], reduced[1]);
    if neg_min.wrapping_neg() != max {
        return Err(KeelError::usage(format!(
            "{} value must be same on all processes, argument #{}",
            what, arg
        )));
    }
    Ok(())
}

/// Check that every participant passed the same integer (collective).
pub fn valid_logical_collective_int(obj: &dyn KeelObject, value: Int, arg: u32) -> KeelResult<()> {
    if !collective_checks_enabled() {
        return Ok(());
    }
    check_agreement(obj, value, "Int", arg)
}

/// Check that every participant passed the same real (collective).
///
/// Values are compared bit for bit, so NaN agrees with an identical NaN.
pub fn valid_logical_collective_real(obj: &dyn KeelObject, value: Real, arg: u32) -> KeelResult<()> {
    if !collective_checks_enabled() {
        return Ok(());
    }
    check_agreement(obj, value.to_bits() as Int, "Real", arg)
}

/// Check that every participant passed the same flag (collective).
pub fn valid_logical_collective_bool(obj: &dyn KeelObject, value: bool, arg: u32) -> KeelResult<()> {
    if !collective_checks_enabled() {
        return Ok(());
    }
    check_agreement(obj, Int::from(value), "Bool", arg)
}
