//! Rendering objects as text.

use crate::object::KeelObject;
use keel_core::{AsciiStream, KeelError, KeelResult};
use std::fmt::{self, Write as _};
use std::io::Write as _;

/// Render `obj` through its vtable, falling back to [`default_view`].
pub fn view(obj: &dyn KeelObject, out: &mut dyn fmt::Write) -> KeelResult<()> {
    let header = obj.header();
    if header.is_destroyed() {
        return Err(KeelError::invalid("cannot view a destroyed object"));
    }
    match header.ops().view {
        Some(view_fn) => view_fn(obj, out),
        None => default_view(obj, out),
    }
}

/// Generic summary: class, prefix, name, participant count and subtype.
///
/// ```text
/// Vec Object: (sub_) Vec_0 3 processes
///   type: seq
/// ```
pub fn default_view(obj: &dyn KeelObject, out: &mut dyn fmt::Write) -> KeelResult<()> {
    let header = obj.header();
    let indent = "  ".repeat(header.tab_level());
    let comm = header.comm()?;
    let name = header.name()?;
    let prefix = header
        .options_prefix()
        .map(|p| format!("({}) ", p))
        .unwrap_or_default();

    writeln!(
        out,
        "{indent}{} Object: {prefix}{name} {} processes",
        header.class_name(),
        comm.size()
    )?;
    writeln!(
        out,
        "{indent}  type: {}",
        header.type_name().as_deref().unwrap_or("not yet set")
    )?;
    Ok(())
}

/// Render `obj` to a shared stream while holding that stream's lock.
pub fn view_to_stream(obj: &dyn KeelObject, stream: AsciiStream) -> KeelResult<()> {
    let mut text = String::new();
    view(obj, &mut text)?;

    let _guard = stream.lock();
    match stream {
        AsciiStream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(text.as_bytes())?;
            out.flush()?;
        }
        AsciiStream::Stderr => {
            let mut out = std::io::stderr().lock();
            out.write_all(text.as_bytes())?;
            out.flush()?;
        }
    }
    Ok(())
}
