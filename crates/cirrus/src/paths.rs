//! Path conventions for delayed writes.
//!
//! A file written to `out/__magic/<anything>/file` is not materialised at that
//! path; its upload is completed later at `out/file`. An inner `__base`
//! segment keeps everything after it, so
//! `out/__magic/job-1/tasks/t-1/__base/year=2024/file` lands at
//! `out/year=2024/file`.

use object_store::path::{Path, PathPart};

use crate::error::CommitError;
use crate::pending::{PENDING_SUFFIX, PENDINGSET_SUFFIX};

/// Segment marking a delayed-write directory.
pub const MAGIC: &str = "__magic";

/// Segment marking the root of the relative path kept under `__magic`.
pub const BASE: &str = "__base";

/// Name of the success marker under an output directory.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

pub fn elements(path: &Path) -> Vec<String> {
    path.parts().map(|p| p.as_ref().to_string()).collect()
}

fn join<'a>(elements: impl IntoIterator<Item = &'a String>) -> Path {
    elements
        .into_iter()
        .map(|e| PathPart::from(e.as_str()))
        .collect()
}

pub fn is_magic_path(path: &Path) -> bool {
    path.parts().any(|p| p.as_ref() == MAGIC)
}

fn is_commit_record(path: &Path) -> bool {
    path.filename()
        .is_some_and(|name| name.ends_with(PENDING_SUFFIX) || name.ends_with(PENDINGSET_SUFFIX))
}

/// Whether a write to `path` must be deferred.
///
/// Commit records written under `__magic` are ordinary writes.
pub fn is_delayed_write(path: &Path) -> bool {
    is_magic_path(path) && !is_commit_record(path)
}

/// The `__magic` directory of an output path.
pub fn magic_dir(output: &Path) -> Path {
    output.child(MAGIC)
}

/// Where a delayed write under `__magic` is finally committed.
pub fn final_destination(path: &Path) -> Result<Path, CommitError> {
    let elements = elements(path);
    let magic = elements
        .iter()
        .position(|e| e == MAGIC)
        .ok_or_else(|| CommitError::invalid("magic path", format!("no {MAGIC} in {path}")))?;

    let (parent, under_magic) = (&elements[..magic], &elements[magic + 1..]);
    let kept = match under_magic.iter().position(|e| e == BASE) {
        Some(base) => &under_magic[base + 1..],
        None => under_magic.last().map(std::slice::from_ref).unwrap_or(&[]),
    };
    if kept.is_empty() {
        return Err(CommitError::invalid(
            "magic path",
            format!("no file name under {MAGIC} in {path}"),
        ));
    }

    Ok(join(parent.iter().chain(kept)))
}

/// Path of the record describing a delayed write to `path`.
pub fn pending_record_path(path: &Path) -> Path {
    Path::from(format!("{path}{PENDING_SUFFIX}"))
}

/// Insert `uuid` into a file name, before its first `.` or at the end.
///
/// Names already containing `uuid` are returned unchanged.
pub fn add_uuid(name: &str, uuid: &str) -> String {
    if uuid.is_empty() || name.contains(uuid) {
        return name.to_string();
    }
    let file_start = name.rfind('/').map(|slash| slash + 1).unwrap_or(0);
    match name[file_start..].find('.') {
        Some(dot) => {
            let dot = file_start + dot;
            format!("{}-{uuid}{}", &name[..dot], &name[dot..])
        }
        None => format!("{name}-{uuid}"),
    }
}

/// Path of `relative` beneath `base`, element by element.
pub fn child_path(base: &Path, relative: &str) -> Path {
    relative
        .split('/')
        .filter(|e| !e.is_empty())
        .fold(base.clone(), |path, element| path.child(element))
}
