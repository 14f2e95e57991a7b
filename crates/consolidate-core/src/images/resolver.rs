//! Resolving a report's selected-image pointer to an image of its exam.

use std::fmt;

use super::ids::parse_positional;
use crate::models::{Exam, ExamImage};

/// Why a pointer could not be resolved. Unresolved pointers are left as
/// they are and reported; they are never mapped to a best guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    /// Positional index past the end of the exam's current images.
    OutOfRange { index: usize, available: usize },
    /// Positional id whose prefix names another exam.
    ForeignExam { prefix: String },
    /// Not an image of this exam and carries no positional index.
    NoPositionalPattern,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unresolved::OutOfRange { index, available } => {
                write!(f, "index {index} out of range ({available} images)")
            }
            Unresolved::ForeignExam { prefix } => write!(f, "pointer belongs to exam {prefix}"),
            Unresolved::NoPositionalPattern => f.write_str("no image with this id and no positional index"),
        }
    }
}

/// Resolve `pointer` against `images`, the exam's images in capture order.
///
/// An id of an image in the list resolves to that image. Otherwise a
/// positional id `<exam>-<N>` resolves to the N-th image (0-based) when
/// its prefix is the exam's id or external id.
pub fn resolve_image_reference<'a>(
    pointer: &str,
    exam: &Exam,
    images: &'a [ExamImage],
) -> Result<&'a ExamImage, Unresolved> {
    if let Some(image) = images.iter().find(|img| img.id == pointer) {
        return Ok(image);
    }

    let (prefix, index) = parse_positional(pointer).ok_or(Unresolved::NoPositionalPattern)?;
    let own_prefix = prefix == exam.id || exam.external_id.as_deref() == Some(prefix);
    if !own_prefix {
        return Err(Unresolved::ForeignExam {
            prefix: prefix.to_string(),
        });
    }

    images.get(index).ok_or(Unresolved::OutOfRange {
        index,
        available: images.len(),
    })
}
