//! Image identity.
//!
//! Legacy image ids either encode a position in an import-time ordering
//! (`<examId>-<N>`) or were generated by the old uploader (`cml…`). Both
//! are replaced by `img-<uuid>.jpg`, read from the content-addressed file
//! name already present in the storage URL. Report pointers are rewritten
//! with an audit entry; pointers that cannot be resolved are reported and
//! left untouched. Audited pointer changes can be reverted the same way.

mod ids;
mod migrate;
mod resolver;
mod revert;

pub use ids::{
    file_name_from_url, is_legacy_id, owner_name_from_url, parse_positional, stable_image_id,
    IdFormat,
};
pub use migrate::{migrate_pass, prune_pass, MIGRATION_REASON};
pub use resolver::{resolve_image_reference, Unresolved};
pub use revert::{revert_pass, RevertSelection, REVERT_REASON};
