//! vcsync mappings: virtual <-> host identity translation, ownership marking,
//! the reverse index and the per-kind mapper registry.

#![forbid(unsafe_code)]

pub mod index;
pub mod labels;
pub mod names;
pub mod registry;
pub mod resources;

pub use index::ReverseIndex;
pub use labels::{
    is_owned, labels_equal, marker_selector, marker_value, rewrite_annotations, rewrite_labels, stamp_marker,
    MARKER_LABEL,
};
pub use names::{physical_name, safe_concat_name, validate_name};
pub use registry::{MapperRegistry, MappingPolicy, NamespaceMode, ResourceMapper};
