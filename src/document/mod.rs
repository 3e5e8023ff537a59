//! Document-store query guard
//!
//! The find/aggregate counterpart of [`crate::guard`]: shape validation,
//! field confinement against a sampled allow-list, and the limit/date rewrites
//! applied before a spec reaches the store.

mod error;
pub mod fields;
pub mod node;
pub mod spec;
pub mod validator;

pub use error::DocumentQueryError;
pub use fields::{
    detect_date_field, extract_field_refs, normalize_field_path, profile_documents, validate_fields,
    DateEncoding, DateField, FieldAllowList, FieldProfile, IDENTITY_FIELD,
};
pub use node::{Key, SpecNode};
pub use spec::QuerySpec;
pub use validator::{has_temporal_cue, strip_meta_keys, DocumentQueryValidator};
