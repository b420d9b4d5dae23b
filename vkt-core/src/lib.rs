//! VKT Core - Coordinate Addressing and Semantic Compression
//!
//! # The Guarantees (Non-Negotiable)
//! 1. Coordinates Round-Trip: `parse(c.to_string()) == c`
//! 2. Validation Is Total: every violated rule is reported in one pass
//! 3. Writes Always Validate: the block store has no unvalidated path
//! 4. Reconstruction Is Exact: deltas rebuild the stored bytes, hash-checked
//! 5. Files Are Atomic and Deterministic: same store, same bytes

pub mod schema;
pub mod coordinate;
pub mod tenant;
pub mod validation;
pub mod hashing;
pub mod delta;
pub mod config;
pub mod error;
pub mod store;
pub mod vkt;

pub use schema::{Attribute, Category, Domain, State};
pub use coordinate::{Coordinate, CoordinatePrefix, Directive};
pub use tenant::TenantId;
pub use validation::{
    RecordLookup, RecordStatus, ValidationContext, ValidationResult, ValidationRule,
    ValidationViolation, Validator,
};
pub use hashing::{canonical_json, sha256_hex, ContentHash};
pub use config::{CoreConfig, StorePolicy, ValidationLimits, VktOptions};
pub use error::{CoreError, Result};
pub use store::{BlockKind, CompactionReport, CoordinateRecord, SemanticBlock, SemanticBlockStore, StoreStats};
pub use vkt::{load, save, PrefixScan, VktFile, VktFileManager, VktHeader};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse a coordinate string.
pub fn parse_coordinate(text: &str) -> Result<Coordinate> {
    Coordinate::parse(text)
}

/// Parse and validate in one call, against `lookup` when given.
pub fn validate_full(
    text: &str,
    tenant: &TenantId,
    lookup: Option<&dyn RecordLookup>,
) -> Result<ValidationResult> {
    let ctx = ValidationContext { tenant, lookup };
    Validator::new().validate_str(text, &ctx)
}
