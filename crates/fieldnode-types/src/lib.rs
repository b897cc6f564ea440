//! Telemetry message model for fieldnode.
//!
//! This crate holds the types shared by the store and the service: the
//! reading shapes, the normalized message produced from each bus payload,
//! and the normalizer itself.
//!
//! # Features
//!
//! - Wide (fixed-column) and narrow (one row per sensor entry) reading shapes
//! - Tolerant payload normalization: malformed fields become absent values
//! - Error types for payload decoding
//!
//! # Example
//!
//! ```
//! use fieldnode_types::{Normalizer, ReadingShape};
//!
//! let normalizer = Normalizer::new(ReadingShape::Narrow);
//! let msg = normalizer.normalize(br#"{"device_id":"d1","readings":{"temp":{"value":20}}}"#)?;
//! assert_eq!(msg.readings.row_count(), 1);
//! # Ok::<(), fieldnode_types::ParseError>(())
//! ```

pub mod error;
pub mod normalize;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use normalize::{Normalizer, normalize};
pub use types::{
    DeviceUpsert, NarrowReading, NormalizedMessage, ReadingSet, ReadingShape, UNKNOWN_DEVICE_ID,
    WIDE_COLUMNS, WideReading,
};
