//! # Tideway Core
//!
//! Data model shared by the Tideway edge runtime.
//!
//! - [`value`]: runtime values, their JSON mapping and the hashable
//!   [`ValueKey`] used to key lookup tables
//! - [`tuple`]: the [`Tuple`] message carried on the topic broker, with the
//!   optional [`RowChange`] that makes it an updatable row
//!
//! ```rust
//! use tideway_core::{RowKind, Tuple, Value};
//!
//! let t = Tuple::new("devices")
//!     .with_field("id", 1)
//!     .with_change(RowKind::Delete, 1);
//! assert_eq!(t.get("id"), Some(&Value::Int(1)));
//! assert_eq!(t.row_kind(), RowKind::Delete);
//! ```

pub mod tuple;
pub mod value;

pub use tuple::{FxIndexMap, RowChange, RowKind, Tuple, UnknownRowKind};
pub use value::{Value, ValueKey};
