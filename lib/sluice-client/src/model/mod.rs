//! Point and field data model.

mod field;
pub use self::field::{Field, FieldKind, FieldValue, Histogram};

mod point;
pub use self::point::{Point, DEFAULT_NAMESPACE};
