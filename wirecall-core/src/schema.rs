use serde::{de::DeserializeOwned, Serialize};

/// Structural description of a wire type.
///
/// The schema is what the protocol descriptor carries for each method's
/// arguments and result; the actual value bytes move through serde. Field
/// names inside argument records are positional (`arg_0`, `arg_1`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    /// The explicit empty/void schema; the result schema of `()`.
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Array(Box<Schema>),
    Optional(Box<Schema>),
    Record { name: String, fields: Vec<Field> },
    Enum { name: String, symbols: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

impl Schema {
    pub fn record(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Schema::Record {
            name: name.into(),
            fields,
        }
    }

    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }
}

impl Field {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Field {
            name: name.into(),
            schema,
        }
    }
}

/// A value that can cross the wire.
///
/// Serde is the object-to-record codec; `schema()` is the structural
/// description the descriptor builder records for the type. Application
/// record types implement this by hand next to their serde derives.
pub trait WireType: Serialize + DeserializeOwned + Send + 'static {
    fn schema() -> Schema;
}

impl WireType for () {
    fn schema() -> Schema {
        Schema::Null
    }
}

impl WireType for bool {
    fn schema() -> Schema {
        Schema::Boolean
    }
}

impl WireType for i32 {
    fn schema() -> Schema {
        Schema::Int
    }
}

impl WireType for i64 {
    fn schema() -> Schema {
        Schema::Long
    }
}

impl WireType for f32 {
    fn schema() -> Schema {
        Schema::Float
    }
}

impl WireType for f64 {
    fn schema() -> Schema {
        Schema::Double
    }
}

impl WireType for String {
    fn schema() -> Schema {
        Schema::String
    }
}

impl WireType for bytes::Bytes {
    fn schema() -> Schema {
        Schema::Bytes
    }
}

impl<T: WireType> WireType for Option<T> {
    fn schema() -> Schema {
        Schema::optional(T::schema())
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn schema() -> Schema {
        Schema::array(T::schema())
    }
}

/// Last path segment of a type name, generic arguments included.
///
/// `alloc::string::String` becomes `String`; used for wire-visible error
/// origins where full crate paths would leak build layout.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Only strip path segments ahead of the first generic bracket.
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_wraps_inner_schema() {
        assert_eq!(
            Option::<String>::schema(),
            Schema::Optional(Box::new(Schema::String))
        );
    }

    #[test]
    fn short_name_strips_path() {
        assert_eq!(short_type_name::<String>(), "String");
        struct Local;
        assert_eq!(short_type_name::<Local>(), "Local");
    }
}
