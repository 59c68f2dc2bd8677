//! Argument and reply codec, parameterized by wire encoding.
//!
//! Two interchangeable encodings carry the same records: `Json` is the
//! human-readable form (argument records are objects keyed `arg_0...`,
//! replies are a single `{"value": ..., "error": ...}` record), `Binary` is
//! the compact form (postcard payloads, replies prefixed with a one-byte
//! success/error discriminant). Value and error are a tagged union, never
//! two independent channels.

use crate::error::{CodecError, ErrorRecord};
use crate::schema::{Schema, WireType};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Wire encoding selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Binary,
    #[default]
    Json,
}

impl Encoding {
    pub const fn content_type(self) -> &'static str {
        match self {
            Encoding::Binary => "application/octet-stream",
            Encoding::Json => "application/json",
        }
    }

    /// Content-type negotiation: binary only when explicitly asked for,
    /// readable text otherwise.
    pub fn from_content_type(value: Option<&str>) -> Encoding {
        match value {
            Some(v) if v.starts_with("application/octet-stream") => Encoding::Binary,
            _ => Encoding::Json,
        }
    }
}

/// An argument list: a tuple of wire types, one per method parameter.
///
/// Implemented for tuples of arity 0 through 6. Provides the per-parameter
/// type names the descriptor builder sorts overloads by, and the positional
/// JSON record form of the tuple.
pub trait ArgTuple: Serialize + DeserializeOwned + Send + 'static {
    const ARITY: usize;
    fn type_names() -> Vec<&'static str>;
    fn schemas() -> Vec<Schema>;
    fn to_json_record(&self) -> Result<JsonMap<String, JsonValue>, CodecError>;
    fn from_json_record(record: &JsonMap<String, JsonValue>) -> Result<Self, CodecError>;
}

macro_rules! arg_tuple {
    ($arity:expr; $( $idx:tt => $name:ident ),*) => {
        impl<$( $name: WireType ),*> ArgTuple for ($( $name, )*) {
            const ARITY: usize = $arity;

            fn type_names() -> Vec<&'static str> {
                vec![$( std::any::type_name::<$name>() ),*]
            }

            fn schemas() -> Vec<Schema> {
                vec![$( $name::schema() ),*]
            }

            #[allow(unused_mut)]
            fn to_json_record(&self) -> Result<JsonMap<String, JsonValue>, CodecError> {
                let mut record = JsonMap::new();
                $(
                    record.insert(
                        format!("arg_{}", $idx),
                        serde_json::to_value(&self.$idx)?,
                    );
                )*
                Ok(record)
            }

            #[allow(unused_variables)]
            fn from_json_record(
                record: &JsonMap<String, JsonValue>,
            ) -> Result<Self, CodecError> {
                Ok(($(
                    {
                        let field = format!("arg_{}", $idx);
                        let value = record.get(&field).cloned().unwrap_or(JsonValue::Null);
                        serde_json::from_value::<$name>(value)
                            .map_err(|_| CodecError::Argument(field))?
                    },
                )*))
            }
        }
    };
}

arg_tuple!(0;);
arg_tuple!(1; 0 => A0);
arg_tuple!(2; 0 => A0, 1 => A1);
arg_tuple!(3; 0 => A0, 1 => A1, 2 => A2);
arg_tuple!(4; 0 => A0, 1 => A1, 2 => A2, 3 => A3);
arg_tuple!(5; 0 => A0, 1 => A1, 2 => A2, 3 => A3, 4 => A4);
arg_tuple!(6; 0 => A0, 1 => A1, 2 => A2, 3 => A3, 4 => A4, 5 => A5);

/// Encode a call's argument list.
pub fn encode_args<A: ArgTuple>(args: &A, encoding: Encoding) -> Result<Bytes, CodecError> {
    match encoding {
        Encoding::Json => {
            let record = args.to_json_record()?;
            Ok(Bytes::from(serde_json::to_vec(&JsonValue::Object(record))?))
        }
        Encoding::Binary => Ok(Bytes::from(postcard::to_allocvec(args)?)),
    }
}

/// Decode a call's argument list.
pub fn decode_args<A: ArgTuple>(bytes: &[u8], encoding: Encoding) -> Result<A, CodecError> {
    match encoding {
        Encoding::Json => {
            let value: JsonValue = serde_json::from_slice(bytes)?;
            let record = value
                .as_object()
                .ok_or_else(|| CodecError::Argument("<record>".to_string()))?;
            A::from_json_record(record)
        }
        Encoding::Binary => Ok(postcard::from_bytes(bytes)?),
    }
}

#[derive(Serialize)]
struct ReplyOut<'a, T> {
    value: Option<&'a T>,
    error: Option<&'a ErrorRecord>,
}

#[derive(Deserialize)]
struct ReplyIn {
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    error: Option<ErrorRecord>,
}

const REPLY_VALUE: u8 = 0;
const REPLY_ERROR: u8 = 1;

/// Encode a reply: a success value or an error record, as one tagged union.
///
/// This surface never fails. A value that cannot be encoded degrades into a
/// decodable textual error record whose message is the encoder failure;
/// the encode path itself is not allowed to become a second failure.
pub fn encode_reply<T: WireType>(reply: Result<&T, &ErrorRecord>, encoding: Encoding) -> Bytes {
    match try_encode_reply(reply, encoding) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("reply failed to encode, degrading to textual error: {err}");
            let record = ErrorRecord::new(Some(err.to_string()), "EncodeError");
            match try_encode_reply::<()>(Err(&record), Encoding::Json) {
                Ok(bytes) => bytes,
                // Plain strings cannot fail to serialize; keep a literal
                // fallback anyway so this path can never panic or error.
                Err(_) => Bytes::from_static(
                    br#"{"value":null,"error":{"correlationId":"","message":"reply encoding failed","originClassName":"EncodeError"}}"#,
                ),
            }
        }
    }
}

fn try_encode_reply<T: WireType>(
    reply: Result<&T, &ErrorRecord>,
    encoding: Encoding,
) -> Result<Bytes, CodecError> {
    match encoding {
        Encoding::Json => {
            let out = match reply {
                Ok(value) => ReplyOut {
                    value: Some(value),
                    error: None,
                },
                Err(record) => ReplyOut {
                    value: None,
                    error: Some(record),
                },
            };
            Ok(Bytes::from(serde_json::to_vec(&out)?))
        }
        Encoding::Binary => {
            let (tag, payload) = match reply {
                Ok(value) => (REPLY_VALUE, postcard::to_allocvec(value)?),
                Err(record) => (REPLY_ERROR, postcard::to_allocvec(record)?),
            };
            let mut buf = Vec::with_capacity(1 + payload.len());
            buf.push(tag);
            buf.extend_from_slice(&payload);
            Ok(Bytes::from(buf))
        }
    }
}

/// Decode a reply into the value-or-error union.
pub fn decode_reply<T: WireType>(
    bytes: &[u8],
    encoding: Encoding,
) -> Result<Result<T, ErrorRecord>, CodecError> {
    match encoding {
        Encoding::Json => {
            let reply: ReplyIn = serde_json::from_slice(bytes)?;
            match reply.error {
                Some(record) => Ok(Err(record)),
                None => Ok(Ok(serde_json::from_value(reply.value)?)),
            }
        }
        Encoding::Binary => match bytes.split_first() {
            Some((&REPLY_VALUE, payload)) => Ok(Ok(postcard::from_bytes(payload)?)),
            Some((&REPLY_ERROR, payload)) => Ok(Err(postcard::from_bytes(payload)?)),
            _ => Err(CodecError::EmptyReply),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BOTH: [Encoding; 2] = [Encoding::Binary, Encoding::Json];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bean {
        i: i32,
        str: String,
    }

    impl WireType for Bean {
        fn schema() -> Schema {
            Schema::record(
                "Bean",
                vec![
                    crate::schema::Field::new("i", Schema::Int),
                    crate::schema::Field::new("str", Schema::String),
                ],
            )
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    enum Color {
        Red,
        Green,
        Blue,
    }

    impl WireType for Color {
        fn schema() -> Schema {
            Schema::Enum {
                name: "Color".to_string(),
                symbols: vec!["Red".into(), "Green".into(), "Blue".into()],
            }
        }
    }

    fn roundtrip_value<T: WireType + PartialEq + std::fmt::Debug + Clone>(value: T) {
        for enc in BOTH {
            let bytes = encode_reply(Ok(&value), enc);
            let back = decode_reply::<T>(&bytes, enc).unwrap().unwrap();
            assert_eq!(back, value, "{enc:?}");
        }
    }

    #[test]
    fn primitive_replies_round_trip() {
        roundtrip_value(true);
        roundtrip_value(42i32);
        roundtrip_value(-7i64);
        roundtrip_value(2.5f64);
        roundtrip_value("hello".to_string());
        roundtrip_value(());
        roundtrip_value(Some("opt".to_string()));
        roundtrip_value(Option::<String>::None);
    }

    #[test]
    fn byte_array_replies_round_trip() {
        roundtrip_value(Bytes::from_static(&[0u8, 1, 2, 255, 128]));
    }

    #[test]
    fn record_and_enum_replies_round_trip() {
        roundtrip_value(Bean {
            i: 3,
            str: "test".to_string(),
        });
        roundtrip_value(Color::Green);
        roundtrip_value(vec![Color::Red, Color::Blue]);
    }

    #[test]
    fn argument_records_round_trip() {
        for enc in BOTH {
            let args = (3i32, "test".to_string(), Some(true));
            let bytes = encode_args(&args, enc).unwrap();
            let back: (i32, String, Option<bool>) = decode_args(&bytes, enc).unwrap();
            assert_eq!(back, args, "{enc:?}");
        }
    }

    #[test]
    fn empty_argument_list_round_trips() {
        for enc in BOTH {
            let bytes = encode_args(&(), enc).unwrap();
            decode_args::<()>(&bytes, enc).unwrap();
        }
    }

    #[test]
    fn json_arguments_are_keyed_positionally() {
        let bytes = encode_args(&(3i32, "test".to_string()), Encoding::Json).unwrap();
        let value: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["arg_0"], 3);
        assert_eq!(value["arg_1"], "test");
    }

    #[test]
    fn error_record_round_trips_exactly() {
        let record = ErrorRecord {
            correlation_id: "proc-17".to_string(),
            message: Some("boom".to_string()),
            origin_class_name: "IllegalState".to_string(),
        };
        for enc in BOTH {
            let bytes = encode_reply::<String>(Err(&record), enc);
            let back = decode_reply::<String>(&bytes, enc).unwrap().unwrap_err();
            assert_eq!(back, record, "{enc:?}");
        }
        // A null message survives too.
        let quiet = ErrorRecord {
            correlation_id: "proc-18".to_string(),
            message: None,
            origin_class_name: "Quiet".to_string(),
        };
        for enc in BOTH {
            let bytes = encode_reply::<String>(Err(&quiet), enc);
            assert_eq!(decode_reply::<String>(&bytes, enc).unwrap().unwrap_err(), quiet);
        }
    }

    #[test]
    fn json_reply_is_a_tagged_union() {
        let bytes = encode_reply(Ok(&"v".to_string()), Encoding::Json);
        let value: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["value"], "v");
        assert_eq!(value["error"], JsonValue::Null);

        let record = ErrorRecord::new(Some("x".to_string()), "E");
        let bytes = encode_reply::<String>(Err(&record), Encoding::Json);
        let value: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["value"], JsonValue::Null);
        assert_eq!(value["error"]["originClassName"], "E");
    }

    #[test]
    fn binary_reply_leads_with_discriminant() {
        let bytes = encode_reply(Ok(&1i32), Encoding::Binary);
        assert_eq!(bytes[0], REPLY_VALUE);
        let record = ErrorRecord::new(None, "E");
        let bytes = encode_reply::<i32>(Err(&record), Encoding::Binary);
        assert_eq!(bytes[0], REPLY_ERROR);
    }

    #[test]
    fn truncated_binary_reply_is_a_decode_error() {
        assert!(decode_reply::<i32>(&[], Encoding::Binary).is_err());
        assert!(decode_reply::<String>(&[REPLY_VALUE], Encoding::Binary).is_err());
    }

    // A value whose serde implementation always fails, to exercise the
    // degradation path.
    #[derive(Debug)]
    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("deliberately unencodable"))
        }
    }

    impl<'de> Deserialize<'de> for Unencodable {
        fn deserialize<D: serde::Deserializer<'de>>(_d: D) -> Result<Self, D::Error> {
            Err(serde::de::Error::custom("deliberately undecodable"))
        }
    }

    impl WireType for Unencodable {
        fn schema() -> Schema {
            Schema::Null
        }
    }

    #[test]
    fn unencodable_value_degrades_to_textual_error() {
        for enc in BOTH {
            let bytes = encode_reply(Ok(&Unencodable), enc);
            // Degraded replies are always textual, whatever was requested.
            let record = decode_reply::<()>(&bytes, Encoding::Json)
                .unwrap()
                .unwrap_err();
            assert_eq!(record.origin_class_name, "EncodeError");
            assert!(record.message.unwrap().contains("deliberately unencodable"));
        }
    }

    proptest! {
        #[test]
        fn any_string_reply_round_trips(s in ".*") {
            for enc in BOTH {
                let bytes = encode_reply(Ok(&s), enc);
                let back = decode_reply::<String>(&bytes, enc).unwrap().unwrap();
                prop_assert_eq!(&back, &s);
            }
        }

        #[test]
        fn any_long_args_round_trip(a in any::<i64>(), b in any::<i64>()) {
            for enc in BOTH {
                let bytes = encode_args(&(a, b), enc).unwrap();
                let back: (i64, i64) = decode_args(&bytes, enc).unwrap();
                prop_assert_eq!(back, (a, b));
            }
        }
    }
}
