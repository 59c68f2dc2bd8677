//! Protocol descriptors derived from service contract declarations.
//!
//! A contract declares, per method, the call shape (unary or stream), the
//! argument tuple type and the result type. From that the builder derives a
//! stable wire identity for every method: overload-safe names, positional
//! argument records and the shared error schema. Descriptors are built once
//! per contract type and cached for the process lifetime.

use crate::codec::ArgTuple;
use crate::error::{ContractError, ErrorRecord};
use crate::schema::{Field, Schema, WireType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::sync::LazyLock;

/// Delivery model of a method: one deferred result, or a flow-controlled
/// stream of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    Stream,
}

/// Logical service identity: namespace, name and optional version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
    pub version: Option<String>,
}

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ServiceName {
            namespace: namespace.into(),
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Full wire-visible name, `<namespace>.<name>[_<version>]`.
    pub fn full(&self) -> String {
        let versioned = match &self.version {
            Some(v) if !v.is_empty() => format!("{}_{}", self.name, v),
            _ => self.name.clone(),
        };
        if self.namespace.is_empty() {
            versioned
        } else {
            format!("{}.{}", self.namespace, versioned)
        }
    }
}

/// A plain service interface declaration.
///
/// Implementations list their methods through the [`ContractBuilder`]; the
/// declaration is the single source the protocol is derived from, for both
/// the server dispatch table and the client stubs.
pub trait ServiceContract: 'static {
    fn service_name() -> ServiceName;
    fn contract(c: &mut ContractBuilder);
}

#[derive(Debug)]
struct DeclaredMethod {
    plain_name: String,
    kind: CallKind,
    arg_type_names: Vec<&'static str>,
    arg_schemas: Vec<Schema>,
    response_schema: Schema,
}

/// Collects method declarations for one contract.
#[derive(Debug, Default)]
pub struct ContractBuilder {
    methods: Vec<DeclaredMethod>,
}

impl ContractBuilder {
    /// Declare a unary method: arguments in, one deferred result out.
    pub fn unary<Args: ArgTuple, T: WireType>(&mut self, name: &str) -> &mut Self {
        self.declare::<Args>(name, CallKind::Unary, T::schema())
    }

    /// Declare a stream method: arguments in, a demand-controlled stream of
    /// `T` items out. The stream sink is not an argument and never appears
    /// in the request record.
    pub fn stream<Args: ArgTuple, T: WireType>(&mut self, name: &str) -> &mut Self {
        self.declare::<Args>(name, CallKind::Stream, T::schema())
    }

    fn declare<Args: ArgTuple>(
        &mut self,
        name: &str,
        kind: CallKind,
        response_schema: Schema,
    ) -> &mut Self {
        self.methods.push(DeclaredMethod {
            plain_name: name.to_string(),
            kind,
            arg_type_names: Args::type_names(),
            arg_schemas: Args::schemas(),
            response_schema,
        });
        self
    }
}

/// Wire identity of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Collision-free protocol name, `plain_name` or `plain_name_<rank>`
    /// for overloads.
    pub wire_name: String,
    pub plain_name: String,
    /// `<service-full-name>/<wire_name>`, the name transports route by.
    pub full_name: String,
    pub kind: CallKind,
    pub arg_type_names: Vec<&'static str>,
    /// Record `<wire_name>_Req` with one positional field per argument.
    pub request_schema: Schema,
    pub response_schema: Schema,
    pub error_schema: Schema,
}

impl MethodDescriptor {
    pub fn signature(&self) -> String {
        self.arg_type_names.join(", ")
    }
}

/// The canonical protocol for one service contract: stable identity plus
/// one [`MethodDescriptor`] per method, keyed by wire name. Immutable after
/// construction.
#[derive(Debug)]
pub struct ProtocolDescriptor {
    pub service: ServiceName,
    pub methods: IndexMap<String, MethodDescriptor>,
}

static DESCRIPTORS: LazyLock<DashMap<TypeId, &'static ProtocolDescriptor>> =
    LazyLock::new(DashMap::new);

impl ProtocolDescriptor {
    /// Cached descriptor for `C`. The first caller builds it; concurrent
    /// first builds are serialized on the cache entry, and every later
    /// lookup returns the same `&'static` instance.
    pub fn of<C: ServiceContract>() -> Result<&'static ProtocolDescriptor, ContractError> {
        match DESCRIPTORS.entry(TypeId::of::<C>()) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(v) => {
                let built: &'static ProtocolDescriptor = Box::leak(Box::new(Self::build::<C>()?));
                v.insert(built);
                Ok(built)
            }
        }
    }

    /// Uncached build, used directly only by tests that compare repeated
    /// derivations.
    pub fn build<C: ServiceContract>() -> Result<ProtocolDescriptor, ContractError> {
        let service = C::service_name();
        let mut builder = ContractBuilder::default();
        C::contract(&mut builder);
        Self::assemble(service, builder)
    }

    fn assemble(
        service: ServiceName,
        builder: ContractBuilder,
    ) -> Result<ProtocolDescriptor, ContractError> {
        let declared = builder.methods;
        if declared.is_empty() {
            return Err(ContractError::Empty {
                service: service.full(),
            });
        }
        for (i, m) in declared.iter().enumerate() {
            let dup = declared[..i]
                .iter()
                .any(|o| o.plain_name == m.plain_name && o.arg_type_names == m.arg_type_names);
            if dup {
                return Err(ContractError::DuplicateSignature {
                    service: service.full(),
                    name: m.plain_name.clone(),
                    signature: m.arg_type_names.join(", "),
                });
            }
        }

        let full_service = service.full();
        let mut methods = IndexMap::with_capacity(declared.len());
        for m in &declared {
            let wire_name = wire_name_of(&declared, m);
            let fields = m
                .arg_schemas
                .iter()
                .enumerate()
                .map(|(i, s)| Field::new(format!("arg_{i}"), s.clone()))
                .collect();
            let descriptor = MethodDescriptor {
                full_name: format!("{}/{}", full_service, wire_name),
                plain_name: m.plain_name.clone(),
                kind: m.kind,
                arg_type_names: m.arg_type_names.clone(),
                request_schema: Schema::record(format!("{wire_name}_Req"), fields),
                response_schema: m.response_schema.clone(),
                error_schema: ErrorRecord::schema(),
                wire_name: wire_name.clone(),
            };
            methods.insert(wire_name, descriptor);
        }
        Ok(ProtocolDescriptor { service, methods })
    }

    /// Look up by wire name.
    pub fn method(&self, wire_name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(wire_name)
    }

    /// Resolve a method by its plain name and argument signature; this is
    /// how stubs and binders address overloads without knowing their rank.
    pub fn resolve(
        &self,
        plain_name: &str,
        arg_type_names: &[&'static str],
    ) -> Result<&MethodDescriptor, ContractError> {
        self.methods
            .values()
            .find(|m| m.plain_name == plain_name && m.arg_type_names == arg_type_names)
            .ok_or_else(|| ContractError::UnknownMethod {
                service: self.service.full(),
                name: plain_name.to_string(),
                signature: arg_type_names.join(", "),
            })
    }
}

/// Overload-safe wire name: the plain name when unique, otherwise the plain
/// name suffixed with the method's zero-based rank in the lexicographic
/// ordering of same-named signatures. Stable regardless of declaration
/// order.
fn wire_name_of(all: &[DeclaredMethod], target: &DeclaredMethod) -> String {
    let mut same_named: Vec<&DeclaredMethod> = all
        .iter()
        .filter(|m| m.plain_name == target.plain_name)
        .collect();
    if same_named.len() == 1 {
        return target.plain_name.clone();
    }
    same_named.sort_by(|a, b| a.arg_type_names.cmp(&b.arg_type_names));
    let rank = same_named
        .iter()
        .position(|m| m.arg_type_names == target.arg_type_names)
        .unwrap_or(0);
    format!("{}_{}", target.plain_name, rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Calc;
    impl ServiceContract for Calc {
        fn service_name() -> ServiceName {
            ServiceName::new("demo", "calc").with_version("0.0")
        }
        fn contract(c: &mut ContractBuilder) {
            c.unary::<(i32, String), String>("getCall")
                .unary::<(), ()>("voidCall")
                .stream::<(i32,), String>("stream");
        }
    }

    struct Overloaded;
    impl ServiceContract for Overloaded {
        fn service_name() -> ServiceName {
            ServiceName::new("demo", "over")
        }
        fn contract(c: &mut ContractBuilder) {
            // Deliberately declared in "wrong" order; ranks must not care.
            c.unary::<(String,), String>("get")
                .unary::<(i32,), String>("get")
                .unary::<(bool,), String>("get");
        }
    }

    #[test]
    fn unique_names_stay_plain() {
        let p = ProtocolDescriptor::build::<Calc>().unwrap();
        assert!(p.method("getCall").is_some());
        assert_eq!(p.method("getCall").unwrap().kind, CallKind::Unary);
        assert_eq!(p.method("stream").unwrap().kind, CallKind::Stream);
    }

    #[test]
    fn full_name_carries_namespace_and_version() {
        let p = ProtocolDescriptor::build::<Calc>().unwrap();
        assert_eq!(
            p.method("getCall").unwrap().full_name,
            "demo.calc_0.0/getCall"
        );
    }

    #[test]
    fn request_record_is_positional() {
        let p = ProtocolDescriptor::build::<Calc>().unwrap();
        let md = p.method("getCall").unwrap();
        match &md.request_schema {
            Schema::Record { name, fields } => {
                assert_eq!(name, "getCall_Req");
                assert_eq!(fields[0].name, "arg_0");
                assert_eq!(fields[0].schema, Schema::Int);
                assert_eq!(fields[1].name, "arg_1");
                assert_eq!(fields[1].schema, Schema::String);
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn overloads_get_distinct_stable_wire_names() {
        let a = ProtocolDescriptor::build::<Overloaded>().unwrap();
        let b = ProtocolDescriptor::build::<Overloaded>().unwrap();
        let names_a: Vec<_> = a.methods.keys().cloned().collect();
        let names_b: Vec<_> = b.methods.keys().cloned().collect();
        assert_eq!(names_a, names_b);
        let mut unique = names_a.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        for n in &names_a {
            assert!(n.starts_with("get_"), "overload {n} must carry a rank");
        }
        // Signature ordering is lexicographic on the full type names:
        // alloc::string::String < bool < i32, independent of declaration
        // order.
        let string_md = a
            .resolve("get", &[std::any::type_name::<String>()])
            .unwrap();
        assert_eq!(string_md.wire_name, "get_0");
        let bool_md = a.resolve("get", &[std::any::type_name::<bool>()]).unwrap();
        assert_eq!(bool_md.wire_name, "get_1");
        let i32_md = a.resolve("get", &[std::any::type_name::<i32>()]).unwrap();
        assert_eq!(i32_md.wire_name, "get_2");
    }

    #[test]
    fn descriptor_cache_is_pointer_idempotent() {
        let first = ProtocolDescriptor::of::<Calc>().unwrap();
        let second = ProtocolDescriptor::of::<Calc>().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn duplicate_signature_is_a_contract_error() {
        struct Dup;
        impl ServiceContract for Dup {
            fn service_name() -> ServiceName {
                ServiceName::new("demo", "dup")
            }
            fn contract(c: &mut ContractBuilder) {
                c.unary::<(i32,), String>("m").unary::<(i32,), String>("m");
            }
        }
        assert!(matches!(
            ProtocolDescriptor::build::<Dup>(),
            Err(ContractError::DuplicateSignature { .. })
        ));
    }

    #[test]
    fn empty_contract_is_rejected() {
        struct Empty;
        impl ServiceContract for Empty {
            fn service_name() -> ServiceName {
                ServiceName::new("demo", "empty")
            }
            fn contract(_c: &mut ContractBuilder) {}
        }
        assert!(matches!(
            ProtocolDescriptor::build::<Empty>(),
            Err(ContractError::Empty { .. })
        ));
    }
}
