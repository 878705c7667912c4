//! Task parameter values and their XML codecs.
//!
//! A parameter value is stored as a `(type_name, payload)` pair. The payload
//! is the value serialized to XML with the type name as root element:
//!
//! ```text
//! Int32    <Int32>42</Int32>
//! String   <String>C:\HostingSpaces</String>
//! Guid     <Guid>6f9619ff-8b86-d011-b42d-00c04fc964ff</Guid>
//! ```
//!
//! Leading and trailing whitespace of text content is written as character
//! references (`<String>&#32;x</String>`), since the serde reader trims raw
//! whitespace at element edges.
//!
//! Only types registered in a [`ParamRegistry`] can be encoded or decoded.
//! Renaming a registered tag breaks decoding of parameters already stored
//! under the old name.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Write as _};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use panel_core::ServiceError;

// ---------------------------------------------------------------------------
// TaskParamType
// ---------------------------------------------------------------------------

/// A Rust type that can be stored as a task parameter.
pub trait TaskParamType:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
    /// Stable tag persisted next to the payload; also the XML root element.
    const TYPE_NAME: &'static str;
}

impl TaskParamType for bool {
    const TYPE_NAME: &'static str = "Boolean";
}

impl TaskParamType for i32 {
    const TYPE_NAME: &'static str = "Int32";
}

impl TaskParamType for i64 {
    const TYPE_NAME: &'static str = "Int64";
}

impl TaskParamType for f64 {
    const TYPE_NAME: &'static str = "Double";
}

impl TaskParamType for String {
    const TYPE_NAME: &'static str = "String";
}

impl TaskParamType for Uuid {
    const TYPE_NAME: &'static str = "Guid";
}

impl TaskParamType for DateTime<Utc> {
    const TYPE_NAME: &'static str = "DateTime";
}

// ---------------------------------------------------------------------------
// ParamValue
// ---------------------------------------------------------------------------

trait ParamData: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_data(&self, other: &dyn ParamData) -> bool;
}

impl<T: TaskParamType> ParamData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_data(&self, other: &dyn ParamData) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

/// A live parameter value of some [`TaskParamType`].
#[derive(Clone)]
pub struct ParamValue {
    type_name: &'static str,
    data: Arc<dyn ParamData>,
}

impl ParamValue {
    pub fn new<T: TaskParamType>(value: T) -> Self {
        Self {
            type_name: T::TYPE_NAME,
            data: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: TaskParamType>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    fn rust_type_id(&self) -> TypeId {
        self.data.as_any().type_id()
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.data.eq_data(other.data.as_ref())
    }
}

impl Debug for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.type_name, self.data)
    }
}

// ---------------------------------------------------------------------------
// ParamRegistry
// ---------------------------------------------------------------------------

type EncodeFn = fn(&ParamValue) -> Result<String, ServiceError>;
type DecodeFn = fn(&str) -> Result<ParamValue, ServiceError>;

struct Codec {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Closed mapping from type tag to XML codec.
pub struct ParamRegistry {
    codecs: HashMap<&'static str, Codec>,
}

impl ParamRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// A registry with the primitive types every task may use.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert::<bool>();
        registry.insert::<i32>();
        registry.insert::<i64>();
        registry.insert::<f64>();
        registry.insert::<String>();
        registry.insert::<Uuid>();
        registry.insert::<DateTime<Utc>>();
        registry
    }

    /// Register `T` under its tag.
    ///
    /// Registering the same type twice is a no-op; binding a tag that already
    /// belongs to a different type is a `Conflict`.
    pub fn register<T: TaskParamType>(&mut self) -> Result<(), ServiceError> {
        if let Some(existing) = self.codecs.get(T::TYPE_NAME) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(ServiceError::Conflict(format!(
                "parameter type {} is already registered for another type",
                T::TYPE_NAME
            )));
        }
        self.insert::<T>();
        Ok(())
    }

    /// Serialize a live value to its XML payload.
    ///
    /// The payload is decoded again before it is returned; a value that does
    /// not come back equal is a `Validation` error, so it is never stored.
    pub fn encode(&self, value: &ParamValue) -> Result<String, ServiceError> {
        let codec = self.codecs.get(value.type_name()).ok_or_else(|| {
            ServiceError::Validation(format!(
                "parameter type {} is not registered",
                value.type_name()
            ))
        })?;
        if codec.type_id != value.rust_type_id() {
            return Err(ServiceError::Validation(format!(
                "parameter type {} is registered for another type",
                value.type_name()
            )));
        }
        let payload = (codec.encode)(value)?;
        let back = (codec.decode)(&payload).map_err(|e| {
            ServiceError::Validation(format!(
                "parameter type {} cannot be read back: {e}",
                value.type_name()
            ))
        })?;
        if back != *value {
            return Err(ServiceError::Validation(format!(
                "parameter type {} does not survive encoding: {payload}",
                value.type_name()
            )));
        }
        Ok(payload)
    }

    /// Decode a stored payload using the codec registered for `type_name`.
    pub fn decode(&self, type_name: &str, payload: &str) -> Result<ParamValue, ServiceError> {
        let codec = self.codecs.get(type_name).ok_or_else(|| {
            ServiceError::Decode(format!("unknown parameter type {type_name:?}"))
        })?;
        check_root(type_name, payload)?;
        (codec.decode)(payload)
    }

    fn insert<T: TaskParamType>(&mut self) {
        self.codecs.insert(
            T::TYPE_NAME,
            Codec {
                type_id: TypeId::of::<T>(),
                encode: encode_as::<T>,
                decode: decode_as::<T>,
            },
        );
    }
}

impl Default for ParamRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn encode_as<T: TaskParamType>(value: &ParamValue) -> Result<String, ServiceError> {
    let typed = value.downcast_ref::<T>().ok_or_else(|| {
        ServiceError::Internal(format!("parameter value is not a {}", T::TYPE_NAME))
    })?;
    let xml = quick_xml::se::to_string_with_root(T::TYPE_NAME, typed)
        .map_err(|e| ServiceError::Internal(format!("encode {}: {e}", T::TYPE_NAME)))?;
    protect_edge_whitespace(&xml)
        .map_err(|e| ServiceError::Internal(format!("encode {}: {e}", T::TYPE_NAME)))
}

fn decode_as<T: TaskParamType>(payload: &str) -> Result<ParamValue, ServiceError> {
    quick_xml::de::from_str::<T>(payload)
        .map(ParamValue::new)
        .map_err(|e| ServiceError::Decode(format!("decode {}: {e}", T::TYPE_NAME)))
}

/// The payload's root element must be the type tag.
fn check_root(type_name: &str, payload: &str) -> Result<(), ServiceError> {
    let mut reader = Reader::from_str(payload);
    loop {
        match reader
            .read_event()
            .map_err(|e| ServiceError::Decode(format!("decode {type_name}: {e}")))?
        {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() == type_name.as_bytes() {
                    return Ok(());
                }
                return Err(ServiceError::Decode(format!(
                    "payload root <{}> does not match parameter type {type_name}",
                    String::from_utf8_lossy(e.name().as_ref())
                )));
            }
            Event::Eof => {
                return Err(ServiceError::Decode(format!("empty {type_name} payload")));
            }
            _ => {}
        }
    }
}

/// Rewrite edge whitespace of every text node as character references.
fn protect_edge_whitespace(xml: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Text(text) => {
                let raw = String::from_utf8_lossy(&text).into_owned();
                writer.write_event(Event::Text(BytesText::from_escaped(escape_edges(&raw))))?;
            }
            event => writer.write_event(event)?,
        }
    }
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

fn escape_edges(raw: &str) -> String {
    let is_space = |c: char| matches!(c, ' ' | '\t' | '\r' | '\n');
    let rest = raw.trim_start_matches(is_space);
    let lead = &raw[..raw.len() - rest.len()];
    let core = rest.trim_end_matches(is_space);
    let trail = &rest[core.len()..];

    let mut out = String::with_capacity(raw.len() + 6 * (lead.len() + trail.len()));
    for c in lead.chars() {
        let _ = write!(out, "&#{};", c as u32);
    }
    out.push_str(core);
    for c in trail.chars() {
        let _ = write!(out, "&#{};", c as u32);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MailboxQuota {
        mailbox: String,
        quota_mb: i64,
        enabled: bool,
    }

    impl TaskParamType for MailboxQuota {
        const TYPE_NAME: &'static str = "MailboxQuota";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Impostor {
        mailbox: String,
    }

    impl TaskParamType for Impostor {
        const TYPE_NAME: &'static str = "MailboxQuota";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ForwardingRule {
        name: String,
        note: String,
        targets: Vec<String>,
    }

    impl TaskParamType for ForwardingRule {
        const TYPE_NAME: &'static str = "ForwardingRule";
    }

    fn roundtrip<T: TaskParamType>(registry: &ParamRegistry, value: T) {
        let live = ParamValue::new(value.clone());
        let payload = registry.encode(&live).unwrap();
        let back = registry.decode(T::TYPE_NAME, &payload).unwrap();
        assert_eq!(back.downcast_ref::<T>(), Some(&value), "payload: {payload}");
        assert_eq!(back, live);
    }

    #[test]
    fn builtin_values_survive_encoding() {
        let registry = ParamRegistry::with_builtins();
        roundtrip(&registry, true);
        roundtrip(&registry, -17i32);
        roundtrip(&registry, 9_000_000_000i64);
        roundtrip(&registry, 2.5f64);
        roundtrip(&registry, "C:\\HostingSpaces\\<site> & co".to_string());
        roundtrip(&registry, Uuid::new_v4());
        roundtrip(&registry, Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn payload_uses_type_name_as_root() {
        let registry = ParamRegistry::with_builtins();
        let payload = registry.encode(&ParamValue::new(42i32)).unwrap();
        assert_eq!(payload, "<Int32>42</Int32>");
    }

    #[test]
    fn structured_type_after_registration() {
        let mut registry = ParamRegistry::with_builtins();
        let quota = MailboxQuota {
            mailbox: "info@example.com".into(),
            quota_mb: 512,
            enabled: true,
        };

        let err = registry.encode(&ParamValue::new(quota.clone())).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        registry.register::<MailboxQuota>().unwrap();
        registry.register::<MailboxQuota>().unwrap();
        roundtrip(&registry, quota);
    }

    #[test]
    fn tag_collision_is_rejected() {
        let mut registry = ParamRegistry::new();
        registry.register::<MailboxQuota>().unwrap();
        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let err = registry
            .encode(&ParamValue::new(Impostor { mailbox: "x".into() }))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let registry = ParamRegistry::with_builtins();
        let err = registry.decode("HostingPlan", "<HostingPlan/>").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let registry = ParamRegistry::with_builtins();
        let err = registry.decode("Int32", "<Int32>forty-two</Int32>").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        let err = registry.decode("Boolean", "<Boolean>true").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn values_of_different_types_differ() {
        assert_ne!(ParamValue::new(1i32), ParamValue::new(1i64));
        assert_eq!(ParamValue::new("a".to_string()), ParamValue::new("a".to_string()));
        assert_eq!(format!("{:?}", ParamValue::new(7i32)), "Int32(7)");
    }

    #[test]
    fn edge_whitespace_in_strings_is_kept() {
        let registry = ParamRegistry::with_builtins();
        for value in ["  padded  ", " ", "a\n", "line1\nline2\n", "\tC:\\Sites \r\n", ""] {
            roundtrip(&registry, value.to_string());
        }

        let payload = registry
            .encode(&ParamValue::new("  x  ".to_string()))
            .unwrap();
        assert_eq!(payload, "<String>&#32;&#32;x&#32;&#32;</String>");
    }

    #[test]
    fn edge_whitespace_in_struct_fields_is_kept() {
        let mut registry = ParamRegistry::with_builtins();
        registry.register::<MailboxQuota>().unwrap();
        for mailbox in [" sp ", " ", "info@example.com\n"] {
            roundtrip(
                &registry,
                MailboxQuota {
                    mailbox: mailbox.into(),
                    quota_mb: 10,
                    enabled: false,
                },
            );
        }
    }

    #[test]
    fn value_that_cannot_be_read_back_is_rejected() {
        let mut registry = ParamRegistry::with_builtins();
        registry.register::<ForwardingRule>().unwrap();

        roundtrip(
            &registry,
            ForwardingRule {
                name: "sales".into(),
                note: "to team".into(),
                targets: vec!["a@example.com".into(), "b@example.com".into()],
            },
        );

        let empty = ForwardingRule {
            name: "sales".into(),
            note: "none".into(),
            targets: Vec::new(),
        };
        let err = registry.encode(&ParamValue::new(empty)).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)), "{err:?}");
    }

    #[test]
    fn payload_root_must_match_type() {
        let registry = ParamRegistry::with_builtins();
        let err = registry.decode("Int32", "<Int64>5</Int64>").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        let err = registry.decode("Int32", "").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
        assert_eq!(
            registry.decode("Int32", "<Int32>5</Int32>").unwrap(),
            ParamValue::new(5i32)
        );
    }
}
