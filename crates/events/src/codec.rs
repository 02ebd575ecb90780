//! Payload codecs, keyed by event name.
//!
//! A [`CodecRegistry`] is built once at startup through
//! [`CodecRegistryBuilder`] and is read-only afterwards; share it behind an
//! `Arc`. Tests build their own isolated registries.
//!
//! Payloads are encoded as JSON.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;
use crate::record::EventRecord;

type SharedPayload = Arc<dyn Any + Send + Sync>;
type EncodeFn = fn(&str, &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError>;
type DecodeFn = fn(&str, &[u8]) -> Result<SharedPayload, CodecError>;

/// Turns event payloads into bytes and back.
pub trait Codec: Send + Sync {
    fn marshal(&self, name: &str, payload: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, name: &str, bytes: &[u8]) -> Result<SharedPayload, CodecError>;

    /// Encode the payload of a record.
    fn marshal_record(&self, record: &EventRecord) -> Result<Vec<u8>, CodecError> {
        self.marshal(record.name(), record.raw_data().as_ref())
    }
}

impl<C: Codec + ?Sized> Codec for Arc<C> {
    fn marshal(&self, name: &str, payload: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        (**self).marshal(name, payload)
    }

    fn unmarshal(&self, name: &str, bytes: &[u8]) -> Result<SharedPayload, CodecError> {
        (**self).unmarshal(name, bytes)
    }
}

#[derive(Clone, Copy)]
struct Entry {
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Default)]
pub struct CodecRegistryBuilder {
    entries: HashMap<String, Entry>,
}

impl CodecRegistryBuilder {
    /// Register `T` as the payload type of events named `name`.
    ///
    /// One type may back several names; a name can only be registered once.
    pub fn register<T>(mut self, name: impl Into<String>) -> Result<Self, CodecError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(CodecError::DuplicateEvent(name));
        }
        self.entries.insert(
            name,
            Entry {
                type_name: type_name::<T>(),
                encode: encode::<T>,
                decode: decode::<T>,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            entries: self.entries,
        }
    }
}

/// Read-only map from event name to payload codec.
pub struct CodecRegistry {
    entries: HashMap<String, Entry>,
}

impl CodecRegistry {
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn entry(&self, name: &str) -> Result<&Entry, CodecError> {
        self.entries
            .get(name)
            .ok_or_else(|| CodecError::UnknownEvent(name.to_string()))
    }
}

impl Codec for CodecRegistry {
    fn marshal(&self, name: &str, payload: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        (self.entry(name)?.encode)(name, payload)
    }

    fn unmarshal(&self, name: &str, bytes: &[u8]) -> Result<SharedPayload, CodecError> {
        (self.entry(name)?.decode)(name, bytes)
    }
}

impl core::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.type_name))
            .collect();
        names.sort_unstable();
        f.debug_struct("CodecRegistry").field("entries", &names).finish()
    }
}

fn encode<T>(name: &str, payload: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + 'static,
{
    let typed = payload
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::TypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        })?;
    serde_json::to_vec(typed).map_err(|source| CodecError::Encode {
        name: name.to_string(),
        source,
    })
}

fn decode<T>(name: &str, bytes: &[u8]) -> Result<SharedPayload, CodecError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let typed: T = serde_json::from_slice(bytes).map_err(|source| CodecError::Decode {
        name: name.to_string(),
        source,
    })?;
    Ok(Arc::new(typed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AggregateRef;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Approved {
        amount: u64,
    }

    fn registry() -> CodecRegistry {
        CodecRegistry::builder()
            .register::<Approved>("loan.approved")
            .unwrap()
            .build()
    }

    #[test]
    fn duplicate_names_fail_at_registration() {
        let err = CodecRegistry::builder()
            .register::<Approved>("loan.approved")
            .unwrap()
            .register::<String>("loan.approved")
            .err()
            .unwrap();
        assert!(matches!(err, CodecError::DuplicateEvent(name) if name == "loan.approved"));
    }

    #[test]
    fn record_payload_survives_marshal_and_unmarshal() {
        let codec = registry();
        let record = EventRecord::new(
            "loan.approved",
            AggregateRef::default(),
            Approved { amount: 250 },
        );

        let bytes = codec.marshal_record(&record).unwrap();
        let decoded = codec.unmarshal("loan.approved", &bytes).unwrap();

        assert_eq!(decoded.downcast_ref::<Approved>(), Some(&Approved { amount: 250 }));
    }

    #[test]
    fn unknown_names_and_wrong_types_are_reported() {
        let codec = registry();

        assert!(matches!(
            codec.unmarshal("loan.rejected", b"{}"),
            Err(CodecError::UnknownEvent(_))
        ));
        assert!(matches!(
            codec.marshal("loan.approved", &"not approved"),
            Err(CodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            codec.unmarshal("loan.approved", b"{\"amount\":\"many\"}"),
            Err(CodecError::Decode { .. })
        ));
    }
}
