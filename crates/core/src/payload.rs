//! Job payload values and their runtime shapes.
//!
//! Payloads are carried as `serde_json::Value`, a tagged variant, so a
//! handler's expected parameter can be checked at schedule time by comparing
//! shapes rather than inspecting function signatures.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Arbitrary job data.
pub type Payload = serde_json::Value;

/// Runtime shape of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Accepts every payload.
    Any,
    Null,
    Bool,
    /// Integral number.
    Int,
    /// Any number; integers are accepted as floats.
    Float,
    String,
    List,
    Map,
}

impl PayloadKind {
    /// The concrete shape of `value` (never `Any`).
    pub fn of(value: &Payload) -> Self {
        match value {
            Payload::Null => PayloadKind::Null,
            Payload::Bool(_) => PayloadKind::Bool,
            Payload::Number(n) if n.is_i64() || n.is_u64() => PayloadKind::Int,
            Payload::Number(_) => PayloadKind::Float,
            Payload::String(_) => PayloadKind::String,
            Payload::Array(_) => PayloadKind::List,
            Payload::Object(_) => PayloadKind::Map,
        }
    }

    /// Whether a parameter of this kind can receive `value`.
    pub fn accepts(&self, value: &Payload) -> bool {
        match (self, PayloadKind::of(value)) {
            (PayloadKind::Any, _) => true,
            (PayloadKind::Float, PayloadKind::Int) => true,
            (expected, found) => *expected == found,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Any => "any",
            PayloadKind::Null => "null",
            PayloadKind::Bool => "bool",
            PayloadKind::Int => "int",
            PayloadKind::Float => "float",
            PayloadKind::String => "string",
            PayloadKind::List => "list",
            PayloadKind::Map => "map",
        }
    }
}

impl core::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust type usable as the parameter of a typed handler.
///
/// `KIND` is the payload shape checked at schedule time; the value is then
/// deserialized into `Self` by the worker. Implement it for your own
/// structs with `PayloadKind::Map`.
pub trait JobPayload: DeserializeOwned + Serialize + 'static {
    const KIND: PayloadKind;
}

macro_rules! impl_job_payload {
    ($kind:expr => $($t:ty),+ $(,)?) => {
        $(impl JobPayload for $t {
            const KIND: PayloadKind = $kind;
        })+
    };
}

impl_job_payload!(PayloadKind::Null => ());
impl_job_payload!(PayloadKind::Bool => bool);
impl_job_payload!(PayloadKind::Int => i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);
impl_job_payload!(PayloadKind::Float => f32, f64);
impl_job_payload!(PayloadKind::String => String);
impl_job_payload!(PayloadKind::Any => Payload);

impl<T: JobPayload> JobPayload for Vec<T> {
    const KIND: PayloadKind = PayloadKind::List;
}

impl<T: JobPayload> JobPayload for BTreeMap<String, T> {
    const KIND: PayloadKind = PayloadKind::Map;
}

impl<T: JobPayload> JobPayload for HashMap<String, T> {
    const KIND: PayloadKind = PayloadKind::Map;
}
