//! Typed param and metric values

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

/// Module roots whose array objects are flattened into nested lists
const TENSOR_MODULES: [&str; 5] = ["numpy", "torch", "tensorflow", "jax", "cupy"];

/// Envelope key used by client libraries that cannot convert tensors themselves
const TENSOR_ENVELOPE: &str = "__tensor__";

/// A param or metric value
///
/// Serialised to plain JSON: booleans, numbers and strings map onto their
/// JSON counterparts, anything else is carried as a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(Value),
}

impl ParamValue {
    /// Numeric view used for metric comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Build a value from an arbitrary JSON value
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => ParamValue::Bool(b),
            Value::String(s) => ParamValue::String(s),
            Value::Number(n) => match n.as_i64() {
                Some(i) if !n.is_f64() => ParamValue::Int(i),
                _ => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            other => ParamValue::Json(other),
        }
    }

    /// Decode an `objectValueJson` payload, flattening tensor envelopes
    pub fn from_object_json(raw: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(sniff_tensor(value))
    }

    /// Encode as JSON
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Int(i) => Value::Number((*i).into()),
            ParamValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::Json(v) => v.clone(),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl Serialize for ParamValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(ParamValue::from_json)
    }
}

/// Convert a tensor envelope into nested lists; other values pass through
///
/// The envelope is `{"__tensor__": {"module": "numpy", "shape": [2, 2], "data": [1, 2, 3, 4]}}`
/// with `data` flattened in row-major order.
pub fn sniff_tensor(value: Value) -> ParamValue {
    let Some(tensor) = value.get(TENSOR_ENVELOPE) else {
        return ParamValue::from_json(value);
    };
    let module = tensor.get("module").and_then(Value::as_str).unwrap_or("");
    let root = module.split('.').next().unwrap_or("");
    if !TENSOR_MODULES.contains(&root) {
        return ParamValue::from_json(value);
    }

    let Some(shape) = tensor.get("shape").and_then(tensor_shape) else {
        return ParamValue::from_json(value);
    };
    let Some(data) = tensor.get("data").and_then(Value::as_array) else {
        return ParamValue::from_json(value);
    };
    let size = shape.iter().try_fold(1usize, |size, dim| size.checked_mul(*dim));
    if size != Some(data.len()) {
        return ParamValue::from_json(value);
    }
    if shape.is_empty() {
        return data
            .first()
            .cloned()
            .map(ParamValue::from_json)
            .unwrap_or(ParamValue::Json(Value::Null));
    }
    ParamValue::Json(reshape(&shape, data))
}

/// Dimensions of a tensor envelope
///
/// `None` unless every dimension is a positive integer that fits in `usize`.
fn tensor_shape(shape: &Value) -> Option<Vec<usize>> {
    shape
        .as_array()?
        .iter()
        .map(|dim| {
            dim.as_u64()
                .and_then(|dim| usize::try_from(dim).ok())
                .filter(|dim| *dim > 0)
        })
        .collect()
}

fn reshape(shape: &[usize], data: &[Value]) -> Value {
    match shape {
        [] => data.first().cloned().unwrap_or(Value::Null),
        [_] => Value::Array(data.to_vec()),
        [dim, rest @ ..] => {
            let stride: usize = rest.iter().product();
            let rows = (0..*dim)
                .map(|i| reshape(rest, &data[i * stride..(i + 1) * stride]))
                .collect();
            Value::Array(rows)
        }
    }
}
