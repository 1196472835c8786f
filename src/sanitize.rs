//! Conversion of native values into JSON-safe values.
//!
//! * Non-finite floats (NaN, +/-infinity) become `null`.
//! * Complex numbers become strings of the form `1.5+2j`.
//! * Byte strings are decoded as UTF-8, replacing invalid sequences.
//! * Arrays become nested JSON arrays, one level per dimension.

use crate::array::{Block, Complex};

use ndarray::{ArrayViewD, Axis};
use serde_json::{Number, Value};

/// Conversion into a JSON-safe [serde_json::Value].
pub trait Sanitize {
    fn sanitize(&self) -> Value;
}

impl Sanitize for f64 {
    fn sanitize(&self) -> Value {
        Number::from_f64(*self).map_or(Value::Null, Value::Number)
    }
}

impl Sanitize for f32 {
    fn sanitize(&self) -> Value {
        (*self as f64).sanitize()
    }
}

impl Sanitize for i64 {
    fn sanitize(&self) -> Value {
        Value::from(*self)
    }
}

impl Sanitize for u64 {
    fn sanitize(&self) -> Value {
        Value::from(*self)
    }
}

impl Sanitize for bool {
    fn sanitize(&self) -> Value {
        Value::Bool(*self)
    }
}

impl Sanitize for Complex {
    fn sanitize(&self) -> Value {
        Value::String(format!("{}{:+}j", self.re, self.im))
    }
}

impl Sanitize for Vec<u8> {
    fn sanitize(&self) -> Value {
        Value::String(String::from_utf8_lossy(self).into_owned())
    }
}

impl Sanitize for String {
    fn sanitize(&self) -> Value {
        Value::String(self.clone())
    }
}

/// Convert an n-dimensional view into nested JSON arrays.
pub fn sanitize_array<T: Sanitize>(array: ArrayViewD<T>) -> Value {
    if array.ndim() == 0 {
        return array
            .first()
            .map_or(Value::Null, |element| element.sanitize());
    }
    Value::Array(
        array
            .axis_iter(Axis(0))
            .map(|sub| sanitize_array(sub))
            .collect(),
    )
}

impl Sanitize for Block {
    fn sanitize(&self) -> Value {
        match self {
            Block::Bool(array) => sanitize_array(array.view()),
            Block::Int(array) => sanitize_array(array.view()),
            Block::UInt(array) => sanitize_array(array.view()),
            Block::Float(array) => sanitize_array(array.view()),
            Block::Complex(array) => sanitize_array(array.view()),
            Block::Bytes(array) => sanitize_array(array.view()),
            Block::Text(array) => sanitize_array(array.view()),
        }
    }
}

impl<T: Sanitize> Sanitize for Option<T> {
    fn sanitize(&self) -> Value {
        self.as_ref().map_or(Value::Null, Sanitize::sanitize)
    }
}
