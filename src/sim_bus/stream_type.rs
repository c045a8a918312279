// Stream types: the metadata describing the shape of samples on a topic.
//
// A stream type is a meta-type name plus named properties. The serialized
// byte size derived from these properties drives the QoS profile selection.

use std::collections::BTreeMap;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

/// Standard meta-type names.
pub const META_TYPE_RAW: &str = "raw";
pub const META_TYPE_PLAIN: &str = "plain";
pub const META_TYPE_PLAIN_ARRAY: &str = "plain_array";
pub const META_TYPE_STRING: &str = "string";
pub const META_TYPE_STRUCTURED: &str = "structured";

/// Standard property names.
pub const PROP_DATATYPE: &str = "datatype";
pub const PROP_MAX_ARRAY_SIZE: &str = "max_array_size";
pub const PROP_MAX_BYTE_SIZE: &str = "max_byte_size";
pub const PROP_STRUCT_DEFINITION: &str = "struct_definition";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
  pub value_type: String,
  pub value: String,
}

/// Metadata describing the shape of samples on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamType {
  meta_type: String,
  properties: BTreeMap<String, Property>,
}

impl StreamType {
  pub fn new(meta_type: &str) -> Self {
    StreamType {
      meta_type: meta_type.to_string(),
      properties: BTreeMap::new(),
    }
  }

  /// Raw octet stream without further shape information.
  pub fn raw() -> Self {
    StreamType::new(META_TYPE_RAW)
  }

  /// A single plain scalar, e.g. `plain("f64")`.
  pub fn plain(datatype: &str) -> Self {
    let mut st = StreamType::new(META_TYPE_PLAIN);
    st.set_property(PROP_DATATYPE, "string", datatype);
    st
  }

  /// A bounded array of plain scalars.
  pub fn plain_array(datatype: &str, max_array_size: usize) -> Self {
    let mut st = StreamType::new(META_TYPE_PLAIN_ARRAY);
    st.set_property(PROP_DATATYPE, "string", datatype);
    st.set_property(PROP_MAX_ARRAY_SIZE, "int", &max_array_size.to_string());
    st
  }

  /// A text signal bounded by `max_byte_size`.
  pub fn string(max_byte_size: usize) -> Self {
    let mut st = StreamType::new(META_TYPE_STRING);
    st.set_property(PROP_MAX_BYTE_SIZE, "int", &max_byte_size.to_string());
    st
  }

  /// A structured type. `struct_definition` is a comma-separated field list
  /// of primitives with optional array suffix, e.g. `"f64[3],u8,i32[10]"`.
  pub fn structured(struct_definition: &str) -> Self {
    let mut st = StreamType::new(META_TYPE_STRUCTURED);
    st.set_property(PROP_STRUCT_DEFINITION, "string", struct_definition);
    st
  }

  pub fn meta_type(&self) -> &str {
    &self.meta_type
  }

  pub fn set_property(&mut self, name: &str, value_type: &str, value: &str) {
    self.properties.insert(
      name.to_string(),
      Property {
        value_type: value_type.to_string(),
        value: value.to_string(),
      },
    );
  }

  pub fn property(&self, name: &str) -> Option<&str> {
    self.properties.get(name).map(|p| p.value.as_str())
  }

  pub fn property_names(&self) -> Vec<String> {
    self.properties.keys().cloned().collect()
  }

  pub fn properties(&self) -> &BTreeMap<String, Property> {
    &self.properties
  }

  fn property_usize(&self, name: &str) -> Option<usize> {
    self.property(name).and_then(|v| v.trim().parse::<usize>().ok())
  }

  /// Byte size of the stream-type message itself: the sum of the property
  /// value sizes. Drives the stream-type topic profile.
  pub fn stream_type_size(&self) -> usize {
    self.properties.values().map(|p| p.value.len()).sum()
  }

  /// Serialized byte size of one sample as declared by this type. `None`
  /// when the type does not declare enough to compute one (raw streams).
  pub fn sample_size(&self) -> Option<usize> {
    // An explicit byte bound wins over any computation.
    if let Some(max_byte_size) = self.property_usize(PROP_MAX_BYTE_SIZE) {
      return Some(max_byte_size);
    }
    match self.meta_type.as_str() {
      META_TYPE_PLAIN => self
        .property(PROP_DATATYPE)
        .and_then(primitive_size),
      META_TYPE_PLAIN_ARRAY => {
        let element = self.property(PROP_DATATYPE).and_then(primitive_size)?;
        let count = self.property_usize(PROP_MAX_ARRAY_SIZE)?;
        Some(element * count)
      }
      META_TYPE_STRUCTURED => {
        let definition = self.property(PROP_STRUCT_DEFINITION)?;
        let static_size = parse_struct_static_size(definition)?;
        let count = self.property_usize(PROP_MAX_ARRAY_SIZE).unwrap_or(1);
        Some(static_size * count)
      }
      _ => None,
    }
  }
}

/// Size of one primitive in bytes.
pub fn primitive_size(datatype: &str) -> Option<usize> {
  match datatype {
    "bool" | "u8" | "i8" => Some(1),
    "u16" | "i16" => Some(2),
    "u32" | "i32" | "f32" => Some(4),
    "u64" | "i64" | "f64" => Some(8),
    _ => None,
  }
}

/// Static serialized size of a structure description: comma-separated
/// primitive fields, each with an optional `[n]` array suffix.
pub fn parse_struct_static_size(definition: &str) -> Option<usize> {
  let mut total = 0usize;
  for field in definition.split(',') {
    let field = field.trim();
    if field.is_empty() {
      continue;
    }
    let (datatype, count) = match field.split_once('[') {
      Some((datatype, rest)) => {
        let count = rest.strip_suffix(']')?.trim().parse::<usize>().ok()?;
        (datatype.trim(), count)
      }
      None => (field, 1),
    };
    total = total.checked_add(primitive_size(datatype)?.checked_mul(count)?)?;
  }
  if total == 0 {
    None
  } else {
    Some(total)
  }
}
