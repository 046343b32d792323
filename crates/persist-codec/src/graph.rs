//! Codec trait and the graph-preserving JSON codec.
//!
//! # Wire format
//!
//! JSON scalars, arrays and objects encode as themselves. Everything else is
//! a single-key tag object:
//!
//! | value                 | encoding                          |
//! |-----------------------|-----------------------------------|
//! | `Undefined`           | `{"$undefined":null}`             |
//! | non-finite `Float`    | `{"$num":"NaN"}`                  |
//! | `Date`                | `{"$date":1400000000000}`         |
//! | `Regex`               | `{"$regex":["^a+$","i"]}`         |
//! | `Set`                 | `{"$set":[...]}`                  |
//! | `Map`                 | `{"$map":[[k,v],...]}`            |
//! | `Shared`, first visit | `{"$def":[id, inner]}`            |
//! | `Shared`, revisit     | `{"$ref":id}`                     |
//!
//! A plain object with exactly one `$`-prefixed key is wrapped as
//! `{"$obj":{...}}` so it never reads back as a tag. Node ids are assigned
//! in depth-first order and object keys are sorted, so encoding is
//! deterministic.
//!
//! Both directions accept at most [`MAX_DEPTH`] levels of value nesting, so
//! anything that encodes also decodes.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::{Map, Value as Json, json};

use crate::error::{CodecError, CodecResult};
use crate::value::{SharedValue, Value};

const TAG_UNDEFINED: &str = "$undefined";
const TAG_NUM: &str = "$num";
const TAG_DATE: &str = "$date";
const TAG_REGEX: &str = "$regex";
const TAG_SET: &str = "$set";
const TAG_MAP: &str = "$map";
const TAG_DEF: &str = "$def";
const TAG_REF: &str = "$ref";
const TAG_OBJ: &str = "$obj";

/// Deepest value nesting the codec encodes or decodes. A shared node counts
/// as one level.
pub const MAX_DEPTH: usize = 512;

/// Serialization contract between observable values and stored text.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> CodecResult<String>;
    fn decode(&self, text: &str) -> CodecResult<Value>;
}

/// Reference codec: JSON text that keeps maps, sets, dates, regexes and
/// shared or cyclic nodes intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphCodec;

impl Codec for GraphCodec {
    fn encode(&self, value: &Value) -> CodecResult<String> {
        let json = Encoder::default().encode(value)?;
        Ok(serde_json::to_string(&json)?)
    }

    fn decode(&self, text: &str) -> CodecResult<Value> {
        // serde_json stops at 128 levels; a shared node alone takes two.
        // Depth is bounded by MAX_DEPTH in the decoder instead.
        let mut de = serde_json::Deserializer::from_str(text);
        de.disable_recursion_limit();
        let json = Json::deserialize(&mut de)?;
        de.end()?;
        Decoder::default().decode(json)
    }
}

fn tagged(tag: &str, payload: Json) -> Json {
    let mut map = Map::new();
    map.insert(tag.to_string(), payload);
    Json::Object(map)
}

fn is_tag_shaped(map: &Map<String, Json>) -> bool {
    map.len() == 1 && map.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn descend(depth: &mut usize) -> CodecResult<()> {
    if *depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep(MAX_DEPTH));
    }
    *depth += 1;
    Ok(())
}

#[derive(Default)]
struct Encoder {
    /// Node address → id, for every shared node seen so far.
    ids: HashMap<usize, u64>,
    next_id: u64,
    depth: usize,
}

impl Encoder {
    fn encode(&mut self, value: &Value) -> CodecResult<Json> {
        descend(&mut self.depth)?;
        let json = self.encode_value(value);
        self.depth -= 1;
        json
    }

    fn encode_value(&mut self, value: &Value) -> CodecResult<Json> {
        let json = match value {
            Value::Undefined => tagged(TAG_UNDEFINED, Json::Null),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => Json::Number(n),
                None => tagged(TAG_NUM, Json::from(non_finite_name(*f))),
            },
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(self.encode_all(items)?),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.encode(item)?);
                }
                if is_tag_shaped(&out) {
                    tagged(TAG_OBJ, Json::Object(out))
                } else {
                    Json::Object(out)
                }
            }
            Value::Map(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (key, item) in entries {
                    pairs.push(Json::Array(vec![self.encode(key)?, self.encode(item)?]));
                }
                tagged(TAG_MAP, Json::Array(pairs))
            }
            Value::Set(items) => tagged(TAG_SET, Json::Array(self.encode_all(items)?)),
            Value::Date(at) => tagged(TAG_DATE, Json::from(at.timestamp_millis())),
            Value::Regex { source, flags } => tagged(TAG_REGEX, json!([source, flags])),
            Value::Shared(node) => return self.encode_shared(node),
        };
        Ok(json)
    }

    fn encode_all(&mut self, items: &[Value]) -> CodecResult<Vec<Json>> {
        items.iter().map(|item| self.encode(item)).collect()
    }

    fn encode_shared(&mut self, node: &SharedValue) -> CodecResult<Json> {
        if let Some(id) = self.ids.get(&node.addr()) {
            return Ok(tagged(TAG_REF, Json::from(*id)));
        }
        let id = self.next_id;
        self.next_id += 1;
        // Registered before descending so a cycle back to this node becomes a $ref.
        self.ids.insert(node.addr(), id);
        let inner = self.encode(&node.get())?;
        Ok(tagged(TAG_DEF, json!([id, inner])))
    }
}

fn non_finite_name(f: f64) -> &'static str {
    if f.is_nan() {
        "NaN"
    } else if f.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

#[derive(Default)]
struct Decoder {
    nodes: HashMap<u64, SharedValue>,
    depth: usize,
}

impl Decoder {
    fn decode(&mut self, json: Json) -> CodecResult<Value> {
        descend(&mut self.depth)?;
        let value = self.decode_value(json);
        self.depth -= 1;
        value
    }

    fn decode_value(&mut self, json: Json) -> CodecResult<Value> {
        let value = match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::from_number(&n)?,
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(self.decode_all(items)?),
            Json::Object(map) if is_tag_shaped(&map) => {
                let Some((tag, payload)) = map.into_iter().next() else {
                    return Ok(Value::Object(BTreeMap::new()));
                };
                self.decode_tagged(&tag, payload)?
            }
            Json::Object(map) => self.decode_object(map)?,
        };
        Ok(value)
    }

    fn decode_all(&mut self, items: Vec<Json>) -> CodecResult<Vec<Value>> {
        items.into_iter().map(|item| self.decode(item)).collect()
    }

    fn decode_object(&mut self, map: Map<String, Json>) -> CodecResult<Value> {
        let mut out = BTreeMap::new();
        for (key, item) in map {
            out.insert(key, self.decode(item)?);
        }
        Ok(Value::Object(out))
    }

    fn decode_tagged(&mut self, tag: &str, payload: Json) -> CodecResult<Value> {
        match tag {
            TAG_UNDEFINED => Ok(Value::Undefined),
            TAG_NUM => match payload.as_str() {
                Some("NaN") => Ok(Value::Float(f64::NAN)),
                Some("Infinity") => Ok(Value::Float(f64::INFINITY)),
                Some("-Infinity") => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => Err(CodecError::MalformedTag(TAG_NUM)),
            },
            TAG_DATE => {
                let millis = payload.as_i64().ok_or(CodecError::MalformedTag(TAG_DATE))?;
                Value::date_millis(millis)
            }
            TAG_REGEX => match payload {
                Json::Array(parts) => match parts.as_slice() {
                    [Json::String(source), Json::String(flags)] => {
                        Ok(Value::regex(source.as_str(), flags.as_str()))
                    }
                    _ => Err(CodecError::MalformedTag(TAG_REGEX)),
                },
                _ => Err(CodecError::MalformedTag(TAG_REGEX)),
            },
            TAG_SET => match payload {
                Json::Array(items) => Ok(Value::Set(self.decode_all(items)?)),
                _ => Err(CodecError::MalformedTag(TAG_SET)),
            },
            TAG_MAP => {
                let Json::Array(pairs) = payload else {
                    return Err(CodecError::MalformedTag(TAG_MAP));
                };
                let mut entries = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    let Json::Array(pair) = pair else {
                        return Err(CodecError::MalformedTag(TAG_MAP));
                    };
                    let [key, item]: [Json; 2] = pair
                        .try_into()
                        .map_err(|_| CodecError::MalformedTag(TAG_MAP))?;
                    entries.push((self.decode(key)?, self.decode(item)?));
                }
                Ok(Value::Map(entries))
            }
            TAG_OBJ => match payload {
                Json::Object(map) => self.decode_object(map),
                _ => Err(CodecError::MalformedTag(TAG_OBJ)),
            },
            TAG_DEF => {
                let Json::Array(parts) = payload else {
                    return Err(CodecError::MalformedTag(TAG_DEF));
                };
                let [id, inner]: [Json; 2] = parts
                    .try_into()
                    .map_err(|_| CodecError::MalformedTag(TAG_DEF))?;
                let id = id.as_u64().ok_or(CodecError::MalformedTag(TAG_DEF))?;
                let node = SharedValue::new(Value::Null);
                if self.nodes.insert(id, node.clone()).is_some() {
                    return Err(CodecError::DuplicateNode(id));
                }
                let inner = self.decode(inner)?;
                node.set(inner);
                Ok(Value::Shared(node))
            }
            TAG_REF => {
                let id = payload.as_u64().ok_or(CodecError::MalformedTag(TAG_REF))?;
                self.nodes
                    .get(&id)
                    .cloned()
                    .map(Value::Shared)
                    .ok_or(CodecError::DanglingReference(id))
            }
            other => Err(CodecError::UnknownTag(other.to_string())),
        }
    }
}
