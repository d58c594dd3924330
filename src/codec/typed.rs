//! Typed message payloads.
//!
//! The wire form is a flat record: `_lctype` selects the variant, `_lctext`
//! and `_lcattrs` are common to all variants, `_lcfile` and `_lcloc` belong to
//! media and location messages. Every other key is carried through untouched.

use serde_json::{Map, Value};

use crate::sdk::message::{
    AUDIO_TAG, FILE_TAG, IMAGE_TAG, LOCATION_TAG, RECALLED_TAG, TEXT_TAG, VIDEO_TAG,
};
use crate::sdk::{
    CustomMessage, FileRef, GeoPoint, LocationMessage, MediaMessage, RecalledMessage, TextMessage,
    TypedFields, TypedMessage,
};

pub const TYPE_KEY: &str = "_lctype";
pub const TEXT_KEY: &str = "_lctext";
pub const ATTRIBUTES_KEY: &str = "_lcattrs";
pub const FILE_KEY: &str = "_lcfile";
pub const LOCATION_KEY: &str = "_lcloc";

/// Encode/decode pair for one typed variant
trait TypedVariant: Sized {
    /// Build the variant from the record, with `_lctype` already removed
    fn decode(record: Map<String, Value>) -> Self;

    /// Write the variant's keys, `_lctype` excluded
    fn encode(&self, out: &mut Map<String, Value>);
}

/// Decode a typed payload record
pub fn decode(mut record: Map<String, Value>) -> TypedMessage {
    let tag = take_i64(&mut record, TYPE_KEY);
    match tag {
        None => TypedMessage::Custom(CustomMessage {
            type_tag: None,
            fields: TypedFields::decode(record),
        }),
        Some(tag) => decode_tagged(tag, record),
    }
}

fn decode_tagged(tag: i64, record: Map<String, Value>) -> TypedMessage {
    match tag {
        TEXT_TAG => TypedMessage::Text(TextMessage::decode(record)),
        IMAGE_TAG => TypedMessage::Image(MediaMessage::decode(record)),
        AUDIO_TAG => TypedMessage::Audio(MediaMessage::decode(record)),
        VIDEO_TAG => TypedMessage::Video(MediaMessage::decode(record)),
        LOCATION_TAG => TypedMessage::Location(LocationMessage::decode(record)),
        FILE_TAG => TypedMessage::File(MediaMessage::decode(record)),
        RECALLED_TAG => TypedMessage::Recalled(RecalledMessage::decode(record)),
        type_tag => TypedMessage::Custom(CustomMessage {
            type_tag: Some(type_tag),
            fields: TypedFields::decode(record),
        }),
    }
}

/// Encode a typed payload record
pub fn encode(message: &TypedMessage) -> Map<String, Value> {
    let mut out = Map::new();
    match message {
        TypedMessage::Text(m) => m.encode(&mut out),
        TypedMessage::Image(m)
        | TypedMessage::Audio(m)
        | TypedMessage::Video(m)
        | TypedMessage::File(m) => m.encode(&mut out),
        TypedMessage::Location(m) => m.encode(&mut out),
        TypedMessage::Recalled(m) => m.encode(&mut out),
        TypedMessage::Custom(m) => m.fields.encode(&mut out),
    }
    if let Some(tag) = message.type_tag() {
        out.insert(TYPE_KEY.to_string(), Value::from(tag));
    }
    out
}

impl TypedFields {
    fn decode(mut record: Map<String, Value>) -> Self {
        let text = take_string(&mut record, TEXT_KEY);
        let attributes = take_object(&mut record, ATTRIBUTES_KEY);
        Self {
            text,
            attributes,
            extra: record,
        }
    }

    fn encode(&self, out: &mut Map<String, Value>) {
        for (key, value) in &self.extra {
            out.insert(key.clone(), value.clone());
        }
        if let Some(text) = &self.text {
            out.insert(TEXT_KEY.to_string(), Value::from(text.as_str()));
        }
        if let Some(attributes) = &self.attributes {
            out.insert(ATTRIBUTES_KEY.to_string(), Value::Object(attributes.clone()));
        }
    }
}

impl TypedVariant for TextMessage {
    fn decode(record: Map<String, Value>) -> Self {
        Self {
            fields: TypedFields::decode(record),
        }
    }

    fn encode(&self, out: &mut Map<String, Value>) {
        self.fields.encode(out);
    }
}

impl TypedVariant for RecalledMessage {
    fn decode(record: Map<String, Value>) -> Self {
        Self {
            fields: TypedFields::decode(record),
        }
    }

    fn encode(&self, out: &mut Map<String, Value>) {
        self.fields.encode(out);
    }
}

impl TypedVariant for MediaMessage {
    fn decode(mut record: Map<String, Value>) -> Self {
        let file = take_object(&mut record, FILE_KEY).map(FileRef::decode);
        Self {
            fields: TypedFields::decode(record),
            file,
            attachment: None,
        }
    }

    fn encode(&self, out: &mut Map<String, Value>) {
        self.fields.encode(out);
        if let Some(file) = &self.file {
            out.insert(FILE_KEY.to_string(), Value::Object(file.encode()));
        }
    }
}

impl TypedVariant for LocationMessage {
    fn decode(mut record: Map<String, Value>) -> Self {
        let location = match record.remove(LOCATION_KEY) {
            Some(value) => match GeoPoint::decode(&value) {
                Some(point) => Some(point),
                None => {
                    record.insert(LOCATION_KEY.to_string(), value);
                    None
                }
            },
            None => None,
        };
        Self {
            fields: TypedFields::decode(record),
            location,
        }
    }

    fn encode(&self, out: &mut Map<String, Value>) {
        self.fields.encode(out);
        if let Some(point) = &self.location {
            let mut loc = Map::new();
            loc.insert("latitude".to_string(), Value::from(point.latitude));
            loc.insert("longitude".to_string(), Value::from(point.longitude));
            out.insert(LOCATION_KEY.to_string(), Value::Object(loc));
        }
    }
}

impl FileRef {
    fn decode(mut record: Map<String, Value>) -> Self {
        Self {
            url: take_string(&mut record, "url"),
            object_id: take_string(&mut record, "objId"),
            metadata: take_object(&mut record, "metaData"),
            extra: record,
        }
    }

    fn encode(&self) -> Map<String, Value> {
        let mut out = self.extra.clone();
        if let Some(url) = &self.url {
            out.insert("url".to_string(), Value::from(url.as_str()));
        }
        if let Some(object_id) = &self.object_id {
            out.insert("objId".to_string(), Value::from(object_id.as_str()));
        }
        if let Some(metadata) = &self.metadata {
            out.insert("metaData".to_string(), Value::Object(metadata.clone()));
        }
        out
    }
}

impl GeoPoint {
    /// Only a plain `{latitude, longitude}` object is a geo-point
    fn decode(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 2 {
            return None;
        }
        Some(Self {
            latitude: object.get("latitude")?.as_f64()?,
            longitude: object.get("longitude")?.as_f64()?,
        })
    }
}

fn take_string(record: &mut Map<String, Value>, key: &str) -> Option<String> {
    match record.remove(key)? {
        Value::String(s) => Some(s),
        other => {
            record.insert(key.to_string(), other);
            None
        }
    }
}

fn take_object(record: &mut Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
    match record.remove(key)? {
        Value::Object(map) => Some(map),
        other => {
            record.insert(key.to_string(), other);
            None
        }
    }
}

fn take_i64(record: &mut Map<String, Value>, key: &str) -> Option<i64> {
    match record.remove(key)? {
        Value::Number(n) if n.is_i64() => n.as_i64(),
        other => {
            record.insert(key.to_string(), other);
            None
        }
    }
}
