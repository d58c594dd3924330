//! Message model as the SDK sees it.
//!
//! Typed messages form a closed set keyed by a numeric type tag; anything the
//! bridge does not recognize is kept as [`CustomMessage`] with its tag.

use std::path::PathBuf;

use serde_json::{Map, Value};

/// Type tag of [`TextMessage`]
pub const TEXT_TAG: i64 = -1;
/// Type tag of image messages
pub const IMAGE_TAG: i64 = -2;
/// Type tag of audio messages
pub const AUDIO_TAG: i64 = -3;
/// Type tag of video messages
pub const VIDEO_TAG: i64 = -4;
/// Type tag of [`LocationMessage`]
pub const LOCATION_TAG: i64 = -5;
/// Type tag of generic file messages
pub const FILE_TAG: i64 = -6;
/// Type tag of [`RecalledMessage`]
pub const RECALLED_TAG: i64 = -127;

/// A message exchanged with the SDK
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub conversation_id: Option<String>,
    pub from: Option<String>,
    /// Server timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub patch_timestamp: Option<i64>,
    pub delivered_timestamp: Option<i64>,
    pub read_timestamp: Option<i64>,
    pub mentioned_members: Option<Vec<String>>,
    pub mention_all: Option<bool>,
    pub transient: Option<bool>,
    pub content: MessageContent,
}

/// Message payload
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MessageContent {
    #[default]
    Empty,
    Text(String),
    Binary(Vec<u8>),
    Typed(TypedMessage),
}

/// Categorized message payloads
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    Text(TextMessage),
    Image(MediaMessage),
    Audio(MediaMessage),
    Video(MediaMessage),
    Location(LocationMessage),
    File(MediaMessage),
    Recalled(RecalledMessage),
    Custom(CustomMessage),
}

/// Fields shared by every typed message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedFields {
    pub text: Option<String>,
    pub attributes: Option<Map<String, Value>>,
    /// Keys the bridge does not interpret, carried through untouched
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMessage {
    pub fields: TypedFields,
}

/// Image, audio, video and generic file messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMessage {
    pub fields: TypedFields,
    /// Already-uploaded file as reported by the SDK
    pub file: Option<FileRef>,
    /// Content the SDK should upload when the message is sent
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationMessage {
    pub fields: TypedFields,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalledMessage {
    pub fields: TypedFields,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomMessage {
    /// `None` when the payload carried no integer `_lctype`
    pub type_tag: Option<i64>,
    pub fields: TypedFields,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Reference to a file stored by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileRef {
    pub url: Option<String>,
    pub object_id: Option<String>,
    /// `name`, `format`, `size`, `width`, `height`, `duration`, ...
    pub metadata: Option<Map<String, Value>>,
    pub extra: Map<String, Value>,
}

/// Where the content of an outgoing file comes from
#[derive(Debug, Clone, PartialEq)]
pub enum FileSource {
    Inline(Vec<u8>),
    Path(PathBuf),
    Url(String),
}

/// File content attached to an outgoing media message
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub source: FileSource,
    pub name: String,
    /// The host supplied the name; the SDK must not rename the file
    pub keep_name: bool,
    pub format: Option<String>,
}

impl TypedMessage {
    /// Numeric type tag of this message, if it has one
    pub fn type_tag(&self) -> Option<i64> {
        match self {
            TypedMessage::Text(_) => Some(TEXT_TAG),
            TypedMessage::Image(_) => Some(IMAGE_TAG),
            TypedMessage::Audio(_) => Some(AUDIO_TAG),
            TypedMessage::Video(_) => Some(VIDEO_TAG),
            TypedMessage::Location(_) => Some(LOCATION_TAG),
            TypedMessage::File(_) => Some(FILE_TAG),
            TypedMessage::Recalled(_) => Some(RECALLED_TAG),
            TypedMessage::Custom(custom) => custom.type_tag,
        }
    }

    pub fn fields(&self) -> &TypedFields {
        match self {
            TypedMessage::Text(m) => &m.fields,
            TypedMessage::Image(m)
            | TypedMessage::Audio(m)
            | TypedMessage::Video(m)
            | TypedMessage::File(m) => &m.fields,
            TypedMessage::Location(m) => &m.fields,
            TypedMessage::Recalled(m) => &m.fields,
            TypedMessage::Custom(m) => &m.fields,
        }
    }

    /// Mutable access to the media part of file-backed messages
    pub fn media_mut(&mut self) -> Option<&mut MediaMessage> {
        match self {
            TypedMessage::Image(m)
            | TypedMessage::Audio(m)
            | TypedMessage::Video(m)
            | TypedMessage::File(m) => Some(m),
            _ => None,
        }
    }
}

impl Message {
    /// Whether the payload is a file-backed typed message
    pub fn is_file_backed(&self) -> bool {
        matches!(
            &self.content,
            MessageContent::Typed(
                TypedMessage::Image(_)
                    | TypedMessage::Audio(_)
                    | TypedMessage::Video(_)
                    | TypedMessage::File(_)
            )
        )
    }
}

impl FileRef {
    pub fn name(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("name").and_then(Value::as_str)
    }
}
