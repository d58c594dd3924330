//! File parameters attached to outgoing media messages.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::sdk::{Attachment, FileSource, Message, MessageContent};

/// Length of generated file names
const GENERATED_NAME_LEN: usize = 16;

/// The `file` parameter of `sendMessage` / `patchMessage`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileParam {
    /// Inline content, base64 on the JSON wire
    #[serde(alias = "inlineBytes", with = "super::base64_bytes")]
    pub data: Option<Vec<u8>>,
    #[serde(alias = "filePath")]
    pub path: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
    pub format: Option<String>,
}

impl FileParam {
    /// Pick the content source: inline bytes, then local path, then url.
    ///
    /// Empty strings count as absent. Returns `None` when no source is usable.
    pub fn resolve(self) -> Option<Attachment> {
        let source = if let Some(bytes) = self.data {
            FileSource::Inline(bytes)
        } else if let Some(path) = non_empty(self.path) {
            FileSource::Path(PathBuf::from(path))
        } else if let Some(url) = non_empty(self.url) {
            FileSource::Url(url)
        } else {
            return None;
        };

        let (name, keep_name) = match non_empty(self.name) {
            Some(name) => (name, true),
            None => (generated_name(), false),
        };

        Some(Attachment {
            source,
            name,
            keep_name,
            format: non_empty(self.format),
        })
    }
}

/// Attach the file to `message` when the message is file-backed
pub fn attach(message: &mut Message, file: FileParam) {
    if !message.is_file_backed() {
        debug!("Ignoring file parameter for a message without file payload");
        return;
    }
    let Some(attachment) = file.resolve() else {
        debug!("Invalid file parameter, no usable source");
        return;
    };
    if let MessageContent::Typed(typed) = &mut message.content {
        if let Some(media) = typed.media_mut() {
            media.attachment = Some(attachment);
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn generated_name() -> String {
    let mut name = uuid::Uuid::new_v4().simple().to_string();
    name.truncate(GENERATED_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{MediaMessage, TypedMessage};
    use serde_json::json;

    fn param(value: serde_json::Value) -> FileParam {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_path_wins_over_url() {
        let attachment = param(json!({"path": "/tmp/a.png", "url": "https://x/a.png"}))
            .resolve()
            .unwrap();
        assert_eq!(attachment.source, FileSource::Path(PathBuf::from("/tmp/a.png")));
    }

    #[test]
    fn test_inline_wins_over_everything() {
        let attachment = param(json!({"data": "AQID", "path": "/tmp/a", "url": "https://x"}))
            .resolve()
            .unwrap();
        assert_eq!(attachment.source, FileSource::Inline(vec![1, 2, 3]));
    }

    #[test]
    fn test_aliases_are_accepted() {
        let attachment = param(json!({"filePath": "/tmp/b", "name": "b.txt", "format": "txt"}))
            .resolve()
            .unwrap();
        assert_eq!(attachment.source, FileSource::Path(PathBuf::from("/tmp/b")));
        assert_eq!(attachment.name, "b.txt");
        assert!(attachment.keep_name);
        assert_eq!(attachment.format.as_deref(), Some("txt"));
    }

    #[test]
    fn test_empty_sources_are_skipped() {
        let attachment = param(json!({"path": "", "url": "https://x/c"})).resolve().unwrap();
        assert_eq!(attachment.source, FileSource::Url("https://x/c".into()));
        assert!(param(json!({"path": "", "name": "n"})).resolve().is_none());
    }

    #[test]
    fn test_missing_name_is_generated() {
        let attachment = param(json!({"url": "https://x/c"})).resolve().unwrap();
        assert_eq!(attachment.name.len(), GENERATED_NAME_LEN);
        assert!(!attachment.keep_name);
    }

    #[test]
    fn test_attach_only_to_file_backed_messages() {
        let mut text = Message {
            content: MessageContent::Text("hi".into()),
            ..Message::default()
        };
        attach(&mut text, param(json!({"url": "https://x"})));
        assert_eq!(text.content, MessageContent::Text("hi".into()));

        let mut image = Message {
            content: MessageContent::Typed(TypedMessage::Image(MediaMessage::default())),
            ..Message::default()
        };
        attach(&mut image, param(json!({"url": "https://x"})));
        match image.content {
            MessageContent::Typed(TypedMessage::Image(media)) => assert!(media.attachment.is_some()),
            other => panic!("unexpected content {other:?}"),
        }
    }
}
