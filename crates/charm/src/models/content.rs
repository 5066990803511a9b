use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
/// Content passed to or from an LLM, or returned by a tool
pub enum Content {
    Text(TextContent),
    Image(ImageContent),
}

impl Content {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Content::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        Content::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// A plain-text rendering, used wherever only text can be carried
    pub fn summary(&self) -> String {
        match self {
            Content::Text(text) => text.text.clone(),
            Content::Image(image) => format!("[image: {}]", image.mime_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_serializes_with_type_tag() {
        let content = Content::image("aGVsbG8=", "image/png");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(
            value,
            json!({"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"})
        );
        assert_eq!(content.summary(), "[image: image/png]");
        assert!(content.as_text().is_none());
    }
}
