use serde::{Deserialize, Serialize};

/// Reference to a binary image payload carried by a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl ImageSource {
    pub fn base64<M: Into<String>, D: Into<String>>(media_type: M, data: D) -> Self {
        ImageSource::Base64 {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn url<U: Into<String>>(url: U) -> Self {
        ImageSource::Url { url: url.into() }
    }

    /// Render as a data: URI (or pass the URL through) for backends that only
    /// accept `image_url` content.
    pub fn to_data_uri(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => {
                format!("data:{media_type};base64,{data}")
            }
            ImageSource::Url { url } => url.clone(),
        }
    }
}
