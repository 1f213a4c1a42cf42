use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

impl GenerateContentRequest {
    pub fn new(parts: Vec<Part>, system_instruction: Option<&str>) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: system_instruction.map(|text| Content {
                role: String::new(),
                parts: vec![Part::text(text)],
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(rename = "fileData", skip_serializing_if = "Option::is_none", default)]
    pub file_data: Option<FileData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            file_data: None,
        }
    }

    pub fn file(mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            text: None,
            file_data: Some(FileData {
                mime_type: mime_type.into(),
                file_uri: uri.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "fileUri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Content,
}

impl GenerateContentResponse {
    /// 拼接首个候选的全部文本片段；无候选时为空串。
    pub fn text(&self) -> String {
        let Some(first) = self.candidates.first() else {
            return String::new();
        };
        first
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

/// Files API 返回的文件元数据。上传后 state 经历 PROCESSING → ACTIVE/FAILED。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
}

impl FileInfo {
    pub fn is_processing(&self) -> bool {
        self.state == "PROCESSING"
    }

    pub fn is_active(&self) -> bool {
        self.state == "ACTIVE"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub file: FileInfo,
}
