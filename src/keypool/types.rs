use crate::logging;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 单个 API Key 的持久化记录。
///
/// usage / exhausted 按模型惰性初始化：缺失条目按 0 / false 处理。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    #[serde(default)]
    pub usage: HashMap<String, u32>,
    #[serde(default)]
    pub exhausted: HashMap<String, bool>,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            usage: HashMap::new(),
            exhausted: HashMap::new(),
        }
    }

    pub fn usage_for(&self, model: &str) -> u32 {
        self.usage.get(model).copied().unwrap_or(0)
    }

    pub fn is_exhausted(&self, model: &str) -> bool {
        self.exhausted.get(model).copied().unwrap_or(false)
    }

    /// 脱敏后的 key 标识，用于日志与状态报告。
    pub fn masked(&self) -> String {
        logging::mask_key(&self.key)
    }
}

/// api_keys.json 的文件格式。文件不存在时按空池处理。
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PoolFile {
    #[serde(default)]
    pub last_reset_date: String,
    #[serde(default)]
    pub keys: Vec<KeyRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_defaults_for_unknown_model() {
        let rec = KeyRecord::new("AIzaSyEXAMPLE1234");
        assert_eq!(rec.usage_for("gemini-2.5-flash"), 0);
        assert!(!rec.is_exhausted("gemini-2.5-flash"));
    }

    #[test]
    fn masked_never_contains_full_secret() {
        let rec = KeyRecord::new("AIzaSySECRETSECRET");
        assert!(!rec.masked().contains("SECRETSECRET"));
    }

    #[test]
    fn pool_file_tolerates_missing_fields() {
        let raw = r#"{"keys":[{"key":"AIzaSyEXAMPLE1234"}]}"#;
        let f: PoolFile = sonic_rs::from_str(raw).unwrap();
        assert_eq!(f.last_reset_date, "");
        assert_eq!(f.keys.len(), 1);
        assert!(f.keys[0].usage.is_empty());
    }
}
