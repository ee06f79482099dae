// 管理器配置
//
// 支持默认值、构建器风格的 with_* 方法，以及从JSON文件加载。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub const DEFAULT_CDN: &str = "https://cdn.jsdelivr.net/npm/";

/// Widget管理器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// comm目标名称
    pub comm_target_name: String,
    /// 本端使用的协议版本
    pub protocol_version: String,
    /// 第三方模块的CDN根地址
    pub cdn_base: String,
    /// 指定模块的完整URL，优先于CDN规则
    pub module_cdn: HashMap<String, String>,
    /// 只从CDN加载，跳过本地加载尝试
    pub only_cdn: bool,
    pub log_level: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            comm_target_name: "jupyter.widget".to_string(),
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            cdn_base: DEFAULT_CDN.to_string(),
            module_cdn: HashMap::new(),
            only_cdn: false,
            log_level: "info".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从JSON文件加载，缺失的字段使用默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        log::info!("加载配置: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.comm_target_name.is_empty() {
            return Err(ConfigError::Invalid("comm_target_name is empty".to_string()));
        }
        if protocol_major(&self.protocol_version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "protocol_version '{}' has no major version",
                self.protocol_version
            )));
        }
        Url::parse(&self.cdn_base)?;
        Ok(())
    }

    pub fn with_comm_target_name(mut self, name: impl Into<String>) -> Self {
        self.comm_target_name = name.into();
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_cdn_base(mut self, cdn: impl Into<String>) -> Self {
        self.cdn_base = cdn.into();
        self
    }

    pub fn with_module_cdn(mut self, module: impl Into<String>, url: impl Into<String>) -> Self {
        self.module_cdn.insert(module.into(), url.into());
        self
    }

    pub fn with_only_cdn(mut self, only_cdn: bool) -> Self {
        self.only_cdn = only_cdn;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// 计算动态加载器应该获取的模块地址
    ///
    /// `foo/bar` → `<cdn>foo@<version>/dist/bar`，
    /// `@scope/pkg/sub` → `<cdn>@scope/pkg@<version>/dist/sub`，
    /// 没有子路径时文件名为 `index`。
    pub fn module_url(&self, module: &str, version: &str) -> Result<Url, ConfigError> {
        if let Some(url) = self.module_cdn.get(module) {
            return Ok(Url::parse(url)?);
        }

        let (package, file) = split_module_name(module);
        let mut base = self.cdn_base.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;
        Ok(base.join(&format!("{}@{}/dist/{}", package, version, file))?)
    }

    /// 对端协议版本与本端主版本不一致时返回false
    pub fn is_compatible_protocol(&self, version: &str) -> bool {
        protocol_major(version) == protocol_major(&self.protocol_version)
    }
}

fn split_module_name(module: &str) -> (&str, &str) {
    let first = module.find('/');
    let split = match first {
        Some(index) if module.starts_with('@') => module[index + 1..]
            .find('/')
            .map(|second| index + 1 + second),
        other => other,
    };
    match split {
        Some(index) => (&module[..index], &module[index + 1..]),
        None => (module, "index"),
    }
}

/// 解析主版本号
pub fn protocol_major(version: &str) -> Option<u64> {
    version.split('.').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_url_rules() {
        let config = ManagerConfig::default();
        assert_eq!(
            config.module_url("foo/bar", "1.0.0").unwrap().as_str(),
            "https://cdn.jsdelivr.net/npm/foo@1.0.0/dist/bar"
        );
        assert_eq!(
            config.module_url("foo-widgets", "1.0.0").unwrap().as_str(),
            "https://cdn.jsdelivr.net/npm/foo-widgets@1.0.0/dist/index"
        );
        assert_eq!(
            config.module_url("@scope/pkg/sub", "2.1.0").unwrap().as_str(),
            "https://cdn.jsdelivr.net/npm/@scope/pkg@2.1.0/dist/sub"
        );
        assert_eq!(
            config.module_url("@scope/pkg", "2.1.0").unwrap().as_str(),
            "https://cdn.jsdelivr.net/npm/@scope/pkg@2.1.0/dist/index"
        );
    }

    #[test]
    fn test_module_cdn_override_wins() {
        let config = ManagerConfig::default()
            .with_module_cdn("foo", "https://example.com/foo.js")
            .with_cdn_base("https://unpkg.com");
        assert_eq!(
            config.module_url("foo", "1").unwrap().as_str(),
            "https://example.com/foo.js"
        );
        assert_eq!(
            config.module_url("bar", "1").unwrap().as_str(),
            "https://unpkg.com/bar@1/dist/index"
        );
    }

    #[test]
    fn test_json_loading_uses_defaults() {
        let config = ManagerConfig::from_json_str(r#"{"only_cdn": true}"#).unwrap();
        assert!(config.only_cdn);
        assert_eq!(config.comm_target_name, "jupyter.widget");
        assert!(ManagerConfig::from_json_str(r#"{"cdn_base": "not a url"}"#).is_err());
        assert!(ManagerConfig::from_json_str(r#"{"protocol_version": "x"}"#).is_err());
    }

    #[test]
    fn test_protocol_compatibility() {
        let config = ManagerConfig::default();
        assert!(config.is_compatible_protocol("2.0.0"));
        assert!(!config.is_compatible_protocol("1.0.0"));
        assert_eq!(protocol_major("2.1.0"), Some(2));
    }
}
