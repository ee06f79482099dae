// Widget错误处理系统
//
// 本文件定义了widget同步框架的统一错误类型：
// - WidgetError：统一的错误类型
// - ErrorKind：错误分类，便于嵌入环境按类型处理
// - ClassNotFoundReason：区分模块缺失与导出缺失
//
// 每个错误都携带足够的上下文（模型ID、属性名、模块名等）以及可选的源错误链。

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Widget统一错误类型
#[derive(Error, Debug)]
pub enum WidgetError {
    /// 类解析失败
    ///
    /// 内置注册表和动态加载器都无法提供请求的模型/视图类
    #[error("Class {class} not found in module {module}@{version}: {reason}")]
    ClassNotFound {
        module: String,
        class: String,
        version: String,
        reason: ClassNotFoundReason,
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// 反序列化错误
    ///
    /// 某个已注册的反序列化器拒绝了输入，或线上消息格式不正确
    #[error("Deserialization failed{}: {message}", attribute_suffix(.attribute))]
    Deserialization {
        attribute: Option<String>,
        message: String,
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// 查找失败
    ///
    /// 未知的模型ID、未设置的属性等
    #[error("{what} not found: {key}")]
    NotFound { what: NotFoundKind, key: String },

    /// 模型已关闭
    #[error("Model {model_id} is closed (operation: {operation})")]
    Closed { model_id: String, operation: String },

    /// 传输错误
    ///
    /// comm发送/打开失败，由嵌入环境报告
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        comm_id: Option<String>,
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

fn attribute_suffix(attribute: &Option<String>) -> String {
    match attribute {
        Some(name) => format!(" for attribute '{}'", name),
        None => String::new(),
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClassNotFound,
    Deserialization,
    NotFound,
    Closed,
    Transport,
}

/// 类解析失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassNotFoundReason {
    /// 没有配置动态加载器，且内置注册表中没有该模块
    NoLoader,
    /// 动态加载器找不到模块
    ModuleNotFound,
    /// 模块已加载，但不包含请求的导出
    ExportNotFound,
    /// 导出存在，但类型不符（例如请求模型却得到视图）
    WrongClassKind,
}

impl fmt::Display for ClassNotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassNotFoundReason::NoLoader => write!(f, "no dynamic loader configured"),
            ClassNotFoundReason::ModuleNotFound => write!(f, "module could not be loaded"),
            ClassNotFoundReason::ExportNotFound => write!(f, "module has no such export"),
            ClassNotFoundReason::WrongClassKind => write!(f, "export has the wrong class kind"),
        }
    }
}

/// 查找失败的对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Model,
    Attribute,
    View,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundKind::Model => write!(f, "Model"),
            NotFoundKind::Attribute => write!(f, "Attribute"),
            NotFoundKind::View => write!(f, "View"),
        }
    }
}

/// Widget结果类型别名
pub type WidgetResult<T> = Result<T, WidgetError>;

impl WidgetError {
    /// 创建类解析错误
    pub fn class_not_found(
        module: impl Into<String>,
        class: impl Into<String>,
        version: impl Into<String>,
        reason: ClassNotFoundReason,
    ) -> Self {
        WidgetError::ClassNotFound {
            module: module.into(),
            class: class.into(),
            version: version.into(),
            reason,
            source: None,
        }
    }

    /// 创建带源错误的类解析错误
    pub fn class_not_found_with_source(
        module: impl Into<String>,
        class: impl Into<String>,
        version: impl Into<String>,
        reason: ClassNotFoundReason,
        source: Box<dyn StdError + Send + Sync>,
    ) -> Self {
        WidgetError::ClassNotFound {
            module: module.into(),
            class: class.into(),
            version: version.into(),
            reason,
            source: Some(source),
        }
    }

    /// 创建反序列化错误
    pub fn deserialization(message: impl Into<String>) -> Self {
        WidgetError::Deserialization {
            attribute: None,
            message: message.into(),
            source: None,
        }
    }

    /// 创建指定属性的反序列化错误
    pub fn attribute_deserialization(
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        WidgetError::Deserialization {
            attribute: Some(attribute.into()),
            message: message.into(),
            source: None,
        }
    }

    /// 创建模型查找错误
    pub fn model_not_found(model_id: impl Into<String>) -> Self {
        WidgetError::NotFound {
            what: NotFoundKind::Model,
            key: model_id.into(),
        }
    }

    /// 创建属性查找错误
    pub fn attribute_not_found(name: impl Into<String>) -> Self {
        WidgetError::NotFound {
            what: NotFoundKind::Attribute,
            key: name.into(),
        }
    }

    /// 创建视图查找错误
    pub fn view_not_found(view_id: impl Into<String>) -> Self {
        WidgetError::NotFound {
            what: NotFoundKind::View,
            key: view_id.into(),
        }
    }

    /// 创建模型已关闭错误
    pub fn closed(model_id: impl Into<String>, operation: impl Into<String>) -> Self {
        WidgetError::Closed {
            model_id: model_id.into(),
            operation: operation.into(),
        }
    }

    /// 创建传输错误
    pub fn transport(message: impl Into<String>, comm_id: Option<String>) -> Self {
        WidgetError::Transport {
            message: message.into(),
            comm_id,
            source: None,
        }
    }

    /// 创建带源错误的传输错误
    pub fn transport_with_source(
        message: impl Into<String>,
        comm_id: Option<String>,
        source: Box<dyn StdError + Send + Sync>,
    ) -> Self {
        WidgetError::Transport {
            message: message.into(),
            comm_id,
            source: Some(source),
        }
    }

    /// 为反序列化错误补充属性名（已有属性名时保持不变）
    pub fn for_attribute(self, name: &str) -> Self {
        match self {
            WidgetError::Deserialization {
                attribute: None,
                message,
                source,
            } => WidgetError::Deserialization {
                attribute: Some(name.to_string()),
                message,
                source,
            },
            other => other,
        }
    }

    /// 获取错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            WidgetError::ClassNotFound { .. } => ErrorKind::ClassNotFound,
            WidgetError::Deserialization { .. } => ErrorKind::Deserialization,
            WidgetError::NotFound { .. } => ErrorKind::NotFound,
            WidgetError::Closed { .. } => ErrorKind::Closed,
            WidgetError::Transport { .. } => ErrorKind::Transport,
        }
    }

    /// 获取源错误
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            WidgetError::ClassNotFound { source, .. }
            | WidgetError::Deserialization { source, .. }
            | WidgetError::Transport { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// 错误链（从本错误开始，逐层展开源错误）
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current: Option<&(dyn StdError + 'static)> =
            self.cause().map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

impl From<serde_json::Error> for WidgetError {
    fn from(err: serde_json::Error) -> Self {
        WidgetError::Deserialization {
            attribute: None,
            message: format!("JSON error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_not_found_message_names_module_and_class() {
        let err = WidgetError::class_not_found(
            "foo-widgets",
            "FooModel",
            "1.0.0",
            ClassNotFoundReason::NoLoader,
        );
        let text = err.to_string();
        assert!(text.contains("foo-widgets"));
        assert!(text.contains("FooModel"));
        assert_eq!(err.kind(), ErrorKind::ClassNotFound);
    }

    #[test]
    fn test_for_attribute_fills_missing_name() {
        let err = WidgetError::deserialization("bad value").for_attribute("value");
        match err {
            WidgetError::Deserialization { attribute, .. } => {
                assert_eq!(attribute.as_deref(), Some("value"));
            }
            _ => panic!("Expected Deserialization"),
        }

        let err = WidgetError::attribute_deserialization("a", "x").for_attribute("b");
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_error_chain_includes_source() {
        let io_error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = WidgetError::transport_with_source(
            "send failed",
            Some("comm-1".to_string()),
            Box::new(io_error),
        );
        let chain = err.chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[1].contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: WidgetError = json_error.into();
        assert_eq!(err.kind(), ErrorKind::Deserialization);
    }
}
