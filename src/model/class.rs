/// 模型类
///
/// 一个模型类描述某种widget的默认属性、属性序列化器和构造后的初始化逻辑。
/// 具体的widget通过组合实现这个trait，而不是继承。
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::WidgetModel;
use crate::error::WidgetResult;
use crate::serializers::{AttributeSerializer, SerializerRegistry};
use crate::value::{AttributeMap, WidgetValue};

/// 类标识：模块名、导出名、模块版本
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassSpec {
    pub module: String,
    pub name: String,
    pub version: String,
}

impl ClassSpec {
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.module, self.version, self.name)
    }
}

/// 模型类trait
pub trait ModelClass: Send + Sync {
    /// 导出名
    fn name(&self) -> &str;

    /// 默认属性，会被初始状态覆盖
    fn defaults(&self) -> AttributeMap {
        AttributeMap::new()
    }

    /// 属性序列化器
    fn serializers(&self) -> &SerializerRegistry;

    /// 模型构造完成、注册到管理器之前调用
    fn initialize(&self, _model: &Arc<WidgetModel>) -> WidgetResult<()> {
        Ok(())
    }
}

/// 只有默认值和序列化器的模型类
#[derive(Clone)]
pub struct BasicModelClass {
    name: String,
    defaults: AttributeMap,
    serializers: SerializerRegistry,
}

impl BasicModelClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: AttributeMap::new(),
            serializers: SerializerRegistry::new(),
        }
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<WidgetValue>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }

    pub fn with_serializer<S>(mut self, attribute: impl Into<String>, serializer: S) -> Self
    where
        S: AttributeSerializer + 'static,
    {
        self.serializers = self.serializers.with(attribute, serializer);
        self
    }

    /// 继承另一个类的默认值和序列化器（本类已有的优先）
    pub fn extending(mut self, base: &BasicModelClass) -> Self {
        for (key, value) in &base.defaults {
            self.defaults
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let mut serializers = base.serializers.clone();
        serializers.extend(&self.serializers);
        self.serializers = serializers;
        self
    }
}

impl ModelClass for BasicModelClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> AttributeMap {
        self.defaults.clone()
    }

    fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }
}

impl fmt::Debug for BasicModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicModelClass")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("serializers", &self.serializers)
            .finish()
    }
}
