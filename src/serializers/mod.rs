// 属性序列化器注册表
//
// 每个属性名可以注册一对转换函数：
// - serialize：内存表示 → 线上表示（同步）
// - deserialize：线上表示 → 内存表示（可以是待定的异步计算）
//
// 没有注册序列化器的属性原样通过。

pub mod builtin;

pub use builtin::{BytesSerializer, ModelReferenceSerializer};

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::WidgetResult;
use crate::manager::WidgetManager;
use crate::value::{AttributeMap, WidgetValue};

/// 反序列化结果：立即可用，或者需要等待的异步计算
pub enum Deserialized {
    Ready(WidgetValue),
    Pending(BoxFuture<'static, WidgetResult<WidgetValue>>),
}

impl fmt::Debug for Deserialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deserialized::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Deserialized::Pending(_) => write!(f, "Pending(..)"),
        }
    }
}

/// 序列化上下文
///
/// 两个方向都会传入；反序列化模型引用时需要通过管理器查找模型。
#[derive(Clone, Default)]
pub struct SerializerContext {
    manager: Option<Arc<WidgetManager>>,
    model_id: Option<String>,
}

impl SerializerContext {
    pub fn new(manager: Option<Arc<WidgetManager>>) -> Self {
        Self {
            manager,
            model_id: None,
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn manager(&self) -> Option<&Arc<WidgetManager>> {
        self.manager.as_ref()
    }

    /// 正在处理的模型ID（构造期间可能为空）
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }
}

/// 属性序列化器
pub trait AttributeSerializer: Send + Sync {
    /// 内存表示 → 线上表示
    fn serialize(&self, value: &WidgetValue, context: &SerializerContext)
        -> WidgetResult<WidgetValue>;

    /// 线上表示 → 内存表示
    fn deserialize(
        &self,
        value: WidgetValue,
        context: &SerializerContext,
    ) -> WidgetResult<Deserialized>;
}

type SerializeFn =
    Arc<dyn Fn(&WidgetValue, &SerializerContext) -> WidgetResult<WidgetValue> + Send + Sync>;
type DeserializeFn =
    Arc<dyn Fn(WidgetValue, &SerializerContext) -> WidgetResult<Deserialized> + Send + Sync>;

/// 由闭包组成的序列化器，未提供的方向原样通过
#[derive(Clone, Default)]
pub struct FnSerializer {
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
}

impl FnSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_serialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&WidgetValue, &SerializerContext) -> WidgetResult<WidgetValue> + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(f));
        self
    }

    pub fn on_deserialize<F>(mut self, f: F) -> Self
    where
        F: Fn(WidgetValue, &SerializerContext) -> WidgetResult<Deserialized> + Send + Sync + 'static,
    {
        self.deserialize = Some(Arc::new(f));
        self
    }
}

impl AttributeSerializer for FnSerializer {
    fn serialize(
        &self,
        value: &WidgetValue,
        context: &SerializerContext,
    ) -> WidgetResult<WidgetValue> {
        match &self.serialize {
            Some(f) => f(value, context),
            None => Ok(value.clone()),
        }
    }

    fn deserialize(
        &self,
        value: WidgetValue,
        context: &SerializerContext,
    ) -> WidgetResult<Deserialized> {
        match &self.deserialize {
            Some(f) => f(value, context),
            None => Ok(Deserialized::Ready(value)),
        }
    }
}

/// 序列化器注册表：属性名 → 序列化器
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn AttributeSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册序列化器（构建器风格）
    pub fn with<S>(mut self, attribute: impl Into<String>, serializer: S) -> Self
    where
        S: AttributeSerializer + 'static,
    {
        self.register(attribute, Arc::new(serializer));
        self
    }

    /// 注册序列化器，覆盖同名属性已有的注册
    pub fn register(&mut self, attribute: impl Into<String>, serializer: Arc<dyn AttributeSerializer>) {
        self.serializers.insert(attribute.into(), serializer);
    }

    /// 合并另一个注册表，另一方优先
    pub fn extend(&mut self, other: &SerializerRegistry) {
        for (name, serializer) in &other.serializers {
            self.serializers.insert(name.clone(), serializer.clone());
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&Arc<dyn AttributeSerializer>> {
        self.serializers.get(attribute)
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.serializers.contains_key(attribute)
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    /// 反序列化整个状态
    ///
    /// 所有待定的属性并发等待；任何一个失败则整体失败，返回第一个错误。
    pub async fn deserialize_state(
        &self,
        state: AttributeMap,
        context: &SerializerContext,
    ) -> WidgetResult<AttributeMap> {
        let mut resolved = AttributeMap::new();
        let mut pending = Vec::new();

        for (key, value) in state {
            let Some(serializer) = self.serializers.get(&key) else {
                resolved.insert(key, value);
                continue;
            };
            match serializer
                .deserialize(value, context)
                .map_err(|e| e.for_attribute(&key))?
            {
                Deserialized::Ready(value) => {
                    resolved.insert(key, value);
                }
                Deserialized::Pending(future) => {
                    pending.push(async move {
                        match future.await {
                            Ok(value) => Ok((key, value)),
                            Err(e) => Err(e.for_attribute(&key)),
                        }
                    });
                }
            }
        }

        if !pending.is_empty() {
            log::trace!("等待 {} 个异步反序列化属性", pending.len());
            for (key, value) in futures::future::try_join_all(pending).await? {
                resolved.insert(key, value);
            }
        }

        Ok(resolved)
    }

    /// 序列化整个状态
    pub fn serialize_state(
        &self,
        state: &AttributeMap,
        context: &SerializerContext,
    ) -> WidgetResult<AttributeMap> {
        let mut out = AttributeMap::new();
        for (key, value) in state {
            out.insert(key.clone(), self.serialize_value(key, value, context)?);
        }
        Ok(out)
    }

    /// 序列化单个属性
    pub fn serialize_value(
        &self,
        attribute: &str,
        value: &WidgetValue,
        context: &SerializerContext,
    ) -> WidgetResult<WidgetValue> {
        match self.serializers.get(attribute) {
            Some(serializer) => serializer
                .serialize(value, context)
                .map_err(|e| e.for_attribute(attribute)),
            None => Ok(value.clone()),
        }
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.serializers.keys().collect();
        names.sort();
        f.debug_struct("SerializerRegistry")
            .field("attributes", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, WidgetError};

    fn scaled_registry() -> SerializerRegistry {
        SerializerRegistry::new()
            .with(
                "a",
                FnSerializer::new().on_deserialize(|value, _| {
                    let v = value.as_f64().unwrap_or_default();
                    Ok(Deserialized::Ready(WidgetValue::from(v * 3.0)))
                }),
            )
            .with(
                "b",
                FnSerializer::new().on_deserialize(|value, _| {
                    let v = value.as_f64().unwrap_or_default();
                    Ok(Deserialized::Pending(Box::pin(async move {
                        tokio::task::yield_now().await;
                        Ok(WidgetValue::from(v / 2.0))
                    })))
                }),
            )
    }

    #[tokio::test]
    async fn test_deserialize_state_mixes_sync_and_async() {
        let mut state = AttributeMap::new();
        state.insert("a".to_string(), WidgetValue::from(2.0));
        state.insert("b".to_string(), WidgetValue::from(2.0));
        state.insert("c".to_string(), WidgetValue::from(2.0));

        let resolved = scaled_registry()
            .deserialize_state(state, &SerializerContext::default())
            .await
            .unwrap();

        assert_eq!(resolved["a"].as_f64(), Some(6.0));
        assert_eq!(resolved["b"].as_f64(), Some(1.0));
        assert_eq!(resolved["c"].as_f64(), Some(2.0));
    }

    #[tokio::test]
    async fn test_async_rejection_names_the_attribute() {
        let registry = SerializerRegistry::new().with(
            "broken",
            FnSerializer::new().on_deserialize(|_, _| {
                Ok(Deserialized::Pending(Box::pin(async {
                    Err(WidgetError::deserialization("nope"))
                })))
            }),
        );
        let mut state = AttributeMap::new();
        state.insert("broken".to_string(), WidgetValue::Null);

        let err = registry
            .deserialize_state(state, &SerializerContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deserialization);
        assert!(err.to_string().contains("'broken'"));
    }

    #[test]
    fn test_serialize_state_passes_unregistered_keys() {
        let registry = SerializerRegistry::new().with(
            "x",
            FnSerializer::new().on_serialize(|_, _| Ok(WidgetValue::from("packed"))),
        );
        let mut state = AttributeMap::new();
        state.insert("x".to_string(), WidgetValue::from(1));
        state.insert("y".to_string(), WidgetValue::from(2));

        let out = registry
            .serialize_state(&state, &SerializerContext::default())
            .unwrap();
        assert_eq!(out["x"].as_str(), Some("packed"));
        assert_eq!(out["y"].as_i64(), Some(2));
    }

    #[test]
    fn test_serializer_sees_owning_model_id() {
        let registry = SerializerRegistry::new().with(
            "owner",
            FnSerializer::new().on_serialize(|_, context| {
                Ok(WidgetValue::from(context.model_id().unwrap_or("none")))
            }),
        );
        let mut state = AttributeMap::new();
        state.insert("owner".to_string(), WidgetValue::Null);

        let context = SerializerContext::default().with_model_id("m7");
        let out = registry.serialize_state(&state, &context).unwrap();
        assert_eq!(out["owner"].as_str(), Some("m7"));

        let failing = SerializerRegistry::new().with(
            "bad",
            FnSerializer::new()
                .on_serialize(|_, _| Err(WidgetError::deserialization("cannot pack"))),
        );
        let mut state = AttributeMap::new();
        state.insert("bad".to_string(), WidgetValue::Null);
        let err = failing.serialize_state(&state, &context).unwrap_err();
        assert!(err.to_string().contains("'bad'"));
    }
}
