//! 内置序列化器：模型引用与二进制缓冲区

use std::collections::HashMap;
use std::sync::Arc;

use super::{AttributeSerializer, Deserialized, SerializerContext};
use crate::error::{WidgetError, WidgetResult};
use crate::model::WidgetModel;
use crate::value::{model_ref_string, parse_model_ref, WidgetValue};

/// 模型引用序列化器
///
/// 递归处理数组和对象：`Model` 叶子写成 `IPY_MODEL_<id>`，
/// 反序列化时通过管理器等待被引用的模型就绪。
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelReferenceSerializer;

impl ModelReferenceSerializer {
    fn pack(value: &WidgetValue) -> WidgetValue {
        match value {
            WidgetValue::Model(model) => WidgetValue::String(model_ref_string(model.id())),
            WidgetValue::Array(items) => WidgetValue::Array(items.iter().map(Self::pack).collect()),
            WidgetValue::Object(map) => WidgetValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::pack(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn collect_refs(value: &WidgetValue, out: &mut Vec<String>) {
        match value {
            WidgetValue::String(s) => {
                if let Some(id) = parse_model_ref(s) {
                    if !out.iter().any(|known| known == id) {
                        out.push(id.to_string());
                    }
                }
            }
            WidgetValue::Array(items) => items.iter().for_each(|v| Self::collect_refs(v, out)),
            WidgetValue::Object(map) => map.values().for_each(|v| Self::collect_refs(v, out)),
            _ => {}
        }
    }

    fn unpack(value: WidgetValue, models: &HashMap<String, Arc<WidgetModel>>) -> WidgetValue {
        match value {
            WidgetValue::String(s) => match parse_model_ref(&s).and_then(|id| models.get(id)) {
                Some(model) => WidgetValue::Model(model.clone()),
                None => WidgetValue::String(s),
            },
            WidgetValue::Array(items) => WidgetValue::Array(
                items.into_iter().map(|v| Self::unpack(v, models)).collect(),
            ),
            WidgetValue::Object(map) => WidgetValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::unpack(v, models)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl AttributeSerializer for ModelReferenceSerializer {
    fn serialize(
        &self,
        value: &WidgetValue,
        _context: &SerializerContext,
    ) -> WidgetResult<WidgetValue> {
        Ok(Self::pack(value))
    }

    fn deserialize(
        &self,
        value: WidgetValue,
        context: &SerializerContext,
    ) -> WidgetResult<Deserialized> {
        let mut ids = Vec::new();
        Self::collect_refs(&value, &mut ids);
        if ids.is_empty() {
            return Ok(Deserialized::Ready(value));
        }

        let manager = context.manager().cloned().ok_or_else(|| {
            WidgetError::deserialization(format!(
                "cannot resolve model reference {} without a manager",
                model_ref_string(&ids[0])
            ))
        })?;

        Ok(Deserialized::Pending(Box::pin(async move {
            let mut models = HashMap::with_capacity(ids.len());
            for id in ids {
                let model = manager.get_model(&id).await.map_err(|e| {
                    WidgetError::deserialization(format!(
                        "cannot resolve model reference {}: {}",
                        model_ref_string(&id),
                        e
                    ))
                })?;
                models.insert(id, model);
            }
            Ok(Self::unpack(value, &models))
        })))
    }
}

/// 二进制缓冲区序列化器
///
/// 接受 `Bytes`、`null`，以及JSON回退时出现的字节数组。
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl BytesSerializer {
    fn coerce(value: WidgetValue) -> WidgetResult<WidgetValue> {
        match value {
            WidgetValue::Bytes(_) | WidgetValue::Null => Ok(value),
            WidgetValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_i64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| WidgetError::deserialization("byte array contains a non-byte element"))
                })
                .collect::<WidgetResult<Vec<u8>>>()
                .map(WidgetValue::Bytes),
            other => Err(WidgetError::deserialization(format!(
                "expected binary buffer, got {:?}",
                other
            ))),
        }
    }
}

impl AttributeSerializer for BytesSerializer {
    fn serialize(
        &self,
        value: &WidgetValue,
        _context: &SerializerContext,
    ) -> WidgetResult<WidgetValue> {
        Self::coerce(value.clone())
    }

    fn deserialize(
        &self,
        value: WidgetValue,
        _context: &SerializerContext,
    ) -> WidgetResult<Deserialized> {
        Self::coerce(value).map(Deserialized::Ready)
    }
}
