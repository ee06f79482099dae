/// Widget属性值类型
///
/// 内存中的属性值是一棵强类型树：除了JSON兼容的标量和容器之外，
/// 还可以直接持有二进制缓冲区和对其他模型的引用。
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::WidgetModel;

/// 模型引用在线上的字符串前缀
pub const MODEL_REF_PREFIX: &str = "IPY_MODEL_";

/// 属性映射（按键有序）
pub type AttributeMap = BTreeMap<String, WidgetValue>;

/// 属性值
#[derive(Clone)]
pub enum WidgetValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<WidgetValue>),
    Object(BTreeMap<String, WidgetValue>),
    /// 原始二进制缓冲区，线上通过buffer_paths带外传输
    Bytes(Vec<u8>),
    /// 对另一个活跃模型的引用
    Model(Arc<WidgetModel>),
}

impl WidgetValue {
    /// 从JSON值转换（不做任何模型引用解析）
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => WidgetValue::Null,
            Value::Bool(b) => WidgetValue::Bool(b),
            Value::Number(n) => WidgetValue::Number(n),
            Value::String(s) => WidgetValue::String(s),
            Value::Array(items) => {
                WidgetValue::Array(items.into_iter().map(WidgetValue::from_json).collect())
            }
            Value::Object(map) => WidgetValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, WidgetValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// 转换为JSON值
    ///
    /// 模型引用写成 `IPY_MODEL_<id>`；二进制缓冲区写成字节数组，
    /// 正常的发送路径会在此之前把缓冲区拆分出去。
    pub fn to_json(&self) -> Value {
        match self {
            WidgetValue::Null => Value::Null,
            WidgetValue::Bool(b) => Value::Bool(*b),
            WidgetValue::Number(n) => Value::Number(n.clone()),
            WidgetValue::String(s) => Value::String(s.clone()),
            WidgetValue::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            WidgetValue::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                Value::Object(out)
            }
            WidgetValue::Bytes(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
            WidgetValue::Model(model) => Value::String(model_ref_string(model.id())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WidgetValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WidgetValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WidgetValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WidgetValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WidgetValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[WidgetValue]> {
        match self {
            WidgetValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WidgetValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&Arc<WidgetModel>> {
        match self {
            WidgetValue::Model(model) => Some(model),
            _ => None,
        }
    }

    /// 是否包含二进制缓冲区（递归）
    pub fn contains_bytes(&self) -> bool {
        match self {
            WidgetValue::Bytes(_) => true,
            WidgetValue::Array(items) => items.iter().any(|v| v.contains_bytes()),
            WidgetValue::Object(map) => map.values().any(|v| v.contains_bytes()),
            _ => false,
        }
    }
}

/// 生成模型引用的线上字符串
pub fn model_ref_string(model_id: &str) -> String {
    format!("{}{}", MODEL_REF_PREFIX, model_id)
}

/// 解析模型引用字符串，返回模型ID
pub fn parse_model_ref(value: &str) -> Option<&str> {
    value
        .strip_prefix(MODEL_REF_PREFIX)
        .filter(|id| !id.is_empty())
}

impl PartialEq for WidgetValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (WidgetValue::Null, WidgetValue::Null) => true,
            (WidgetValue::Bool(a), WidgetValue::Bool(b)) => a == b,
            (WidgetValue::Number(a), WidgetValue::Number(b)) => a == b,
            (WidgetValue::String(a), WidgetValue::String(b)) => a == b,
            (WidgetValue::Array(a), WidgetValue::Array(b)) => a == b,
            (WidgetValue::Object(a), WidgetValue::Object(b)) => a == b,
            (WidgetValue::Bytes(a), WidgetValue::Bytes(b)) => a == b,
            // 模型按身份比较
            (WidgetValue::Model(a), WidgetValue::Model(b)) => {
                Arc::ptr_eq(a, b) || a.id() == b.id()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for WidgetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetValue::Null => write!(f, "Null"),
            WidgetValue::Bool(b) => write!(f, "Bool({})", b),
            WidgetValue::Number(n) => write!(f, "Number({})", n),
            WidgetValue::String(s) => write!(f, "String({:?})", s),
            WidgetValue::Array(items) => f.debug_list().entries(items).finish(),
            WidgetValue::Object(map) => f.debug_map().entries(map).finish(),
            WidgetValue::Bytes(bytes) => write!(f, "Bytes(len={})", bytes.len()),
            WidgetValue::Model(model) => write!(f, "Model({})", model.id()),
        }
    }
}

impl From<Value> for WidgetValue {
    fn from(value: Value) -> Self {
        WidgetValue::from_json(value)
    }
}

impl From<bool> for WidgetValue {
    fn from(value: bool) -> Self {
        WidgetValue::Bool(value)
    }
}

impl From<i64> for WidgetValue {
    fn from(value: i64) -> Self {
        WidgetValue::Number(value.into())
    }
}

impl From<i32> for WidgetValue {
    fn from(value: i32) -> Self {
        WidgetValue::Number(value.into())
    }
}

impl From<f64> for WidgetValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(WidgetValue::Number)
            .unwrap_or(WidgetValue::Null)
    }
}

impl From<&str> for WidgetValue {
    fn from(value: &str) -> Self {
        WidgetValue::String(value.to_string())
    }
}

impl From<String> for WidgetValue {
    fn from(value: String) -> Self {
        WidgetValue::String(value)
    }
}

impl From<Vec<u8>> for WidgetValue {
    fn from(value: Vec<u8>) -> Self {
        WidgetValue::Bytes(value)
    }
}

impl From<Arc<WidgetModel>> for WidgetValue {
    fn from(value: Arc<WidgetModel>) -> Self {
        WidgetValue::Model(value)
    }
}

/// 把JSON对象转换为属性映射
pub fn attributes_from_json(map: Map<String, Value>) -> AttributeMap {
    map.into_iter()
        .map(|(k, v)| (k, WidgetValue::from_json(v)))
        .collect()
}
