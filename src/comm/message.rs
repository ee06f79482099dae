/// Comm消息格式
///
/// 线上格式是一个JSON信封加可选的带外二进制缓冲区：
/// - open:    { state: {...}, buffer_paths?: [...] }
/// - update:  { method: "update", state: {...}, buffer_paths?: [...] }
/// - custom:  { method: "custom", content: <任意> }
/// - display: { method: "display" }
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{WidgetError, WidgetResult};

/// 缓冲区路径的一段：对象键或数组下标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// 指向state内部某个值的路径
pub type BufferPath = Vec<PathSegment>;

/// 原始comm消息（传输层看到的信封）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommMessage {
    pub data: Value,
    pub metadata: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl CommMessage {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: Value::Null,
            buffers: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// 消息中的method字段（如果有）
    pub fn method(&self) -> Option<&str> {
        self.data.get("method").and_then(Value::as_str)
    }
}

/// 序列化后的状态：JSON部分加上拆分出去的二进制缓冲区
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerializedState {
    pub state: Map<String, Value>,
    pub buffer_paths: Vec<BufferPath>,
    pub buffers: Vec<Vec<u8>>,
}

impl SerializedState {
    pub fn new(state: Map<String, Value>) -> Self {
        Self {
            state,
            buffer_paths: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.buffers.is_empty()
    }

    /// 从信封的data对象和消息缓冲区中提取状态
    fn from_envelope(data: &Map<String, Value>, buffers: Vec<Vec<u8>>) -> WidgetResult<Self> {
        let state = match data.get("state") {
            Some(Value::Object(state)) => state.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(WidgetError::deserialization(format!(
                    "state must be an object, got {}",
                    json_type_name(other)
                )))
            }
        };
        let buffer_paths = match data.get("buffer_paths") {
            Some(Value::Null) | None => Vec::new(),
            Some(paths) => serde_json::from_value::<Vec<BufferPath>>(paths.clone())?,
        };
        Ok(Self {
            state,
            buffer_paths,
            buffers,
        })
    }

    fn write_envelope(self, data: &mut Map<String, Value>) -> Vec<Vec<u8>> {
        data.insert("state".to_string(), Value::Object(self.state));
        if !self.buffer_paths.is_empty() {
            data.insert("buffer_paths".to_string(), json!(self.buffer_paths));
        }
        self.buffers
    }
}

/// 解析后的widget协议消息
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetMessage {
    /// 状态更新
    Update(SerializedState),
    /// 对端对本地发送的显式确认
    EchoUpdate(SerializedState),
    /// 自定义消息，原样转发给监听者
    Custom {
        content: Value,
        buffers: Vec<Vec<u8>>,
    },
    /// 请求显示默认视图
    Display,
    /// 对端请求完整状态
    RequestState,
    /// 未识别的方法
    Unknown { method: String },
}

impl WidgetMessage {
    /// 解析comm消息
    pub fn parse(message: CommMessage) -> WidgetResult<Self> {
        let CommMessage { data, buffers, .. } = message;
        let data = match data {
            Value::Object(map) => map,
            other => {
                return Err(WidgetError::deserialization(format!(
                    "comm message data must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| WidgetError::deserialization("comm message has no method"))?;

        match method {
            "update" => Ok(WidgetMessage::Update(SerializedState::from_envelope(
                &data, buffers,
            )?)),
            "echo_update" => Ok(WidgetMessage::EchoUpdate(SerializedState::from_envelope(
                &data, buffers,
            )?)),
            "custom" => Ok(WidgetMessage::Custom {
                content: data.get("content").cloned().unwrap_or(Value::Null),
                buffers,
            }),
            "display" => Ok(WidgetMessage::Display),
            "request_state" => Ok(WidgetMessage::RequestState),
            other => Ok(WidgetMessage::Unknown {
                method: other.to_string(),
            }),
        }
    }

    /// 方法名
    pub fn method(&self) -> &str {
        match self {
            WidgetMessage::Update(_) => "update",
            WidgetMessage::EchoUpdate(_) => "echo_update",
            WidgetMessage::Custom { .. } => "custom",
            WidgetMessage::Display => "display",
            WidgetMessage::RequestState => "request_state",
            WidgetMessage::Unknown { method } => method,
        }
    }

    /// 编码为comm消息
    pub fn into_comm_message(self) -> CommMessage {
        let mut data = Map::new();
        data.insert("method".to_string(), Value::String(self.method().to_string()));
        let buffers = match self {
            WidgetMessage::Update(state) | WidgetMessage::EchoUpdate(state) => {
                state.write_envelope(&mut data)
            }
            WidgetMessage::Custom { content, buffers } => {
                data.insert("content".to_string(), content);
                buffers
            }
            WidgetMessage::Display | WidgetMessage::RequestState | WidgetMessage::Unknown { .. } => {
                Vec::new()
            }
        };
        CommMessage::new(Value::Object(data)).with_buffers(buffers)
    }
}

/// comm打开消息
#[derive(Debug, Clone, PartialEq)]
pub struct OpenMessage {
    pub state: SerializedState,
    /// metadata.version 中携带的协议版本
    pub protocol_version: Option<String>,
}

impl OpenMessage {
    pub fn new(state: SerializedState, protocol_version: impl Into<String>) -> Self {
        Self {
            state,
            protocol_version: Some(protocol_version.into()),
        }
    }

    /// 解析comm打开消息
    pub fn parse(message: CommMessage) -> WidgetResult<Self> {
        let CommMessage {
            data,
            metadata,
            buffers,
        } = message;
        let data = match data {
            Value::Object(map) => map,
            other => {
                return Err(WidgetError::deserialization(format!(
                    "comm open data must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        let state = SerializedState::from_envelope(&data, buffers)?;
        let protocol_version = metadata
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            state,
            protocol_version,
        })
    }

    /// 读取state中的必需字符串字段（如 `_model_name`）
    pub fn required_field(&self, key: &str) -> WidgetResult<&str> {
        self.state
            .state
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WidgetError::attribute_deserialization(key, "missing from comm open state")
            })
    }

    pub fn model_name(&self) -> WidgetResult<&str> {
        self.required_field("_model_name")
    }

    pub fn model_module(&self) -> WidgetResult<&str> {
        self.required_field("_model_module")
    }

    /// 模型模块版本，缺失时视为任意版本
    pub fn model_module_version(&self) -> &str {
        self.state
            .state
            .get("_model_module_version")
            .and_then(Value::as_str)
            .unwrap_or("*")
    }

    pub fn into_comm_message(self) -> CommMessage {
        let mut data = Map::new();
        let buffers = self.state.write_envelope(&mut data);
        let metadata = match self.protocol_version {
            Some(version) => json!({ "version": version }),
            None => Value::Null,
        };
        CommMessage::new(Value::Object(data))
            .with_metadata(metadata)
            .with_buffers(buffers)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
