/// 二进制缓冲区的拆分与重组
///
/// 发送前把状态树中的 `Bytes` 叶子拆分为带外缓冲区并记录路径；
/// 接收后按路径把缓冲区放回状态树，再交给反序列化器。
use serde_json::{Map, Value};

use super::message::{BufferPath, PathSegment, SerializedState};
use crate::error::{WidgetError, WidgetResult};
use crate::value::{AttributeMap, WidgetValue};

/// 拆分缓冲区
///
/// 对象中的缓冲区键从JSON中删除，数组中的缓冲区位置置为null。
pub fn remove_buffers(state: &AttributeMap) -> SerializedState {
    let mut buffer_paths = Vec::new();
    let mut buffers = Vec::new();
    let mut json_state = Map::new();
    let mut path = Vec::new();

    for (key, value) in state {
        path.push(PathSegment::Key(key.clone()));
        if let Some(json) = split_value(value, &mut path, &mut buffer_paths, &mut buffers) {
            json_state.insert(key.clone(), json);
        }
        path.pop();
    }

    SerializedState {
        state: json_state,
        buffer_paths,
        buffers,
    }
}

/// 返回None表示该值本身就是缓冲区
fn split_value(
    value: &WidgetValue,
    path: &mut BufferPath,
    buffer_paths: &mut Vec<BufferPath>,
    buffers: &mut Vec<Vec<u8>>,
) -> Option<Value> {
    match value {
        WidgetValue::Bytes(bytes) => {
            buffer_paths.push(path.clone());
            buffers.push(bytes.clone());
            None
        }
        WidgetValue::Array(items) if items.iter().any(|v| v.contains_bytes()) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                out.push(split_value(item, path, buffer_paths, buffers).unwrap_or(Value::Null));
                path.pop();
            }
            Some(Value::Array(out))
        }
        WidgetValue::Object(map) if map.values().any(|v| v.contains_bytes()) => {
            let mut out = Map::new();
            for (key, item) in map {
                path.push(PathSegment::Key(key.clone()));
                if let Some(json) = split_value(item, path, buffer_paths, buffers) {
                    out.insert(key.clone(), json);
                }
                path.pop();
            }
            Some(Value::Object(out))
        }
        other => Some(other.to_json()),
    }
}

/// 重组缓冲区，得到内存中的属性映射（尚未经过反序列化器）
pub fn put_buffers(serialized: SerializedState) -> WidgetResult<AttributeMap> {
    let SerializedState {
        state,
        buffer_paths,
        buffers,
    } = serialized;

    if buffer_paths.len() != buffers.len() {
        return Err(WidgetError::deserialization(format!(
            "{} buffer paths but {} buffers",
            buffer_paths.len(),
            buffers.len()
        )));
    }

    let mut root = WidgetValue::Object(
        state
            .into_iter()
            .map(|(k, v)| (k, WidgetValue::from_json(v)))
            .collect(),
    );

    for (path, buffer) in buffer_paths.into_iter().zip(buffers) {
        insert_at(&mut root, &path, WidgetValue::Bytes(buffer))?;
    }

    match root {
        WidgetValue::Object(map) => Ok(map),
        _ => Err(WidgetError::deserialization("state root is not an object")),
    }
}

fn insert_at(root: &mut WidgetValue, path: &[PathSegment], leaf: WidgetValue) -> WidgetResult<()> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| WidgetError::deserialization("empty buffer path"))?;

    let mut current = root;
    for segment in parents {
        current = match (current, segment) {
            (WidgetValue::Object(map), PathSegment::Key(key)) => map
                .get_mut(key)
                .ok_or_else(|| invalid_path(path, "missing key"))?,
            (WidgetValue::Array(items), PathSegment::Index(index)) => items
                .get_mut(*index)
                .ok_or_else(|| invalid_path(path, "index out of range"))?,
            _ => return Err(invalid_path(path, "segment does not match container type")),
        };
    }

    match (current, last) {
        (WidgetValue::Object(map), PathSegment::Key(key)) => {
            map.insert(key.clone(), leaf);
            Ok(())
        }
        (WidgetValue::Array(items), PathSegment::Index(index)) => {
            if *index < items.len() {
                items[*index] = leaf;
                Ok(())
            } else if *index == items.len() {
                items.push(leaf);
                Ok(())
            } else {
                Err(invalid_path(path, "index out of range"))
            }
        }
        _ => Err(invalid_path(path, "segment does not match container type")),
    }
}

fn invalid_path(path: &[PathSegment], reason: &str) -> WidgetError {
    WidgetError::deserialization(format!("invalid buffer path {:?}: {}", path, reason))
}
