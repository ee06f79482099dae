/// 管理器状态快照
///
/// 快照格式：
/// ```json
/// { "version_major": 2, "version_minor": 0,
///   "state": { "<id>": { "model_name": ..., "model_module": ..., "model_module_version": ...,
///                        "state": {...}, "buffers": [{"path": [...], "encoding": "base64", "data": "..."}] } } }
/// ```
/// 导入时所有ID先占位再并发构造，模型之间的引用与导入顺序无关。
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Claim, ModelOptions, WidgetManager};
use crate::comm::{put_buffers, BufferPath, SerializedState};
use crate::error::{WidgetError, WidgetResult};
use crate::model::WidgetModel;

pub const SNAPSHOT_VERSION_MAJOR: u32 = 2;
pub const SNAPSHOT_VERSION_MINOR: u32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub version_major: u32,
    pub version_minor: u32,
    pub state: BTreeMap<String, ModelSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_name: String,
    pub model_module: String,
    pub model_module_version: String,
    pub state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<BufferSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub path: BufferPath,
    pub encoding: String,
    pub data: String,
}

impl ModelSnapshot {
    fn from_model(model: &WidgetModel) -> WidgetResult<Self> {
        let serialized = model.export_state()?;
        let buffers = serialized
            .buffer_paths
            .into_iter()
            .zip(serialized.buffers)
            .map(|(path, bytes)| BufferSnapshot {
                path,
                encoding: "base64".to_string(),
                data: STANDARD.encode(bytes),
            })
            .collect();
        Ok(Self {
            model_name: model.class_name().to_string(),
            model_module: model.module_name().to_string(),
            model_module_version: model.module_version().to_string(),
            state: serialized.state,
            buffers,
        })
    }

    fn into_serialized(self) -> WidgetResult<SerializedState> {
        let mut buffer_paths = Vec::with_capacity(self.buffers.len());
        let mut buffers = Vec::with_capacity(self.buffers.len());
        for buffer in self.buffers {
            if buffer.encoding != "base64" {
                return Err(WidgetError::deserialization(format!(
                    "unsupported buffer encoding '{}'",
                    buffer.encoding
                )));
            }
            let bytes = STANDARD.decode(buffer.data.as_bytes()).map_err(|e| {
                WidgetError::Deserialization {
                    attribute: None,
                    message: format!("invalid base64 buffer at {:?}", buffer.path),
                    source: Some(Box::new(e)),
                }
            })?;
            buffer_paths.push(buffer.path);
            buffers.push(bytes);
        }
        Ok(SerializedState {
            state: self.state,
            buffer_paths,
            buffers,
        })
    }
}

impl ManagerSnapshot {
    pub fn to_json(&self) -> WidgetResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: Value) -> WidgetResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl WidgetManager {
    /// 导出所有活跃模型的状态
    pub fn export_state(&self) -> WidgetResult<ManagerSnapshot> {
        let mut state = BTreeMap::new();
        for model in self.live_models() {
            if model.is_closed() {
                continue;
            }
            state.insert(model.id().to_string(), ModelSnapshot::from_model(&model)?);
        }
        Ok(ManagerSnapshot {
            version_major: SNAPSHOT_VERSION_MAJOR,
            version_minor: SNAPSHOT_VERSION_MINOR,
            state,
        })
    }

    /// 从快照重建无comm的模型
    ///
    /// 已存在的ID保持不变。返回新建的模型；任何一个失败时返回第一个错误，
    /// 其余成功的模型仍然保留。
    pub async fn import_state(
        &self,
        snapshot: ManagerSnapshot,
    ) -> WidgetResult<Vec<Arc<WidgetModel>>> {
        self.ensure_open("import_state")?;
        if snapshot.version_major != SNAPSHOT_VERSION_MAJOR {
            log::warn!(
                "快照版本 {}.{} 与当前版本 {}.{} 不一致",
                snapshot.version_major,
                snapshot.version_minor,
                SNAPSHOT_VERSION_MAJOR,
                SNAPSHOT_VERSION_MINOR
            );
        }

        let mut owned = Vec::new();
        for (id, model) in snapshot.state {
            match self.claim(&id) {
                Claim::Owner(claim) => owned.push((claim, id, model)),
                Claim::Existing(_) => log::debug!("快照中的模型 {} 已存在，跳过", id),
            }
        }
        log::info!("从快照导入 {} 个模型", owned.len());

        let constructions = owned.into_iter().map(|(claim, id, model)| async move {
            let options = ModelOptions::new(model.model_module.clone(), model.model_name.clone())
                .with_id(id.clone())
                .with_version(model.model_module_version.clone());
            let result = match model.into_serialized().and_then(put_buffers) {
                Ok(state) => self.construct(id, options, state, None).await,
                Err(e) => Err(e),
            };
            claim.finish(&result);
            result
        });

        futures::future::join_all(constructions)
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = ManagerSnapshot::from_json(json!({
            "version_major": 2,
            "version_minor": 0,
            "state": {
                "a": {
                    "model_name": "IntSliderModel",
                    "model_module": "@jupyter-widgets/controls",
                    "model_module_version": "2.0.0",
                    "state": {"value": 3},
                    "buffers": [{"path": ["data"], "encoding": "base64", "data": "AQID"}]
                }
            }
        }))
        .unwrap();

        let model = snapshot.state["a"].clone();
        let serialized = model.into_serialized().unwrap();
        assert_eq!(serialized.buffers, vec![vec![1u8, 2, 3]]);

        let mut bad = snapshot.state["a"].clone();
        bad.buffers[0].encoding = "hex".to_string();
        assert!(bad.into_serialized().is_err());
    }
}
