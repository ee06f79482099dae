/// 嵌入环境接口
///
/// 管理器唯一需要嵌入环境提供的是 `display_view`；创建comm和枚举comm
/// 有默认实现（无comm可用 / 空列表）。
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::comm::{KernelComm, MemoryComm};
use crate::error::{WidgetError, WidgetResult};
use crate::view::{ViewId, WidgetView};

/// 显示选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayOptions {
    /// 挂载点（由嵌入环境解释）
    pub target: Option<String>,
    /// 触发显示的原始消息内容（如果有）
    pub message: Option<Value>,
}

impl DisplayOptions {
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// 已挂载视图的句柄
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewHandle {
    pub view_id: ViewId,
    pub model_id: String,
    pub target: Option<String>,
}

#[async_trait]
pub trait WidgetEnvironment: Send + Sync {
    /// 把视图的渲染结果挂载到页面，挂载完成后返回
    ///
    /// 同一模型可能被多次显示（多个视图）。
    async fn display_view(
        &self,
        view: Arc<dyn WidgetView>,
        options: &DisplayOptions,
    ) -> WidgetResult<ViewHandle>;

    /// 为本端发起的widget创建comm
    async fn create_comm(
        &self,
        _target_name: &str,
        _model_id: &str,
    ) -> WidgetResult<Arc<dyn KernelComm>> {
        Err(WidgetError::transport("no comms available", None))
    }

    /// 枚举活跃的comm：comm_id → 元数据
    async fn get_comm_info(&self) -> WidgetResult<HashMap<String, Value>> {
        Ok(HashMap::new())
    }
}

/// 无头环境
///
/// 记录所有显示请求，用 `MemoryComm` 创建comm。
#[derive(Default)]
pub struct HeadlessEnvironment {
    displayed: Mutex<Vec<ViewHandle>>,
    comms: Mutex<HashMap<String, Arc<MemoryComm>>>,
    fail_display: AtomicBool,
}

impl HeadlessEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn displayed(&self) -> Vec<ViewHandle> {
        self.displayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 本环境创建的comm
    pub fn comm(&self, comm_id: &str) -> Option<Arc<MemoryComm>> {
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(comm_id)
            .cloned()
    }

    /// 登记一个由对端创建的comm，使其出现在comm枚举中
    pub fn track_comm(&self, comm: Arc<MemoryComm>) {
        let id = comm.comm_id().to_string();
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, comm);
    }

    /// 忘记一个comm（模拟重连后通道丢失）
    pub fn forget_comm(&self, comm_id: &str) -> Option<Arc<MemoryComm>> {
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(comm_id)
    }

    pub fn set_fail_display(&self, fail: bool) {
        self.fail_display.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WidgetEnvironment for HeadlessEnvironment {
    async fn display_view(
        &self,
        view: Arc<dyn WidgetView>,
        options: &DisplayOptions,
    ) -> WidgetResult<ViewHandle> {
        let model_id = view
            .model()
            .map(|model| model.id().to_string())
            .unwrap_or_default();
        if self.fail_display.load(Ordering::SeqCst) {
            return Err(WidgetError::transport(
                format!("cannot attach view {}", view.id()),
                None,
            ));
        }
        let handle = ViewHandle {
            view_id: view.id().clone(),
            model_id,
            target: options.target.clone(),
        };
        log::info!("显示视图 {} ({}) 模型 {}", handle.view_id, view.class_name(), handle.model_id);
        self.displayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Ok(handle)
    }

    async fn create_comm(
        &self,
        target_name: &str,
        model_id: &str,
    ) -> WidgetResult<Arc<dyn KernelComm>> {
        let comm = MemoryComm::new(model_id, target_name);
        self.track_comm(comm.clone());
        let comm: Arc<dyn KernelComm> = comm;
        Ok(comm)
    }

    async fn get_comm_info(&self) -> WidgetResult<HashMap<String, Value>> {
        Ok(self
            .comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, comm)| !comm.is_closed())
            .map(|(id, comm)| {
                (
                    id.clone(),
                    serde_json::json!({ "target_name": comm.target_name() }),
                )
            })
            .collect())
    }
}
