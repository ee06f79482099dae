// Widget管理器
//
// 每个嵌入上下文一个管理器，负责：
// - 类解析（内置模块 + 动态加载器，带缓存）
// - 从线上状态构造模型，同一个ID最多构造一次
// - 模型表：ID → 模型，模型关闭时自动注销
// - 视图的创建与显示（最终挂载交给嵌入环境）
// - 快照导出/导入、comm对账、整体关闭

pub mod environment;
pub mod registry;
pub mod snapshot;

pub use environment::{DisplayOptions, HeadlessEnvironment, ViewHandle, WidgetEnvironment};
pub use registry::{
    ClassRegistry, ModuleExports, ModuleLoader, ModuleRequest, StaticModuleLoader, WidgetClass,
};
pub use snapshot::{BufferSnapshot, ManagerSnapshot, ModelSnapshot};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use uuid::Uuid;

use crate::comm::{put_buffers, CommMessage, CommShim, KernelComm, OpenMessage};
use crate::config::{protocol_major, ManagerConfig};
use crate::error::{ClassNotFoundReason, WidgetError, WidgetResult};
use crate::model::{
    ClassSpec, CommInbox, ModelClass, ModelDiagnostics, ModelInit, WidgetModel,
};
use crate::value::AttributeMap;
use crate::view::{ViewClass, ViewId, ViewOptions, WidgetView};

/// 模型构造选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// 缺省时使用comm ID，再缺省时生成UUID
    pub model_id: Option<String>,
    pub model_name: String,
    pub model_module: String,
    pub model_module_version: String,
}

impl ModelOptions {
    pub fn new(model_module: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            model_id: None,
            model_name: model_name.into(),
            model_module: model_module.into(),
            model_module_version: "*".to_string(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.model_module_version = version.into();
        self
    }
}

/// comm对账结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// comm已不存在而被关闭的模型
    pub closed_models: Vec<String>,
    /// 环境报告了但本地没有模型的comm
    pub unknown_comms: Vec<String>,
}

#[derive(Clone)]
enum SlotState {
    Constructing,
    Ready(Arc<WidgetModel>),
    Failed(String),
}

type Slot = Arc<watch::Sender<SlotState>>;

enum Claim<'a> {
    Existing(watch::Receiver<SlotState>),
    Owner(SlotClaim<'a>),
}

/// 某个ID的构造权；未完成就被丢弃时通知等待者失败
struct SlotClaim<'a> {
    manager: &'a WidgetManager,
    id: String,
    slot: Slot,
    done: bool,
}

impl SlotClaim<'_> {
    fn finish(mut self, result: &WidgetResult<Arc<WidgetModel>>) {
        match result {
            Ok(model) if model.is_closed() => {
                self.fail(format!("model {} closed during construction", model.id()))
            }
            Ok(model) => {
                self.slot.send_replace(SlotState::Ready(model.clone()));
            }
            Err(e) => self.fail(e.to_string()),
        }
        self.done = true;
    }

    fn fail(&self, reason: String) {
        self.slot.send_replace(SlotState::Failed(reason));
        let mut models = self.manager.models();
        if models
            .get(&self.id)
            .map_or(false, |slot| Arc::ptr_eq(slot, &self.slot))
        {
            models.remove(&self.id);
        }
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.fail("construction cancelled".to_string());
        }
    }
}

/// Widget管理器
pub struct WidgetManager {
    config: ManagerConfig,
    registry: ClassRegistry,
    environment: Arc<dyn WidgetEnvironment>,
    models: Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
    self_ref: Weak<WidgetManager>,
}

impl WidgetManager {
    /// 创建管理器（没有动态加载器）
    pub fn new(config: ManagerConfig, environment: Arc<dyn WidgetEnvironment>) -> Arc<Self> {
        Self::build(config, environment, None)
    }

    /// 创建带动态加载器的管理器
    pub fn with_loader(
        config: ManagerConfig,
        environment: Arc<dyn WidgetEnvironment>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Arc<Self> {
        Self::build(config, environment, Some(loader))
    }

    fn build(
        config: ManagerConfig,
        environment: Arc<dyn WidgetEnvironment>,
        loader: Option<Arc<dyn ModuleLoader>>,
    ) -> Arc<Self> {
        let registry = ClassRegistry::new(config.clone(), loader);
        crate::widgets::register_builtins(&registry);
        log::info!(
            "创建widget管理器: target={}, protocol={}",
            config.comm_target_name,
            config.protocol_version
        );
        Arc::new_cyclic(|self_ref| Self {
            config,
            registry,
            environment,
            models: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn environment(&self) -> &Arc<dyn WidgetEnvironment> {
        &self.environment
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self, operation: &str) -> WidgetResult<()> {
        if self.is_closed() {
            Err(WidgetError::closed("<manager>", operation))
        } else {
            Ok(())
        }
    }

    // ===== 类解析 =====

    /// 解析类：内置模块优先，其次动态加载器
    pub async fn resolve_class(
        &self,
        module: &str,
        name: &str,
        version: &str,
    ) -> WidgetResult<WidgetClass> {
        self.registry.resolve(module, name, version).await
    }

    pub async fn load_model_class(
        &self,
        module: &str,
        name: &str,
        version: &str,
    ) -> WidgetResult<Arc<dyn ModelClass>> {
        match self.resolve_class(module, name, version).await? {
            WidgetClass::Model(class) => Ok(class),
            WidgetClass::View(_) => Err(WidgetError::class_not_found(
                module,
                name,
                version,
                ClassNotFoundReason::WrongClassKind,
            )),
        }
    }

    pub async fn load_view_class(
        &self,
        module: &str,
        name: &str,
        version: &str,
    ) -> WidgetResult<Arc<dyn ViewClass>> {
        match self.resolve_class(module, name, version).await? {
            WidgetClass::View(class) => Ok(class),
            WidgetClass::Model(_) => Err(WidgetError::class_not_found(
                module,
                name,
                version,
                ClassNotFoundReason::WrongClassKind,
            )),
        }
    }

    // ===== 模型表 =====

    fn claim(&self, id: &str) -> Claim<'_> {
        let mut models = self.models();
        if let Some(slot) = models.get(id) {
            return Claim::Existing(slot.subscribe());
        }
        let (sender, _) = watch::channel(SlotState::Constructing);
        let slot = Arc::new(sender);
        models.insert(id.to_string(), slot.clone());
        Claim::Owner(SlotClaim {
            manager: self,
            id: id.to_string(),
            slot,
            done: false,
        })
    }

    async fn wait_slot(id: &str, mut receiver: watch::Receiver<SlotState>) -> WidgetResult<Arc<WidgetModel>> {
        let state = receiver
            .wait_for(|state| !matches!(state, SlotState::Constructing))
            .await
            .map(|state| state.clone())
            .map_err(|_| WidgetError::model_not_found(id))?;
        match state {
            SlotState::Ready(model) => Ok(model),
            SlotState::Failed(reason) => {
                log::debug!("等待的模型 {} 构造失败: {}", id, reason);
                Err(WidgetError::model_not_found(id))
            }
            SlotState::Constructing => Err(WidgetError::model_not_found(id)),
        }
    }

    /// 构造模型，或返回已存在（或正在构造）的同ID模型
    ///
    /// `state` 是线上形式的状态（缓冲区已放回）。
    pub async fn new_model(
        &self,
        options: ModelOptions,
        state: AttributeMap,
        comm: Option<Arc<dyn KernelComm>>,
    ) -> WidgetResult<Arc<WidgetModel>> {
        if let Err(e) = self.ensure_open("new_model") {
            close_kernel_comm(comm).await;
            return Err(e);
        }
        let id = options
            .model_id
            .clone()
            .or_else(|| comm.as_ref().map(|c| c.comm_id().to_string()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.claim(&id) {
            Claim::Existing(receiver) => {
                let result = Self::wait_slot(&id, receiver).await;
                if let Some(comm) = comm {
                    let in_use = result
                        .as_ref()
                        .ok()
                        .and_then(|model| model.comm())
                        .map_or(false, |shim| shim.wraps(&comm));
                    if !in_use {
                        log::warn!("模型 {} 已存在，关闭多余的comm {}", id, comm.comm_id());
                        close_kernel_comm(Some(comm)).await;
                    }
                }
                result
            }
            Claim::Owner(claim) => {
                let result = self.construct(id, options, state, comm).await;
                claim.finish(&result);
                result
            }
        }
    }

    async fn construct(
        &self,
        id: String,
        options: ModelOptions,
        state: AttributeMap,
        comm: Option<Arc<dyn KernelComm>>,
    ) -> WidgetResult<Arc<WidgetModel>> {
        // 回调在任何await之前注册，构造期间到达的消息排队等待
        let shim = comm.map(CommShim::new);
        let inbox = shim.clone().map(CommInbox::new);
        let result = self.construct_with_inbox(id, options, state, inbox).await;
        if let Err(e) = &result {
            log::warn!("模型构造失败: {}", e);
            if let Some(shim) = shim {
                if let Err(close_err) = shim.close().await {
                    log::warn!("关闭comm {} 失败: {}", shim.comm_id(), close_err);
                }
            }
        }
        result
    }

    async fn construct_with_inbox(
        &self,
        id: String,
        options: ModelOptions,
        state: AttributeMap,
        inbox: Option<CommInbox>,
    ) -> WidgetResult<Arc<WidgetModel>> {
        let class = self
            .load_model_class(
                &options.model_module,
                &options.model_name,
                &options.model_module_version,
            )
            .await?;

        let model = WidgetModel::create(ModelInit {
            id,
            spec: ClassSpec::new(
                options.model_module,
                options.model_name,
                options.model_module_version,
            ),
            class,
            manager: self.self_ref.upgrade(),
            comm: inbox,
            state,
        })
        .await?;

        if self.is_closed() {
            model.close().await;
            return Err(WidgetError::closed(model.id(), "new_model"));
        }
        if model.comm().is_some() {
            model.settled().await;
        }
        if model.is_closed() {
            log::info!("模型 {} 的comm在构造期间已被对端关闭", model.id());
            return Ok(model);
        }
        log::info!("注册模型: {} ({})", model.id(), model.spec());
        Ok(model)
    }

    /// 本端发起的widget：通过环境创建comm，并把序列化后的完整状态作为open消息发出
    pub async fn new_widget(
        &self,
        options: ModelOptions,
        state: AttributeMap,
    ) -> WidgetResult<Arc<WidgetModel>> {
        self.ensure_open("new_widget")?;
        let id = options
            .model_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let comm = self
            .environment
            .create_comm(&self.config.comm_target_name, &id)
            .await?;
        let model = self
            .new_model(options.with_id(id), state, Some(comm))
            .await?;

        if let Some(shim) = model.comm() {
            let open = OpenMessage::new(model.export_state()?, self.config.protocol_version.clone());
            if let Err(e) = shim.open(open).await {
                model.close().await;
                return Err(e);
            }
        }
        Ok(model)
    }

    /// 获取模型，正在构造的模型会等待其完成
    pub async fn get_model(&self, id: &str) -> WidgetResult<Arc<WidgetModel>> {
        let receiver = self
            .models()
            .get(id)
            .map(|slot| slot.subscribe())
            .ok_or_else(|| WidgetError::model_not_found(id))?;
        Self::wait_slot(id, receiver).await
    }

    /// 获取已就绪的模型，不等待
    pub fn try_get_model(&self, id: &str) -> Option<Arc<WidgetModel>> {
        match &*self.models().get(id)?.borrow() {
            SlotState::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    pub fn has_model(&self, id: &str) -> bool {
        self.try_get_model(id).is_some()
    }

    /// 所有已就绪的模型
    pub fn live_models(&self) -> Vec<Arc<WidgetModel>> {
        let mut models: Vec<Arc<WidgetModel>> = self
            .models()
            .values()
            .filter_map(|slot| match &*slot.borrow() {
                SlotState::Ready(model) => Some(model.clone()),
                _ => None,
            })
            .collect();
        models.sort_by(|a, b| a.id().cmp(b.id()));
        models
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.live_models()
            .iter()
            .map(|model| model.id().to_string())
            .collect()
    }

    /// 模型关闭时调用；只注销同一个实例
    pub(crate) fn unregister_model(&self, id: &str, model: &WidgetModel) {
        let mut models = self.models();
        let same = models.get(id).map_or(false, |slot| {
            matches!(&*slot.borrow(), SlotState::Ready(m) if std::ptr::eq(Arc::as_ptr(m), model))
        });
        if same {
            models.remove(id);
            log::debug!("注销模型: {}", id);
        }
    }

    pub fn diagnostics(&self) -> Vec<ModelDiagnostics> {
        self.live_models()
            .iter()
            .map(|model| model.diagnostics())
            .collect()
    }

    // ===== comm =====

    /// 对端创建了新widget
    pub async fn handle_comm_open(
        &self,
        comm: Arc<dyn KernelComm>,
        message: CommMessage,
    ) -> WidgetResult<Arc<WidgetModel>> {
        let open = match OpenMessage::parse(message) {
            Ok(open) => open,
            Err(e) => {
                log::warn!("comm {} 的open消息无效: {}", comm.comm_id(), e);
                close_kernel_comm(Some(comm)).await;
                return Err(e);
            }
        };

        if let Some(version) = &open.protocol_version {
            if !self.config.is_compatible_protocol(version) {
                log::warn!(
                    "协议版本不匹配: 对端 {} (主版本 {:?})，本端 {}",
                    version,
                    protocol_major(version),
                    self.config.protocol_version
                );
            }
        }

        let options = match (open.model_module(), open.model_name()) {
            (Ok(module), Ok(name)) => ModelOptions::new(module, name)
                .with_id(comm.comm_id())
                .with_version(open.model_module_version()),
            (Err(e), _) | (_, Err(e)) => {
                close_kernel_comm(Some(comm)).await;
                return Err(e);
            }
        };

        let state = match put_buffers(open.state) {
            Ok(state) => state,
            Err(e) => {
                close_kernel_comm(Some(comm)).await;
                return Err(e);
            }
        };
        self.new_model(options, state, Some(comm)).await
    }

    /// 与环境报告的comm对账
    pub async fn reconcile_comms(&self) -> WidgetResult<ReconcileReport> {
        self.ensure_open("reconcile_comms")?;
        let info = self.environment.get_comm_info().await?;
        let mut report = ReconcileReport::default();
        let mut known = Vec::new();

        for model in self.live_models() {
            let Some(comm) = model.comm() else {
                continue;
            };
            let comm_id = comm.comm_id().to_string();
            if info.contains_key(&comm_id) {
                known.push(comm_id);
            } else {
                log::info!("comm {} 已不存在，关闭模型 {}", comm_id, model.id());
                model.close().await;
                report.closed_models.push(model.id().to_string());
            }
        }

        report.unknown_comms = info
            .keys()
            .filter(|id| !known.contains(id))
            .cloned()
            .collect();
        report.unknown_comms.sort();
        Ok(report)
    }

    // ===== 视图 =====

    /// 为模型构造一个视图并登记到模型的views表
    pub async fn create_view(
        &self,
        model: &Arc<WidgetModel>,
        options: ViewOptions,
    ) -> WidgetResult<Arc<dyn WidgetView>> {
        let view_name = model
            .get("_view_name")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WidgetError::attribute_not_found("_view_name"))?;
        let view_module = model
            .get("_view_module")
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| model.module_name().to_string());
        let view_version = model
            .get("_view_module_version")
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "*".to_string());

        let view_id = ViewId::generate();
        model.begin_view(&view_id)?;

        let class = match self
            .load_view_class(&view_module, &view_name, &view_version)
            .await
        {
            Ok(class) => class,
            Err(e) => {
                model.unregister_view(&view_id);
                return Err(e);
            }
        };
        let view = match class.create(view_id.clone(), model, &options) {
            Ok(view) => view,
            Err(e) => {
                model.unregister_view(&view_id);
                return Err(e);
            }
        };
        if let Err(e) = model.resolve_view(view.clone()) {
            view.remove();
            return Err(e);
        }
        log::debug!("创建视图 {} ({}) 模型 {}", view_id, view_name, model.id());
        Ok(view)
    }

    /// 创建、渲染并通过环境挂载视图
    ///
    /// 挂载失败只移除该视图，不影响模型。
    pub async fn display_model(
        &self,
        model: &Arc<WidgetModel>,
        options: DisplayOptions,
    ) -> WidgetResult<ViewHandle> {
        self.ensure_open("display_model")?;
        let view = self.create_view(model, ViewOptions::default()).await?;
        if let Err(e) = view.render() {
            view.remove();
            return Err(e);
        }
        match self.environment.display_view(view.clone(), &options).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                log::warn!("显示模型 {} 失败: {}", model.id(), e);
                view.remove();
                Err(e)
            }
        }
    }

    // ===== 生命周期 =====

    /// 关闭所有模型并清空类缓存（幂等）
    pub async fn close_all(&self) {
        let models = self.live_models();
        if !models.is_empty() {
            log::info!("关闭 {} 个模型", models.len());
        }
        for model in models {
            model.close().await;
        }
        self.models().clear();
        self.registry.clear_cache().await;
    }

    /// 关闭管理器，之后不再接受新模型
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("关闭widget管理器");
        self.close_all().await;
    }
}

impl std::fmt::Debug for WidgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetManager")
            .field("config", &self.config)
            .field("models", &self.model_ids())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn close_kernel_comm(comm: Option<Arc<dyn KernelComm>>) {
    if let Some(comm) = comm {
        if let Err(e) = comm.close(None).await {
            log::warn!("关闭comm {} 失败: {}", comm.comm_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MemoryComm;
    use crate::error::ErrorKind;
    use crate::widgets::CONTROLS_MODULE;
    use serde_json::json;

    fn manager() -> (Arc<WidgetManager>, Arc<HeadlessEnvironment>) {
        let environment = HeadlessEnvironment::new();
        let manager = WidgetManager::new(ManagerConfig::default(), environment.clone());
        (manager, environment)
    }

    fn slider_open(value: i64) -> CommMessage {
        CommMessage::new(json!({
            "state": {
                "_model_name": "IntSliderModel",
                "_model_module": CONTROLS_MODULE,
                "_model_module_version": "2.0.0",
                "value": value
            }
        }))
        .with_metadata(json!({"version": "2.1.0"}))
    }

    #[tokio::test]
    async fn test_concurrent_new_model_constructs_once() {
        let (manager, _) = manager();
        let options = ModelOptions::new(CONTROLS_MODULE, "IntSliderModel").with_id("same");

        let (a, b) = tokio::join!(
            manager.new_model(options.clone(), AttributeMap::new(), None),
            manager.new_model(options.clone(), AttributeMap::new(), None)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(manager.model_ids(), vec!["same".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_construction_closes_comm_and_frees_id() {
        let (manager, _) = manager();
        let kernel = MemoryComm::new("bad", "jupyter.widget");
        let message = CommMessage::new(json!({
            "state": {"_model_name": "FooModel", "_model_module": "foo-widgets"}
        }));

        let err = manager
            .handle_comm_open(kernel.clone(), message)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassNotFound);
        assert_eq!(kernel.close_count(), 1);
        assert_eq!(
            manager.get_model("bad").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_model_close_unregisters() {
        let (manager, _) = manager();
        let kernel = MemoryComm::new("c1", "jupyter.widget");
        let model = manager.handle_comm_open(kernel, slider_open(5)).await.unwrap();
        assert!(manager.has_model("c1"));

        model.close().await;
        assert!(!manager.has_model("c1"));
    }

    #[tokio::test]
    async fn test_display_failure_keeps_model() {
        let (manager, environment) = manager();
        let kernel = MemoryComm::new("c2", "jupyter.widget");
        let model = manager.handle_comm_open(kernel, slider_open(1)).await.unwrap();

        environment.set_fail_display(true);
        assert!(manager
            .display_model(&model, DisplayOptions::default())
            .await
            .is_err());
        assert!(model.view_ids().is_empty());
        assert!(!model.is_closed());

        environment.set_fail_display(false);
        let handle = manager
            .display_model(&model, DisplayOptions::default().with_target("cell-1"))
            .await
            .unwrap();
        assert_eq!(handle.model_id, "c2");
        assert_eq!(model.view_ids(), vec![handle.view_id]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_models() {
        let (manager, _) = manager();
        let kernel = MemoryComm::new("c3", "jupyter.widget");
        let model = manager.handle_comm_open(kernel.clone(), slider_open(1)).await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(model.is_closed());
        assert_eq!(kernel.close_count(), 1);

        let late = MemoryComm::new("c4", "jupyter.widget");
        let err = manager
            .handle_comm_open(late.clone(), slider_open(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(late.close_count(), 1);
    }
}
