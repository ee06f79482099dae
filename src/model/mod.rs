// Widget模型
//
// 一个模型对应一个远端widget实例，拥有属性状态并负责同步协议：
// - 本地set只暂存变化，save_changes统一发送
// - 有未确认的发送时，新的变化合并进msg_buffer，确认后一次性发出
// - 应用远端update期间，state_lock记录远端值，用于回声抑制
// - 同一模型的入站消息严格按接收顺序逐条处理
//
// 关闭是终结状态：释放comm、视图和属性，之后的操作返回Closed错误。

pub mod class;
pub mod events;

pub use class::{BasicModelClass, ClassSpec, ModelClass};
pub use events::{
    ChangeOrigin, EventFilter, EventHandler, EventHub, ModelEvent, SubscriptionId,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::comm::{
    put_buffers, remove_buffers, CommMessage, CommShim, SerializedState, WidgetMessage,
};
use crate::error::{WidgetError, WidgetResult};
use crate::manager::{DisplayOptions, WidgetManager};
use crate::serializers::SerializerContext;
use crate::value::{AttributeMap, WidgetValue};
use crate::view::{ViewId, WidgetView};

/// 模型构造参数
pub struct ModelInit {
    pub id: String,
    pub spec: ClassSpec,
    pub class: Arc<dyn ModelClass>,
    pub manager: Option<Arc<WidgetManager>>,
    pub comm: Option<CommInbox>,
    /// 线上形式的初始状态（缓冲区已放回，尚未反序列化）
    pub state: AttributeMap,
}

/// 视图槽位：构造中或已就绪
#[derive(Clone)]
pub enum ViewEntry {
    Pending,
    Ready(Arc<dyn WidgetView>),
}

/// 模型诊断信息
#[derive(Debug, Clone, Serialize)]
pub struct ModelDiagnostics {
    pub id: String,
    pub model_module: String,
    pub model_name: String,
    pub pending_msgs: usize,
    pub buffered_keys: Vec<String>,
    pub staged_keys: Vec<String>,
    pub views: usize,
    pub comm_id: Option<String>,
    pub comm_live: bool,
    pub updates_applied: u64,
    pub updates_sent: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub closed: bool,
}

#[derive(Default)]
struct ModelState {
    attributes: AttributeMap,
    /// 本地set但尚未save的变化
    staged: AttributeMap,
    pending_msgs: usize,
    msg_buffer: Option<AttributeMap>,
    /// 每个未确认发送包含的键，按发送顺序
    in_flight: VecDeque<Vec<String>>,
    state_lock: Option<AttributeMap>,
    views: HashMap<ViewId, ViewEntry>,
    updates_applied: u64,
    updates_sent: u64,
    last_sync: Option<DateTime<Utc>>,
}

enum Inbound {
    Message(CommMessage),
    Closed,
    Barrier(oneshot::Sender<()>),
}

/// 已注册回调的comm
///
/// 创建时立即挂上消息和关闭回调，构造模型期间到达的入站项先排队，
/// 模型就绪后由入站任务按到达顺序处理。
pub struct CommInbox {
    shim: Arc<CommShim>,
    sender: mpsc::UnboundedSender<Inbound>,
    receiver: mpsc::UnboundedReceiver<Inbound>,
}

impl CommInbox {
    pub fn new(shim: Arc<CommShim>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let message_tx = sender.clone();
        shim.on_message(move |message| {
            let _ = message_tx.send(Inbound::Message(message));
        });
        let close_tx = sender.clone();
        shim.on_close(move |_| {
            let _ = close_tx.send(Inbound::Closed);
        });
        Self {
            shim,
            sender,
            receiver,
        }
    }

    pub fn shim(&self) -> &Arc<CommShim> {
        &self.shim
    }
}

impl From<Arc<CommShim>> for CommInbox {
    fn from(shim: Arc<CommShim>) -> Self {
        Self::new(shim)
    }
}

/// Widget模型
pub struct WidgetModel {
    id: String,
    spec: ClassSpec,
    class: Arc<dyn ModelClass>,
    manager: Weak<WidgetManager>,
    self_ref: Weak<WidgetModel>,
    inner: Mutex<ModelState>,
    /// 串行化入站消息处理与本地发送
    state_change: tokio::sync::Mutex<()>,
    comm: Mutex<Option<Arc<CommShim>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    events: EventHub,
    closed: AtomicBool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WidgetModel {
    /// 构造模型
    ///
    /// 初始状态经过反序列化（可能异步）后才返回；任何一个反序列化器失败则构造失败。
    pub async fn create(init: ModelInit) -> WidgetResult<Arc<Self>> {
        let ModelInit {
            id,
            spec,
            class,
            manager,
            comm,
            state,
        } = init;

        let context = SerializerContext::new(manager.clone()).with_model_id(id.clone());
        let resolved = class.serializers().deserialize_state(state, &context).await?;

        let mut attributes = class.defaults();
        attributes.insert("_model_module".to_string(), WidgetValue::from(spec.module.as_str()));
        attributes.insert("_model_name".to_string(), WidgetValue::from(spec.name.as_str()));
        attributes.insert(
            "_model_module_version".to_string(),
            WidgetValue::from(spec.version.as_str()),
        );
        attributes.extend(resolved);

        let manager = manager.as_ref().map(Arc::downgrade).unwrap_or_default();
        let model = Arc::new_cyclic(|self_ref| Self {
            id,
            spec,
            class,
            manager,
            self_ref: self_ref.clone(),
            inner: Mutex::new(ModelState {
                attributes,
                ..ModelState::default()
            }),
            state_change: tokio::sync::Mutex::new(()),
            comm: Mutex::new(None),
            inbound: Mutex::new(None),
            pump: Mutex::new(None),
            events: EventHub::new(),
            closed: AtomicBool::new(false),
        });

        if let Some(comm) = comm {
            model.attach_comm(comm);
        }

        if let Err(e) = model.class.initialize(&model) {
            log::warn!("模型 {} 初始化失败: {}", model.id, e);
            model.close().await;
            return Err(e);
        }

        log::debug!("创建模型 {} ({})", model.id, model.spec);
        Ok(model)
    }

    fn attach_comm(self: &Arc<Self>, inbox: CommInbox) {
        let CommInbox {
            shim,
            sender,
            receiver,
        } = inbox;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(pump_inbound(Arc::downgrade(self), receiver));
                *guard(&self.inbound) = Some(sender);
                *guard(&self.pump) = Some(task);
            }
            Err(_) => {
                log::warn!("没有tokio运行时，模型 {} 的入站消息需要手动分发", self.id);
            }
        }
        *guard(&self.comm) = Some(shim);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ClassSpec {
        &self.spec
    }

    pub fn module_name(&self) -> &str {
        &self.spec.module
    }

    pub fn class_name(&self) -> &str {
        &self.spec.name
    }

    pub fn module_version(&self) -> &str {
        &self.spec.version
    }

    pub fn manager(&self) -> Option<Arc<WidgetManager>> {
        self.manager.upgrade()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> WidgetResult<()> {
        if self.is_closed() {
            Err(WidgetError::closed(&self.id, operation))
        } else {
            Ok(())
        }
    }

    fn serializer_context(&self) -> SerializerContext {
        SerializerContext::new(self.manager()).with_model_id(self.id.clone())
    }

    // ===== 属性读写 =====

    /// 读取属性
    pub fn get(&self, name: &str) -> WidgetResult<WidgetValue> {
        self.ensure_open("get")?;
        guard(&self.inner)
            .attributes
            .get(name)
            .cloned()
            .ok_or_else(|| WidgetError::attribute_not_found(name))
    }

    pub fn has(&self, name: &str) -> bool {
        !self.is_closed() && guard(&self.inner).attributes.contains_key(name)
    }

    /// 全部属性的快照
    pub fn attributes(&self) -> WidgetResult<AttributeMap> {
        self.ensure_open("attributes")?;
        Ok(guard(&self.inner).attributes.clone())
    }

    /// 暂存一个本地变化（不发送）
    pub fn set(&self, name: impl Into<String>, value: impl Into<WidgetValue>) -> WidgetResult<()> {
        let mut changes = AttributeMap::new();
        changes.insert(name.into(), value.into());
        self.set_attributes(changes, ChangeOrigin::local()).map(|_| ())
    }

    /// 由某个视图发起的本地变化，该视图不会因此重新渲染
    pub fn set_from_view(
        &self,
        view: &ViewId,
        name: impl Into<String>,
        value: impl Into<WidgetValue>,
    ) -> WidgetResult<()> {
        let mut changes = AttributeMap::new();
        changes.insert(name.into(), value.into());
        self.set_attributes(changes, ChangeOrigin::from_view(view.clone()))
            .map(|_| ())
    }

    /// 批量设置属性，返回实际发生变化的键
    ///
    /// 本地变化进入暂存区，除非新值正是当前正在应用的远端值；
    /// 远端变化会覆盖同名的暂存值。
    pub fn set_attributes(
        &self,
        changes: AttributeMap,
        origin: ChangeOrigin,
    ) -> WidgetResult<Vec<String>> {
        self.ensure_open("set")?;
        let mut events = Vec::new();
        {
            let mut state = guard(&self.inner);
            for (key, value) in changes {
                let old = state.attributes.get(&key).cloned();
                if old.as_ref() == Some(&value) {
                    continue;
                }
                state.attributes.insert(key.clone(), value.clone());
                match &origin {
                    ChangeOrigin::Local { .. } => {
                        let echoed = state
                            .state_lock
                            .as_ref()
                            .and_then(|lock| lock.get(&key))
                            .map_or(false, |locked| locked == &value);
                        if echoed {
                            state.staged.remove(&key);
                        } else {
                            state.staged.insert(key.clone(), value.clone());
                        }
                    }
                    ChangeOrigin::Remote => {
                        state.staged.remove(&key);
                    }
                }
                events.push(ModelEvent::Change {
                    name: key,
                    old,
                    new: value,
                    origin: origin.clone(),
                });
            }
        }

        let names = self.emit_changes(events, origin);
        Ok(names)
    }

    fn emit_changes(&self, events: Vec<ModelEvent>, origin: ChangeOrigin) -> Vec<String> {
        let names: Vec<String> = events
            .iter()
            .filter_map(|event| match event {
                ModelEvent::Change { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        for event in &events {
            self.events.emit(event);
        }
        if !names.is_empty() {
            self.events.emit(&ModelEvent::ChangeBatch {
                names: names.clone(),
                origin,
            });
        }
        names
    }

    // ===== 发送 =====

    /// 发送所有暂存的本地变化
    ///
    /// 有未确认的发送时，变化合并进msg_buffer，等确认后一起发出。
    /// 没有comm的模型只清空暂存区。
    pub async fn save_changes(&self) -> WidgetResult<()> {
        self.ensure_open("save_changes")?;
        let _turn = self.state_change.lock().await;
        let delta = std::mem::take(&mut guard(&self.inner).staged);
        self.dispatch(delta).await
    }

    async fn dispatch(&self, delta: AttributeMap) -> WidgetResult<()> {
        if delta.is_empty() || self.is_closed() {
            return Ok(());
        }

        let comm = match self.comm() {
            Some(comm) => comm,
            None => {
                log::trace!("模型 {} 没有comm，丢弃 {} 个本地变化", self.id, delta.len());
                guard(&self.inner).last_sync = Some(Utc::now());
                return Ok(());
            }
        };

        let message = {
            let mut state = guard(&self.inner);
            if state.pending_msgs > 0 {
                log::debug!(
                    "模型 {} 有 {} 条未确认消息，缓冲 {} 个变化",
                    self.id,
                    state.pending_msgs,
                    delta.len()
                );
                state
                    .msg_buffer
                    .get_or_insert_with(AttributeMap::new)
                    .extend(delta);
                return Ok(());
            }

            let context = self.serializer_context();
            let wire = match self.class.serializers().serialize_state(&delta, &context) {
                Ok(wire) => wire,
                Err(e) => {
                    restage(&mut state, delta);
                    return Err(e);
                }
            };
            state.pending_msgs += 1;
            state.in_flight.push_back(delta.keys().cloned().collect());
            WidgetMessage::Update(remove_buffers(&wire))
        };

        match comm.send(message).await {
            Ok(()) => {
                let mut state = guard(&self.inner);
                state.updates_sent += 1;
                state.last_sync = Some(Utc::now());
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = guard(&self.inner);
                    state.pending_msgs = state.pending_msgs.saturating_sub(1);
                    state.in_flight.pop_back();
                    restage(&mut state, delta);
                }
                self.events.emit(&ModelEvent::SyncFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 发送自定义消息
    pub async fn send_custom(&self, content: Value, buffers: Vec<Vec<u8>>) -> WidgetResult<()> {
        self.ensure_open("send_custom")?;
        let comm = self.comm().ok_or_else(|| {
            WidgetError::transport(format!("model {} has no comm", self.id), None)
        })?;
        comm.send(WidgetMessage::Custom { content, buffers }).await
    }

    async fn send_full_state(&self) -> WidgetResult<()> {
        let Some(comm) = self.comm() else {
            return Ok(());
        };
        let serialized = self.export_state()?;
        log::debug!("模型 {} 回复完整状态", self.id);
        comm.send(WidgetMessage::Update(serialized)).await
    }

    // ===== 入站消息 =====

    /// 处理一条入站comm消息
    ///
    /// 已关闭的模型忽略所有消息。
    pub async fn handle_comm_msg(&self, message: CommMessage) -> WidgetResult<()> {
        if self.is_closed() {
            log::debug!("模型 {} 已关闭，忽略入站消息", self.id);
            return Ok(());
        }
        let turn = self.state_change.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        match WidgetMessage::parse(message)? {
            WidgetMessage::Update(serialized) => self.apply_update(serialized, false).await,
            WidgetMessage::EchoUpdate(serialized) => self.apply_update(serialized, true).await,
            WidgetMessage::Custom { content, buffers } => {
                self.events
                    .emit(&ModelEvent::CustomMessage { content, buffers });
                Ok(())
            }
            WidgetMessage::Display => {
                drop(turn);
                self.display().await
            }
            WidgetMessage::RequestState => self.send_full_state().await,
            WidgetMessage::Unknown { method } => {
                log::warn!("模型 {} 收到未知方法: {}", self.id, method);
                Ok(())
            }
        }
    }

    async fn apply_update(&self, serialized: SerializedState, echo: bool) -> WidgetResult<()> {
        let raw = put_buffers(serialized)?;
        let keys: Vec<String> = raw.keys().cloned().collect();
        self.acknowledge(&keys, echo);

        let context = self.serializer_context();
        let values = match self
            .class
            .serializers()
            .deserialize_state(raw, &context)
            .await
        {
            Ok(values) => values,
            Err(e) => {
                log::warn!("模型 {} 的update反序列化失败: {}", self.id, e);
                if let Err(flush_err) = self.flush_if_settled().await {
                    log::warn!("模型 {} 刷新缓冲失败: {}", self.id, flush_err);
                }
                return Err(e);
            }
        };
        if self.is_closed() {
            return Ok(());
        }

        // 尚未发出的本地写（包括反序列化期间的set）优先，留给下一次发送
        let values: AttributeMap = {
            let state = guard(&self.inner);
            values
                .into_iter()
                .filter(|(key, _)| {
                    let local = state.staged.contains_key(key)
                        || state
                            .msg_buffer
                            .as_ref()
                            .map_or(false, |buffer| buffer.contains_key(key));
                    if local {
                        log::debug!("模型 {} 保留本地未发送的 {}，跳过远端值", self.id, key);
                    }
                    !local
                })
                .collect()
        };

        guard(&self.inner).state_lock = Some(values.clone());
        let applied = self.set_attributes(values, ChangeOrigin::Remote);
        {
            let mut state = guard(&self.inner);
            state.state_lock = None;
            state.updates_applied += 1;
            state.last_sync = Some(Utc::now());
        }
        applied?;

        self.flush_if_settled().await
    }

    /// 识别确认：echo_update总是确认；update的键是最早一次发送的非空子集时视为确认
    fn acknowledge(&self, keys: &[String], echo: bool) {
        let mut state = guard(&self.inner);
        if state.pending_msgs == 0 {
            return;
        }
        let is_ack = echo
            || (!keys.is_empty()
                && state
                    .in_flight
                    .front()
                    .map_or(false, |sent| keys.iter().all(|k| sent.contains(k))));
        if is_ack {
            state.pending_msgs -= 1;
            state.in_flight.pop_front();
            log::trace!("模型 {} 收到确认，剩余 {} 条未确认", self.id, state.pending_msgs);
        }
    }

    /// 所有发送都已确认时，把msg_buffer作为一条消息发出
    async fn flush_if_settled(&self) -> WidgetResult<()> {
        let (buffer, events) = {
            let mut state = guard(&self.inner);
            if state.pending_msgs > 0 {
                return Ok(());
            }
            let Some(buffer) = state.msg_buffer.take() else {
                return Ok(());
            };

            // 缓冲的本地值优先于期间到达的远端值
            let mut events = Vec::new();
            for (key, value) in &buffer {
                if state.staged.contains_key(key) {
                    continue;
                }
                let old = state.attributes.get(key).cloned();
                if old.as_ref() != Some(value) {
                    state.attributes.insert(key.clone(), value.clone());
                    events.push(ModelEvent::Change {
                        name: key.clone(),
                        old,
                        new: value.clone(),
                        origin: ChangeOrigin::local(),
                    });
                }
            }
            (buffer, events)
        };

        self.emit_changes(events, ChangeOrigin::local());
        log::debug!("模型 {} 发送缓冲的 {} 个变化", self.id, buffer.len());
        self.dispatch(buffer).await
    }

    async fn display(&self) -> WidgetResult<()> {
        let manager = self
            .manager()
            .ok_or_else(|| WidgetError::transport("model has no manager to display it", None))?;
        let model = self
            .self_ref
            .upgrade()
            .ok_or_else(|| WidgetError::closed(&self.id, "display"))?;
        manager
            .display_model(&model, DisplayOptions::default())
            .await
            .map(|_| ())
    }

    /// 对端关闭了comm，等同于本地close
    pub async fn handle_comm_closed(&self) {
        if self.is_closed() {
            return;
        }
        log::info!("模型 {} 的comm被对端关闭", self.id);
        self.events.emit(&ModelEvent::CommClosed);
        if let Some(comm) = self.comm() {
            comm.mark_closed();
        }
        self.close().await;
    }

    /// 等待此前收到的入站消息全部处理完
    pub async fn settled(&self) {
        let sender = guard(&self.inbound).clone();
        if let Some(sender) = sender {
            let (done, wait) = oneshot::channel();
            if sender.send(Inbound::Barrier(done)).is_ok() {
                let _ = wait.await;
            }
        }
    }

    // ===== 生命周期 =====

    /// 关闭模型（幂等）
    ///
    /// 触发一次destroy事件，移除所有视图，关闭comm并从管理器注销。
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("关闭模型 {}", self.id);
        self.events.emit(&ModelEvent::Destroy);

        let comm = guard(&self.comm).take();
        let views: Vec<Arc<dyn WidgetView>> = {
            let mut state = guard(&self.inner);
            let views = state
                .views
                .drain()
                .filter_map(|(_, entry)| match entry {
                    ViewEntry::Ready(view) => Some(view),
                    ViewEntry::Pending => None,
                })
                .collect();
            state.attributes.clear();
            state.staged.clear();
            state.msg_buffer = None;
            state.state_lock = None;
            state.pending_msgs = 0;
            state.in_flight.clear();
            views
        };
        for view in views {
            view.remove();
        }
        self.events.clear();

        if let Some(comm) = comm {
            if let Err(e) = comm.close().await {
                log::warn!("关闭模型 {} 的comm失败: {}", self.id, e);
            }
        }

        if let Some(manager) = self.manager() {
            manager.unregister_model(&self.id, self);
        }

        guard(&self.inbound).take();
        if let Some(pump) = guard(&self.pump).take() {
            pump.abort();
        }
    }

    // ===== 序列化 =====

    /// 用序列化器转换全部属性（纯函数，不修改状态）
    pub fn serialize_state(&self) -> WidgetResult<AttributeMap> {
        self.ensure_open("serialize_state")?;
        let attributes = guard(&self.inner).attributes.clone();
        self.class
            .serializers()
            .serialize_state(&attributes, &self.serializer_context())
    }

    /// 序列化并拆分缓冲区，得到可以直接放进消息或快照的状态
    pub fn export_state(&self) -> WidgetResult<SerializedState> {
        Ok(remove_buffers(&self.serialize_state()?))
    }

    // ===== 事件 =====

    pub fn on(&self, filter: EventFilter, handler: EventHandler) -> SubscriptionId {
        self.events.subscribe(filter, handler)
    }

    pub fn on_change<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.events
            .subscribe(EventFilter::Change(name.to_string()), Arc::new(handler))
    }

    /// 每个触及任一指定键的变化批次触发一次
    pub fn on_some_change<F>(&self, keys: &[&str], handler: F) -> SubscriptionId
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        let keys = keys.iter().map(|k| k.to_string()).collect();
        self.events
            .subscribe(EventFilter::SomeChange(keys), Arc::new(handler))
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ===== 视图 =====

    /// 为正在构造的视图占位
    pub fn begin_view(&self, id: &ViewId) -> WidgetResult<()> {
        self.ensure_open("create_view")?;
        guard(&self.inner).views.insert(id.clone(), ViewEntry::Pending);
        Ok(())
    }

    /// 视图构造完成
    ///
    /// 占位已被移除（视图被取消或模型已关闭）时返回错误，调用方应移除该视图。
    pub fn resolve_view(&self, view: Arc<dyn WidgetView>) -> WidgetResult<()> {
        self.ensure_open("create_view")?;
        let mut state = guard(&self.inner);
        match state.views.get_mut(view.id()) {
            Some(entry) => {
                *entry = ViewEntry::Ready(view);
                Ok(())
            }
            None => Err(WidgetError::view_not_found(view.id().to_string())),
        }
    }

    pub fn unregister_view(&self, id: &ViewId) -> Option<ViewEntry> {
        guard(&self.inner).views.remove(id)
    }

    pub fn view_ids(&self) -> Vec<ViewId> {
        guard(&self.inner).views.keys().cloned().collect()
    }

    pub fn views(&self) -> Vec<Arc<dyn WidgetView>> {
        guard(&self.inner)
            .views
            .values()
            .filter_map(|entry| match entry {
                ViewEntry::Ready(view) => Some(view.clone()),
                ViewEntry::Pending => None,
            })
            .collect()
    }

    // ===== 同步状态 =====

    pub fn comm(&self) -> Option<Arc<CommShim>> {
        guard(&self.comm).clone()
    }

    pub fn comm_live(&self) -> bool {
        self.comm().map_or(false, |comm| comm.is_live())
    }

    pub fn pending_msgs(&self) -> usize {
        guard(&self.inner).pending_msgs
    }

    pub fn msg_buffer(&self) -> Option<AttributeMap> {
        guard(&self.inner).msg_buffer.clone()
    }

    pub fn state_lock(&self) -> Option<AttributeMap> {
        guard(&self.inner).state_lock.clone()
    }

    pub fn staged_keys(&self) -> Vec<String> {
        guard(&self.inner).staged.keys().cloned().collect()
    }

    pub fn diagnostics(&self) -> ModelDiagnostics {
        let comm = self.comm();
        let state = guard(&self.inner);
        ModelDiagnostics {
            id: self.id.clone(),
            model_module: self.spec.module.clone(),
            model_name: self.spec.name.clone(),
            pending_msgs: state.pending_msgs,
            buffered_keys: state
                .msg_buffer
                .as_ref()
                .map(|buffer| buffer.keys().cloned().collect())
                .unwrap_or_default(),
            staged_keys: state.staged.keys().cloned().collect(),
            views: state.views.len(),
            comm_id: comm.as_ref().map(|c| c.comm_id().to_string()),
            comm_live: comm.as_ref().map_or(false, |c| c.is_live()),
            updates_applied: state.updates_applied,
            updates_sent: state.updates_sent,
            last_sync: state.last_sync,
            closed: self.is_closed(),
        }
    }
}

/// 发送失败时把变化放回暂存区，不覆盖之后的新值
fn restage(state: &mut ModelState, delta: AttributeMap) {
    for (key, value) in delta {
        state.staged.entry(key).or_insert(value);
    }
}

async fn pump_inbound(model: Weak<WidgetModel>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        let Some(model) = model.upgrade() else {
            break;
        };
        match item {
            Inbound::Message(message) => {
                if let Err(e) = model.handle_comm_msg(message).await {
                    log::error!("模型 {} 处理入站消息失败: {}", model.id(), e);
                }
            }
            Inbound::Closed => model.handle_comm_closed().await,
            Inbound::Barrier(done) => {
                let _ = done.send(());
            }
        }
        if model.is_closed() {
            break;
        }
    }
}

impl std::fmt::Debug for WidgetModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetModel")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
