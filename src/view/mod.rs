// 视图基础
//
// 视图绑定到一个模型（非拥有引用），监听属性变化并重新渲染。
// 具体的渲染输出由嵌入环境负责，这里只保证视图与模型之间的契约：
// - 视图注册在模型的views表中，移除时注销并取消全部订阅
// - 由本视图发起的变化不会触发本视图的更新
// - 视图不会比模型的close活得更久

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use uuid::Uuid;

use crate::error::{WidgetError, WidgetResult};
use crate::model::{EventFilter, ModelEvent, SubscriptionId, WidgetModel};
use crate::value::AttributeMap;

/// 视图实例ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(String);

impl ViewId {
    pub fn generate() -> Self {
        ViewId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewId {
    fn from(id: &str) -> Self {
        ViewId(id.to_string())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 视图trait
pub trait WidgetView: Send + Sync {
    fn id(&self) -> &ViewId;

    /// 视图类名
    fn class_name(&self) -> &str;

    /// 绑定的模型（模型已释放时为None）
    fn model(&self) -> Option<Arc<WidgetModel>>;

    /// 首次渲染
    fn render(&self) -> WidgetResult<()>;

    /// 模型属性变化后调用
    fn update(&self, changed: &[String]);

    /// 移除视图（幂等）
    fn remove(&self);

    fn is_removed(&self) -> bool;
}

/// 视图构造选项
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    /// 父视图（容器中的子视图）
    pub parent: Option<ViewId>,
}

/// 视图类
pub trait ViewClass: Send + Sync {
    fn name(&self) -> &str;

    fn create(
        &self,
        id: ViewId,
        model: &Arc<WidgetModel>,
        options: &ViewOptions,
    ) -> WidgetResult<Arc<dyn WidgetView>>;
}

/// 视图的公共部分，具体视图通过组合使用
pub struct ViewBase {
    id: ViewId,
    class_name: String,
    model: Weak<WidgetModel>,
    parent: Option<ViewId>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    removed: AtomicBool,
    render_count: AtomicUsize,
    update_count: AtomicUsize,
    rendered: Mutex<Option<AttributeMap>>,
}

impl ViewBase {
    pub fn new(
        id: ViewId,
        class_name: impl Into<String>,
        model: &Arc<WidgetModel>,
        options: &ViewOptions,
    ) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            model: Arc::downgrade(model),
            parent: options.parent.clone(),
            subscriptions: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            render_count: AtomicUsize::new(0),
            update_count: AtomicUsize::new(0),
            rendered: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ViewId {
        &self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn parent(&self) -> Option<&ViewId> {
        self.parent.as_ref()
    }

    pub fn model(&self) -> Option<Arc<WidgetModel>> {
        self.model.upgrade()
    }

    /// 订阅模型事件，视图移除时自动取消
    pub fn listen(&self, filter: EventFilter, handler: Arc<dyn Fn(&ModelEvent) + Send + Sync>) {
        if let Some(model) = self.model() {
            let id = model.on(filter, handler);
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 记录一次渲染后的模型状态
    pub fn record_render(&self) -> WidgetResult<()> {
        let model = self
            .model()
            .ok_or_else(|| WidgetError::view_not_found(self.id.to_string()))?;
        let snapshot = model.attributes()?;
        *self.rendered.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        self.render_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 只刷新变化的键
    pub fn record_update(&self, changed: &[String]) {
        let Some(model) = self.model() else {
            return;
        };
        let mut rendered = self.rendered.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = rendered.get_or_insert_with(AttributeMap::new);
        for key in changed {
            match model.get(key) {
                Ok(value) => {
                    snapshot.insert(key.clone(), value);
                }
                Err(_) => {
                    snapshot.remove(key);
                }
            }
        }
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 最近一次渲染/更新后视图看到的状态
    pub fn rendered_state(&self) -> Option<AttributeMap> {
        self.rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn render_count(&self) -> usize {
        self.render_count.load(Ordering::Relaxed)
    }

    pub fn update_count(&self) -> usize {
        self.update_count.load(Ordering::Relaxed)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// 取消订阅并从模型注销，只在第一次调用时生效
    pub fn detach(&self) -> bool {
        if self.removed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(model) = self.model() {
            for id in subscriptions {
                model.off(id);
            }
            model.unregister_view(&self.id);
        }
        log::debug!("移除视图 {} ({})", self.id, self.class_name);
        true
    }
}

/// 通用绑定视图
///
/// 监听模型的批次变化事件并更新自己看到的状态，跳过自己发起的变化。
pub struct BoundView {
    base: ViewBase,
}

impl BoundView {
    pub fn bind(
        id: ViewId,
        class_name: impl Into<String>,
        model: &Arc<WidgetModel>,
        options: &ViewOptions,
    ) -> Arc<Self> {
        let view = Arc::new(Self {
            base: ViewBase::new(id, class_name, model, options),
        });

        let weak: Weak<BoundView> = Arc::downgrade(&view);
        view.base.listen(
            EventFilter::AnyChange,
            Arc::new(move |event| {
                let Some(view) = weak.upgrade() else {
                    return;
                };
                if let ModelEvent::ChangeBatch { names, origin } = event {
                    if origin.updated_view() == Some(view.id()) {
                        return;
                    }
                    view.update(names);
                }
            }),
        );
        view
    }

    pub fn base(&self) -> &ViewBase {
        &self.base
    }
}

impl WidgetView for BoundView {
    fn id(&self) -> &ViewId {
        self.base.id()
    }

    fn class_name(&self) -> &str {
        self.base.class_name()
    }

    fn model(&self) -> Option<Arc<WidgetModel>> {
        self.base.model()
    }

    fn render(&self) -> WidgetResult<()> {
        if self.base.is_removed() {
            return Err(WidgetError::view_not_found(self.base.id().to_string()));
        }
        self.base.record_render()
    }

    fn update(&self, changed: &[String]) {
        if !self.base.is_removed() {
            self.base.record_update(changed);
        }
    }

    fn remove(&self) {
        self.base.detach();
    }

    fn is_removed(&self) -> bool {
        self.base.is_removed()
    }
}

/// 构造 `BoundView` 的视图类
#[derive(Debug, Clone)]
pub struct BoundViewClass {
    name: String,
}

impl BoundViewClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ViewClass for BoundViewClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(
        &self,
        id: ViewId,
        model: &Arc<WidgetModel>,
        options: &ViewOptions,
    ) -> WidgetResult<Arc<dyn WidgetView>> {
        Ok(BoundView::bind(id, self.name.clone(), model, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BasicModelClass, ClassSpec, ModelInit};

    async fn headless_model() -> Arc<WidgetModel> {
        WidgetModel::create(ModelInit {
            id: "view-test".to_string(),
            spec: ClassSpec::new("@jupyter-widgets/controls", "IntSliderModel", "2.0.0"),
            class: Arc::new(BasicModelClass::new("IntSliderModel").with_default("value", 0)),
            manager: None,
            comm: None,
            state: AttributeMap::new(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_view_skips_its_own_changes() {
        let model = headless_model().await;
        let first = BoundView::bind(ViewId::from("v1"), "IntSliderView", &model, &ViewOptions::default());
        let second = BoundView::bind(ViewId::from("v2"), "IntSliderView", &model, &ViewOptions::default());
        first.render().unwrap();
        second.render().unwrap();

        model.set_from_view(first.id(), "value", 4).unwrap();

        assert_eq!(first.base().update_count(), 0);
        assert_eq!(second.base().update_count(), 1);
        assert_eq!(
            second.base().rendered_state().unwrap()["value"].as_i64(),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_remove_releases_subscriptions() {
        let model = headless_model().await;
        let view = BoundView::bind(ViewId::generate(), "IntSliderView", &model, &ViewOptions::default());
        model.begin_view(view.id()).unwrap();
        model.resolve_view(view.clone()).unwrap();
        assert_eq!(view.base().subscription_count(), 1);

        view.remove();
        view.remove();

        assert!(view.is_removed());
        assert!(model.view_ids().is_empty());
        assert_eq!(view.base().subscription_count(), 0);
        assert!(view.render().is_err());
    }

    #[tokio::test]
    async fn test_model_close_removes_views() {
        let model = headless_model().await;
        let view = BoundView::bind(ViewId::generate(), "IntSliderView", &model, &ViewOptions::default());
        model.begin_view(view.id()).unwrap();
        model.resolve_view(view.clone()).unwrap();

        model.close().await;
        assert!(view.is_removed());
    }
}
