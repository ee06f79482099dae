/// 属性链接模型
///
/// `source`/`target` 都是 `[模型, 属性名]` 对。单向链接在源属性变化时
/// 复制到目标并保存目标；双向链接两个方向都复制，用重入标志避免来回震荡。
/// 任何一端关闭时链接本身也关闭。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::WidgetResult;
use crate::model::{
    BasicModelClass, EventFilter, ModelClass, SubscriptionId, WidgetModel,
};
use crate::serializers::{ModelReferenceSerializer, SerializerRegistry};
use crate::value::{AttributeMap, WidgetValue};

use super::{CONTROLS_MODULE, CONTROLS_MODULE_VERSION};

pub struct LinkModelClass {
    base: BasicModelClass,
    bidirectional: bool,
}

impl LinkModelClass {
    fn build(name: &str, bidirectional: bool) -> Self {
        let base = BasicModelClass::new(name)
            .with_default("_model_module", CONTROLS_MODULE)
            .with_default("_model_module_version", CONTROLS_MODULE_VERSION)
            .with_default("_view_module", CONTROLS_MODULE)
            .with_default("_view_module_version", CONTROLS_MODULE_VERSION)
            .with_default("_view_name", WidgetValue::Null)
            .with_default("source", WidgetValue::Array(Vec::new()))
            .with_default("target", WidgetValue::Array(Vec::new()))
            .with_serializer("source", ModelReferenceSerializer)
            .with_serializer("target", ModelReferenceSerializer);
        Self {
            base,
            bidirectional,
        }
    }

    /// `LinkModel`
    pub fn bidirectional() -> Self {
        Self::build("LinkModel", true)
    }

    /// `DirectionalLinkModel`
    pub fn directional() -> Self {
        Self::build("DirectionalLinkModel", false)
    }
}

impl ModelClass for LinkModelClass {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn defaults(&self) -> AttributeMap {
        self.base.defaults()
    }

    fn serializers(&self) -> &SerializerRegistry {
        self.base.serializers()
    }

    fn initialize(&self, model: &Arc<WidgetModel>) -> WidgetResult<()> {
        let state = Arc::new(LinkState {
            link: Arc::downgrade(model),
            bidirectional: self.bidirectional,
            updating: AtomicBool::new(false),
            bindings: Mutex::new(Vec::new()),
        });

        let rebind = state.clone();
        model.on_some_change(&["source", "target"], move |_| rebind.bind());
        let teardown = state.clone();
        model.on(EventFilter::Destroy, Arc::new(move |_| teardown.unbind()));

        state.bind();
        Ok(())
    }
}

struct LinkState {
    link: Weak<WidgetModel>,
    bidirectional: bool,
    updating: AtomicBool,
    bindings: Mutex<Vec<(Weak<WidgetModel>, SubscriptionId)>>,
}

impl LinkState {
    fn bind(self: &Arc<Self>) {
        self.unbind();
        let Some(link) = self.link.upgrade() else {
            return;
        };
        let (Some((source, source_attr)), Some((target, target_attr))) =
            (endpoint(&link, "source"), endpoint(&link, "target"))
        else {
            log::debug!("链接 {} 的端点不完整，暂不绑定", link.id());
            return;
        };

        self.copy(&source, &source_attr, &target, &target_attr);
        self.follow(&source, &source_attr, &target, &target_attr);
        if self.bidirectional {
            self.follow(&target, &target_attr, &source, &source_attr);
        }

        for end in [&source, &target] {
            let link = self.link.clone();
            let id = end.on(
                EventFilter::Destroy,
                Arc::new(move |_| {
                    if let Some(link) = link.upgrade() {
                        close_later(link);
                    }
                }),
            );
            self.remember(end, id);
        }
        log::debug!(
            "链接 {}: {}.{} -> {}.{}",
            link.id(),
            source.id(),
            source_attr,
            target.id(),
            target_attr
        );
    }

    fn follow(
        self: &Arc<Self>,
        from: &Arc<WidgetModel>,
        from_attr: &str,
        to: &Arc<WidgetModel>,
        to_attr: &str,
    ) {
        let state = self.clone();
        let weak_from = Arc::downgrade(from);
        let weak_to = Arc::downgrade(to);
        let (from_key, to_key) = (from_attr.to_string(), to_attr.to_string());
        let id = from.on_change(from_attr, move |_| {
            if let (Some(from), Some(to)) = (weak_from.upgrade(), weak_to.upgrade()) {
                state.copy(&from, &from_key, &to, &to_key);
            }
        });
        self.remember(from, id);
    }

    fn copy(&self, from: &Arc<WidgetModel>, from_attr: &str, to: &Arc<WidgetModel>, to_attr: &str) {
        if self.updating.swap(true, Ordering::SeqCst) {
            return;
        }
        match from.get(from_attr) {
            Ok(value) => match to.set(to_attr, value) {
                Ok(()) => save_later(to.clone()),
                Err(e) => log::warn!("链接写入 {}.{} 失败: {}", to.id(), to_attr, e),
            },
            Err(e) => log::debug!("链接读取 {}.{} 失败: {}", from.id(), from_attr, e),
        }
        self.updating.store(false, Ordering::SeqCst);
    }

    fn remember(&self, model: &Arc<WidgetModel>, id: SubscriptionId) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Arc::downgrade(model), id));
    }

    fn unbind(&self) {
        let bindings = std::mem::take(
            &mut *self.bindings.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (model, id) in bindings {
            if let Some(model) = model.upgrade() {
                model.off(id);
            }
        }
    }
}

/// 读取 `[模型, 属性名]` 对
fn endpoint(link: &WidgetModel, key: &str) -> Option<(Arc<WidgetModel>, String)> {
    let value = link.get(key).ok()?;
    match value.as_array()? {
        [WidgetValue::Model(model), WidgetValue::String(attr)] => Some((model.clone(), attr.clone())),
        _ => None,
    }
}

fn save_later(model: Arc<WidgetModel>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = model.save_changes().await {
                log::warn!("保存链接目标 {} 失败: {}", model.id(), e);
            }
        });
    }
}

fn close_later(link: Arc<WidgetModel>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { link.close().await });
        }
        Err(_) => log::warn!("没有tokio运行时，链接 {} 无法自动关闭", link.id()),
    }
}
