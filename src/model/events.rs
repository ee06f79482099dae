/// 模型事件系统
///
/// 每个模型拥有自己的事件中心（发布-订阅），视图和链接通过订阅来响应
/// 属性变化、自定义消息和生命周期事件。订阅返回ID，可随时取消。
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::value::WidgetValue;
use crate::view::ViewId;

/// 变化来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// 本地set，可选记录发起变化的视图
    Local { updated_view: Option<ViewId> },
    /// 来自对端的update
    Remote,
}

impl ChangeOrigin {
    pub fn local() -> Self {
        ChangeOrigin::Local { updated_view: None }
    }

    pub fn from_view(view: ViewId) -> Self {
        ChangeOrigin::Local {
            updated_view: Some(view),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ChangeOrigin::Remote)
    }

    pub fn updated_view(&self) -> Option<&ViewId> {
        match self {
            ChangeOrigin::Local { updated_view } => updated_view.as_ref(),
            ChangeOrigin::Remote => None,
        }
    }
}

/// 模型事件
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// `change:<name>`
    Change {
        name: String,
        old: Option<WidgetValue>,
        new: WidgetValue,
        origin: ChangeOrigin,
    },
    /// 一批变化结束后触发一次
    ChangeBatch {
        names: Vec<String>,
        origin: ChangeOrigin,
    },
    /// `msg:custom`
    CustomMessage {
        content: Value,
        buffers: Vec<Vec<u8>>,
    },
    /// 本地发送失败（已回滚到暂存区）
    SyncFailed { message: String },
    /// `comm:close`
    CommClosed,
    /// `destroy`
    Destroy,
}

impl ModelEvent {
    /// 事件名（与前端事件命名一致）
    pub fn name(&self) -> String {
        match self {
            ModelEvent::Change { name, .. } => format!("change:{}", name),
            ModelEvent::ChangeBatch { .. } => "change".to_string(),
            ModelEvent::CustomMessage { .. } => "msg:custom".to_string(),
            ModelEvent::SyncFailed { .. } => "sync:failed".to_string(),
            ModelEvent::CommClosed => "comm:close".to_string(),
            ModelEvent::Destroy => "destroy".to_string(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// 单个属性的变化
    Change(String),
    /// 任意属性变化的批次事件
    AnyChange,
    /// 批次中包含任一指定属性
    SomeChange(Vec<String>),
    Custom,
    SyncFailed,
    CommClosed,
    Destroy,
}

impl EventFilter {
    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &ModelEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Change(wanted), ModelEvent::Change { name, .. }) => wanted == name,
            (EventFilter::AnyChange, ModelEvent::ChangeBatch { .. }) => true,
            (EventFilter::SomeChange(keys), ModelEvent::ChangeBatch { names, .. }) => {
                names.iter().any(|n| keys.contains(n))
            }
            (EventFilter::Custom, ModelEvent::CustomMessage { .. }) => true,
            (EventFilter::SyncFailed, ModelEvent::SyncFailed { .. }) => true,
            (EventFilter::CommClosed, ModelEvent::CommClosed) => true,
            (EventFilter::Destroy, ModelEvent::Destroy) => true,
            _ => false,
        }
    }
}

/// 订阅ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&ModelEvent) + Send + Sync>;

struct Subscription {
    filter: EventFilter,
    handler: EventHandler,
}

/// 事件中心
///
/// emit时先复制匹配的处理器列表再逐个调用，处理器内部可以安全地
/// 订阅、取消订阅或再次修改模型。
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscription { filter, handler });
        id
    }

    /// 取消订阅，返回订阅是否存在
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn emit(&self, event: &ModelEvent) {
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.filter.matches(event))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn clear(&self) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn batch(names: &[&str]) -> ModelEvent {
        ModelEvent::ChangeBatch {
            names: names.iter().map(|s| s.to_string()).collect(),
            origin: ChangeOrigin::Remote,
        }
    }

    #[test]
    fn test_filter_matching() {
        let change = ModelEvent::Change {
            name: "value".to_string(),
            old: None,
            new: WidgetValue::from(1),
            origin: ChangeOrigin::local(),
        };
        assert!(EventFilter::Change("value".to_string()).matches(&change));
        assert!(!EventFilter::Change("other".to_string()).matches(&change));
        assert!(!EventFilter::AnyChange.matches(&change));
        assert!(EventFilter::SomeChange(vec!["b".to_string()]).matches(&batch(&["a", "b"])));
        assert!(!EventFilter::SomeChange(vec!["c".to_string()]).matches(&batch(&["a", "b"])));
        assert_eq!(change.name(), "change:value");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = hub.subscribe(
            EventFilter::Destroy,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        hub.emit(&ModelEvent::Destroy);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&ModelEvent::Destroy);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let hub = Arc::new(EventHub::new());
        let inner = hub.clone();
        hub.subscribe(
            EventFilter::CommClosed,
            Arc::new(move |_| {
                inner.subscribe(EventFilter::All, Arc::new(|_| {}));
            }),
        );
        hub.emit(&ModelEvent::CommClosed);
        assert_eq!(hub.subscriber_count(), 2);
    }
}
