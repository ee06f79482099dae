use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use widget_sync::manager::{ModuleExports, StaticModuleLoader};
use widget_sync::model::BasicModelClass;
use widget_sync::serializers::{Deserialized, FnSerializer};
use widget_sync::{
    CommMessage, EventFilter, HeadlessEnvironment, KernelComm, ManagerConfig, MemoryComm,
    ModelEvent, WidgetManager, WidgetModel, WidgetValue,
};

const CONTROLS: &str = "@jupyter-widgets/controls";

fn open_message(state: Value) -> CommMessage {
    CommMessage::new(json!({ "state": state, "buffer_paths": [] }))
        .with_metadata(json!({ "version": widget_sync::PROTOCOL_VERSION }))
}

fn update(state: Value) -> CommMessage {
    CommMessage::new(json!({ "method": "update", "state": state }))
}

async fn open_slider(
    manager: &Arc<WidgetManager>,
    comm_id: &str,
    value: i64,
) -> (Arc<WidgetModel>, Arc<MemoryComm>) {
    let kernel = MemoryComm::new(comm_id, "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();
    let model = manager
        .handle_comm_open(
            comm,
            open_message(json!({
                "_model_module": CONTROLS,
                "_model_name": "IntSliderModel",
                "_model_module_version": "2.0.0",
                "value": value
            })),
        )
        .await
        .unwrap();
    (model, kernel)
}

fn headless_manager() -> Arc<WidgetManager> {
    WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new())
}

/// 本地设置5→10后的完整往返：一条update、确认后不再发送、监听者只看到一次变化
#[tokio::test]
async fn test_local_change_round_trip() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "slider", 5).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    model.on_change("value", move |event| {
        if let ModelEvent::Change { new, .. } = event {
            sink.lock().unwrap().push(new.as_i64());
        }
    });

    model.set("value", 10).unwrap();
    model.save_changes().await.unwrap();

    let sent = kernel.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data, json!({"method": "update", "state": {"value": 10}}));
    assert_eq!(model.pending_msgs(), 1);

    kernel.deliver(CommMessage::new(
        json!({"method": "echo_update", "state": {"value": 10}}),
    ));
    model.settled().await;

    assert_eq!(model.pending_msgs(), 0);
    assert!(kernel.take_sent().is_empty());
    assert_eq!(model.get("value").unwrap().as_i64(), Some(10));
    assert_eq!(*seen.lock().unwrap(), vec![Some(10)]);
}

/// 远端更新期间，监听者把同一个值写回，不应产生回声消息
#[tokio::test]
async fn test_echo_suppression_during_remote_update() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "echo", 0).await;

    let writer = Arc::downgrade(&model);
    model.on_change("value", move |event| {
        if let (ModelEvent::Change { new, .. }, Some(model)) = (event, writer.upgrade()) {
            model.set("value", new.clone()).unwrap();
        }
    });

    kernel.deliver(update(json!({"value": 42})));
    model.settled().await;
    model.save_changes().await.unwrap();

    assert_eq!(model.get("value").unwrap().as_i64(), Some(42));
    assert!(model.staged_keys().is_empty());
    assert!(kernel.take_sent().is_empty());
}

/// 未确认期间的多次保存合并为一条消息
#[tokio::test]
async fn test_buffered_saves_flush_after_ack() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "buffered", 0).await;

    model.set("value", 1).unwrap();
    model.save_changes().await.unwrap();
    model.set("min", -5).unwrap();
    model.save_changes().await.unwrap();
    model.set("max", 50).unwrap();
    model.save_changes().await.unwrap();
    assert_eq!(kernel.take_sent().len(), 1);

    kernel.deliver(update(json!({"value": 1})));
    model.settled().await;

    let sent = kernel.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].data,
        json!({"method": "update", "state": {"max": 50, "min": -5}})
    );
}

/// 异步反序列化器完成后才应用状态，且保持消息顺序
#[tokio::test]
async fn test_async_deserializer_keeps_message_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let class = BasicModelClass::new("SlowModel").with_serializer(
        "value",
        FnSerializer::new().on_deserialize(move |value, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let doubled = value.as_i64().unwrap_or(0) * 2;
            Ok(Deserialized::Pending(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(WidgetValue::from(doubled))
            })))
        }),
    );
    let loader = Arc::new(
        StaticModuleLoader::new().with_module("slow-widgets", ModuleExports::new().with_model(class)),
    );
    let manager = WidgetManager::with_loader(
        ManagerConfig::default(),
        HeadlessEnvironment::new(),
        loader.clone(),
    );

    let kernel = MemoryComm::new("slow", "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();
    let model = manager
        .handle_comm_open(
            comm,
            open_message(json!({
                "_model_module": "slow-widgets",
                "_model_name": "SlowModel",
                "_model_module_version": "1.0.0",
                "value": 1
            })),
        )
        .await
        .unwrap();
    assert_eq!(model.get("value").unwrap().as_i64(), Some(2));

    kernel.deliver(update(json!({"value": 3})));
    kernel.deliver(update(json!({"value": 4})));
    model.settled().await;

    assert_eq!(model.get("value").unwrap().as_i64(), Some(8));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(loader.load_count(), 1);
}

/// 二进制属性通过带外缓冲区发送，路径指向原位置
#[tokio::test]
async fn test_binary_attribute_travels_as_buffer() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "binary", 0).await;

    model
        .set("payload", WidgetValue::Object(
            [("data".to_string(), WidgetValue::Bytes(vec![1, 2, 3]))]
                .into_iter()
                .collect(),
        ))
        .unwrap();
    model.save_changes().await.unwrap();

    let sent = kernel.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].buffers, vec![vec![1u8, 2, 3]]);
    assert_eq!(sent[0].data["buffer_paths"], json!([["payload", "data"]]));
}

/// 自定义消息原样转发给监听者
#[tokio::test]
async fn test_custom_message_reaches_listeners() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "custom", 0).await;

    let received = Arc::new(Mutex::new(None));
    let sink = received.clone();
    model.on(
        EventFilter::Custom,
        Arc::new(move |event| {
            if let ModelEvent::CustomMessage { content, buffers } = event {
                *sink.lock().unwrap() = Some((content.clone(), buffers.len()));
            }
        }),
    );

    kernel.deliver(
        CommMessage::new(json!({"method": "custom", "content": {"event": "click"}}))
            .with_buffers(vec![vec![9]]),
    );
    model.settled().await;

    assert_eq!(
        *received.lock().unwrap(),
        Some((json!({"event": "click"}), 1))
    );
}

/// 对端关闭comm后模型关闭、注销，且只收到一次销毁事件
#[tokio::test]
async fn test_remote_close_destroys_model_once() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "closing", 0).await;

    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    model.on(
        EventFilter::Destroy,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    kernel.remote_close();
    model.settled().await;
    model.close().await;

    assert!(model.is_closed());
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(!manager.has_model("closing"));
    assert_eq!(kernel.close_count(), 0);
    assert!(model.get("value").is_err());
}

/// 每次反序列化 `value` 都要等待 `delay` 的模型类，原样返回数值
fn slow_manager(delay: Duration) -> Arc<WidgetManager> {
    let class = BasicModelClass::new("LaggyModel").with_serializer(
        "value",
        FnSerializer::new().on_deserialize(move |value, _| {
            Ok(Deserialized::Pending(Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })))
        }),
    );
    let loader = Arc::new(
        StaticModuleLoader::new().with_module("laggy-widgets", ModuleExports::new().with_model(class)),
    );
    WidgetManager::with_loader(ManagerConfig::default(), HeadlessEnvironment::new(), loader)
}

fn laggy_open(value: i64) -> CommMessage {
    open_message(json!({
        "_model_module": "laggy-widgets",
        "_model_name": "LaggyModel",
        "_model_module_version": "1.0.0",
        "value": value
    }))
}

/// 远端update反序列化期间的本地写入不被覆盖，下次保存时发出
#[tokio::test]
async fn test_local_set_during_remote_deserialize_survives() {
    let manager = slow_manager(Duration::from_millis(30));
    let kernel = MemoryComm::new("laggy", "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();
    let model = manager.handle_comm_open(comm, laggy_open(1)).await.unwrap();

    kernel.deliver(update(json!({"value": 3})));
    tokio::time::sleep(Duration::from_millis(5)).await;
    model.set("value", 99).unwrap();
    model.settled().await;

    assert_eq!(model.get("value").unwrap().as_i64(), Some(99));
    assert_eq!(model.staged_keys(), vec!["value".to_string()]);

    model.save_changes().await.unwrap();
    let sent = kernel.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data, json!({"method": "update", "state": {"value": 99}}));
}

/// update确认不会丢掉尚未保存的同名本地写入
#[tokio::test]
async fn test_ack_keeps_unsaved_local_write() {
    let manager = headless_manager();
    let (model, kernel) = open_slider(&manager, "unsaved", 0).await;

    model.set("value", 2).unwrap();
    model.save_changes().await.unwrap();
    assert_eq!(kernel.take_sent().len(), 1);
    model.set("value", 5).unwrap();

    kernel.deliver(update(json!({"value": 2})));
    model.settled().await;

    assert_eq!(model.pending_msgs(), 0);
    assert_eq!(model.get("value").unwrap().as_i64(), Some(5));

    model.save_changes().await.unwrap();
    let sent = kernel.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data, json!({"method": "update", "state": {"value": 5}}));
}

/// 构造期间到达的update在模型就绪后按序应用
#[tokio::test]
async fn test_update_during_construction_is_applied() {
    let manager = slow_manager(Duration::from_millis(30));
    let kernel = MemoryComm::new("early", "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();

    let (model, _) = tokio::join!(manager.handle_comm_open(comm, laggy_open(1)), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        kernel.deliver(update(json!({"value": 7})));
    });
    let model = model.unwrap();

    assert_eq!(model.get("value").unwrap().as_i64(), Some(7));
    assert!(manager.has_model("early"));
    assert!(kernel.take_sent().is_empty());
}

/// 构造期间对端关闭comm：模型以关闭状态返回，不注册，也不回送关闭
#[tokio::test]
async fn test_remote_close_during_construction_closes_model() {
    let manager = slow_manager(Duration::from_millis(30));
    let kernel = MemoryComm::new("gone", "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();

    let (model, _) = tokio::join!(manager.handle_comm_open(comm, laggy_open(1)), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        kernel.deliver(update(json!({"value": 7})));
        kernel.remote_close();
    });
    let model = model.unwrap();

    assert!(model.is_closed());
    assert!(!manager.has_model("gone"));
    assert_eq!(kernel.close_count(), 0);
    assert!(manager.get_model("gone").await.is_err());
}
