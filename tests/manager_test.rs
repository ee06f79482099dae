use serde_json::{json, Value};
use std::sync::Arc;

use widget_sync::error::ClassNotFoundReason;
use widget_sync::manager::ModelOptions;
use widget_sync::{
    AttributeMap, CommMessage, DisplayOptions, HeadlessEnvironment, KernelComm, ManagerConfig,
    ManagerSnapshot, MemoryComm, WidgetError, WidgetManager, WidgetModel, WidgetValue,
};

const CONTROLS: &str = "@jupyter-widgets/controls";

fn open_message(state: Value) -> CommMessage {
    CommMessage::new(json!({ "state": state }))
        .with_metadata(json!({ "version": widget_sync::PROTOCOL_VERSION }))
}

async fn open(
    manager: &Arc<WidgetManager>,
    comm_id: &str,
    state: Value,
) -> (Result<Arc<WidgetModel>, WidgetError>, Arc<MemoryComm>) {
    let kernel = MemoryComm::new(comm_id, "jupyter.widget");
    let comm: Arc<dyn KernelComm> = kernel.clone();
    (manager.handle_comm_open(comm, open_message(state)).await, kernel)
}

fn slider_state(value: i64) -> Value {
    json!({
        "_model_module": CONTROLS,
        "_model_name": "IntSliderModel",
        "_model_module_version": "2.0.0",
        "value": value
    })
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    check()
}

#[tokio::test]
async fn test_unknown_module_without_loader_is_class_not_found() {
    let manager = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let (result, kernel) = open(
        &manager,
        "foo",
        json!({
            "_model_module": "foo-widgets",
            "_model_name": "FooModel",
            "_model_module_version": "1.0.0"
        }),
    )
    .await;

    match result {
        Err(WidgetError::ClassNotFound { module, reason, .. }) => {
            assert_eq!(module, "foo-widgets");
            assert_eq!(reason, ClassNotFoundReason::NoLoader);
        }
        other => panic!("expected ClassNotFound, got {:?}", other.map(|m| m.id().to_string())),
    }
    assert_eq!(kernel.close_count(), 1);
    assert!(!manager.has_model("foo"));
}

#[tokio::test]
async fn test_box_children_resolve_to_models() {
    let manager = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let (slider, _) = open(&manager, "s1", slider_state(3)).await;
    let slider = slider.unwrap();
    let (hbox, _) = open(
        &manager,
        "box",
        json!({
            "_model_module": CONTROLS,
            "_model_name": "HBoxModel",
            "_model_module_version": "2.0.0",
            "children": ["IPY_MODEL_s1"]
        }),
    )
    .await;
    let hbox = hbox.unwrap();

    let children = hbox.get("children").unwrap();
    match children.as_array() {
        Some([WidgetValue::Model(child)]) => assert!(Arc::ptr_eq(child, &slider)),
        other => panic!("unexpected children {:?}", other),
    }
    let exported = hbox.export_state().unwrap();
    assert_eq!(exported.state["children"], json!(["IPY_MODEL_s1"]));
}

#[tokio::test]
async fn test_snapshot_round_trip_rebuilds_references() {
    let source = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    open(&source, "s1", slider_state(7)).await.0.unwrap();
    open(
        &source,
        "box",
        json!({
            "_model_module": CONTROLS,
            "_model_name": "VBoxModel",
            "_model_module_version": "2.0.0",
            "children": ["IPY_MODEL_s1"]
        }),
    )
    .await
    .0
    .unwrap();

    let snapshot = source.export_state().unwrap();
    assert_eq!(snapshot.state.len(), 2);
    let text = serde_json::to_string(&snapshot.to_json().unwrap()).unwrap();

    // "box" 排在 "s1" 之前导入，引用仍然能解析
    let target = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let restored = ManagerSnapshot::from_json(serde_json::from_str(&text).unwrap()).unwrap();
    let models = target.import_state(restored).await.unwrap();
    assert_eq!(models.len(), 2);

    let vbox = target.get_model("box").await.unwrap();
    let slider = target.get_model("s1").await.unwrap();
    assert_eq!(slider.get("value").unwrap().as_i64(), Some(7));
    assert!(slider.comm().is_none());
    match vbox.get("children").unwrap().as_array() {
        Some([WidgetValue::Model(child)]) => assert!(Arc::ptr_eq(child, &slider)),
        other => panic!("unexpected children {:?}", other),
    }
}

#[tokio::test]
async fn test_new_widget_opens_comm_with_full_state() {
    let environment = HeadlessEnvironment::new();
    let manager = WidgetManager::new(ManagerConfig::default(), environment.clone());

    let mut state = AttributeMap::new();
    state.insert("value".to_string(), WidgetValue::from(3));
    let model = manager
        .new_widget(
            ModelOptions::new(CONTROLS, "IntSliderModel")
                .with_version("2.0.0")
                .with_id("w1"),
            state,
        )
        .await
        .unwrap();
    assert_eq!(model.id(), "w1");

    let kernel = environment.comm("w1").unwrap();
    let opened = kernel.open_message().unwrap();
    assert_eq!(opened.data["state"]["_model_name"], json!("IntSliderModel"));
    assert_eq!(opened.data["state"]["value"], json!(3));
    assert_eq!(opened.data["state"]["max"], json!(100));
    assert_eq!(opened.metadata["version"], json!(widget_sync::PROTOCOL_VERSION));
}

#[tokio::test]
async fn test_reconcile_closes_models_with_lost_comms() {
    let environment = HeadlessEnvironment::new();
    let manager = WidgetManager::new(ManagerConfig::default(), environment.clone());

    let (kept, kept_comm) = open(&manager, "kept", slider_state(1)).await;
    let kept = kept.unwrap();
    environment.track_comm(kept_comm);
    let (lost, _) = open(&manager, "lost", slider_state(2)).await;
    let lost = lost.unwrap();
    environment.track_comm(MemoryComm::new("orphan", "jupyter.widget"));

    let report = manager.reconcile_comms().await.unwrap();
    assert_eq!(report.closed_models, vec!["lost".to_string()]);
    assert_eq!(report.unknown_comms, vec!["orphan".to_string()]);
    assert!(lost.is_closed());
    assert!(!kept.is_closed());
}

#[tokio::test]
async fn test_display_then_close_removes_view() {
    let environment = HeadlessEnvironment::new();
    let manager = WidgetManager::new(ManagerConfig::default(), environment.clone());
    let (slider, _) = open(&manager, "shown", slider_state(4)).await;
    let slider = slider.unwrap();

    let handle = manager
        .display_model(&slider, DisplayOptions::default().with_target("output-1"))
        .await
        .unwrap();
    assert_eq!(handle.model_id, "shown");
    assert_eq!(environment.displayed().len(), 1);

    let views = slider.views();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].class_name(), "IntSliderView");

    slider.close().await;
    assert!(views[0].is_removed());
    assert!(!manager.has_model("shown"));
}

#[tokio::test]
async fn test_link_propagates_and_saves_target() {
    let manager = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let (a, _) = open(&manager, "a", slider_state(1)).await;
    let a = a.unwrap();
    let (b, b_comm) = open(&manager, "b", slider_state(1)).await;
    let b = b.unwrap();
    let (link, _) = open(
        &manager,
        "link",
        json!({
            "_model_module": CONTROLS,
            "_model_name": "DirectionalLinkModel",
            "_model_module_version": "2.0.0",
            "source": ["IPY_MODEL_a", "value"],
            "target": ["IPY_MODEL_b", "value"]
        }),
    )
    .await;
    let link = link.unwrap();

    a.set("value", 7).unwrap();
    assert_eq!(b.get("value").unwrap().as_i64(), Some(7));
    assert!(wait_for(|| !b_comm.sent_messages().is_empty()).await);
    assert_eq!(
        b_comm.sent_messages()[0].data,
        json!({"method": "update", "state": {"value": 7}})
    );

    b.close().await;
    assert!(wait_for(|| link.is_closed()).await);
    assert!(!a.is_closed());
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let manager = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let (slider, kernel) = open(&manager, "s", slider_state(0)).await;
    let slider = slider.unwrap();

    manager.shutdown().await;
    assert!(slider.is_closed());
    assert_eq!(kernel.close_count(), 1);
    assert!(manager.model_ids().is_empty());

    let (result, late) = open(&manager, "late", slider_state(0)).await;
    assert!(result.is_err());
    assert_eq!(late.close_count(), 1);
}

#[tokio::test]
async fn test_duplicate_id_closes_redundant_comm() {
    let manager = WidgetManager::new(ManagerConfig::default(), HeadlessEnvironment::new());
    let (first, first_comm) = open(&manager, "dup", slider_state(1)).await;
    let first = first.unwrap();

    let extra = MemoryComm::new("dup-extra", "jupyter.widget");
    let comm: Arc<dyn KernelComm> = extra.clone();
    let again = manager
        .new_model(
            ModelOptions::new(CONTROLS, "IntSliderModel").with_id("dup"),
            AttributeMap::new(),
            Some(comm),
        )
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(extra.close_count(), 1);
    assert_eq!(first_comm.close_count(), 0);
    assert!(!first.is_closed());
    assert_eq!(first.get("value").unwrap().as_i64(), Some(1));
}
