// widget-replay：在无头环境里回放一段comm事件脚本，输出最终的管理器快照
//
// 用法: widget-replay <script.json> [config.json]
//
// 脚本格式:
// { "events": [
//     { "type": "open",    "comm_id": "a", "data": {...}, "buffers": ["<base64>"] },
//     { "type": "msg",     "comm_id": "a", "data": {...}, "buffers": [] },
//     { "type": "set",     "model_id": "a", "state": {...} },
//     { "type": "display", "model_id": "a" },
//     { "type": "close",   "comm_id": "a" }
// ] }

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use widget_sync::value::attributes_from_json;
use widget_sync::{
    CommMessage, DisplayOptions, HeadlessEnvironment, KernelComm, ManagerConfig, MemoryComm,
    WidgetManager,
};

#[derive(Debug, Deserialize)]
struct ReplayScript {
    events: Vec<ReplayEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayEvent {
    Open {
        comm_id: String,
        data: Value,
        #[serde(default)]
        buffers: Vec<String>,
    },
    Msg {
        comm_id: String,
        data: Value,
        #[serde(default)]
        buffers: Vec<String>,
    },
    Set {
        model_id: String,
        state: Map<String, Value>,
    },
    Display {
        model_id: String,
    },
    Close {
        comm_id: String,
    },
}

fn decode_buffers(buffers: &[String]) -> Result<Vec<Vec<u8>>, base64::DecodeError> {
    buffers.iter().map(|b| STANDARD.decode(b.as_bytes())).collect()
}

async fn replay(
    manager: &Arc<WidgetManager>,
    environment: &Arc<HeadlessEnvironment>,
    script: ReplayScript,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut comms: HashMap<String, Arc<MemoryComm>> = HashMap::new();

    for (index, event) in script.events.into_iter().enumerate() {
        log::debug!("回放事件 #{}: {:?}", index, event);
        match event {
            ReplayEvent::Open {
                comm_id,
                data,
                buffers,
            } => {
                let comm = MemoryComm::new(comm_id.clone(), manager.config().comm_target_name.clone());
                environment.track_comm(comm.clone());
                comms.insert(comm_id, comm.clone());
                let message = CommMessage::new(data).with_buffers(decode_buffers(&buffers)?);
                let kernel: Arc<dyn KernelComm> = comm;
                if let Err(e) = manager.handle_comm_open(kernel, message).await {
                    log::error!("事件 #{} 打开widget失败: {}", index, e);
                }
            }
            ReplayEvent::Msg {
                comm_id,
                data,
                buffers,
            } => match comms.get(&comm_id) {
                Some(comm) => {
                    comm.deliver(CommMessage::new(data).with_buffers(decode_buffers(&buffers)?));
                    if let Some(model) = manager.try_get_model(&comm_id) {
                        model.settled().await;
                    }
                }
                None => log::warn!("事件 #{} 引用了未知comm {}", index, comm_id),
            },
            ReplayEvent::Set { model_id, state } => {
                let model = manager.get_model(&model_id).await?;
                model.set_attributes(
                    attributes_from_json(state),
                    widget_sync::ChangeOrigin::local(),
                )?;
                if let Err(e) = model.save_changes().await {
                    log::error!("事件 #{} 保存模型 {} 失败: {}", index, model_id, e);
                }
            }
            ReplayEvent::Display { model_id } => {
                let model = manager.get_model(&model_id).await?;
                if let Err(e) = manager.display_model(&model, DisplayOptions::default()).await {
                    log::error!("事件 #{} 显示模型 {} 失败: {}", index, model_id, e);
                }
            }
            ReplayEvent::Close { comm_id } => match comms.get(&comm_id) {
                Some(comm) => {
                    comm.remote_close();
                    if let Some(model) = manager.try_get_model(&comm_id) {
                        model.settled().await;
                    }
                }
                None => log::warn!("事件 #{} 引用了未知comm {}", index, comm_id),
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <script.json> [config.json]", args[0]);
        std::process::exit(2);
    }

    let config = match args.get(2) {
        Some(path) => ManagerConfig::from_json_file(path)?,
        None => ManagerConfig::default(),
    };
    widget_sync::init_logging_with(&config);
    log::info!("widget-replay {} (协议 {})", widget_sync::VERSION, config.protocol_version);

    let content = std::fs::read_to_string(&args[1])?;
    let script: ReplayScript = serde_json::from_str(&content)?;
    log::info!("加载 {} 个事件", script.events.len());

    let environment = HeadlessEnvironment::new();
    let manager = WidgetManager::new(config, environment.clone());

    replay(&manager, &environment, script).await?;

    let snapshot = manager.export_state()?;
    println!("{}", serde_json::to_string_pretty(&snapshot.to_json()?)?);
    for handle in environment.displayed() {
        log::info!("已显示视图 {} -> 模型 {}", handle.view_id, handle.model_id);
    }

    manager.shutdown().await;
    Ok(())
}
