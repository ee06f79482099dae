// 核心模块
pub mod comm;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod serializers;
pub mod value;
pub mod view;
pub mod widgets;

// 重新导出主要类型
pub use comm::{CommMessage, CommShim, KernelComm, MemoryComm, SerializedState, WidgetMessage};
pub use config::{ConfigError, ManagerConfig};
pub use error::{ErrorKind, WidgetError, WidgetResult};
pub use manager::{
    DisplayOptions, HeadlessEnvironment, ManagerSnapshot, ModelOptions, WidgetEnvironment,
    WidgetManager,
};
pub use model::{ChangeOrigin, EventFilter, ModelEvent, WidgetModel};
pub use serializers::{AttributeSerializer, SerializerRegistry};
pub use value::{AttributeMap, WidgetValue};
pub use view::{ViewId, WidgetView};

/// 库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 本端实现的widget消息协议版本
pub const PROTOCOL_VERSION: &str = "2.1.0";

/// 初始化日志系统，`RUST_LOG` 未设置时使用 info 级别
pub fn init_logging() {
    init_logging_with(&ManagerConfig::default());
}

/// 按配置中的日志级别初始化日志系统，重复调用时忽略
pub fn init_logging_with(config: &ManagerConfig) {
    let level = config
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
