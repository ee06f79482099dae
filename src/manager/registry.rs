/// 类注册表
///
/// 把 (模块, 导出名) 映射到模型类或视图类。解析顺序：
/// 1. 已缓存的解析结果
/// 2. 内置模块
/// 3. 可注入的动态加载器（给定模块名和版本，返回模块的导出表）
///
/// 动态加载的模块按 (模块, 版本) 缓存，类按 (模块, 导出名, 版本) 缓存。
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use url::Url;

use crate::config::ManagerConfig;
use crate::error::{ClassNotFoundReason, WidgetError, WidgetResult};
use crate::model::ModelClass;
use crate::view::ViewClass;

/// 模块导出的类
#[derive(Clone)]
pub enum WidgetClass {
    Model(Arc<dyn ModelClass>),
    View(Arc<dyn ViewClass>),
}

impl WidgetClass {
    pub fn kind(&self) -> &'static str {
        match self {
            WidgetClass::Model(_) => "model",
            WidgetClass::View(_) => "view",
        }
    }
}

impl fmt::Debug for WidgetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetClass::Model(class) => write!(f, "Model({})", class.name()),
            WidgetClass::View(class) => write!(f, "View({})", class.name()),
        }
    }
}

/// 模块导出表
#[derive(Clone, Default, Debug)]
pub struct ModuleExports {
    exports: HashMap<String, WidgetClass>,
}

impl ModuleExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model<C: ModelClass + 'static>(mut self, class: C) -> Self {
        self.exports
            .insert(class.name().to_string(), WidgetClass::Model(Arc::new(class)));
        self
    }

    pub fn with_view<C: ViewClass + 'static>(mut self, class: C) -> Self {
        self.exports
            .insert(class.name().to_string(), WidgetClass::View(Arc::new(class)));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, class: WidgetClass) {
        self.exports.insert(name.into(), class);
    }

    pub fn get(&self, name: &str) -> Option<&WidgetClass> {
        self.exports.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// 动态加载请求
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRequest {
    pub module: String,
    pub version: String,
    /// 按CDN规则计算出的模块地址
    pub url: Option<Url>,
    /// 只允许从CDN加载
    pub cdn_only: bool,
}

/// 动态模块加载器，由嵌入环境注入
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, request: &ModuleRequest) -> WidgetResult<ModuleExports>;
}

/// 预先登记模块的加载器，记录加载次数
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: RwLock<HashMap<String, ModuleExports>>,
    loads: AtomicUsize,
    requests: RwLock<Vec<ModuleRequest>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, module: impl Into<String>, exports: ModuleExports) -> Self {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.into(), exports);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModuleRequest> {
        self.requests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, request: &ModuleRequest) -> WidgetResult<ModuleExports> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.module)
            .cloned()
            .ok_or_else(|| {
                WidgetError::transport(format!("no module named {}", request.module), None)
            })
    }
}

type ClassKey = (String, String, String);

/// 类注册表
pub struct ClassRegistry {
    config: ManagerConfig,
    builtins: RwLock<HashMap<String, ModuleExports>>,
    loader: Option<Arc<dyn ModuleLoader>>,
    classes: RwLock<HashMap<ClassKey, WidgetClass>>,
    /// 同一模块的并发加载在这里排队，避免重复加载
    modules: tokio::sync::Mutex<HashMap<(String, String), ModuleExports>>,
}

impl ClassRegistry {
    pub fn new(config: ManagerConfig, loader: Option<Arc<dyn ModuleLoader>>) -> Self {
        Self {
            config,
            builtins: RwLock::new(HashMap::new()),
            loader,
            classes: RwLock::new(HashMap::new()),
            modules: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 注册内置模块
    pub fn register_builtin(&self, module: impl Into<String>, exports: ModuleExports) {
        let module = module.into();
        log::debug!("注册内置模块: {} ({} 个导出)", module, exports.len());
        self.builtins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module, exports);
    }

    pub fn builtin_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builtins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    /// 解析类
    pub async fn resolve(&self, module: &str, name: &str, version: &str) -> WidgetResult<WidgetClass> {
        let key = (module.to_string(), name.to_string(), version.to_string());
        if let Some(class) = self
            .classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(class.clone());
        }

        let builtin = self
            .builtins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .map(|exports| exports.get(name).cloned());

        let class = match builtin {
            Some(Some(class)) => class,
            Some(None) => {
                return Err(WidgetError::class_not_found(
                    module,
                    name,
                    version,
                    ClassNotFoundReason::ExportNotFound,
                ))
            }
            None => {
                let exports = self.load_module(module, name, version).await?;
                exports.get(name).cloned().ok_or_else(|| {
                    WidgetError::class_not_found(
                        module,
                        name,
                        version,
                        ClassNotFoundReason::ExportNotFound,
                    )
                })?
            }
        };

        self.classes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, class.clone());
        Ok(class)
    }

    async fn load_module(&self, module: &str, name: &str, version: &str) -> WidgetResult<ModuleExports> {
        let loader = self.loader.as_ref().ok_or_else(|| {
            WidgetError::class_not_found(module, name, version, ClassNotFoundReason::NoLoader)
        })?;

        let mut modules = self.modules.lock().await;
        let module_key = (module.to_string(), version.to_string());
        if let Some(exports) = modules.get(&module_key) {
            return Ok(exports.clone());
        }

        let url = match self.config.module_url(module, version) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("无法计算模块 {}@{} 的地址: {}", module, version, e);
                None
            }
        };
        let request = ModuleRequest {
            module: module.to_string(),
            version: version.to_string(),
            url,
            cdn_only: self.config.only_cdn,
        };

        log::info!("动态加载模块: {}@{}", module, version);
        let exports = loader.load(&request).await.map_err(|e| {
            WidgetError::class_not_found_with_source(
                module,
                name,
                version,
                ClassNotFoundReason::ModuleNotFound,
                Box::new(e),
            )
        })?;
        modules.insert(module_key, exports.clone());
        Ok(exports)
    }

    /// 清空解析缓存（内置模块保留）
    pub async fn clear_cache(&self) {
        self.classes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.modules.lock().await.clear();
    }

    pub fn cached_classes(&self) -> usize {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("builtins", &self.builtin_modules())
            .field("has_loader", &self.has_loader())
            .field("cached_classes", &self.cached_classes())
            .finish()
    }
}
