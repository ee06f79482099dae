// Comm传输适配层
//
// 把嵌入环境提供的通用双向消息通道（open/send/close + 消息/关闭回调）
// 适配为widget协议使用的统一接口：
// - KernelComm：环境实现的原始通道
// - CommShim：协议侧使用的包装，负责消息编码、存活状态和幂等关闭
// - MemoryComm：进程内通道，用于无头运行和测试

pub mod buffers;
pub mod memory;
pub mod message;

pub use buffers::{put_buffers, remove_buffers};
pub use memory::MemoryComm;
pub use message::{
    BufferPath, CommMessage, OpenMessage, PathSegment, SerializedState, WidgetMessage,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{WidgetError, WidgetResult};

/// 消息回调
pub type MessageCallback = Arc<dyn Fn(CommMessage) + Send + Sync>;
/// 关闭回调，参数为对端关闭时附带的消息
pub type CloseCallback = Arc<dyn Fn(Option<CommMessage>) + Send + Sync>;

/// 内核通道抽象
///
/// 由嵌入环境实现。回调在通道收到消息或被对端关闭时调用，
/// 调用方保证同一通道上的消息按接收顺序回调。
#[async_trait]
pub trait KernelComm: Send + Sync {
    /// 通道ID
    fn comm_id(&self) -> &str;

    /// 目标名称（如 "jupyter.widget"）
    fn target_name(&self) -> &str;

    /// 打开通道并发送初始数据
    async fn open(&self, message: CommMessage) -> WidgetResult<()>;

    /// 发送消息
    async fn send(&self, message: CommMessage) -> WidgetResult<()>;

    /// 关闭通道
    async fn close(&self, message: Option<CommMessage>) -> WidgetResult<()>;

    /// 注册消息回调
    fn on_msg(&self, callback: MessageCallback);

    /// 注册关闭回调
    fn on_close(&self, callback: CloseCallback);
}

/// Comm统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
}

/// widget协议侧的comm包装
pub struct CommShim {
    comm: Arc<dyn KernelComm>,
    closed: Arc<AtomicBool>,
    messages_sent: AtomicU64,
    messages_received: Arc<AtomicU64>,
    send_failures: AtomicU64,
}

impl CommShim {
    /// 包装一个内核通道
    pub fn new(comm: Arc<dyn KernelComm>) -> Arc<Self> {
        let shim = Arc::new(Self {
            comm,
            closed: Arc::new(AtomicBool::new(false)),
            messages_sent: AtomicU64::new(0),
            messages_received: Arc::new(AtomicU64::new(0)),
            send_failures: AtomicU64::new(0),
        });

        // 对端关闭时立即标记，之后的发送直接失败
        let closed = shim.closed.clone();
        shim.comm.on_close(Arc::new(move |_| {
            closed.store(true, Ordering::SeqCst);
        }));

        shim
    }

    pub fn comm_id(&self) -> &str {
        self.comm.comm_id()
    }

    pub fn target_name(&self) -> &str {
        self.comm.target_name()
    }

    /// 是否包装的是同一个内核通道
    pub fn wraps(&self, comm: &Arc<dyn KernelComm>) -> bool {
        Arc::as_ptr(&self.comm) as *const () == Arc::as_ptr(comm) as *const ()
    }

    /// 通道是否仍然可用
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// 打开通道
    pub async fn open(&self, message: OpenMessage) -> WidgetResult<()> {
        self.ensure_live("open")?;
        log::debug!("打开comm: {} ({})", self.comm_id(), self.target_name());
        self.comm.open(message.into_comm_message()).await
    }

    /// 发送widget协议消息
    pub async fn send(&self, message: WidgetMessage) -> WidgetResult<()> {
        self.ensure_live(message.method())?;
        let method = message.method().to_string();
        match self.comm.send(message.into_comm_message()).await {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                log::trace!("comm {} 发送 {} 消息", self.comm_id(), method);
                Ok(())
            }
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("comm {} 发送 {} 消息失败: {}", self.comm_id(), method, e);
                Err(e)
            }
        }
    }

    /// 关闭通道（幂等）
    pub async fn close(&self) -> WidgetResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("关闭comm: {}", self.comm_id());
        self.comm.close(None).await
    }

    /// 标记为已被对端关闭，不再向对端发送关闭消息
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// 注册入站消息回调
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(CommMessage) + Send + Sync + 'static,
    {
        let received = self.messages_received.clone();
        self.comm.on_msg(Arc::new(move |message| {
            received.fetch_add(1, Ordering::Relaxed);
            handler(message);
        }));
    }

    /// 注册对端关闭回调
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(Option<CommMessage>) + Send + Sync + 'static,
    {
        self.comm.on_close(Arc::new(handler));
    }

    pub fn stats(&self) -> CommStats {
        CommStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    fn ensure_live(&self, operation: &str) -> WidgetResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(WidgetError::transport(
                format!("cannot {} on a closed comm", operation),
                Some(self.comm_id().to_string()),
            ))
        }
    }
}

impl std::fmt::Debug for CommShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommShim")
            .field("comm_id", &self.comm_id())
            .field("target_name", &self.target_name())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_shim_close_is_idempotent() {
        let kernel = MemoryComm::new("comm-1", "jupyter.widget");
        let shim = CommShim::new(kernel.clone());

        shim.close().await.unwrap();
        shim.close().await.unwrap();

        assert!(!shim.is_live());
        assert_eq!(kernel.close_count(), 1);
    }

    #[tokio::test]
    async fn test_shim_rejects_send_after_remote_close() {
        let kernel = MemoryComm::new("comm-2", "jupyter.widget");
        let shim = CommShim::new(kernel.clone());

        kernel.remote_close();
        let err = shim.send(WidgetMessage::Display).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        // 对端已关闭，不再回送关闭消息
        shim.close().await.unwrap();
        assert_eq!(kernel.close_count(), 0);
    }

    #[tokio::test]
    async fn test_shim_counts_traffic() {
        let kernel = MemoryComm::new("comm-3", "jupyter.widget");
        let shim = CommShim::new(kernel.clone());
        shim.on_message(|_| {});

        shim.send(WidgetMessage::RequestState).await.unwrap();
        kernel.deliver(CommMessage::new(json!({"method": "display"})));

        let stats = shim.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(kernel.sent_messages()[0].method(), Some("request_state"));
    }

    #[test]
    fn test_wraps_identifies_kernel_comm() {
        let kernel = MemoryComm::new("comm-4", "jupyter.widget");
        let comm: Arc<dyn KernelComm> = kernel.clone();
        let other: Arc<dyn KernelComm> = MemoryComm::new("comm-4", "jupyter.widget");
        let shim = CommShim::new(comm.clone());

        assert!(shim.wraps(&comm));
        assert!(!shim.wraps(&other));
    }
}
