/// 进程内comm通道
///
/// 记录所有发出的消息，允许测试或无头环境注入入站消息和模拟对端关闭。
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{CloseCallback, CommMessage, KernelComm, MessageCallback};
use crate::error::{WidgetError, WidgetResult};

pub struct MemoryComm {
    comm_id: String,
    target_name: String,
    opened: Mutex<Option<CommMessage>>,
    sent: Mutex<Vec<CommMessage>>,
    msg_callbacks: Mutex<Vec<MessageCallback>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MemoryComm {
    pub fn new(comm_id: impl Into<String>, target_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            comm_id: comm_id.into(),
            target_name: target_name.into(),
            opened: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            msg_callbacks: Mutex::new(Vec::new()),
            close_callbacks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// 模拟对端发来一条消息
    pub fn deliver(&self, message: CommMessage) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("comm {} 已关闭，丢弃入站消息", self.comm_id);
            return;
        }
        let callbacks = self
            .msg_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(message.clone());
        }
    }

    /// 模拟对端关闭通道
    pub fn remote_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self
            .close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(None);
        }
    }

    /// 让之后的发送失败（用于注入传输错误）
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// 已发送的消息
    pub fn sent_messages(&self) -> Vec<CommMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 取出并清空已发送的消息
    pub fn take_sent(&self) -> Vec<CommMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// 打开时携带的消息
    pub fn open_message(&self) -> Option<CommMessage> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 本地调用close的次数
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelComm for MemoryComm {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    async fn open(&self, message: CommMessage) -> WidgetResult<()> {
        *self.opened.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        Ok(())
    }

    async fn send(&self, message: CommMessage) -> WidgetResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WidgetError::transport(
                "comm is closed",
                Some(self.comm_id.clone()),
            ));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(WidgetError::transport(
                "injected send failure",
                Some(self.comm_id.clone()),
            ));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    async fn close(&self, _message: Option<CommMessage>) -> WidgetResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn on_msg(&self, callback: MessageCallback) {
        self.msg_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.close_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}
