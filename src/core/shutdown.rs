//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，触发后按注册顺序执行清理任务。
//! 典型的清理链：RequestDrain（取消在途请求并等待任务退出），随后由调用方停止反馈分发。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::manager::RequestManager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 主循环自行结束（如输入关闭）
    Finished,
}

/// 关闭信号：一个根 token，外加首个触发原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只记录第一次触发的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
                this.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let this = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, shutting down");
                        this.shutdown(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// 按注册顺序执行清理任务，每个任务单独计时
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// 执行全部清理任务，返回失败或超时的任务数；单个任务失败不影响后续任务
    pub async fn run_cleanup(&self) -> usize {
        let mut failed = 0;
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "Cleanup finished"),
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(task = name, error = %e, "Cleanup failed");
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        task = name,
                        timeout_ms = self.per_task_timeout.as_millis() as u64,
                        "Cleanup timed out"
                    );
                }
            }
        }
        failed
    }
}

/// 取消全部在途请求并等待其任务退出
pub struct RequestDrain {
    requests: Arc<RequestManager>,
}

impl RequestDrain {
    pub fn new(requests: Arc<RequestManager>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl ShutdownCleanup for RequestDrain {
    fn name(&self) -> &'static str {
        "request_drain"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let active = self.requests.active_count().await;
        tracing::info!(active, "Cancelling in-flight requests");
        self.requests.shutdown().await;
        Ok(())
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后执行清理；返回关闭原因
pub async fn run_until_shutdown<Fut>(
    signals: Arc<ShutdownManager>,
    app: Fut,
    coordinator: &ShutdownCoordinator,
) -> ShutdownReason
where
    Fut: Future<Output = ()>,
{
    signals.install_signal_handlers();
    let token = signals.token();

    tokio::select! {
        _ = app => signals.shutdown(ShutdownReason::Finished),
        _ = token.cancelled() => {}
    }

    let reason = signals.reason().unwrap_or(ShutdownReason::Finished);
    tracing::info!(?reason, "Shutting down");
    let failed = coordinator.run_cleanup().await;
    if failed > 0 {
        tracing::warn!(failed, "Some cleanup tasks did not finish cleanly");
    }
    reason
}
