use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::MetricsCollector;

/// 后台上报任务句柄
///
/// 丢弃句柄不会停止任务，需要显式调用 `shutdown`。
#[derive(Debug)]
pub struct ReporterHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    /// 停止任务，停止前再上报一次
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!("Metrics reporter task failed: {}", e);
        }
    }
}

pub(super) fn spawn(collector: MetricsCollector, period: Duration) -> ReporterHandle {
    let (tx, mut rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即完成，跳过
        ticker.tick().await;

        tracing::info!("Metrics reporter started, interval {:?}", period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    collector.report().await;
                }
                _ = &mut rx => {
                    collector.report().await;
                    break;
                }
            }
        }
        tracing::info!("Metrics reporter stopped");
    });

    ReporterHandle { shutdown: tx, task }
}
