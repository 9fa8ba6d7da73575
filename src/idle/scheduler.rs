use std::time::Duration;

use tokio::sync::oneshot;

/// 遅延実行タイマーのハンドル
///
/// `cancel` するかハンドルをドロップするとコールバックは実行されない。
/// 発火済み・取り消し済みハンドルへの `cancel` は何もしない
pub struct TimerHandle {
    cancel: Option<oneshot::Sender<()>>,
}

/// `delay` 経過後に `callback` を一度だけ実行するタイマーを登録する
///
/// アイドル期限とカウントダウンの両方がこの 1 つのプリミティブで動く
pub fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => callback(),
            _ = cancel_rx => {}
        }
    });

    TimerHandle {
        cancel: Some(cancel_tx),
    }
}

impl TimerHandle {
    /// タイマーを取り消す
    pub fn cancel(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(tx) = self.cancel.take() {
            // 既に発火していて受信側がいなくても問題ない
            let _ = tx.send(());
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _handle = schedule(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = schedule(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        {
            let _handle = schedule(Duration::from_secs(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
