use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::idle::scheduler::{self, TimerHandle};

/// アイドル監視の時間設定
#[derive(Debug, Clone, Copy)]
pub struct IdleConfig {
    /// 最後の操作からこの時間で警告に入る
    pub idle_timeout: Duration,
    /// 警告からサインアウトまでのカウントダウン長
    pub warning_window: Duration,
}

/// アイドル監視の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleState {
    Active,
    Warning { seconds_remaining: u32 },
    LoggedOut,
}

/// タイムアウト到達時に一度だけ実行されるフック
///
/// サインアウト要求はここから投げっぱなしで行う（失敗しても再試行しない）
pub type TimeoutHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
enum IdleCommand {
    Activity { ack: oneshot::Sender<IdleState> },
    StayLoggedIn { ack: oneshot::Sender<IdleState> },
    LogoutNow,
    Teardown,
    DeadlineElapsed { epoch: u64 },
    CountdownTick { epoch: u64 },
}

/// ウォッチドッグへの操作ハンドル
///
/// 状態を返すメソッドは、コマンドが監視タスクで処理された後の状態を返す。
/// 監視タスク終了後の呼び出しは何も起こさず、応答は `LoggedOut` になる
#[derive(Clone)]
pub struct IdleHandle {
    tx: mpsc::UnboundedSender<IdleCommand>,
    state: watch::Receiver<IdleState>,
}

impl IdleHandle {
    /// 操作イベント（クリック）を通知して期限をリセットする
    ///
    /// 警告表示中の操作ではリセットされない。処理後の状態を返す
    pub async fn activity(&self) -> IdleState {
        self.ack_command(|ack| IdleCommand::Activity { ack }).await
    }

    /// 警告モーダルの「継続する」。処理後の状態を返す
    pub async fn stay_logged_in(&self) -> IdleState {
        self.ack_command(|ack| IdleCommand::StayLoggedIn { ack }).await
    }

    /// 警告モーダルの「今すぐログアウト」
    pub fn logout_now(&self) {
        let _ = self.tx.send(IdleCommand::LogoutNow);
    }

    /// フックを実行せずに監視を終了する（セッションが外部で閉じた場合）
    pub fn teardown(&self) {
        let _ = self.tx.send(IdleCommand::Teardown);
    }

    /// 現在の状態を取得
    pub fn state(&self) -> IdleState {
        self.state.borrow().clone()
    }

    /// 状態変化の購読
    pub fn subscribe(&self) -> watch::Receiver<IdleState> {
        self.state.clone()
    }

    /// コマンドを送り、処理後の状態の応答を待つ
    async fn ack_command(
        &self,
        build: impl FnOnce(oneshot::Sender<IdleState>) -> IdleCommand,
    ) -> IdleState {
        let (ack, response) = oneshot::channel();
        if self.tx.send(build(ack)).is_err() {
            return IdleState::LoggedOut;
        }
        response.await.unwrap_or(IdleState::LoggedOut)
    }
}

/// アイドルセッションのウォッチドッグ
///
/// 期限タイマーとカウントダウンタイマーはどちらも
/// `scheduler::schedule` で登録し、発火はコマンドとして
/// 自分のキューへ送る。状態遷移は全てこの単一タスク上で起きるため、
/// タイマーと操作イベントの競合は到着順に直列化される
pub struct IdleWatchdog {
    cfg: IdleConfig,
    tx: mpsc::UnboundedSender<IdleCommand>,
    rx: mpsc::UnboundedReceiver<IdleCommand>,
    state_tx: watch::Sender<IdleState>,
    deadline: Option<TimerHandle>,
    countdown: Option<TimerHandle>,
    /// タイマー世代。取り消し後に届いた発火コマンドを識別して捨てる
    epoch: u64,
    seconds_remaining: u32,
    on_timeout: Option<TimeoutHook>,
}

impl IdleWatchdog {
    /// 監視タスクを起動してハンドルを返す
    ///
    /// 起動直後から期限タイマーが動き出す
    pub fn spawn(cfg: IdleConfig, on_timeout: TimeoutHook) -> IdleHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(IdleState::Active);

        let mut watchdog = Self {
            cfg,
            tx: tx.clone(),
            rx,
            state_tx,
            deadline: None,
            countdown: None,
            epoch: 0,
            seconds_remaining: 0,
            on_timeout: Some(on_timeout),
        };
        tokio::spawn(async move { watchdog.run().await });

        IdleHandle {
            tx,
            state: state_rx,
        }
    }

    async fn run(&mut self) {
        self.arm_deadline();

        while let Some(command) = self.rx.recv().await {
            match command {
                IdleCommand::Activity { ack } => {
                    // 警告表示中のクリックではモーダルは消えない。
                    // 期限リセットは Active の間だけ
                    if matches!(self.current(), IdleState::Active) {
                        self.arm_deadline();
                    }
                    let _ = ack.send(self.current());
                }
                IdleCommand::StayLoggedIn { ack } => {
                    match self.current() {
                        IdleState::LoggedOut => {}
                        IdleState::Warning { .. } => {
                            self.arm_deadline();
                            self.publish(IdleState::Active);
                        }
                        IdleState::Active => self.arm_deadline(),
                    }
                    let _ = ack.send(self.current());
                }
                IdleCommand::DeadlineElapsed { epoch } if epoch == self.epoch => {
                    self.enter_warning();
                }
                IdleCommand::CountdownTick { epoch } if epoch == self.epoch => {
                    self.seconds_remaining = self.seconds_remaining.saturating_sub(1);
                    if self.seconds_remaining == 0 {
                        self.force_logout();
                        return;
                    }
                    self.publish(IdleState::Warning {
                        seconds_remaining: self.seconds_remaining,
                    });
                    self.arm_countdown();
                }
                // 取り消し済みタイマーの遅延発火は無視する
                IdleCommand::DeadlineElapsed { .. } | IdleCommand::CountdownTick { .. } => {}
                IdleCommand::LogoutNow => {
                    self.force_logout();
                    return;
                }
                IdleCommand::Teardown => {
                    self.clear_timers();
                    return;
                }
            }
        }

        self.clear_timers();
    }

    fn enter_warning(&mut self) {
        self.clear_timers();
        self.seconds_remaining = self.cfg.warning_window.as_secs() as u32;
        self.publish(IdleState::Warning {
            seconds_remaining: self.seconds_remaining,
        });
        self.arm_countdown();
    }

    fn force_logout(&mut self) {
        self.clear_timers();
        self.publish(IdleState::LoggedOut);
        // フックの実行は一度だけ
        if let Some(hook) = self.on_timeout.take() {
            hook();
        }
    }

    /// 期限タイマーを張り直す
    ///
    /// 既存のタイマーは両方とも取り消してから登録する
    fn arm_deadline(&mut self) {
        self.clear_timers();
        self.epoch += 1;
        let epoch = self.epoch;
        let tx = self.tx.clone();
        self.deadline = Some(scheduler::schedule(self.cfg.idle_timeout, move || {
            let _ = tx.send(IdleCommand::DeadlineElapsed { epoch });
        }));
    }

    /// 1 秒後のカウントダウン刻みを登録する
    fn arm_countdown(&mut self) {
        let epoch = self.epoch;
        let tx = self.tx.clone();
        self.countdown = Some(scheduler::schedule(Duration::from_secs(1), move || {
            let _ = tx.send(IdleCommand::CountdownTick { epoch });
        }));
    }

    /// 両タイマーを取り消す。タイマーが無いときは何もしない
    fn clear_timers(&mut self) {
        if let Some(timer) = self.deadline.take() {
            timer.cancel();
        }
        if let Some(timer) = self.countdown.take() {
            timer.cancel();
        }
    }

    fn current(&self) -> IdleState {
        self.state_tx.borrow().clone()
    }

    fn publish(&self, state: IdleState) {
        // 購読者がいなくても監視は続ける
        let _ = self.state_tx.send(state);
    }
}
