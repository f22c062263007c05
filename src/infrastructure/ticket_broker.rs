//! 票据代理（限流器）- 基础设施层
//!
//! 持有稀缺资源"请求额度"，只暴露"领取票据"的能力。
//!
//! ## 两个票据池
//! - **主池**：每个时间窗口重新装满到固定容量 `R`，上一窗口未用完的票据作废
//! - **溢出池**：只发给被后端明确告知"超出限流"的调用方
//!
//! 补充时如果有欠票（被拒绝后排队的调用方），先从本窗口容量中还欠票，
//! 剩余容量才进入主池。欠票超过 `R` 时分多个窗口还清，主池在这些窗口内为空。

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// 限流预算：每个时间窗口允许的请求数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// 每个窗口的票据容量
    pub capacity: usize,
    /// 窗口长度
    pub window: Duration,
}

impl RateBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
        }
    }

    /// 每分钟 `requests` 个请求，一次性发放
    pub fn per_minute(requests: usize) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    /// 每分钟 `requests` 个请求，摊到每秒发放
    ///
    /// 避免整分钟的额度在窗口开头被一次性打光。
    pub fn spread_per_minute(requests: usize) -> Self {
        let per_second = (requests as f64 / 60.0).round() as usize;
        Self::new(per_second, Duration::from_secs(1))
    }
}

/// 票据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    /// 主池
    Primary,
    /// 溢出池（限流拒绝后补发）
    Overflow,
}

/// 一次外发请求的许可
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    kind: TicketKind,
}

impl Ticket {
    pub fn kind(&self) -> TicketKind {
        self.kind
    }
}

/// 票据领取失败
///
/// `NoTicketAvailable` 只表示本地等待超时，与后端返回的限流拒绝是两回事。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    /// 在超时时间内没有领到票据
    #[error("[{broker}] 等待 {waited:?} 后仍没有可用票据")]
    NoTicketAvailable { broker: String, waited: Duration },
    /// 票据代理已关闭
    #[error("[{broker}] 票据代理已关闭")]
    Closed { broker: String },
}

/// 一次补充的分配结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefillOutcome {
    /// 放入主池的票据数
    pub primary: usize,
    /// 放入溢出池的票据数
    pub overflow: usize,
}

#[derive(Debug, Clone, Copy)]
enum Pool {
    Primary,
    Overflow,
}

#[derive(Debug, Default)]
struct PoolState {
    primary: usize,
    overflow: usize,
    owed: usize,
    ticks: u64,
    closed: bool,
}

/// 票据代理
///
/// 职责：
/// - 按预算发放主池票据
/// - 记录被后端限流拒绝的欠票，并在下一窗口优先补发
/// - 不认识后端请求的内容
pub struct TicketBroker {
    name: String,
    budget: RateBudget,
    timeout: Option<Duration>,
    state: Mutex<PoolState>,
    primary_ready: Notify,
    overflow_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl TicketBroker {
    /// 创建票据代理，主池立即装满
    ///
    /// # 参数
    /// - `name`: 代理名称（通常是限流分组名），仅用于日志
    /// - `budget`: 限流预算
    /// - `timeout`: 领取票据的最长等待时间，`None` 表示无限等待
    pub fn new(name: impl Into<String>, budget: RateBudget, timeout: Option<Duration>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            budget,
            timeout,
            state: Mutex::new(PoolState {
                primary: budget.capacity,
                ..Default::default()
            }),
            primary_ready: Notify::new(),
            overflow_ready: Notify::new(),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    /// 领取一张主池票据
    pub async fn acquire(&self) -> Result<Ticket, TicketError> {
        self.with_timeout(self.take(Pool::Primary)).await
    }

    /// 后端返回限流拒绝后调用：登记欠票，等待溢出池补发
    pub async fn acquire_after_rejection(&self) -> Result<Ticket, TicketError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(self.closed_error());
            }
            state.owed += 1;
        }

        let result = self.with_timeout(self.take(Pool::Overflow)).await;
        if let Err(TicketError::NoTicketAvailable { .. }) = result {
            let mut state = self.lock_state();
            state.owed = state.owed.saturating_sub(1);
        }
        result
    }

    /// 补充一个窗口的票据
    ///
    /// 由后台补充任务按窗口调用，也可以在测试中直接调用。
    pub fn refill(&self) -> RefillOutcome {
        let capacity = self.budget.capacity;
        let outcome = {
            let mut state = self.lock_state();
            if state.closed {
                return RefillOutcome::default();
            }
            state.ticks += 1;

            let outcome = if state.owed == 0 {
                RefillOutcome {
                    primary: capacity,
                    overflow: 0,
                }
            } else if state.owed < capacity {
                let owed = std::mem::take(&mut state.owed);
                RefillOutcome {
                    primary: capacity - owed,
                    overflow: owed,
                }
            } else {
                state.owed -= capacity;
                RefillOutcome {
                    primary: 0,
                    overflow: capacity,
                }
            };

            state.overflow += outcome.overflow;
            // 上一窗口剩余的主池票据作废
            state.primary = outcome.primary;
            outcome
        };

        if outcome.overflow > 0 {
            self.overflow_ready.notify_waiters();
        }
        if outcome.primary > 0 {
            self.primary_ready.notify_waiters();
        }

        debug!(
            "[{}] 补充票据: 主池 {} 张, 溢出池 {} 张",
            self.name, outcome.primary, outcome.overflow
        );
        outcome
    }

    /// 启动后台补充任务
    ///
    /// 任务只持有弱引用：代理被释放或调用 [`TicketBroker::shutdown`] 后任务自行退出。
    pub fn spawn_refill(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let window = self.budget.window;
        let name = self.name.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match weak.upgrade() {
                            Some(broker) => {
                                broker.refill();
                            }
                            None => break,
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("[{}] 票据补充任务退出", name);
        })
    }

    /// 关闭代理：唤醒所有等待者，之后的领取都返回 `Closed`
    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        // 进程退出阶段补充任务可能已经结束，发送失败可以忽略
        let _ = self.shutdown_tx.send(true);
        self.primary_ready.notify_waiters();
        self.overflow_ready.notify_waiters();
        info!("[{}] 票据代理已关闭", self.name);
    }

    /// 主池剩余票据数
    pub fn primary_available(&self) -> usize {
        self.lock_state().primary
    }

    /// 溢出池剩余票据数
    pub fn overflow_available(&self) -> usize {
        self.lock_state().overflow
    }

    /// 尚未补发的欠票数
    pub fn owed(&self) -> usize {
        self.lock_state().owed
    }

    /// 已执行的补充次数
    pub fn ticks(&self) -> u64 {
        self.lock_state().ticks
    }

    // ========== 内部方法 ==========

    async fn take(&self, pool: Pool) -> Result<Ticket, TicketError> {
        let notify = match pool {
            Pool::Primary => &self.primary_ready,
            Pool::Overflow => &self.overflow_ready,
        };

        loop {
            // 先登记唤醒再检查状态，避免错过检查与等待之间的补充
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ticket) = self.try_take(pool)? {
                return Ok(ticket);
            }
            notified.await;
        }
    }

    fn try_take(&self, pool: Pool) -> Result<Option<Ticket>, TicketError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(self.closed_error());
        }
        let (available, kind) = match pool {
            Pool::Primary => (&mut state.primary, TicketKind::Primary),
            Pool::Overflow => (&mut state.overflow, TicketKind::Overflow),
        };
        if *available == 0 {
            return Ok(None);
        }
        *available -= 1;
        Ok(Some(Ticket { kind }))
    }

    async fn with_timeout<F>(&self, fut: F) -> Result<Ticket, TicketError>
    where
        F: Future<Output = Result<Ticket, TicketError>>,
    {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(TicketError::NoTicketAvailable {
                    broker: self.name.clone(),
                    waited: limit,
                }),
            },
            None => fut.await,
        }
    }

    fn closed_error(&self) -> TicketError {
        TicketError::Closed {
            broker: self.name.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TicketBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketBroker")
            .field("name", &self.name)
            .field("budget", &self.budget)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn broker(capacity: usize, timeout_ms: Option<u64>) -> Arc<TicketBroker> {
        Arc::new(TicketBroker::new(
            "test",
            RateBudget::new(capacity, Duration::from_secs(60)),
            timeout_ms.map(Duration::from_millis),
        ))
    }

    async fn wait_for_owed(broker: &TicketBroker, expected: usize) {
        for _ in 0..1000 {
            if broker.owed() == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("欠票数没有达到 {}，当前 {}", expected, broker.owed());
    }

    #[tokio::test]
    async fn test_acquire_drains_primary_then_times_out() {
        let broker = broker(2, Some(20));

        assert_eq!(assert_ok!(broker.acquire().await).kind(), TicketKind::Primary);
        assert_eq!(assert_ok!(broker.acquire().await).kind(), TicketKind::Primary);

        let err = assert_err!(broker.acquire().await);
        assert!(matches!(err, TicketError::NoTicketAvailable { .. }));
    }

    #[tokio::test]
    async fn test_refill_resets_primary_instead_of_adding() {
        let broker = broker(3, None);
        assert_eq!(broker.primary_available(), 3);

        let outcome = broker.refill();
        assert_eq!(outcome, RefillOutcome { primary: 3, overflow: 0 });
        assert_eq!(broker.primary_available(), 3);
        assert_eq!(broker.ticks(), 1);
    }

    #[tokio::test]
    async fn test_refill_pays_owed_tickets_first_when_below_capacity() {
        let broker = broker(5, None);
        // 主池清空，模拟本窗口已经用完
        for _ in 0..5 {
            assert_ok!(broker.acquire().await);
        }

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let b = broker.clone();
            waiters.push(tokio::spawn(async move { b.acquire_after_rejection().await }));
        }
        wait_for_owed(&broker, 3).await;

        let outcome = broker.refill();
        assert_eq!(outcome, RefillOutcome { primary: 2, overflow: 3 });
        assert_eq!(broker.owed(), 0);

        for waiter in waiters {
            let ticket = assert_ok!(waiter.await.unwrap());
            assert_eq!(ticket.kind(), TicketKind::Overflow);
        }
        assert_eq!(broker.primary_available(), 2);
        assert_eq!(broker.overflow_available(), 0);
    }

    #[tokio::test]
    async fn test_refill_spends_whole_window_on_overflow_when_owed_exceeds_capacity() {
        let broker = broker(2, None);

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let b = broker.clone();
            waiters.push(tokio::spawn(async move { b.acquire_after_rejection().await }));
        }
        wait_for_owed(&broker, 5).await;

        let outcome = broker.refill();
        assert_eq!(outcome, RefillOutcome { primary: 0, overflow: 2 });
        assert_eq!(broker.owed(), 3);
        assert_eq!(broker.primary_available(), 0);

        let outcome = broker.refill();
        assert_eq!(outcome, RefillOutcome { primary: 0, overflow: 2 });
        assert_eq!(broker.owed(), 1);

        let outcome = broker.refill();
        assert_eq!(outcome, RefillOutcome { primary: 1, overflow: 1 });
        assert_eq!(broker.owed(), 0);

        for waiter in waiters {
            assert_ok!(waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_with_closed() {
        let broker = broker(1, None);
        assert_ok!(broker.acquire().await);

        let b = broker.clone();
        let waiter = tokio::spawn(async move { b.acquire().await });
        tokio::task::yield_now().await;

        broker.shutdown();
        let err = assert_err!(waiter.await.unwrap());
        assert!(matches!(err, TicketError::Closed { .. }));

        // 关闭后补充是空操作
        assert_eq!(broker.refill(), RefillOutcome::default());
    }

    #[tokio::test]
    async fn test_refill_task_replenishes_and_stops_on_shutdown() {
        let broker = Arc::new(TicketBroker::new(
            "timer",
            RateBudget::new(1, Duration::from_millis(10)),
            Some(Duration::from_secs(2)),
        ));
        let handle = broker.spawn_refill();

        assert_ok!(broker.acquire().await);
        // 下一张票据只能来自补充任务
        assert_ok!(broker.acquire().await);
        assert!(broker.ticks() >= 1);

        broker.shutdown();
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), handle).await);
    }

    #[test]
    fn test_spread_per_minute_rounds_to_per_second_budget() {
        let budget = RateBudget::spread_per_minute(300);
        assert_eq!(budget.capacity, 5);
        assert_eq!(budget.window, Duration::from_secs(1));

        // 低于每秒一个时至少保留一张
        assert_eq!(RateBudget::spread_per_minute(10).capacity, 1);
    }
}
