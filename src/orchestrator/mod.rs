//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责派发试验和汇总结果，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 管理应用生命周期（初始化、运行、保存）
//! - 加载题目、后端和提示词
//! - 按运行模式选择基准测试、重新评审或只出报告
//!
//! ### `engine` - 运行引擎
//! - 启动票据补充任务
//! - 启动状态监控并派发全部工作单元
//! - 等待所有任务结束后做最后一次排空
//!
//! ### `dispatcher` - 派发器
//! - 把 (后端 × 位置 × 题目 × 试验) 展开成工作单元
//! - 每个工作单元一个任务，受后端生成并发数限制
//!
//! ### `status_monitor` - 状态监控
//! - 定时排空变更队列并写入结果树
//! - 定时保存进度、报告进度
//! - 全部完成时只宣告一次
//!
//! ### `reevaluator` - 重新评审
//! - 对已有答案重新投票，不重新生成
//!
//! ## 层次关系
//!
//! ```text
//! app (处理整个运行)
//!     ↓
//! engine + dispatcher + status_monitor
//!     ↓
//! workflow::TrialFlow (处理单次试验)
//!     ↓
//! services (能力层：invoker / consensus)
//!     ↓
//! infrastructure (基础设施：TicketBroker)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单写者**：只有状态监控写结果树，其他任务只推变更
//! 2. **资源隔离**：只有编排层启动和停止票据补充任务
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure

pub mod app;
pub mod dispatcher;
pub mod engine;
pub mod reevaluator;
pub mod status_monitor;

// 重新导出主要类型
pub use app::App;
pub use dispatcher::{
    build_work_units, plan_resume, units_for_keys, DispatchSummary, Dispatched, Dispatcher,
    ResumePlan,
};
pub use engine::{Engine, EngineSettings, RunReport};
pub use reevaluator::{ReevaluationReport, Reevaluator, VerdictChange};
pub use status_monitor::{
    BackendProgress, DrainOutcome, LogReporter, ProgressReporter, ProgressSnapshot, StatusMonitor,
};
