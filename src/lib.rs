//! # Needlestack Bench
//!
//! 一个在限流条件下并发测试大模型长上下文检索能力的基准测试引擎
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（请求额度），只暴露能力
//! - `TicketBroker` - 按时间窗口发放请求票据
//!
//! ### ② 业务能力层（Services）
//! - `clients/` - 各提供方的调用实现，以及后端注册表
//! - `services/` - 描述"我能做什么"
//! - `RetryingInvoker` - 领票、调用、超时和重试
//! - `ConsensusEvaluator` - 评审团并发投票，多数决
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次试验"的完整处理流程
//! - `WorkUnit` - 工作单元（试验键 + 题目 + 提示词）
//! - `TrialFlow` - 流程编排（生成 → 评审 → 推入变更）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/engine` - 运行引擎，管理补充任务、监控和派发
//! - `orchestrator/dispatcher` - 派发器，每个工作单元一个任务
//! - `orchestrator/status_monitor` - 唯一写结果树的任务
//!
//! ### 结果（Results）
//! - `results/` - 结果树、变更队列和报告
//! - `persistence/` - 结果保存和加载
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;

pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod results;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{Backend, BackendError, BackendHandle, BackendRegistry};
pub use config::{Config, RunMode};
pub use error::{AppError, AppResult};
pub use infrastructure::{RateBudget, Ticket, TicketBroker, TicketError};
pub use models::{PromptBook, Question};
pub use orchestrator::{App, Engine, EngineSettings, RunReport};
pub use persistence::{JsonResultStore, ResultStore};
pub use results::{Mutation, MutationQueue, ResultTree, TrialKey, TrialResult};
pub use services::{ConsensusEvaluator, RetryPolicy, RetryingInvoker};
pub use workflow::{TrialFlow, WorkUnit};
