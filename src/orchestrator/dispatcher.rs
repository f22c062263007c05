//! 工作单元派发器 - 编排层
//!
//! ## 职责
//!
//! 1. **构建工作单元**：后端 × 探测位置 × 题目 × 试验 的完整笛卡尔积
//! 2. **按后端限流并发**：每个后端一个独立的生成并发池，慢后端不会拖住其他后端
//! 3. **乱序完成**：调用方只能通过句柄等待完成，不能假设顺序
//! 4. **兜底**：任务异常退出时补记"没有答案"，保证每个试验最终都有结论

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clients::BackendRegistry;
use crate::error::SetupError;
use crate::models::{ProbeLocation, PromptBook, Question, QuestionId};
use crate::results::{ResultTree, TrialKey};
use crate::workflow::{TrialFlow, TrialOutcome, WorkUnit};

/// 构建全部工作单元
///
/// 每个组合都必须有提示词，缺失即结构错误。
pub fn build_work_units(
    backends: &[String],
    locations: &[ProbeLocation],
    questions: &[Arc<Question>],
    trial_count: u32,
    prompts: &PromptBook,
) -> Result<Vec<WorkUnit>, SetupError> {
    let mut units =
        Vec::with_capacity(backends.len() * locations.len() * questions.len() * trial_count as usize);

    for backend in backends {
        for &location in locations {
            for question in questions {
                let prompt = prompt_for(prompts, backend, location, question.id)?;
                for trial in 0..trial_count {
                    units.push(WorkUnit::new(
                        TrialKey::new(backend.clone(), location, question.id, trial),
                        question.clone(),
                        prompt.clone(),
                    ));
                }
            }
        }
    }
    Ok(units)
}

/// 只为指定的键构建工作单元（断点续跑）
pub fn units_for_keys(
    keys: &[TrialKey],
    questions: &HashMap<QuestionId, Arc<Question>>,
    prompts: &PromptBook,
) -> Result<Vec<WorkUnit>, SetupError> {
    keys.iter()
        .map(|key| {
            let question = questions
                .get(&key.question_id)
                .ok_or(SetupError::UnknownQuestion {
                    question_id: key.question_id,
                })?;
            let prompt = prompt_for(prompts, &key.backend, key.location, key.question_id)?;
            Ok(WorkUnit::new(key.clone(), question.clone(), prompt))
        })
        .collect()
}

/// 一次运行要做的事
///
/// 新运行只有生成单元；断点续跑时按试验状态分成三类，已有的答案不会重新生成。
#[derive(Debug, Default)]
pub struct ResumePlan {
    /// 还没有生成结果的试验
    pub units: Vec<WorkUnit>,
    /// 已有答案、只需重新评审的试验
    pub judging: Vec<(TrialKey, Arc<Question>, String)>,
    /// 已确认没有答案、槽位直接判负的试验
    pub no_answer: Vec<TrialKey>,
}

impl ResumePlan {
    pub fn from_units(units: Vec<WorkUnit>) -> Self {
        Self {
            units,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.units.len() + self.judging.len() + self.no_answer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &TrialKey> {
        self.units
            .iter()
            .map(|u| &u.key)
            .chain(self.judging.iter().map(|(key, _, _)| key))
            .chain(self.no_answer.iter())
    }
}

/// 按结果树中已记录的状态为未完成的试验制定续跑计划
pub fn plan_resume(
    tree: &ResultTree,
    keys: &[TrialKey],
    questions: &HashMap<QuestionId, Arc<Question>>,
    prompts: &PromptBook,
) -> Result<ResumePlan, SetupError> {
    let mut plan = ResumePlan::default();
    let mut generate = Vec::new();

    for key in keys {
        let trial = tree.trial(key).ok_or_else(|| SetupError::MissingTrial {
            key: key.to_string(),
        })?;
        if !trial.answer_recorded {
            generate.push(key.clone());
            continue;
        }
        match &trial.generated_answer {
            Some(answer) => {
                let question = questions
                    .get(&key.question_id)
                    .ok_or(SetupError::UnknownQuestion {
                        question_id: key.question_id,
                    })?;
                plan.judging.push((key.clone(), question.clone(), answer.clone()));
            }
            None => plan.no_answer.push(key.clone()),
        }
    }

    plan.units = units_for_keys(&generate, questions, prompts)?;
    Ok(plan)
}

fn prompt_for(
    prompts: &PromptBook,
    backend: &str,
    location: ProbeLocation,
    question_id: QuestionId,
) -> Result<Arc<str>, SetupError> {
    prompts
        .get(backend, location, question_id)
        .map(Arc::from)
        .ok_or_else(|| SetupError::MissingPrompt {
            backend: backend.to_string(),
            location,
            question_id,
        })
}

/// 已派发的任务
#[derive(Debug)]
pub struct Dispatched {
    pub key: TrialKey,
    pub handle: JoinHandle<TrialOutcome>,
}

/// 派发统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub no_answer: usize,
    /// 异常退出的任务
    pub crashed: usize,
}

/// 派发器
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    flow: TrialFlow,
}

impl Dispatcher {
    pub fn new(registry: Arc<BackendRegistry>, flow: TrialFlow) -> Self {
        Self { registry, flow }
    }

    pub fn flow(&self) -> &TrialFlow {
        &self.flow
    }

    /// 派发全部工作单元
    ///
    /// 先检查每个单元的后端都已注册，全部通过后才开始派发。
    pub fn dispatch(&self, units: Vec<WorkUnit>) -> Result<Vec<Dispatched>, SetupError> {
        for unit in &units {
            self.registry.handle(unit.backend())?;
        }

        let total = units.len();
        let mut dispatched = Vec::with_capacity(total);
        for unit in units {
            let handle = self.registry.handle(unit.backend())?.clone();
            let flow = self.flow.clone();
            let key = unit.key.clone();

            let task = tokio::spawn(async move {
                let _permit = match handle.generation_pool().clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        flow.abandon(&unit.key, format!("生成并发池已关闭: {}", e));
                        return TrialOutcome::NoAnswer;
                    }
                };
                flow.run(&handle, &unit).await
            });
            dispatched.push(Dispatched { key, handle: task });
        }

        info!("📦 已派发 {} 个工作单元", total);
        Ok(dispatched)
    }

    /// 重新评审已有答案
    pub fn dispatch_judging(&self, items: Vec<(TrialKey, Arc<Question>, String)>) -> Vec<Dispatched> {
        items
            .into_iter()
            .map(|(key, question, answer)| {
                let flow = self.flow.clone();
                let task_key = key.clone();
                let task =
                    tokio::spawn(async move { flow.judge(&task_key, &question, &answer).await });
                Dispatched { key, handle: task }
            })
            .collect()
    }

    /// 等待全部任务结束
    pub async fn join(&self, dispatched: Vec<Dispatched>) -> DispatchSummary {
        let mut summary = DispatchSummary {
            total: dispatched.len(),
            ..Default::default()
        };

        for Dispatched { key, handle } in dispatched {
            match handle.await {
                Ok(TrialOutcome::Judged { passed: true, .. }) => summary.passed += 1,
                Ok(TrialOutcome::Judged { passed: false, .. }) => summary.failed += 1,
                Ok(TrialOutcome::NoAnswer) => summary.no_answer += 1,
                Err(e) => {
                    error!("[{}] 任务执行失败: {}", key, e);
                    self.flow.abandon(&key, format!("任务执行失败: {}", e));
                    summary.crashed += 1;
                }
            }
        }
        summary
    }
}
