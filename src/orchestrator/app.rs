//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：加载配置、后端注册表、题目和提示词
//! 2. **构建键空间**：派发前一次性建好结果树，任何结构错误都中止运行
//! 3. **模式分发**：完整测评 / 重新评审 / 只输出报告
//! 4. **全局统计**：运行结束后输出分数和分歧报告

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::clients::BackendRegistry;
use crate::config::{Config, RunMode};
use crate::error::AppResult;
use crate::models::{load_backend_specs, load_questions, ProbeLocation, PromptBook, Question, QuestionId};
use crate::orchestrator::dispatcher::{build_work_units, plan_resume, ResumePlan};
use crate::orchestrator::engine::{Engine, EngineSettings};
use crate::orchestrator::reevaluator::Reevaluator;
use crate::persistence::{JsonResultStore, ResultStore};
use crate::results::ResultTree;
use crate::utils::logging::{log_reevaluation, log_reports, log_startup, log_units_built, print_final_stats};

/// 应用主结构
pub struct App {
    config: Config,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        log_startup(&config);
        Ok(Self { config })
    }

    /// 按运行模式执行
    pub async fn run(&self) -> AppResult<()> {
        match self.config.run_mode {
            RunMode::Benchmark => self.run_benchmark().await,
            RunMode::Reevaluate => self.run_reevaluate().await,
            RunMode::Report => self.run_report().await,
        }
    }

    /// 结果目录：指定了续跑目录就用它，否则按当天日期新建
    fn store(&self) -> JsonResultStore {
        match &self.config.resume_dir {
            Some(dir) => JsonResultStore::new(dir.clone()),
            None => JsonResultStore::for_today(&self.config.result_dir),
        }
    }

    async fn load_registry(&self) -> AppResult<Arc<BackendRegistry>> {
        let specs = load_backend_specs(&self.config.backends_file).await?;
        Ok(Arc::new(BackendRegistry::from_specs(&specs, &self.config)?))
    }

    async fn load_questions(&self) -> AppResult<Vec<Arc<Question>>> {
        let questions = load_questions(&self.config.questions_file).await?;
        Ok(questions.into_iter().map(Arc::new).collect())
    }

    fn engine(&self, registry: Arc<BackendRegistry>, store: &JsonResultStore) -> Engine {
        Engine::new(registry, EngineSettings::from_config(&self.config))
            .with_store(Arc::new(store.clone()))
    }

    async fn run_benchmark(&self) -> AppResult<()> {
        let registry = self.load_registry().await?;
        let questions = self.load_questions().await?;
        let prompts = PromptBook::load_dir(&self.config.prompt_dir, registry.subjects()).await?;
        let locations: Vec<ProbeLocation> = self
            .config
            .probe_locations
            .clone()
            .unwrap_or_else(|| prompts.locations());

        let question_ids: Vec<QuestionId> = questions.iter().map(|q| q.id).collect();
        prompts.verify_complete(registry.subjects(), &locations, &question_ids)?;

        let store = self.store();
        let (tree, plan) = if self.config.resume_dir.is_some() && store.has_results().await {
            let mut tree = store.load().await?;
            let pending = tree.reset_pending_verdicts(registry.judges());
            info!("↩️ 从 {} 续跑，剩余 {} 个试验", store.dir().display(), pending.len());
            let by_id: HashMap<QuestionId, Arc<Question>> =
                questions.iter().map(|q| (q.id, q.clone())).collect();
            let plan = plan_resume(&tree, &pending, &by_id, &prompts)?;
            (tree, plan)
        } else {
            let plain: Vec<Question> = questions.iter().map(|q| Question::clone(q)).collect();
            let tree = ResultTree::build(
                registry.subjects(),
                &locations,
                &plain,
                self.config.trial_count,
                registry.judges(),
            )?;
            let units = build_work_units(
                registry.subjects(),
                &locations,
                &questions,
                self.config.trial_count,
                &prompts,
            )?;
            (tree, ResumePlan::from_units(units))
        };

        log_units_built(
            plan.len(),
            registry.subjects().len(),
            locations.len(),
            questions.len(),
            registry.judges().len(),
        );

        let engine = self.engine(registry.clone(), &store);
        let report = engine.run_plan(tree, plan).await?;
        registry.shutdown();

        log_reports(&report.tree);
        print_final_stats(&report, store.dir());
        Ok(())
    }

    async fn run_reevaluate(&self) -> AppResult<()> {
        let store = self.store();
        let tree = store.load().await?;
        let registry = self.load_registry().await?;
        let questions = self.load_questions().await?;

        let engine = self.engine(registry.clone(), &store);
        let report = Reevaluator::new(&engine).run(tree, &questions).await?;
        registry.shutdown();

        log_reevaluation(&report);
        log_reports(&report.run.tree);
        print_final_stats(&report.run, store.dir());
        Ok(())
    }

    async fn run_report(&self) -> AppResult<()> {
        let store = self.store();
        let mut tree = store.load().await?;
        tree.recompute_scores();

        if !tree.is_finished() {
            warn!("⚠️ 结果尚未全部完成，报告只包含已完成的试验");
        }
        log_reports(&tree);
        store.save(&tree).await?;
        Ok(())
    }
}

