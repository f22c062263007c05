/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use std::path::Path;

use tracing::info;

use crate::config::Config;
use crate::orchestrator::engine::RunReport;
use crate::orchestrator::reevaluator::ReevaluationReport;
use crate::orchestrator::status_monitor::ProgressSnapshot;
use crate::results::{DissentReport, ResultTree, ScoreSummary, VarianceReport};

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {:?} 模式", config.run_mode);
    info!(
        "📊 每组试验次数: {}, 生成并发: {}, 评审并发: {}",
        config.trial_count, config.generation_pool_size, config.judge_pool_size
    );
    info!(
        "🔁 重试 {} 次, 基础延迟 {:?}, 调用超时 {:?}",
        config.retry_attempts, config.retry_base_delay, config.call_timeout
    );
    info!("{}", "=".repeat(60));
}

/// 记录工作单元构建信息
///
/// # 参数
/// - `total`: 工作单元总数
/// - `backends`: 被测后端数
/// - `locations`: 探测位置数
/// - `questions`: 题目数
/// - `judges`: 评审团人数
pub fn log_units_built(total: usize, backends: usize, locations: usize, questions: usize, judges: usize) {
    info!(
        "✓ 构建 {} 个工作单元 ({} 后端 × {} 位置 × {} 题目)",
        total, backends, locations, questions
    );
    info!("📋 需要评审 {} 次 (评审团 {} 人)\n", total * judges, judges);
}

/// 记录一次排空后的进度
pub fn log_progress(snapshot: &ProgressSnapshot) {
    info!(
        "⏱ 试验: 已回答 {}/{}, 已完成 {}/{} | 评审: {}/{} | 失败: 生成 {}, 评审 {}",
        snapshot.answered,
        snapshot.total_trials,
        snapshot.finished,
        snapshot.total_trials,
        snapshot.evaluations_completed,
        snapshot.evaluations_required,
        snapshot.failed_generations,
        snapshot.failed_evaluations
    );
    for (backend, progress) in &snapshot.backends {
        tracing::debug!(
            "   [{}] 已回答 {}/{}, 已完成 {}",
            backend,
            progress.answered,
            progress.total,
            progress.finished
        );
    }
    for (judge, completed) in &snapshot.judges {
        tracing::debug!("   [评审 {}] 已评审 {}", judge, completed);
    }
}

/// 输出分数、评审分歧和试验差异报告
pub fn log_reports(tree: &ResultTree) {
    info!("\n{}", "=".repeat(60));
    info!("📈 分数汇总");
    for summary in ScoreSummary::from_tree(tree) {
        info!(
            "[{}] 总分: {} (生成失败 {}, 评审失败 {})",
            summary.backend,
            format_score(summary.score),
            summary.failed_generations,
            summary.failed_evaluations
        );
        for (location, score) in &summary.location_scores {
            info!("   位置 {:>8}: {}", location, format_score(*score));
        }
    }

    info!("{}", "─".repeat(60));
    info!("🧑‍⚖️ 评审分歧");
    let dissent = DissentReport::from_tree(tree);
    for (judge, stats) in &dissent.judges {
        info!(
            "[{}] 评审 {} 次, 与结论不一致 {} 次 ({})",
            judge,
            stats.evaluations,
            stats.disagreements,
            format_percent(stats.percent_wrong())
        );
    }
    info!("⚠️ 反对票过半的试验: {} 个", dissent.concerning_trials.len());

    info!("{}", "─".repeat(60));
    info!("🎲 试验间差异");
    for (backend, variance) in &VarianceReport::from_tree(tree).backends {
        info!(
            "[{}] {}/{} 组结论不一致 ({})",
            backend,
            variance.inconsistent_groups,
            variance.groups,
            format_percent(variance.percent_inconsistent())
        );
    }
    info!("{}", "=".repeat(60));
}

/// 记录重新评审的变化
pub fn log_reevaluation(report: &ReevaluationReport) {
    info!(
        "🔁 重新评审 {} 个试验, {} 个结论改变",
        report.reevaluated,
        report.changes.len()
    );
    for change in &report.changes {
        info!(
            "   {}: {} → {}",
            change.key,
            format_verdict(change.before),
            format_verdict(change.after)
        );
    }
}

/// 打印最终统计信息
///
/// # 参数
/// - `report`: 运行结果
/// - `result_dir`: 结果保存目录
pub fn print_final_stats(report: &RunReport, result_dir: &Path) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!(
        "✅ 通过: {}/{}",
        report.dispatch.passed, report.dispatch.total
    );
    info!("❌ 不通过: {}", report.dispatch.failed);
    info!("🕳 无答案: {}", report.dispatch.no_answer);
    if report.dispatch.crashed > 0 {
        info!("💥 异常退出: {}", report.dispatch.crashed);
    }
    if !report.completed {
        info!("⚠️ 仍有 {} 个试验未完成", report.tree.pending_keys().len());
    }
    info!("{}", "=".repeat(60));
    info!("\n结果已保存至: {}", result_dir.display());
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

fn format_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{:.3}", s))
}

fn format_percent(percent: Option<f64>) -> String {
    percent.map_or_else(|| "-".to_string(), |p| format!("{:.1}%", p))
}

fn format_verdict(passed: Option<bool>) -> &'static str {
    match passed {
        Some(true) => "通过",
        Some(false) => "不通过",
        None => "未完成",
    }
}
