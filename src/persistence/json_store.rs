//! 结果持久化
//!
//! 每个后端一个 `<backend>_full_results.json`，另有一份全部后端的分数汇总 `model_scores.json`。
//! 重新载入后键保持不变，未完成的试验可以继续派发。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{AppError, AppResult, FileError};
use crate::results::{BackendResult, ResultTree, ScoreSummary};

pub const FULL_RESULTS_SUFFIX: &str = "_full_results.json";
pub const MODEL_SCORES_FILE: &str = "model_scores.json";

/// 结果树的存取
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 保存整棵树的快照
    async fn save(&self, tree: &ResultTree) -> AppResult<()>;

    /// 从快照重建结果树
    async fn load(&self) -> AppResult<ResultTree>;
}

/// JSON 文件存储
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    dir: PathBuf,
}

impl JsonResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 按当天日期建运行目录：`<root>/<YYYY-MM-DD>`
    pub fn for_today(root: &Path) -> Self {
        Self::new(root.join(Local::now().format("%Y-%m-%d").to_string()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend_file(&self, backend: &str) -> PathBuf {
        self.dir.join(format!("{}{}", backend, FULL_RESULTS_SUFFIX))
    }

    /// 目录里是否已有结果
    pub async fn has_results(&self) -> bool {
        matches!(self.result_files().await, Ok(files) if !files.is_empty())
    }

    async fn result_files(&self) -> AppResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Err(FileError::DirectoryNotFound {
                path: self.dir.display().to_string(),
            }
            .into());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| AppError::file_read_failed(self.dir.display().to_string(), e))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_result = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(FULL_RESULTS_SUFFIX));
            if is_result {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// 先写临时文件再改名，避免检查点写到一半被读到
    async fn write_json<T: serde::Serialize + ?Sized>(&self, path: &Path, value: &T) -> AppResult<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| AppError::json_parse_failed(path.display().to_string(), e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| AppError::file_write_failed(tmp.display().to_string(), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| AppError::file_write_failed(path.display().to_string(), e))?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonResultStore {
    async fn save(&self, tree: &ResultTree) -> AppResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::file_write_failed(self.dir.display().to_string(), e))?;

        for (name, backend) in &tree.backends {
            self.write_json(&self.backend_file(name), backend).await?;
        }

        let summaries = ScoreSummary::from_tree(tree);
        self.write_json(&self.dir.join(MODEL_SCORES_FILE), &summaries)
            .await?;

        debug!("已保存 {} 个后端的结果到 {}", tree.backends.len(), self.dir.display());
        Ok(())
    }

    async fn load(&self) -> AppResult<ResultTree> {
        let files = self.result_files().await?;
        if files.is_empty() {
            return Err(FileError::NotFound {
                path: self.dir.join(format!("*{}", FULL_RESULTS_SUFFIX)).display().to_string(),
            }
            .into());
        }

        let mut tree = ResultTree::default();
        for path in files {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))?;
            let backend: BackendResult = serde_json::from_str(&content)
                .map_err(|e| AppError::json_parse_failed(path.display().to_string(), e))?;

            if tree.judges.is_empty() {
                tree.judges = panel_of(&backend);
            }
            tree.backends.insert(backend.backend.clone(), backend);
        }

        info!("✓ 已载入 {} 个后端的结果 ({})", tree.backends.len(), self.dir.display());
        Ok(tree)
    }
}

/// 从任意一个试验的槽位恢复评审团顺序
fn panel_of(backend: &BackendResult) -> Vec<String> {
    backend
        .locations
        .values()
        .flat_map(|location| location.questions.values())
        .flat_map(|question| question.trials.values())
        .next()
        .map(|trial| trial.verdicts.iter().map(|v| v.judge.clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;
    use crate::results::TrialKey;
    use tokio_test::assert_err;

    fn tree() -> ResultTree {
        let mut tree = ResultTree::build(
            &["gpt".to_string(), "llama".to_string()],
            &[100, 2500],
            &[Question::new(1, "t", "q", "a"), Question::new(2, "t", "q", "b")],
            2,
            &["j1".to_string(), "j2".to_string(), "j3".to_string()],
        )
        .unwrap();

        let trial = tree.trial_mut(&TrialKey::new("gpt", 2500, 2, 1)).unwrap();
        trial.record_answer(Some("b".to_string()));
        trial.record_verdict(0, "j1", true);
        trial.record_verdict(1, "j2", true);
        trial.record_verdict(2, "j3", false);
        tree.recompute_scores();
        tree
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonResultStore::new(dir.path().join("run"));
        let original = tree();

        store.save(&original).await.unwrap();
        assert!(store.backend_file("gpt").exists());
        assert!(store.dir().join(MODEL_SCORES_FILE).exists());
        assert!(store.has_results().await);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.judges, ["j1", "j2", "j3"]);
        assert_eq!(loaded.pending_keys().len(), original.pending_keys().len());
        assert_eq!(
            loaded.trial(&TrialKey::new("gpt", 2500, 2, 1)).unwrap().dissent_count,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_load_from_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonResultStore::new(dir.path());
        assert!(!store.has_results().await);
        assert_err!(store.load().await);
    }
}
