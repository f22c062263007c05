//! 提示词簿
//!
//! 提示词由外部的语料组装工具生成，这里只负责按 (后端, 位置, 题目) 取用。

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{AppError, AppResult, FileError, SetupError};
use crate::models::QuestionId;

/// 探测位置（提示词中注入目标段落的 token 偏移）
pub type ProbeLocation = u64;

#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    prompts: HashMap<(String, ProbeLocation, QuestionId), String>,
}

impl PromptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        backend: impl Into<String>,
        location: ProbeLocation,
        question_id: QuestionId,
        prompt: impl Into<String>,
    ) {
        self.prompts
            .insert((backend.into(), location, question_id), prompt.into());
    }

    pub fn get(
        &self,
        backend: &str,
        location: ProbeLocation,
        question_id: QuestionId,
    ) -> Option<&str> {
        self.prompts
            .get(&(backend.to_string(), location, question_id))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// 所有出现过的探测位置（升序去重）
    pub fn locations(&self) -> Vec<ProbeLocation> {
        let mut locations: Vec<_> = self.prompts.keys().map(|(_, loc, _)| *loc).collect();
        locations.sort_unstable();
        locations.dedup();
        locations
    }

    /// 检查每个组合都有提示词
    ///
    /// 派发开始前调用，缺任何一条都是结构初始化错误。
    pub fn verify_complete(
        &self,
        backends: &[String],
        locations: &[ProbeLocation],
        question_ids: &[QuestionId],
    ) -> Result<(), SetupError> {
        for backend in backends {
            for &location in locations {
                for &question_id in question_ids {
                    if self.get(backend, location, question_id).is_none() {
                        return Err(SetupError::MissingPrompt {
                            backend: backend.clone(),
                            location,
                            question_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// 从目录加载：`<dir>/<backend>/p_<location>_<question>.txt`
    pub async fn load_dir(dir: &Path, backends: &[String]) -> AppResult<Self> {
        if !dir.exists() {
            return Err(FileError::DirectoryNotFound {
                path: dir.display().to_string(),
            }
            .into());
        }

        let mut book = Self::new();
        for backend in backends {
            let backend_dir = dir.join(backend);
            if !backend_dir.exists() {
                // 缺目录留给 verify_complete 报告具体缺哪一条
                continue;
            }

            let mut entries = tokio::fs::read_dir(&backend_dir)
                .await
                .map_err(|e| AppError::file_read_failed(backend_dir.display().to_string(), e))?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some((location, question_id)) = parse_prompt_file_name(&path) else {
                    continue;
                };
                let prompt = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))?;
                book.insert(backend.clone(), location, question_id, prompt);
            }
        }

        info!("已加载 {} 条提示词 ({})", book.len(), dir.display());
        Ok(book)
    }
}

/// 解析 `p_<location>_<question>.txt`
fn parse_prompt_file_name(path: &Path) -> Option<(ProbeLocation, QuestionId)> {
    if path.extension().and_then(|s| s.to_str()) != Some("txt") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("p_")?;
    let (location, question) = rest.split_once('_')?;
    Some((location.parse().ok()?, question.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prompt_file_name() {
        assert_eq!(
            parse_prompt_file_name(Path::new("/x/gpt/p_2500_17.txt")),
            Some((2500, 17))
        );
        assert_eq!(parse_prompt_file_name(Path::new("p_2500.txt")), None);
        assert_eq!(parse_prompt_file_name(Path::new("p_1_2.json")), None);
    }

    #[test]
    fn test_verify_complete_reports_missing_prompt() {
        let mut book = PromptBook::new();
        book.insert("gpt", 100, 1, "prompt");

        let backends = vec!["gpt".to_string()];
        assert!(book.verify_complete(&backends, &[100], &[1]).is_ok());

        let err = book.verify_complete(&backends, &[100], &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            SetupError::MissingPrompt {
                location: 100,
                question_id: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_load_dir_reads_prompt_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend_dir = dir.path().join("gpt");
        std::fs::create_dir_all(&backend_dir).unwrap();
        std::fs::write(backend_dir.join("p_500_3.txt"), "long prompt").unwrap();
        std::fs::write(backend_dir.join("notes.md"), "ignored").unwrap();

        let book = PromptBook::load_dir(dir.path(), &["gpt".to_string()])
            .await
            .unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book.get("gpt", 500, 3), Some("long prompt"));
        assert_eq!(book.locations(), vec![500]);
    }
}
