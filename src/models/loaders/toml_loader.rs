use std::path::Path;

use tokio::fs;
use tracing::info;

use crate::error::{AppError, AppResult, FileError};
use crate::models::{BackendFile, BackendSpec, Question, QuestionFile};

async fn read_toml_file(path: &Path) -> AppResult<String> {
    if !path.exists() {
        return Err(FileError::NotFound {
            path: path.display().to_string(),
        }
        .into());
    }
    fs::read_to_string(path)
        .await
        .map_err(|e| AppError::file_read_failed(path.display().to_string(), e))
}

/// 从 TOML 文件加载题目列表
pub async fn load_questions(path: &Path) -> AppResult<Vec<Question>> {
    let content = read_toml_file(path).await?;
    let file: QuestionFile = toml::from_str(&content)
        .map_err(|e| AppError::toml_parse_failed(path.display().to_string(), e))?;

    info!("成功加载 {} 个题目 ({})", file.questions.len(), path.display());
    Ok(file.questions)
}

/// 从 TOML 文件加载后端配置
pub async fn load_backend_specs(path: &Path) -> AppResult<Vec<BackendSpec>> {
    let content = read_toml_file(path).await?;
    let file: BackendFile = toml::from_str(&content)
        .map_err(|e| AppError::toml_parse_failed(path.display().to_string(), e))?;

    info!("成功加载 {} 个后端配置 ({})", file.backends.len(), path.display());
    Ok(file.backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_questions_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("questions.toml");
        std::fs::write(
            &path,
            r#"
            [[questions]]
            id = 1
            text = "The lighthouse keeper was named Ada."
            question = "What was the keeper's name?"
            answer = "Ada"

            [[questions]]
            id = 2
            text = "The ship left on a Tuesday."
            question = "Which day did the ship leave?"
            answer = "Tuesday"
            alternate_answers = ["Tues"]
            "#,
        )
        .unwrap();

        let questions = load_questions(&path).await.unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].answer, "Ada");
        assert!(questions[1].has_alternate_answers());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let err = load_questions(Path::new("/definitely/not/here.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::File(FileError::NotFound { .. })));
    }
}
