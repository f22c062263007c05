use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 结果树结构初始化错误（致命，整个运行中止）
    #[error("结构初始化错误: {0}")]
    Setup(#[from] SetupError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 缺少 API 密钥
    #[error("未找到 API 密钥: {var_name}")]
    ApiKeyNotFound { var_name: String },
    /// 未知的后端提供方
    #[error("未知的后端提供方: {provider} (后端: {backend})")]
    UnknownProvider { backend: String, provider: String },
    /// 未知的运行模式
    #[error("未知的运行模式: {mode}")]
    UnknownRunMode { mode: String },
    /// 后端列表为空
    #[error("没有配置任何{role}后端")]
    NoBackends { role: String },
}

/// 结构初始化错误
///
/// 派发开始前构建结果树固定键空间时出现的任何错误都归入此类。
#[derive(Debug, Error)]
pub enum SetupError {
    /// 键重复
    #[error("结果树键重复: {key}")]
    DuplicateKey { key: String },
    /// 缺少提示词
    #[error("缺少提示词: 后端 {backend} 位置 {location} 题目 {question_id}")]
    MissingPrompt {
        backend: String,
        location: u64,
        question_id: u32,
    },
    /// 后端未注册
    #[error("后端未注册: {backend}")]
    UnknownBackend { backend: String },
    /// 结果树中找不到工作单元对应的试验
    #[error("结果树中不存在试验: {key}")]
    MissingTrial { key: String },
    /// 维度为空
    #[error("{axis} 列表为空")]
    EmptyAxis { axis: String },
    /// 结果树里的题目在题目文件中不存在
    #[error("题目 {question_id} 不在题目文件中")]
    UnknownQuestion { question_id: u32 },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

// ========== 从常见错误类型转换 ==========

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::File(FileError::JsonParseFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: String::new(), // TOML错误通常不包含路径信息
            source: Box::new(err),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件读取错误
    pub fn file_read_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建 TOML 解析错误
    pub fn toml_parse_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::TomlParseFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 创建 JSON 解析错误
    pub fn json_parse_failed(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::File(FileError::JsonParseFailed {
            path: path.into(),
            source: Box::new(source),
        })
    }

    /// 是否为结构初始化错误
    pub fn is_setup_error(&self) -> bool {
        matches!(self, AppError::Setup(_))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_is_classified() {
        let err: AppError = SetupError::DuplicateKey {
            key: "gpt/100/1/0".to_string(),
        }
        .into();
        assert!(err.is_setup_error());
        assert!(err.to_string().contains("gpt/100/1/0"));
    }

    #[test]
    fn test_io_error_converts_to_file_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: AppError = io.into();
        assert!(matches!(err, AppError::File(FileError::ReadFailed { .. })));
    }
}
