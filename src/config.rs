use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// 完整测评：生成答案并由评审团投票
    #[default]
    Benchmark,
    /// 载入已有结果，只重新评审
    Reevaluate,
    /// 载入已有结果，只输出报告
    Report,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "benchmark" => Ok(RunMode::Benchmark),
            "reevaluate" | "re-evaluate" => Ok(RunMode::Reevaluate),
            "report" => Ok(RunMode::Report),
            other => Err(ConfigError::UnknownRunMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 每个 (后端, 位置, 题目) 重复试验次数
    pub trial_count: u32,
    /// 每个被测后端的生成并发数
    pub generation_pool_size: usize,
    /// 每个评审后端的评审并发数
    pub judge_pool_size: usize,
    /// 状态监控排空间隔
    pub status_interval: Duration,
    // --- 重试配置 ---
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    /// 限流拒绝的重试上限（不消耗普通重试次数）
    pub rate_limit_retries: u32,
    /// 领取票据的等待上限，`None` 表示一直等
    pub ticket_timeout: Option<Duration>,
    /// 单次后端调用超时
    pub call_timeout: Option<Duration>,
    /// 每排空多少次写一次检查点，0 表示不写
    pub checkpoint_every: u32,
    // --- 文件配置 ---
    pub questions_file: PathBuf,
    pub prompt_dir: PathBuf,
    pub backends_file: PathBuf,
    /// 结果根目录，每次运行在其下按日期建子目录
    pub result_dir: PathBuf,
    /// 重新评审 / 报告模式读取的已有结果目录
    pub resume_dir: Option<PathBuf>,
    /// 探测位置，不指定时从提示词目录推断
    pub probe_locations: Option<Vec<u64>>,
    pub run_mode: RunMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trial_count: 5,
            generation_pool_size: 100,
            judge_pool_size: 250,
            status_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            rate_limit_retries: 100,
            ticket_timeout: None,
            call_timeout: Some(Duration::from_secs(90)),
            checkpoint_every: 12,
            questions_file: PathBuf::from("questions.toml"),
            prompt_dir: PathBuf::from("prompts"),
            backends_file: PathBuf::from("backends.toml"),
            result_dir: PathBuf::from("tests"),
            resume_dir: None,
            probe_locations: None,
            run_mode: RunMode::Benchmark,
        }
    }
}

impl Config {
    /// 从环境变量读取配置，未设置的字段使用默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 从任意键值来源读取配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            parse_var(&lookup, name, default.as_secs()).map(Duration::from_secs)
        };
        let optional_secs = |name: &str, default: Option<Duration>| -> Result<Option<Duration>, ConfigError> {
            match lookup(name) {
                // 0 表示关闭
                Some(value) => parse_value::<u64>(name, &value)
                    .map(|n| (n > 0).then(|| Duration::from_secs(n))),
                None => Ok(default),
            }
        };

        Ok(Self {
            trial_count: parse_var(&lookup, "TRIAL_COUNT", default.trial_count)?,
            generation_pool_size: parse_var(&lookup, "GENERATION_POOL_SIZE", default.generation_pool_size)?,
            judge_pool_size: parse_var(&lookup, "JUDGE_POOL_SIZE", default.judge_pool_size)?,
            status_interval: secs("STATUS_INTERVAL_SECS", default.status_interval)?,
            retry_attempts: parse_var(&lookup, "RETRY_ATTEMPTS", default.retry_attempts)?,
            retry_base_delay: secs("RETRY_BASE_DELAY_SECS", default.retry_base_delay)?,
            rate_limit_retries: parse_var(&lookup, "RATE_LIMIT_RETRIES", default.rate_limit_retries)?,
            ticket_timeout: optional_secs("TICKET_TIMEOUT_SECS", default.ticket_timeout)?,
            call_timeout: optional_secs("CALL_TIMEOUT_SECS", default.call_timeout)?,
            checkpoint_every: parse_var(&lookup, "CHECKPOINT_EVERY", default.checkpoint_every)?,
            questions_file: lookup("QUESTIONS_FILE").map(PathBuf::from).unwrap_or(default.questions_file),
            prompt_dir: lookup("PROMPT_DIR").map(PathBuf::from).unwrap_or(default.prompt_dir),
            backends_file: lookup("BACKENDS_FILE").map(PathBuf::from).unwrap_or(default.backends_file),
            result_dir: lookup("RESULT_DIR").map(PathBuf::from).unwrap_or(default.result_dir),
            resume_dir: lookup("RESUME_DIR").map(PathBuf::from).or(default.resume_dir),
            probe_locations: match lookup("PROBE_LOCATIONS") {
                Some(value) => Some(parse_locations(&value)?),
                None => default.probe_locations,
            },
            run_mode: match lookup("RUN_MODE") {
                Some(value) => value.parse()?,
                None => default.run_mode,
            },
        })
    }
}

/// 读取 API 密钥：先找 `NIAN_<VAR>`，再找 `<VAR>`
pub fn api_key(var_name: &str) -> Result<String, ConfigError> {
    api_key_from(var_name, |name| std::env::var(name).ok())
}

fn api_key_from<F>(var_name: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(&format!("NIAN_{}", var_name))
        .or_else(|| lookup(var_name))
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ConfigError::ApiKeyNotFound {
            var_name: var_name.to_string(),
        })
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => parse_value(name, &value),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: name.to_string(),
            value: value.to_string(),
            expected_type: std::any::type_name::<T>().to_string(),
        })
}

fn parse_locations(value: &str) -> Result<Vec<u64>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_value("PROBE_LOCATIONS", part))
        .collect()
}
