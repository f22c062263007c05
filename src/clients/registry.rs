//! 后端注册表
//!
//! 进程启动时构建一次，显式传给派发器和评审器。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clients::{Backend, OllamaClient, OpenAiCompatibleClient};
use crate::config::{api_key, Config};
use crate::error::{AppResult, ConfigError, SetupError};
use crate::infrastructure::{RateBudget, TicketBroker};
use crate::models::{provider_defaults, BackendRole, BackendSpec, Protocol};

/// 一个后端及其绑定的资源
///
/// 生成和评审使用两个独立的并发池，同时充当被测后端和评审的模型不会把自己饿死。
#[derive(Clone)]
pub struct BackendHandle {
    client: Arc<dyn Backend>,
    broker: Arc<TicketBroker>,
    generation_pool: Arc<Semaphore>,
    evaluation_pool: Arc<Semaphore>,
}

impl BackendHandle {
    pub fn new(
        client: Arc<dyn Backend>,
        broker: Arc<TicketBroker>,
        generation_permits: usize,
        evaluation_permits: usize,
    ) -> Self {
        Self {
            client,
            broker,
            generation_pool: Arc::new(Semaphore::new(generation_permits.max(1))),
            evaluation_pool: Arc::new(Semaphore::new(evaluation_permits.max(1))),
        }
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub fn client(&self) -> &Arc<dyn Backend> {
        &self.client
    }

    pub fn broker(&self) -> &Arc<TicketBroker> {
        &self.broker
    }

    pub fn generation_pool(&self) -> &Arc<Semaphore> {
        &self.generation_pool
    }

    pub fn evaluation_pool(&self) -> &Arc<Semaphore> {
        &self.evaluation_pool
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id())
            .field("broker", &self.broker.name())
            .finish()
    }
}

/// 后端注册表
#[derive(Debug, Default)]
pub struct BackendRegistry {
    handles: HashMap<String, BackendHandle>,
    subjects: Vec<String>,
    judges: Vec<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个后端，名称重复是结构错误
    pub fn register(&mut self, handle: BackendHandle, roles: &[BackendRole]) -> Result<(), SetupError> {
        let name = handle.id().to_string();
        if self.handles.contains_key(&name) {
            return Err(SetupError::DuplicateKey { key: name });
        }
        if roles.contains(&BackendRole::Subject) {
            self.subjects.push(name.clone());
        }
        if roles.contains(&BackendRole::Judge) {
            self.judges.push(name.clone());
        }
        self.handles.insert(name, handle);
        Ok(())
    }

    /// 按配置构建注册表
    ///
    /// 同一限流组的后端共享一个票据代理，预算取组内第一个后端的设置。
    pub fn from_specs(specs: &[BackendSpec], config: &Config) -> AppResult<Self> {
        let mut registry = Self::new();
        let mut brokers: HashMap<String, Arc<TicketBroker>> = HashMap::new();

        for spec in specs {
            let defaults = provider_defaults(&spec.provider).ok_or_else(|| {
                ConfigError::UnknownProvider {
                    backend: spec.name.clone(),
                    provider: spec.provider.clone(),
                }
            })?;

            let broker = brokers
                .entry(spec.rate_group_key().to_string())
                .or_insert_with(|| {
                    let rpm = spec.requests_per_minute.unwrap_or(defaults.requests_per_minute);
                    let budget = if spec.spread {
                        RateBudget::spread_per_minute(rpm)
                    } else {
                        RateBudget::per_minute(rpm)
                    };
                    Arc::new(TicketBroker::new(
                        spec.rate_group_key(),
                        budget,
                        config.ticket_timeout,
                    ))
                })
                .clone();

            let api_base = spec.api_base.as_deref().unwrap_or(defaults.api_base);
            let (client, generation_permits, evaluation_permits): (Arc<dyn Backend>, usize, usize) =
                match defaults.protocol {
                    Protocol::OpenAiCompatible => {
                        let key = match defaults.api_key_var {
                            Some(var) => api_key(var)?,
                            None => String::new(),
                        };
                        let client = OpenAiCompatibleClient::new(
                            &spec.name,
                            &spec.model,
                            api_base,
                            &key,
                            spec.max_input,
                        );
                        (
                            Arc::new(client),
                            config.generation_pool_size,
                            config.judge_pool_size,
                        )
                    }
                    // 本地模型一次只跑一个请求
                    Protocol::Ollama => (
                        Arc::new(OllamaClient::new(&spec.name, &spec.model, api_base, spec.max_input)),
                        1,
                        1,
                    ),
                };

            registry.register(
                BackendHandle::new(client, broker, generation_permits, evaluation_permits),
                &spec.roles,
            )?;
        }

        registry.ensure_roles_filled()?;
        info!(
            "后端注册完成: 被测 {} 个, 评审 {} 个, 票据代理 {} 个",
            registry.subjects.len(),
            registry.judges.len(),
            brokers.len()
        );
        Ok(registry)
    }

    /// 被测后端和评审团都不能为空
    pub fn ensure_roles_filled(&self) -> Result<(), ConfigError> {
        if self.subjects.is_empty() {
            return Err(ConfigError::NoBackends {
                role: "被测".to_string(),
            });
        }
        if self.judges.is_empty() {
            return Err(ConfigError::NoBackends {
                role: "评审".to_string(),
            });
        }
        Ok(())
    }

    pub fn handle(&self, name: &str) -> Result<&BackendHandle, SetupError> {
        self.handles.get(name).ok_or_else(|| SetupError::UnknownBackend {
            backend: name.to_string(),
        })
    }

    /// 被测后端名称（注册顺序）
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// 评审团名称（注册顺序，即评审槽位顺序）
    pub fn judges(&self) -> &[String] {
        &self.judges
    }

    /// 评审团句柄（评审槽位顺序）
    pub fn judge_panel(&self) -> Result<Vec<BackendHandle>, SetupError> {
        self.judges
            .iter()
            .map(|name| self.handle(name).cloned())
            .collect()
    }

    /// 去重后的全部票据代理
    pub fn brokers(&self) -> Vec<Arc<TicketBroker>> {
        let mut brokers: Vec<Arc<TicketBroker>> = Vec::new();
        for handle in self.handles.values() {
            if !brokers.iter().any(|b| Arc::ptr_eq(b, handle.broker())) {
                brokers.push(handle.broker().clone());
            }
        }
        brokers
    }

    /// 为每个票据代理启动补充任务
    pub fn start_refills(&self) -> Vec<JoinHandle<()>> {
        self.brokers().iter().map(TicketBroker::spawn_refill).collect()
    }

    /// 关闭全部票据代理
    pub fn shutdown(&self) {
        for broker in self.brokers() {
            broker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::BackendError;
    use async_trait::async_trait;

    struct Echo(&'static str);

    #[async_trait]
    impl Backend for Echo {
        fn id(&self) -> &str {
            self.0
        }

        fn max_input(&self) -> usize {
            1000
        }

        async fn invoke(&self, prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
            Ok(prompt.to_string())
        }
    }

    fn handle(name: &'static str, broker: &Arc<TicketBroker>) -> BackendHandle {
        BackendHandle::new(Arc::new(Echo(name)), broker.clone(), 2, 2)
    }

    #[test]
    fn test_register_tracks_roles_in_order() {
        let broker = Arc::new(TicketBroker::new("shared", RateBudget::per_minute(10), None));
        let mut registry = BackendRegistry::new();
        registry
            .register(handle("a", &broker), &[BackendRole::Subject])
            .unwrap();
        registry
            .register(handle("b", &broker), &[BackendRole::Subject, BackendRole::Judge])
            .unwrap();
        registry
            .register(handle("c", &broker), &[BackendRole::Judge])
            .unwrap();

        assert_eq!(registry.subjects(), ["a", "b"]);
        assert_eq!(registry.judges(), ["b", "c"]);
        assert_eq!(registry.brokers().len(), 1);
        assert!(registry.ensure_roles_filled().is_ok());
    }

    #[test]
    fn test_duplicate_and_unknown_backends() {
        let broker = Arc::new(TicketBroker::new("x", RateBudget::per_minute(10), None));
        let mut registry = BackendRegistry::new();
        registry.register(handle("a", &broker), &[BackendRole::Subject]).unwrap();

        let dup = registry.register(handle("a", &broker), &[BackendRole::Judge]);
        assert!(matches!(dup, Err(SetupError::DuplicateKey { .. })));
        assert!(matches!(registry.handle("zzz"), Err(SetupError::UnknownBackend { .. })));
        assert!(matches!(
            registry.ensure_roles_filled(),
            Err(ConfigError::NoBackends { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_specs_shares_brokers_by_rate_group() {
        let specs: Vec<BackendSpec> = toml::from_str::<crate::models::BackendFile>(
            r#"
            [[backends]]
            name = "llama-small"
            provider = "ollama"
            model = "llama3:8b"
            rate_group = "local"

            [[backends]]
            name = "llama-judge"
            provider = "ollama"
            model = "llama3:70b"
            rate_group = "local"
            roles = ["judge"]
            "#,
        )
        .unwrap()
        .backends;

        let registry = BackendRegistry::from_specs(&specs, &Config::default()).unwrap();
        assert_eq!(registry.brokers().len(), 1);
        assert_eq!(registry.handle("llama-small").unwrap().generation_pool().available_permits(), 1);
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let spec = BackendSpec {
            name: "mystery".to_string(),
            provider: "nowhere".to_string(),
            model: "m".to_string(),
            api_base: None,
            max_input: 1000,
            requests_per_minute: None,
            spread: false,
            rate_group: None,
            roles: vec![BackendRole::Subject],
        };
        let err = BackendRegistry::from_specs(&[spec], &Config::default()).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }
}
