use anyhow::{Result, bail};
use log::debug;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::{
    http::{DEFAULT_TIMEOUT, HttpClient, PoolConfig, RetryPolicy},
    runtime::Runtime,
    workflow::{DEFAULT_IDENTITY, WorkflowClient},
};

/// Environment variable holding the workflow API key.
pub const API_KEY_ENV: &str = "WFCALL_API_KEY";

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("wfcall/", env!("WFCALL_VERSION"));

/// Everything needed to talk to one workflow endpoint.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    /// Falls back to `WFCALL_API_KEY` when unset
    pub api_key: Option<String>,
    pub identity: String,
    pub policy: RetryPolicy,
    pub timeout: Duration,
    pub pool: PoolConfig,
}

impl Settings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            identity: DEFAULT_IDENTITY.to_string(),
            policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            pool: PoolConfig::default(),
        }
    }
}

pub struct Config<R: Runtime> {
    pub client: WorkflowClient<R>,
}

impl<R: Runtime> Config<R> {
    /// Builds a dedicated pooled client for `settings`.
    pub fn new(runtime: R, settings: Settings) -> Result<Self> {
        let http = HttpClient::build(settings.pool, USER_AGENT, HeaderMap::new())?;
        Self::with_http(runtime, settings, http)
    }

    /// Uses an existing, possibly shared, client. `settings.pool` is ignored.
    pub fn with_http(runtime: R, settings: Settings, http: HttpClient) -> Result<Self> {
        let api_key = match settings.api_key {
            Some(key) => key,
            None => match runtime.env_var(API_KEY_ENV) {
                Ok(key) => key,
                Err(_) => bail!(
                    "No API key given. Pass --api-key or set the {} environment variable.",
                    API_KEY_ENV
                ),
            },
        };
        if api_key.trim().is_empty() {
            bail!("The workflow API key is empty.");
        }
        debug!("Using workflow API key: {}", mask_secret(&api_key));

        let client = WorkflowClient::with_runtime(runtime, http, settings.url, &api_key)?
            .with_identity(settings.identity)
            .with_policy(settings.policy)
            .with_timeout(settings.timeout);

        Ok(Self { client })
    }
}

/// Shows just enough of a secret to tell keys apart in logs.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::workflow::{DeliveryMode, Fields, WorkflowRequest};
    use mockito::Server;
    use tokio_util::sync::CancellationToken;

    /// Helper function to verify Authorization header behavior
    /// - `flag_key`: key passed explicitly, otherwise the environment is consulted
    async fn verify_authorization_header(flag_key: Option<&str>, env_key: &str) {
        let mut runtime = MockRuntime::new();
        let env_key_owned = env_key.to_string();
        runtime
            .expect_env_var()
            .with(mockall::predicate::eq(API_KEY_ENV))
            .times(if flag_key.is_some() { 0 } else { 1 })
            .returning(move |_| Ok(env_key_owned.clone()));

        let expected = flag_key.unwrap_or(env_key);

        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/workflows/run")
            .match_header("authorization", format!("Bearer {}", expected).as_str())
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .with_body(r#"{"data":{"outputs":{}}}"#)
            .create_async()
            .await;

        let mut settings = Settings::new(format!("{}/v1/workflows/run", server.url()));
        settings.api_key = flag_key.map(str::to_string);
        let config = Config::new(runtime, settings).unwrap();

        let request = WorkflowRequest::new(Fields::new(), DeliveryMode::Blocking, "tester");
        let result = config
            .client
            .invoke(&request, &CancellationToken::new())
            .await;

        mock.assert_async().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_config_uses_api_key_from_environment() {
        verify_authorization_header(None, "app-env-key-0123456789").await;
    }

    #[tokio::test]
    async fn test_config_prefers_explicit_api_key() {
        verify_authorization_header(Some("app-flag-key-0123456789"), "app-env-key").await;
    }

    #[test]
    fn test_config_without_api_key_fails() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_env_var()
            .with(mockall::predicate::eq(API_KEY_ENV))
            .returning(|_| Err(std::env::VarError::NotPresent));

        let result = Config::new(runtime, Settings::new("http://localhost/run"));
        let err = result.err().unwrap();
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn test_config_with_blank_api_key_fails() {
        let mut settings = Settings::new("http://localhost/run");
        settings.api_key = Some("  ".to_string());
        assert!(Config::new(MockRuntime::new(), settings).is_err());
    }

    #[test]
    fn test_config_applies_settings() {
        let mut settings = Settings::new("http://localhost/run");
        settings.api_key = Some("app-key".to_string());
        settings.identity = "scheduler".to_string();
        settings.policy = RetryPolicy::new(1, Duration::from_secs(2), Duration::from_secs(4));
        settings.pool = PoolConfig {
            max_idle_per_host: 2,
            max_connections: 3,
        };

        let config = Config::new(MockRuntime::new(), settings).unwrap();
        assert_eq!(config.client.identity(), "scheduler");
        assert_eq!(config.client.policy().max_retries, 1);
        assert_eq!(config.client.http().pool().max_connections, 3);
    }

    #[test]
    fn test_config_with_shared_http_client() {
        let http = HttpClient::build(
            PoolConfig {
                max_idle_per_host: 1,
                max_connections: 2,
            },
            USER_AGENT,
            HeaderMap::new(),
        )
        .unwrap();
        let mut settings = Settings::new("http://localhost/run");
        settings.api_key = Some("app-key".to_string());

        let config = Config::with_http(MockRuntime::new(), settings, http.clone()).unwrap();
        assert_eq!(config.client.http().pool().max_connections, 2);

        http.close();
        assert!(config.client.http().is_closed());
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("app-lJpX4GANg9d6pud8"), "app-*********pud8");
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret("ab"), "****");
    }
}
