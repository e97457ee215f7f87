//! Credential lifetime gate for submissions.
//!
//! [`AccessToken`] caches the remaining validity of a credential (a grid
//! proxy, a token) and only asks the credential source again when the cached
//! value has decayed below what the caller needs and a cooldown has passed, or
//! when the cache is older than the staleness bound.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::process::{ProcessError, ProcessRunner};
use crate::error::CredentialError;

/// Reports how long the credential stays valid, in seconds.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn query_timeleft(&self) -> Result<u64, CredentialError>;
}

/// Credential that never expires, for backends that need none.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialCredential;

#[async_trait]
impl CredentialSource for TrivialCredential {
    async fn query_timeleft(&self) -> Result<u64, CredentialError> {
        Ok(u64::MAX)
    }
}

/// Credential inspected through an external command printing `key : value` lines.
#[derive(Debug, Clone)]
pub struct CommandCredential {
    runner: ProcessRunner,
    program: String,
    args: Vec<String>,
    key: String,
}

impl CommandCredential {
    pub fn new(runner: ProcessRunner, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            args,
            key: "timeleft".to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl CredentialSource for CommandCredential {
    async fn query_timeleft(&self) -> Result<u64, CredentialError> {
        let output = self
            .runner
            .run(&self.program, &self.args)
            .await
            .map_err(|e| match e {
                ProcessError::Timeout(t) => CredentialError::Timeout(t.as_secs()),
                ProcessError::Spawn(e) => {
                    CredentialError::CommandFailed(format!("{}: {}", self.program, e))
                }
            })?;
        if !output.success() {
            return Err(CredentialError::CommandFailed(format!(
                "{} {}",
                self.program,
                output.describe_failure()
            )));
        }
        parse_timeleft(&output.stdout, &self.key)
    }
}

/// Extract the remaining lifetime from `key : value` output.
///
/// The value is either a number of seconds or `HH:MM:SS`.
pub fn parse_timeleft(output: &str, key: &str) -> Result<u64, CredentialError> {
    let value = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
        .ok_or_else(|| CredentialError::Missing(key.to_string()))?;
    parse_duration_value(value)
}

fn parse_duration_value(value: &str) -> Result<u64, CredentialError> {
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(seconds);
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(CredentialError::Parse(value.to_string()));
    }
    let mut total = 0u64;
    for part in parts {
        let n: u64 = part
            .trim()
            .parse()
            .map_err(|_| CredentialError::Parse(value.to_string()))?;
        total = total
            .checked_mul(60)
            .and_then(|t| t.checked_add(n))
            .ok_or_else(|| CredentialError::Parse(value.to_string()))?;
    }
    Ok(total)
}

/// Timing policy of an [`AccessToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Safety margin required on top of the requested lifetime (seconds)
    pub lower_limit: u64,
    /// Cooldown between refreshes triggered by a low cached value (seconds)
    pub min_query_interval: u64,
    /// Cached values older than this are always refreshed (seconds)
    pub max_query_interval: u64,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            lower_limit: 300,
            min_query_interval: 60,
            max_query_interval: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedLifetime {
    queried_at: Instant,
    remaining: u64,
}

impl CachedLifetime {
    fn decayed(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.queried_at).as_secs();
        self.remaining.saturating_sub(elapsed)
    }
}

pub struct AccessToken {
    source: Box<dyn CredentialSource>,
    policy: AccessPolicy,
    cache: Mutex<Option<CachedLifetime>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    pub fn new(source: impl CredentialSource + 'static, policy: AccessPolicy) -> Self {
        Self {
            source: Box::new(source),
            policy,
            cache: Mutex::new(None),
        }
    }

    /// Token backed by [`TrivialCredential`] with no safety margin.
    pub fn trivial() -> Self {
        Self::new(
            TrivialCredential,
            AccessPolicy {
                lower_limit: 0,
                ..AccessPolicy::default()
            },
        )
    }

    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    fn cached(&self) -> Option<CachedLifetime> {
        *self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remaining lifetime in seconds, refreshing the cache when needed.
    pub async fn get_timeleft(&self, threshold: u64) -> Result<u64, CredentialError> {
        let now = Instant::now();
        if let Some(cached) = self.cached() {
            let since = now.saturating_duration_since(cached.queried_at);
            let remaining = cached.decayed(now);
            let cooled_down = since >= Duration::from_secs(self.policy.min_query_interval);
            let stale = since >= Duration::from_secs(self.policy.max_query_interval);
            if !stale && (remaining >= threshold || !cooled_down) {
                return Ok(remaining);
            }
        }
        self.refresh().await
    }

    /// Whether a job needing `required` seconds may be submitted now.
    pub async fn can_submit(&self, required: u64) -> Result<bool, CredentialError> {
        let timeleft = self.get_timeleft(required).await?;
        let needed = required.saturating_add(self.policy.lower_limit);
        if timeleft < needed {
            tracing::warn!(timeleft, needed, "Credential lifetime too short for submission");
        }
        Ok(timeleft >= needed)
    }

    async fn refresh(&self) -> Result<u64, CredentialError> {
        let old = self.cached().map(|c| c.decayed(Instant::now()));
        let remaining = self.source.query_timeleft().await?;
        *self.cache.lock().unwrap_or_else(|p| p.into_inner()) = Some(CachedLifetime {
            queried_at: Instant::now(),
            remaining,
        });
        tracing::info!(old = ?old, new = remaining, "Refreshed credential lifetime");
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        remaining: u64,
        queries: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn query_timeleft(&self) -> Result<u64, CredentialError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.remaining)
        }
    }

    fn counting(remaining: u64) -> (AccessToken, Arc<AtomicU32>) {
        let queries = Arc::new(AtomicU32::new(0));
        let token = AccessToken::new(
            CountingSource {
                remaining,
                queries: queries.clone(),
            },
            AccessPolicy::default(),
        );
        (token, queries)
    }

    #[test]
    fn parses_seconds_and_clock_format() {
        assert_eq!(parse_timeleft("timeleft : 3600", "timeleft").unwrap(), 3600);
        assert_eq!(
            parse_timeleft("subject : /CN=me\ntimeleft : 11:59:50\n", "timeleft").unwrap(),
            11 * 3600 + 59 * 60 + 50
        );
    }

    #[test]
    fn oversized_clock_value_is_a_parse_error() {
        let huge = format!("timeleft : {}:00:00", u64::MAX);
        assert_eq!(
            parse_timeleft(&huge, "timeleft"),
            Err(CredentialError::Parse(format!("{}:00:00", u64::MAX)))
        );
    }

    #[test]
    fn missing_key_and_garbage_are_distinct_errors() {
        assert_eq!(
            parse_timeleft("subject : /CN=me", "timeleft"),
            Err(CredentialError::Missing("timeleft".to_string()))
        );
        assert!(matches!(
            parse_timeleft("timeleft : soon", "timeleft"),
            Err(CredentialError::Parse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_queries_then_serves_from_cache() {
        let (token, queries) = counting(7200);
        assert_eq!(token.get_timeleft(0).await.unwrap(), 7200);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(token.get_timeleft(0).await.unwrap(), 7190);
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn low_value_waits_for_cooldown_before_refresh() {
        let (token, queries) = counting(1000);
        token.get_timeleft(0).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!token.can_submit(900).await.unwrap());
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        token.get_timeleft(2000).await.unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_is_always_refreshed() {
        let (token, queries) = counting(100_000);
        token.get_timeleft(0).await.unwrap();
        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        token.get_timeleft(0).await.unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 1);
        tokio::time::advance(Duration::from_secs(60)).await;
        token.get_timeleft(0).await.unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn can_submit_requires_lower_limit_margin() {
        let (token, _) = counting(4000);
        assert!(token.can_submit(3700).await.unwrap());
        assert!(!token.can_submit(3701).await.unwrap());
    }

    #[tokio::test]
    async fn trivial_token_always_allows() {
        let token = AccessToken::trivial();
        assert!(token.can_submit(u64::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn failing_inspection_command_is_credential_error() {
        let source = CommandCredential::new(ProcessRunner::default(), "false", Vec::new());
        let token = AccessToken::new(source, AccessPolicy::default());
        assert!(matches!(
            token.can_submit(60).await,
            Err(CredentialError::CommandFailed(_))
        ));
    }

    #[tokio::test]
    async fn inspection_command_output_is_parsed() {
        let source = CommandCredential::new(
            ProcessRunner::default(),
            "sh",
            vec!["-c".to_string(), "echo 'timeleft  : 01:00:00'".to_string()],
        );
        assert_eq!(source.query_timeleft().await.unwrap(), 3600);
    }
}
