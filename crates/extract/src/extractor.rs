use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::field::FieldSet;
use crate::heuristic::HeuristicExtractor;
use crate::result::{ExtractError, StructuredResult};

/// A text-to-record extractor.
///
/// Implementations must be cancellation-safe: the caller may drop the future when its
/// deadline passes, and nothing the extractor started may outlive that drop.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Extract the requested fields from `text`.
    async fn extract(&self, text: &str, fields: &FieldSet) -> Result<StructuredResult, ExtractError>;
}

/// Run `extractor` under a hard deadline. Exceeding it yields `ExtractError::Timeout`;
/// the in-flight call is dropped, not left running.
pub async fn extract_with_deadline(
    extractor: &dyn Extractor,
    text: &str,
    fields: &FieldSet,
    deadline: Duration,
) -> Result<StructuredResult, ExtractError> {
    match tokio::time::timeout(deadline, extractor.extract(text, fields)).await {
        Ok(result) => result,
        Err(_) => Err(ExtractError::Timeout(deadline.as_millis() as u64)),
    }
}

/// Which extractor produced a result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// The remote (LLM) extractor.
    Primary,
    /// The local pattern-based extractor. Results are degraded.
    Fallback,
}

/// When to swap a failed primary extraction for the local fallback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Never fall back; failures go through the retry budget.
    Never,
    /// Fall back on any primary failure.
    Always,
    /// Fall back only when this failure would otherwise exhaust the retry budget.
    #[default]
    OnFinalAttempt,
}

impl FallbackPolicy {
    pub fn should_fall_back(&self, error: &ExtractError, final_attempt: bool) -> bool {
        if !error.is_retryable() {
            return false;
        }
        match self {
            FallbackPolicy::Never => false,
            FallbackPolicy::Always => true,
            FallbackPolicy::OnFinalAttempt => final_attempt,
        }
    }
}

impl std::str::FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(FallbackPolicy::Never),
            "always" => Ok(FallbackPolicy::Always),
            "on_final_attempt" => Ok(FallbackPolicy::OnFinalAttempt),
            other => Err(format!(
                "unknown fallback policy `{other}` (expected never, always, on_final_attempt)"
            )),
        }
    }
}

/// A successful extraction plus the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub result: StructuredResult,
    pub strategy: ExtractionStrategy,
    /// Primary failure that triggered the fallback, if any.
    pub primary_error: Option<ExtractError>,
}

impl Extracted {
    pub fn is_degraded(&self) -> bool {
        self.strategy == ExtractionStrategy::Fallback
    }
}

/// Primary extractor + deadline + fallback selection, as one call.
#[derive(Clone)]
pub struct ExtractionPipeline {
    primary: Arc<dyn Extractor>,
    fallback: HeuristicExtractor,
    policy: FallbackPolicy,
    deadline: Duration,
}

impl ExtractionPipeline {
    pub fn new(primary: Arc<dyn Extractor>, deadline: Duration) -> Self {
        Self {
            primary,
            fallback: HeuristicExtractor::new(),
            policy: FallbackPolicy::default(),
            deadline,
        }
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Run the primary under the deadline; on failure, consult the policy.
    ///
    /// `final_attempt` tells the policy whether a failure here would kill the job.
    pub async fn run(
        &self,
        text: &str,
        fields: &FieldSet,
        final_attempt: bool,
    ) -> Result<Extracted, ExtractError> {
        debug!(
            extractor = self.primary.name(),
            deadline_ms = self.deadline.as_millis() as u64,
            "running primary extractor"
        );

        match extract_with_deadline(self.primary.as_ref(), text, fields, self.deadline).await {
            Ok(result) => Ok(Extracted {
                result,
                strategy: ExtractionStrategy::Primary,
                primary_error: None,
            }),
            Err(err) if self.policy.should_fall_back(&err, final_attempt) => {
                warn!(
                    extractor = self.primary.name(),
                    error = %err,
                    "primary extraction failed; using heuristic fallback"
                );
                let result = self.fallback.extract_sync(text, fields);
                Ok(Extracted {
                    result,
                    strategy: ExtractionStrategy::Fallback,
                    primary_error: Some(err),
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;

    struct Slow;

    #[async_trait::async_trait]
    impl Extractor for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn extract(&self, _: &str, _: &FieldSet) -> Result<StructuredResult, ExtractError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(ExtractError::upstream("unreachable"))
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Extractor for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn extract(&self, _: &str, _: &FieldSet) -> Result<StructuredResult, ExtractError> {
            Err(ExtractError::upstream("503 service unavailable"))
        }
    }

    fn fields() -> FieldSet {
        FieldSet::new([Field::Name, Field::Email]).unwrap()
    }

    #[tokio::test]
    async fn deadline_turns_slow_call_into_timeout() {
        let err = extract_with_deadline(&Slow, "x", &fields(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ExtractError::Timeout(50));
    }

    #[tokio::test]
    async fn never_policy_surfaces_primary_error() {
        let pipeline = ExtractionPipeline::new(Arc::new(Broken), Duration::from_secs(1))
            .with_policy(FallbackPolicy::Never);
        let err = pipeline.run("text", &fields(), true).await.unwrap_err();
        assert!(matches!(err, ExtractError::Upstream(_)));
    }

    #[tokio::test]
    async fn final_attempt_policy_falls_back_only_on_last_try() {
        let pipeline = ExtractionPipeline::new(Arc::new(Broken), Duration::from_secs(1));

        assert!(pipeline.run("Ada Lovelace", &fields(), false).await.is_err());

        let extracted = pipeline.run("Ada Lovelace", &fields(), true).await.unwrap();
        assert!(extracted.is_degraded());
        assert!(extracted.result.satisfies(&fields()));
        assert!(matches!(extracted.primary_error, Some(ExtractError::Upstream(_))));
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("ALWAYS".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::Always);
        assert_eq!(
            "on_final_attempt".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::OnFinalAttempt
        );
        assert!("sometimes".parse::<FallbackPolicy>().is_err());
    }
}
