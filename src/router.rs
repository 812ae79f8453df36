//! Intent classification and turn planning.
//!
//! Precedence for every entry point (HTTP, SSE, WebSocket, CLI):
//! 1. exact shortcut phrases (`"ad booking"`, ...) resolved by table lookup;
//! 2. the configured [`IntentClassifier`];
//! 3. any classifier error becomes [`Intent::Other`].

use std::sync::Arc;

use async_trait::async_trait;
use patrika_assist_core::intent::{parse_classifier_output, resolve, ClassificationError, Intent};
use patrika_assist_core::routing::{route, shortcut, ResponseStrategy, SupportMenu};

use crate::generation::{GenerationParams, TextGenerator};

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<Intent, ClassificationError>;
}

/// Used when `classifier.provider = "disabled"`: every query is `other`.
pub struct DisabledClassifier;

#[async_trait]
impl IntentClassifier for DisabledClassifier {
    async fn classify(&self, _query: &str) -> Result<Intent, ClassificationError> {
        Err(ClassificationError::Disabled)
    }
}

/// Classifies by prompting the text generator for a JSON verdict.
pub struct LlmClassifier {
    generator: Arc<dyn TextGenerator>,
    params: GenerationParams,
}

impl LlmClassifier {
    pub fn new(generator: Arc<dyn TextGenerator>, params: GenerationParams) -> Self {
        Self { generator, params }
    }
}

pub fn classification_prompt(query: &str) -> String {
    format!(
        r#"query = {query}
tell me the intent based on the query
out of following intents:
- refund
- rp (want to know related to the platform rajasthan patrika)
- ad_booking (want to know related to the advertisement booking)
- customer (want to know related to book ad for customer)
- agency (want to know related to book ad for agency)
- other

{{
    "intent": "refund/rp/ad_booking/customer/agency/other"
}}

don't give any other text like ```json or ``` and response just give the json format response"#
    )
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(&self, query: &str) -> Result<Intent, ClassificationError> {
        let raw = self
            .generator
            .generate(&classification_prompt(query), &self.params)
            .await
            .map_err(|e| ClassificationError::Upstream(e.to_string()))?;
        parse_classifier_output(&raw)
    }
}

/// How one turn will be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnPlan {
    pub intent: Intent,
    pub strategy: ResponseStrategy,
    pub menu: SupportMenu,
    /// Resolved from a shortcut phrase without classification.
    pub shortcut: bool,
}

#[derive(Clone)]
pub struct IntentRouter {
    classifier: Arc<dyn IntentClassifier>,
}

impl IntentRouter {
    pub fn new(classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }

    /// Classify a query. Never fails: errors are logged and become `other`.
    pub async fn classify(&self, query: &str) -> Intent {
        if let Some(hit) = shortcut(query) {
            return hit.intent;
        }
        let result = self.classifier.classify(query).await;
        if let Err(e) = &result {
            match e {
                ClassificationError::Disabled => {
                    tracing::debug!("classifier disabled; using 'other'")
                }
                other => tracing::warn!(error = %other, "classification failed; using 'other'"),
            }
        }
        resolve(result)
    }

    /// Decide intent, strategy and menu for a query.
    pub async fn plan(&self, query: &str) -> TurnPlan {
        if let Some(hit) = shortcut(query) {
            return TurnPlan {
                intent: hit.intent,
                strategy: ResponseStrategy::Canned(hit.reply),
                menu: route(hit.intent).menu,
                shortcut: true,
            };
        }
        let intent = self.classify(query).await;
        let r = route(intent);
        TurnPlan {
            intent,
            strategy: r.strategy,
            menu: r.menu,
            shortcut: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use patrika_assist_core::routing::CannedReply;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(s: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(s.to_string()),
                calls: AtomicUsize::new(0),
            })
        }
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err("quota exceeded".to_string()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn router_with(generator: Arc<Scripted>) -> IntentRouter {
        IntentRouter::new(Arc::new(LlmClassifier::new(
            generator,
            GenerationParams::default(),
        )))
    }

    #[tokio::test]
    async fn llm_verdict_is_used() {
        let router = router_with(Scripted::ok("```json\n{\"intent\": \"agency\"}\n```"));
        assert_eq!(router.classify("how do agencies book?").await, Intent::Agency);
        let plan = router.plan("how do agencies book?").await;
        assert_eq!(plan.strategy, ResponseStrategy::AgencyGuide);
        assert!(!plan.shortcut);
    }

    #[tokio::test]
    async fn failures_fall_back_to_other() {
        for router in [
            router_with(Scripted::failing()),
            router_with(Scripted::ok("")),
            router_with(Scripted::ok("{\"intent\": \"weather\"}")),
            router_with(Scripted::ok("I think it's about refunds")),
            IntentRouter::new(Arc::new(DisabledClassifier)),
        ] {
            assert_eq!(router.classify("hello").await, Intent::Other);
            assert_eq!(router.plan("hello").await.strategy, ResponseStrategy::General);
        }
    }

    #[tokio::test]
    async fn shortcut_skips_classifier() {
        let generator = Scripted::ok("{\"intent\": \"other\"}");
        let router = router_with(Arc::clone(&generator));
        let plan = router.plan("AD BOOKING").await;
        assert_eq!(plan.intent, Intent::AdBooking);
        assert_eq!(plan.strategy, ResponseStrategy::Canned(CannedReply::AdBooking));
        assert_eq!(plan.menu.options, &["Customer", "Agency"]);
        assert!(plan.shortcut);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn about_shortcut_uses_rp_menu() {
        let router = IntentRouter::new(Arc::new(DisabledClassifier));
        let plan = router.plan("rajasthan patrika").await;
        assert_eq!(plan.intent, Intent::Rp);
        assert_eq!(plan.strategy, ResponseStrategy::Canned(CannedReply::AboutPatrika));
        assert_eq!(plan.menu, route(Intent::Rp).menu);
    }

    #[test]
    fn prompt_lists_every_intent() {
        let prompt = classification_prompt("q");
        for intent in Intent::ALL {
            assert!(prompt.contains(intent.as_str()), "{intent}");
        }
    }
}
