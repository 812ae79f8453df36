//! In-process fakes for the capability traits.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream;
use patrika_assist::config::Config;
use patrika_assist::generation::{GenerationParams, TextGenerator, TextStream};
use patrika_assist::services::Services;
use patrika_assist_core::embedding::{EmbedTask, EmbeddingGateway};
use patrika_assist_core::store::memory::InMemoryIndex;

/// Marker that makes [`KeywordEmbedder`] fail for a text.
pub const FAIL_EMBED: &str = "FAIL_EMBED";

/// Three-dimensional embeddings keyed on topic words.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingGateway for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str, _task: EmbedTask) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains(FAIL_EMBED) {
            bail!("embedding rejected");
        }
        let lower = text.to_lowercase();
        Ok(if lower.contains("founded") || lower.contains("history") {
            vec![1.0, 0.0, 0.0]
        } else if lower.contains("booking") || lower.contains("advert") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        })
    }
}

/// What [`ScriptedGenerator::stream`] produces.
#[derive(Clone)]
pub enum Script {
    /// Yield these deltas, then end.
    Deltas(Vec<&'static str>),
    /// Yield these deltas, then fail.
    FailAfter(Vec<&'static str>),
    /// Refuse to start.
    Unavailable,
    /// Yield `count` deltas, sleeping between each.
    Slow { count: usize, delay: Duration },
}

/// Answers classification prompts with `intent_reply` and everything else
/// according to its [`Script`]. Records every prompt it sees.
pub struct ScriptedGenerator {
    pub intent_reply: String,
    pub script: Script,
    pub prompts: Mutex<Vec<String>>,
    pub classify_calls: AtomicUsize,
    pub produced: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    pub fn new(intent_reply: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            intent_reply: intent_reply.to_string(),
            script,
            prompts: Mutex::new(Vec::new()),
            classify_calls: AtomicUsize::new(0),
            produced: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn answer_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

fn is_classification(prompt: &str) -> bool {
    prompt.contains("tell me the intent")
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        if is_classification(prompt) {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(self.intent_reply.clone());
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.script {
            Script::Deltas(d) => Ok(d.concat()),
            _ => bail!("scripted failure"),
        }
    }

    async fn stream(&self, prompt: &str, _params: &GenerationParams) -> Result<TextStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let produced = Arc::clone(&self.produced);
        match self.script.clone() {
            Script::Deltas(d) => Ok(Box::pin(stream::iter(d.into_iter().map(move |s| {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(s.to_string())
            })))),
            Script::FailAfter(d) => {
                let items = d
                    .into_iter()
                    .map(|s| Ok(s.to_string()))
                    .chain(std::iter::once(Err(anyhow!("upstream reset"))));
                Ok(Box::pin(stream::iter(items)))
            }
            Script::Unavailable => bail!("quota exceeded"),
            Script::Slow { count, delay } => Ok(Box::pin(stream::unfold(0usize, move |i| {
                let produced = Arc::clone(&produced);
                async move {
                    if i >= count {
                        return None;
                    }
                    tokio::time::sleep(delay).await;
                    produced.fetch_add(1, Ordering::SeqCst);
                    Some((Ok::<_, anyhow::Error>(format!("w{i} ")), i + 1))
                }
            }))),
        }
    }
}

pub struct Harness {
    pub services: Services,
    pub index: Arc<InMemoryIndex>,
    pub embedder: Arc<KeywordEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub config: Config,
}

/// Services over fakes with the LLM classifier enabled.
pub fn harness(intent_reply: &str, script: Script) -> Harness {
    harness_with(intent_reply, script, |_| {})
}

pub fn harness_with(intent_reply: &str, script: Script, tweak: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::default();
    config.classifier.provider = "llm".to_string();
    config.generation.provider = "gemini".to_string();
    tweak(&mut config);

    let index = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(KeywordEmbedder::default());
    let generator = ScriptedGenerator::new(intent_reply, script);
    let services = Services::assemble(
        &config,
        embedder.clone(),
        index.clone(),
        generator.clone(),
    );
    Harness {
        services,
        index,
        embedder,
        generator,
        config,
    }
}
