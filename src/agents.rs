//! Response assembly: turns a strategy, a query and optional retrieved
//! context into either fixed text or a generation request.
//!
//! The grounded strategy picks its template by checking whether any
//! passages were retrieved. With none, the no-context template asks the
//! model to say plainly that nothing relevant was found.

use patrika_assist_core::models::RetrievalResult;
use patrika_assist_core::routing::ResponseStrategy;

use crate::generation::GenerationParams;

pub const CUSTOMER_GUIDE: &str = include_str!("guides/customer.md");
pub const AGENCY_GUIDE: &str = include_str!("guides/agency.md");

/// Temperature for the booking-guide and general prompts.
pub const GUIDE_TEMPERATURE: f32 = 0.2;

/// Sent when a grounded turn found no context and generation produced nothing.
pub const NO_CONTEXT_REPLY: &str = "I could not find any information about that in the Rajasthan Patrika knowledge base. Please try rephrasing your question, or choose one of the options below.";

/// Sent when generation fails before any text was delivered.
pub const APOLOGY_REPLY: &str = "Sorry, I am unable to answer right now. Please try again in a moment, or choose one of the options below.";

const ANSWER_STYLE: &str = "Be direct and helpful. Do not include any preparation messages, greetings, or status updates.
Only provide the actual answer or explanation.

NOTE: Start your response directly with the answer, no preparation text.";

/// What the engine should do to produce the answer text.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Deliver this text as-is.
    Fixed(&'static str),
    /// Generate from `prompt`; deliver `fallback` if generation yields nothing.
    Generate {
        prompt: String,
        params: GenerationParams,
        fallback: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    params: GenerationParams,
}

impl ResponseAssembler {
    pub fn new(params: GenerationParams) -> Self {
        Self { params }
    }

    /// Build the answer for `strategy`. `context` is only consulted by the
    /// grounded strategy.
    pub fn prepare(
        &self,
        strategy: ResponseStrategy,
        query: &str,
        context: &RetrievalResult,
    ) -> Answer {
        let guide_params = self.params.with_temperature(GUIDE_TEMPERATURE);
        match strategy {
            ResponseStrategy::Canned(reply) => Answer::Fixed(reply.text()),
            ResponseStrategy::Grounded if context.is_empty() => Answer::Generate {
                prompt: no_context_prompt(query),
                params: self.params,
                fallback: NO_CONTEXT_REPLY,
            },
            ResponseStrategy::Grounded => Answer::Generate {
                prompt: grounded_prompt(query, context),
                params: self.params,
                fallback: APOLOGY_REPLY,
            },
            ResponseStrategy::CustomerGuide => Answer::Generate {
                prompt: guide_prompt(query, CUSTOMER_GUIDE, "a customer"),
                params: guide_params,
                fallback: APOLOGY_REPLY,
            },
            ResponseStrategy::AgencyGuide => Answer::Generate {
                prompt: guide_prompt(query, AGENCY_GUIDE, "an agency"),
                params: guide_params,
                fallback: APOLOGY_REPLY,
            },
            ResponseStrategy::General => Answer::Generate {
                prompt: general_prompt(query),
                params: guide_params,
                fallback: APOLOGY_REPLY,
            },
        }
    }
}

pub fn grounded_prompt(query: &str, context: &RetrievalResult) -> String {
    let joined = context.texts().collect::<Vec<_>>().join("\n\n");
    format!(
        "Context:\n{joined}\n\nQuestion: {query}\n\n\
         Based on the context provided above, answer the question directly and concisely.\n\
         If the answer cannot be found in the context, say so clearly.\n{ANSWER_STYLE}"
    )
}

pub fn no_context_prompt(query: &str) -> String {
    format!(
        "Question: {query}\n\n\
         No supporting context was found in the Rajasthan Patrika knowledge base for this question.\n\
         Tell the user clearly that no information was found about it. Do not guess or invent facts.\n\
         You may suggest rephrasing the question.\n{ANSWER_STYLE}"
    )
}

fn guide_prompt(query: &str, guide: &str, who: &str) -> String {
    format!(
        "query = {query}\ncontext = {guide}\n\n\
         Based on the context provided, answer the user's query directly and concisely.\n\
         If the query is not specific, explain how {who} can book an ad.\n{ANSWER_STYLE}"
    )
}

fn general_prompt(query: &str) -> String {
    format!("query = {query}\n\nAnswer the user's query directly and concisely.\n{ANSWER_STYLE}")
}
