//! The catalog of assistant personas a text session can be bound to.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Agent {
    #[schema(value_type = String)]
    pub id: &'static str,
    #[schema(value_type = String)]
    pub name: &'static str,
    #[schema(value_type = String)]
    pub prompt: &'static str,
}

pub const DEFAULT_AGENT_ID: &str = "news-assistant";

const CATALOG: &[Agent] = &[
    Agent {
        id: "news-assistant",
        name: "News Assistant",
        prompt: "You are a friendly news assistant talking with someone out loud. \
                 Give short, clear summaries of current events and answer follow-up \
                 questions conversationally. Your replies are read aloud, so use plain \
                 sentences only: no lists, headings, emoji or other special characters.",
    },
    Agent {
        id: "general-assistant",
        name: "General Assistant",
        prompt: "You are a helpful general-purpose assistant in a spoken conversation. \
                 Keep answers brief and natural, ask a clarifying question when a request \
                 is ambiguous, and avoid markdown or special characters since everything \
                 you write is spoken.",
    },
    Agent {
        id: "customer-support",
        name: "Customer Support",
        prompt: "You are a patient customer support agent. Acknowledge the customer's \
                 problem, walk them through a solution one step at a time and confirm \
                 each step before moving on. Speak in short plain sentences without \
                 formatting.",
    },
    Agent {
        id: "code-helper",
        name: "Code Helper",
        prompt: "You are a programming assistant speaking with a developer. Explain \
                 concepts and debugging ideas in words rather than code blocks, keep \
                 each answer focused on one idea, and offer to go deeper when useful.",
    },
    Agent {
        id: "language-tutor",
        name: "Language Tutor",
        prompt: "You are an encouraging language tutor. Converse at the learner's level, \
                 gently correct mistakes by repeating the corrected sentence, and keep \
                 your turns short so the learner does most of the talking.",
    },
];

pub fn all() -> &'static [Agent] {
    CATALOG
}

pub fn find(id: &str) -> Option<&'static Agent> {
    CATALOG.iter().find(|agent| agent.id == id)
}

pub fn default_agent() -> &'static Agent {
    &CATALOG[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_agent_is_news_assistant() {
        assert_eq!(default_agent().id, DEFAULT_AGENT_ID);
        assert_eq!(find(DEFAULT_AGENT_ID), Some(default_agent()));
    }

    #[test]
    fn test_catalog_ids_are_unique() {
        let ids: HashSet<_> = all().iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), all().len());
        assert_eq!(all().len(), 5);
        assert!(find("language-tutor").is_some());
        assert!(find("weather-bot").is_none());
    }
}
