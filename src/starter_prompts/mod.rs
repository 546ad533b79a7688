use serde::Serialize;

/// Example question offered on the welcome screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StarterPrompt {
    pub label: &'static str,
    pub prompt: &'static str,
}

pub const STARTER_PROMPTS: [StarterPrompt; 4] = [
    StarterPrompt {
        label: "Literature",
        prompt: "Explain the main themes in \"To Kill a Mockingbird\".",
    },
    StarterPrompt {
        label: "Science",
        prompt: "Show me a diagram of the water cycle.",
    },
    StarterPrompt {
        label: "Coding",
        prompt: "Write a python function to find prime numbers in a list.",
    },
    StarterPrompt {
        label: "Math",
        prompt: "What is the Pythagorean theorem?",
    },
];

pub fn starter_prompts() -> &'static [StarterPrompt] {
    &STARTER_PROMPTS
}

pub fn starter_prompt(index: usize) -> Option<&'static StarterPrompt> {
    STARTER_PROMPTS.get(index)
}
