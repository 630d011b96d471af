//! Disposal assistant backed by a local Ollama server.
//!
//! Small models tend to narrate their reasoning before answering, so every
//! answer is reduced to the four numbered lines the system prompt asks for and,
//! for electronics, corrected away from food or general-waste bins.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "deepseek-r1:1.5b";
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Starter questions offered to users who do not know what to ask.
pub const COMMON_QUESTIONS: &[&str] = &[
    "Which bin does a plastic bottle go in?",
    "How should I dispose of used batteries?",
    "What kind of waste are food leftovers?",
    "Can glass bottles be recycled?",
    "How do I get rid of expired medicine?",
    "What counts as recyclable waste?",
];

pub const DISPOSAL_SYSTEM_PROMPT: &str = "You are a waste sorting expert. Follow these rules strictly:

1. Give the answer directly, with no thinking process
2. Do not use phrases like \"I need to\", \"let me think\" or \"based on my knowledge\"
3. Do not show any analysis, only the result
4. Always answer in the exact numbered format below

Sorting standard:
- Recyclable (blue bin): plastic bottles, glass bottles, cans, paper, metal
- Hazardous (red bin): batteries, fluorescent tubes, expired medicine, paint
- Kitchen (green bin): leftovers, fruit peels, vegetable scraps, bones
- Other (grey bin): plastic bags, tissues, cigarette butts

Special rule, takes priority and must never be classified as kitchen waste:
- Electronic waste and old appliances (phones, computers, tablets, cameras, chargers, power banks,
  headphones, routers, power adapters, cables, small appliances):
  - parts with batteries, screens, circuit boards or heavy metals are Hazardous
  - separable metal or plastic housings are Recyclable
  - recommended handling: take to an e-waste collection point or licensed recycler

Answer format (exactly these four lines, nothing else):
1. Category: [waste type]
2. Handling: [what to do]
3. Reason: [short explanation]
4. Tip: [environmental advice]

Example:
1. Category: Hazardous waste
2. Handling: Put it in the red bin
3. Reason: Contains heavy metals
4. Tip: Proper disposal protects the environment";

const EWASTE_CATEGORY: &str = "1. Category: Hazardous waste";
const EWASTE_HANDLING: &str = "2. Handling: Take it to an e-waste collection point or licensed recycler; parts with batteries or screens go in the red bin (hazardous)";
const EWASTE_REASON: &str = "3. Reason: Contains batteries, circuit boards or heavy metals that do not break down and need specialist recycling";
const EWASTE_TIP: &str = "4. Tip: Never throw it away with household waste; use an electronics take-back channel first";

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

impl GenerateOptions {
    /// Settings used for disposal answers.
    pub fn disposal() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 800,
        }
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

pub struct OllamaClient {
    base_url: String,
    model: String,
    timeout: Duration,
    answer_options: GenerateOptions,
    agent: ureq::Agent,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            model: model.into(),
            timeout,
            answer_options: GenerateOptions::disposal(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Sampling settings for `disposal_answer`.
    pub fn with_answer_options(mut self, options: GenerateOptions) -> Self {
        self.answer_options = options;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when the server answers the model listing with HTTP 200.
    pub fn test_connection(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.agent.get(&url).timeout(PING_TIMEOUT).call() {
            Ok(response) => response.status() == 200,
            Err(err) => {
                log::debug!("chat: connection test against {} failed: {}", url, err);
                false
            }
        }
    }

    pub fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let tags: TagsResponse = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("list models from {}", url))?
            .into_json()
            .context("decode model list")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// One non-streaming completion; returns the `response` text.
    pub fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            }
        });
        let response = match self.agent.post(&url).send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                log::warn!("chat: generate returned HTTP {}", code);
                return Err(anyhow!("ollama request failed: {} - {}", code, text.trim()));
            }
            Err(err) => {
                log::warn!("chat: generate request to {} failed: {}", url, err);
                return Err(anyhow!("cannot reach ollama at {}: {}", self.base_url, err));
            }
        };
        let value: serde_json::Value = response.into_json().context("decode generate response")?;
        value
            .get("response")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ollama response has no 'response' field"))
    }

    pub fn chat_completion(&self, messages: &[ChatMessage], options: GenerateOptions) -> Result<String> {
        self.generate(&flatten_messages(messages), options)
    }

    /// Ask a disposal question; returns the cleaned four-line answer.
    pub fn disposal_answer(&self, question: &str) -> Result<String> {
        let messages = [
            ChatMessage::new(ChatRole::System, DISPOSAL_SYSTEM_PROMPT),
            ChatMessage::new(ChatRole::User, question),
        ];
        let raw = self.chat_completion(&messages, self.answer_options)?;
        Ok(correct_ewaste_answer(question, &filter_reasoning(&raw)))
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Role-prefixed paragraphs joined by blank lines.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let prefix = match m.role {
                ChatRole::System => "System",
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            format!("{}: {}", prefix, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ----------------------------------------------------------------------------
// Answer cleanup
// ----------------------------------------------------------------------------

type Pattern = OnceLock<Option<Regex>>;

fn regex(cell: &'static Pattern, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            log::error!("chat: invalid pattern {}: {}", pattern, err);
            None
        }
    })
    .as_ref()
}

static THINK_BLOCK: Pattern = OnceLock::new();
static REASONING_PARAGRAPHS: OnceLock<Vec<Regex>> = OnceLock::new();
static NUMBERED_LINE: Pattern = OnceLock::new();
static ANSWER_START: Pattern = OnceLock::new();
static EWASTE: Pattern = OnceLock::new();

const REASONING_MARKERS: &[&str] = &[
    "let me think",
    "let me analyze",
    "let me check",
    "let me recall",
    "let me organize",
    "i need to",
    "the user is asking",
    "the user asks",
    "based on my knowledge",
    "from experience",
    "this involves",
    "give the answer directly",
    "without any thinking",
    "to sum up, i",
    "hmm",
    "wait,",
];

/// Strip reasoning narration and keep the numbered answer lines.
pub fn filter_reasoning(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let mut text = match regex(&THINK_BLOCK, r"(?is)<think>.*?</think>") {
        Some(think) => think.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    // An unterminated opening tag leaves only a closing one behind.
    if let Some(pos) = text.find("</think>") {
        text = text[pos + "</think>".len()..].to_string();
    }

    let paragraphs = REASONING_PARAGRAPHS.get_or_init(|| {
        [
            r"(?is)okay, let me .*?(?:in summary|to summarize)",
            r"(?is)i need to .*?make sure the user",
            r"(?is)let me .*?give the answer directly",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });
    for paragraph in paragraphs {
        text = paragraph.replace_all(&text, "").into_owned();
    }

    let lines: Vec<&str> = text
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            !REASONING_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .collect();

    let start = regex(&ANSWER_START, r"(?i)^1\.\s*(category|handling|reason|tip)");
    let from = lines
        .iter()
        .position(|line| start.map_or(false, |re| re.is_match(line.trim())))
        .unwrap_or(0);
    let remaining: Vec<&str> = lines[from..].iter().map(|l| l.trim()).collect();

    let numbered = regex(&NUMBERED_LINE, r"^[1-4]\.\s*");
    let answer: Vec<&str> = remaining
        .iter()
        .copied()
        .filter(|line| numbered.map_or(false, |re| re.is_match(line)))
        .collect();
    let kept = if answer.is_empty() { remaining } else { answer };

    kept.into_iter()
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn mentions_electronics(text: &str) -> bool {
    regex(
        &EWASTE,
        r"(?i)\b(e-?waste|electronics?|electrical|appliances?|(?:cell |mobile |smart)?phones?|computers?|laptops?|tablets?|cameras?|webcams?|headphones?|earphones?|earbuds?|chargers?|power banks?|batter(?:y|ies)|power suppl(?:y|ies)|adapters?|routers?|set-top box(?:es)?|motherboards?|circuit boards?|cables?|usb drives?|hard drives?|hard disks?|monitors?|televisions?|tvs?)\b",
    )
    .map_or(false, |re| re.is_match(text))
}

fn line_number(line: &str) -> Option<u8> {
    let mut chars = line.chars();
    let digit = chars.next()?.to_digit(10)?;
    (chars.next() == Some('.') && (1..=4).contains(&digit)).then_some(digit as u8)
}

fn contains_any(line: &str, words: &[&str]) -> bool {
    let lower = line.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

/// Keep electronics out of kitchen and general-waste answers.
///
/// Leaves the answer untouched unless the question or answer mentions an
/// electronic item; otherwise returns exactly four ordered lines.
pub fn correct_ewaste_answer(question: &str, answer: &str) -> String {
    if answer.trim().is_empty() || !mentions_electronics(&format!("{}\n{}", question, answer)) {
        return answer.to_string();
    }

    let mut lines: Vec<String> = answer
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| match line_number(line) {
            Some(1) if contains_any(line, &["kitchen", "food", "other", "grey", "gray", "residual"]) => {
                EWASTE_CATEGORY.to_string()
            }
            Some(2) if contains_any(line, &["compost", "green", "kitchen", "grey", "gray", "general"]) => {
                EWASTE_HANDLING.to_string()
            }
            Some(3)
                if contains_any(line, &["kitchen", "perishable", "food", "organic", "biodegrad"]) =>
            {
                EWASTE_REASON.to_string()
            }
            Some(4) => EWASTE_TIP.to_string(),
            _ => line.to_string(),
        })
        .collect();

    if !lines.iter().any(|l| line_number(l) == Some(1)) {
        lines.insert(0, EWASTE_CATEGORY.to_string());
    }

    let fallback = [EWASTE_CATEGORY, EWASTE_HANDLING, EWASTE_REASON, EWASTE_TIP];
    (1..=4u8)
        .map(|n| {
            lines
                .iter()
                .find(|l| line_number(l) == Some(n))
                .cloned()
                .unwrap_or_else(|| fallback[(n - 1) as usize].to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_blocks_and_narration_are_removed() {
        let raw = "<think>The user asks about bottles. I need to classify.</think>\n\
                   Okay here goes.\n\
                   1. Category: Recyclable\n\
                   \n\
                   2. Handling: Rinse and put in the blue bin\n\
                   3. Reason: PET plastic\n\
                   4. Tip: Remove the cap\n\
                   Hope this helps!";
        assert_eq!(
            filter_reasoning(raw),
            "1. Category: Recyclable\n2. Handling: Rinse and put in the blue bin\n3. Reason: PET plastic\n4. Tip: Remove the cap"
        );
    }

    #[test]
    fn unterminated_think_is_dropped() {
        let raw = "Let me think about this.\nhmm\n</think>\n1. Category: Other";
        assert_eq!(filter_reasoning(raw), "1. Category: Other");
    }

    #[test]
    fn unnumbered_answers_survive() {
        assert_eq!(filter_reasoning("  Put it in the blue bin.  "), "Put it in the blue bin.");
        assert_eq!(filter_reasoning(""), "");
    }

    #[test]
    fn electronics_are_never_kitchen_waste() {
        let answer = "1. Category: Kitchen waste\n2. Handling: Compost it\n3. Reason: It is organic\n4. Tip: Be green";
        let fixed = correct_ewaste_answer("Where does an old phone charger go?", answer);
        assert_eq!(
            fixed,
            [EWASTE_CATEGORY, EWASTE_HANDLING, EWASTE_REASON, EWASTE_TIP].join("\n")
        );
    }

    #[test]
    fn correct_electronics_answers_keep_their_category_and_fill_gaps() {
        let answer = "1. Category: Recyclable\n3. Reason: Metal housing";
        let fixed = correct_ewaste_answer("What about a laptop?", answer);
        let lines: Vec<&str> = fixed.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "1. Category: Recyclable");
        assert_eq!(lines[1], EWASTE_HANDLING);
        assert_eq!(lines[2], "3. Reason: Metal housing");
        assert_eq!(lines[3], EWASTE_TIP);
    }

    #[test]
    fn unrelated_answers_pass_through() {
        let answer = "1. Category: Kitchen waste";
        assert_eq!(correct_ewaste_answer("Banana peel?", answer), answer);
    }

    #[test]
    fn messages_flatten_with_role_prefixes() {
        let prompt = flatten_messages(&[
            ChatMessage::new(ChatRole::System, "be brief"),
            ChatMessage::new(ChatRole::User, "hi"),
            ChatMessage::new(ChatRole::Assistant, "hello"),
        ]);
        assert_eq!(prompt, "System: be brief\n\nUser: hi\n\nAssistant: hello");
    }

    #[test]
    fn base_url_gets_a_scheme() {
        let client = OllamaClient::new("localhost:11434/", DEFAULT_MODEL, Duration::from_secs(1));
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(normalize_base_url("https://llm.local"), "https://llm.local");
    }

    #[test]
    fn unreachable_server_reports_disconnected() {
        let client = OllamaClient::new("http://127.0.0.1:9", DEFAULT_MODEL, Duration::from_millis(300));
        assert!(!client.test_connection());
        assert!(client.generate("hi", GenerateOptions::default()).is_err());
    }
}
