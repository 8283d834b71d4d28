// src/bot/rules.rs - Banphrase rule definitions and their executable code

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

use crate::types::{ChannelId, PlatformId};

/// Configuration map handed to every rule invocation
pub type SharedRuleConfig = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    /// Blocks the message; the rule's text becomes the reply
    Denial,
    /// Only consulted after the external API blocked a message
    ApiResponse,
    /// Replies with custom text instead of the message
    CustomResponse,
    /// Rewrites the message and lets the chain continue
    Replacement,
    /// Administratively switched off
    Inactive,
}

/// Where a rule applies. A `None` component matches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleScope {
    pub platform: Option<PlatformId>,
    pub channel: Option<ChannelId>,
}

impl RuleScope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn channel(platform: PlatformId, channel: ChannelId) -> Self {
        Self {
            platform: Some(platform),
            channel: Some(channel),
        }
    }

    pub fn is_global(&self) -> bool {
        self.platform.is_none() && self.channel.is_none()
    }

    /// Whether a rule with this scope applies to a message sent in `target`
    pub fn applies_to(&self, target: &RuleScope) -> bool {
        let platform_ok = self.platform.is_none() || self.platform == target.platform;
        let channel_ok = self.channel.is_none() || self.channel == target.channel;
        platform_ok && channel_ok
    }
}

/// Result of running one rule's code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The rule has nothing to say about this message
    Skipped,
    /// The rule produced text (a reply, or the rewritten message)
    Text(String),
    /// The rule fired but wants nothing sent
    Silent,
}

/// Executable rule body.
///
/// Implemented by the declarative built-ins below and by native functions
/// registered in a [`RuleFunctionTable`].
#[async_trait]
pub trait RuleFunction: Send + Sync {
    async fn evaluate(&self, message: &str, shared: &SharedRuleConfig) -> Result<RuleOutcome>;
}

#[async_trait]
impl<F> RuleFunction for F
where
    F: Fn(&str, &SharedRuleConfig) -> Result<RuleOutcome> + Send + Sync,
{
    async fn evaluate(&self, message: &str, shared: &SharedRuleConfig) -> Result<RuleOutcome> {
        self(message, shared)
    }
}

/// Native rule functions, registered before rules are loaded and referenced
/// from rule definitions by name.
#[derive(Clone, Default)]
pub struct RuleFunctionTable {
    functions: HashMap<String, Arc<dyn RuleFunction>>,
}

impl RuleFunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl RuleFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuleFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Rule body as stored in persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCode {
    /// Fires when any needle occurs in the message
    Contains {
        needles: Vec<String>,
        #[serde(default)]
        response: Option<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Literal, wildcard (`bad*`) or regex (`~/pattern/flags`) patterns
    Pattern {
        patterns: Vec<String>,
        #[serde(default)]
        response: Option<String>,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(default)]
        whole_words_only: bool,
    },
    /// Regex substitution over the whole message
    Replace { pattern: String, replacement: String },
    Uppercase,
    Lowercase,
    /// NFKC normalisation with zero-width characters removed
    Normalize,
    /// Always produces the given text (or silence)
    Respond {
        #[serde(default)]
        text: Option<String>,
    },
    /// Function from the native function table
    Native { function: String },
}

impl RuleCode {
    /// Whether the code can fire without producing any text
    pub fn fires_silently(&self) -> bool {
        matches!(
            self,
            RuleCode::Contains { response: None, .. }
                | RuleCode::Pattern { response: None, .. }
                | RuleCode::Respond { text: None }
        )
    }
}

/// A persisted rule record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: u32,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub platform: Option<PlatformId>,
    #[serde(default)]
    pub channel: Option<ChannelId>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
    pub code: RuleCode,
}

fn default_active() -> bool {
    true
}

/// A loaded rule, ready to run
pub struct Rule {
    pub id: u32,
    pub rule_type: RuleType,
    pub scope: RuleScope,
    pub active: bool,
    pub priority: i32,
    pub description: Option<String>,
    code: Arc<dyn RuleFunction>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("rule_type", &self.rule_type)
            .field("scope", &self.scope)
            .field("active", &self.active)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Rule {
    /// Compile a persisted definition against the native function table
    pub fn compile(definition: &RuleDefinition, functions: &RuleFunctionTable) -> Result<Self> {
        if definition.rule_type == RuleType::Replacement && definition.code.fires_silently() {
            return Err(anyhow::anyhow!(
                "Replacement rule {} would fire without text; give it a response",
                definition.id
            ));
        }

        let code: Arc<dyn RuleFunction> = match &definition.code {
            RuleCode::Native { function } => functions
                .get(function)
                .ok_or_else(|| anyhow::anyhow!("Native rule function '{}' is not registered", function))?,
            other => Arc::new(
                BuiltinCode::compile(other)
                    .with_context(|| format!("Failed to compile rule {}", definition.id))?,
            ),
        };

        Ok(Self {
            id: definition.id,
            rule_type: definition.rule_type,
            scope: RuleScope {
                platform: definition.platform,
                channel: definition.channel,
            },
            active: definition.active,
            priority: definition.priority,
            description: definition.description.clone(),
            code,
        })
    }

    /// Build a rule directly around a function, bypassing persistence
    pub fn from_function(
        id: u32,
        rule_type: RuleType,
        scope: RuleScope,
        priority: i32,
        function: impl RuleFunction + 'static,
    ) -> Self {
        Self {
            id,
            rule_type,
            scope,
            active: true,
            priority,
            description: None,
            code: Arc::new(function),
        }
    }

    /// Whether the rule takes part in evaluation at all
    pub fn is_enabled(&self) -> bool {
        self.active && self.rule_type != RuleType::Inactive
    }

    pub async fn evaluate(&self, message: &str, shared: &SharedRuleConfig) -> Result<RuleOutcome> {
        self.code.evaluate(message, shared).await
    }
}

const ZERO_WIDTH: [char; 6] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{E0000}'];

/// Declarative rule bodies, compiled once at load time
enum BuiltinCode {
    Contains {
        needles: Vec<String>,
        response: Option<String>,
        case_sensitive: bool,
    },
    Pattern {
        patterns: Vec<PhrasePattern>,
        response: Option<String>,
        case_sensitive: bool,
        whole_words_only: bool,
    },
    Replace { regex: Regex, replacement: String },
    Uppercase,
    Lowercase,
    Normalize,
    Respond(Option<String>),
}

impl BuiltinCode {
    fn compile(code: &RuleCode) -> Result<Self> {
        Ok(match code {
            RuleCode::Contains { needles, response, case_sensitive } => {
                if needles.is_empty() {
                    return Err(anyhow::anyhow!("'contains' needs at least one needle"));
                }
                let needles = if *case_sensitive {
                    needles.clone()
                } else {
                    needles.iter().map(|n| n.to_lowercase()).collect()
                };
                BuiltinCode::Contains {
                    needles,
                    response: response.clone(),
                    case_sensitive: *case_sensitive,
                }
            }
            RuleCode::Pattern { patterns, response, case_sensitive, whole_words_only } => {
                let patterns = patterns
                    .iter()
                    .map(|p| PhrasePattern::parse(p, *case_sensitive))
                    .collect::<Result<Vec<_>>>()?;
                if patterns.is_empty() {
                    return Err(anyhow::anyhow!("'pattern' needs at least one pattern"));
                }
                BuiltinCode::Pattern {
                    patterns,
                    response: response.clone(),
                    case_sensitive: *case_sensitive,
                    whole_words_only: *whole_words_only,
                }
            }
            RuleCode::Replace { pattern, replacement } => BuiltinCode::Replace {
                regex: Regex::new(pattern).with_context(|| format!("Invalid replacement regex '{}'", pattern))?,
                replacement: replacement.clone(),
            },
            RuleCode::Uppercase => BuiltinCode::Uppercase,
            RuleCode::Lowercase => BuiltinCode::Lowercase,
            RuleCode::Normalize => BuiltinCode::Normalize,
            RuleCode::Respond { text } => BuiltinCode::Respond(text.clone()),
            RuleCode::Native { function } => {
                return Err(anyhow::anyhow!("Native function '{}' is not a built-in", function));
            }
        })
    }

    fn fired(response: &Option<String>) -> RuleOutcome {
        match response {
            Some(text) => RuleOutcome::Text(text.clone()),
            None => RuleOutcome::Silent,
        }
    }
}

#[async_trait]
impl RuleFunction for BuiltinCode {
    async fn evaluate(&self, message: &str, _shared: &SharedRuleConfig) -> Result<RuleOutcome> {
        Ok(match self {
            BuiltinCode::Contains { needles, response, case_sensitive } => {
                let haystack = if *case_sensitive { message.to_string() } else { message.to_lowercase() };
                if needles.iter().any(|n| haystack.contains(n.as_str())) {
                    Self::fired(response)
                } else {
                    RuleOutcome::Skipped
                }
            }
            BuiltinCode::Pattern { patterns, response, case_sensitive, whole_words_only } => {
                if patterns.iter().any(|p| p.matches(message, *case_sensitive, *whole_words_only)) {
                    Self::fired(response)
                } else {
                    RuleOutcome::Skipped
                }
            }
            BuiltinCode::Replace { regex, replacement } => {
                RuleOutcome::Text(regex.replace_all(message, replacement.as_str()).into_owned())
            }
            BuiltinCode::Uppercase => RuleOutcome::Text(message.to_uppercase()),
            BuiltinCode::Lowercase => RuleOutcome::Text(message.to_lowercase()),
            BuiltinCode::Normalize => RuleOutcome::Text(
                message.nfkc().filter(|c| !ZERO_WIDTH.contains(c)).collect(),
            ),
            BuiltinCode::Respond(text) => Self::fired(text),
        })
    }
}

/// Phrase pattern: literal text, `*`/`?` wildcards, or `~/regex/flags`
#[derive(Debug, Clone)]
pub enum PhrasePattern {
    Literal(String),
    Wildcard(Regex),
    Regex(Regex),
}

impl PhrasePattern {
    pub fn parse(input: &str, case_sensitive: bool) -> Result<Self> {
        if input.starts_with("~/") {
            return Self::from_regex_string(input);
        }
        if input.contains('*') || input.contains('?') {
            let body: String = input
                .split('*')
                .map(|part| part.split('?').map(regex::escape).collect::<Vec<_>>().join("."))
                .collect::<Vec<_>>()
                .join(".*");
            let regex = RegexBuilder::new(&format!("^{}$", body))
                .case_insensitive(!case_sensitive)
                .build()?;
            return Ok(PhrasePattern::Wildcard(regex));
        }
        if input.is_empty() {
            return Err(anyhow::anyhow!("Empty phrase pattern"));
        }
        Ok(PhrasePattern::Literal(input.to_string()))
    }

    /// Parse NightBot-style `~/pattern/flags`
    fn from_regex_string(input: &str) -> Result<Self> {
        let content = &input[2..];
        let last_slash = content
            .rfind('/')
            .ok_or_else(|| anyhow::anyhow!("Regex pattern must end with '/'"))?;
        let pattern = &content[..last_slash];
        let flags = &content[last_slash + 1..];

        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => { builder.case_insensitive(true); }
                'm' => { builder.multi_line(true); }
                's' => { builder.dot_matches_new_line(true); }
                'x' => { builder.ignore_whitespace(true); }
                _ => return Err(anyhow::anyhow!("Unknown regex flag: {}", flag)),
            }
        }

        let compiled = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid regex pattern: {}", e))?;
        Ok(PhrasePattern::Regex(compiled))
    }

    pub fn matches(&self, text: &str, case_sensitive: bool, whole_words_only: bool) -> bool {
        match self {
            PhrasePattern::Literal(pattern) => {
                let (text, pattern) = if case_sensitive {
                    (text.to_string(), pattern.clone())
                } else {
                    (text.to_lowercase(), pattern.to_lowercase())
                };
                if whole_words_only {
                    Self::words(&text).any(|word| word == pattern)
                } else {
                    text.contains(&pattern)
                }
            }
            PhrasePattern::Wildcard(regex) => {
                if whole_words_only {
                    Self::words(text).any(|word| regex.is_match(word))
                } else {
                    regex.is_match(text) || Self::words(text).any(|word| regex.is_match(word))
                }
            }
            PhrasePattern::Regex(regex) => regex.is_match(text),
        }
    }

    fn words(text: &str) -> impl Iterator<Item = &str> {
        text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
    }
}
