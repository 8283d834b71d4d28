// src/bot/moderation.rs - Banphrase policy engine: local rule chain, external API, downtime policy

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::bot::banphrase_api::{ApiFailure, ApiKind, ApiVerdict, BanphraseApi, BanphraseData};
use crate::bot::channels::{BanphraseApiConfig, ChannelRecord, PlatformRecord};
use crate::bot::denial_log::{DenialLog, DenialRecord};
use crate::bot::registry::{RuleRegistry, RuleSnapshot};
use crate::bot::rules::{Rule, RuleOutcome, RuleScope, RuleType};
use crate::types::{DowntimeBehavior, PipelineError};

/// Longest text ever handed to the external API
pub const API_MESSAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct ModerationSettings {
    /// Reply used when the external API blocks a message and no ApiResponse rule answers
    pub default_banphrase_response: String,
    pub api_message_limit: usize,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            default_banphrase_response: "[Banphrased]".to_string(),
            api_message_limit: API_MESSAGE_LIMIT,
        }
    }
}

/// Verdict of a single `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationResult {
    pub passed: bool,
    /// Text to send: the (possibly rewritten) message, or the refusal reply
    pub text: Option<String>,
    pub warn: bool,
    pub private_message: bool,
}

impl ModerationResult {
    fn passed(text: String) -> Self {
        Self {
            passed: true,
            text: Some(text),
            warn: false,
            private_message: false,
        }
    }

    fn blocked(text: Option<String>) -> Self {
        Self {
            passed: false,
            text,
            warn: false,
            private_message: false,
        }
    }
}

/// Where a message is headed, as far as moderation is concerned
#[derive(Debug, Clone)]
pub struct ModerationContext {
    pub scope: RuleScope,
    pub label: String,
    pub banphrase_api: Option<BanphraseApiConfig>,
}

impl ModerationContext {
    pub fn for_channel(channel: &ChannelRecord) -> Self {
        Self {
            scope: RuleScope::channel(channel.platform, channel.id),
            label: format!("#{}", channel.name),
            banphrase_api: channel.banphrase_api.clone(),
        }
    }

    /// Private-message context: platform rules and global rules only
    pub fn for_platform(platform: &PlatformRecord) -> Self {
        Self {
            scope: RuleScope {
                platform: Some(platform.id),
                channel: None,
            },
            label: format!("{} (private)", platform.name),
            banphrase_api: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_external_api: bool,
}

pub struct ModerationEngine {
    registry: Arc<RuleRegistry>,
    apis: HashMap<ApiKind, Arc<dyn BanphraseApi>>,
    denial_log: Arc<dyn DenialLog>,
    settings: ModerationSettings,
}

impl ModerationEngine {
    pub fn new(registry: Arc<RuleRegistry>, denial_log: Arc<dyn DenialLog>, settings: ModerationSettings) -> Self {
        Self {
            registry,
            apis: HashMap::new(),
            denial_log,
            settings,
        }
    }

    pub fn with_api(mut self, kind: ApiKind, api: Arc<dyn BanphraseApi>) -> Self {
        self.apis.insert(kind, api);
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ModerationSettings {
        &self.settings
    }

    /// Run the full banphrase check for a message
    pub async fn run(
        &self,
        message: &str,
        context: &ModerationContext,
        options: RunOptions,
    ) -> Result<ModerationResult, PipelineError> {
        let snapshot = self.registry.snapshot().await;
        let mut result = message.to_string();

        for rule in snapshot.chain_for(&context.scope) {
            let Some(outcome) = Self::evaluate_guarded(rule, &result, &snapshot).await else {
                continue;
            };

            match (rule.rule_type, outcome) {
                (_, RuleOutcome::Skipped) => {}
                (RuleType::Replacement, RuleOutcome::Text(rewritten)) => {
                    debug!("Rule {} rewrote message in {}", rule.id, context.label);
                    result = rewritten;
                }
                (RuleType::Replacement, RuleOutcome::Silent) => {
                    return Err(PipelineError::ContractViolation {
                        rule_id: rule.id,
                        detail: "replacement rules must produce text".to_string(),
                    });
                }
                (rule_type, RuleOutcome::Text(reply)) => {
                    debug!("{:?} rule {} fired in {}", rule_type, rule.id, context.label);
                    let reply = if reply.is_empty() { None } else { Some(reply) };
                    return Ok(ModerationResult::blocked(reply));
                }
                (rule_type, RuleOutcome::Silent) => {
                    debug!("{:?} rule {} silenced message in {}", rule_type, rule.id, context.label);
                    return Ok(ModerationResult::blocked(None));
                }
            }
        }

        let api_config = match &context.banphrase_api {
            Some(api) if !options.skip_external_api => api,
            _ => return Ok(ModerationResult::passed(result)),
        };

        let kind: ApiKind = api_config.kind.parse()?;
        let api = self
            .apis
            .get(&kind)
            .ok_or_else(|| PipelineError::UnknownApiKind(api_config.kind.clone()))?;

        let checked: String = result.chars().take(self.settings.api_message_limit).collect();
        match api.test(&api_config.url, &checked).await {
            Ok(ApiVerdict::Clean) => Ok(ModerationResult::passed(result)),
            Ok(ApiVerdict::Banned(data)) => {
                info!(
                    "External API blocked message in {} (phrase: {})",
                    context.label,
                    data.phrase.as_deref().unwrap_or("?")
                );
                self.log_denial(context, api_config, &checked, data);

                let reply = self.api_response(&snapshot, context, &result).await;
                Ok(ModerationResult::blocked(Some(
                    reply.unwrap_or_else(|| self.settings.default_banphrase_response.clone()),
                )))
            }
            Err(failure) => {
                warn!(
                    "Banphrase API {} unavailable for {}: {} (downtime behavior {:?})",
                    api_config.url, context.label, failure, api_config.downtime
                );
                Ok(Self::downtime(api_config.downtime, &failure, result))
            }
        }
    }

    /// Run rule code, treating errors and panics as "no effect"
    async fn evaluate_guarded(rule: &Rule, message: &str, snapshot: &RuleSnapshot) -> Option<RuleOutcome> {
        match AssertUnwindSafe(rule.evaluate(message, snapshot.shared()))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!("Rule {} failed, skipping it: {:#}", rule.id, e);
                None
            }
            Err(_) => {
                error!("Rule {} panicked, skipping it", rule.id);
                None
            }
        }
    }

    async fn api_response(&self, snapshot: &RuleSnapshot, context: &ModerationContext, message: &str) -> Option<String> {
        let rule = snapshot.api_response_for(&context.scope)?;
        match Self::evaluate_guarded(rule, message, snapshot).await? {
            RuleOutcome::Text(reply) => Some(reply),
            RuleOutcome::Skipped | RuleOutcome::Silent => None,
        }
    }

    fn log_denial(&self, context: &ModerationContext, api: &BanphraseApiConfig, message: &str, data: BanphraseData) {
        let Some(platform) = context.scope.platform else {
            return;
        };
        let record = DenialRecord::new(platform, context.scope.channel, &api.url, message, data);
        let log = Arc::clone(&self.denial_log);
        tokio::spawn(async move {
            if let Err(e) = log.record(record).await {
                error!("Failed to write denial log record: {:#}", e);
            }
        });
    }

    fn downtime(behavior: DowntimeBehavior, failure: &ApiFailure, result: String) -> ModerationResult {
        match behavior {
            DowntimeBehavior::Ignore => ModerationResult {
                warn: true,
                ..ModerationResult::passed(result)
            },
            DowntimeBehavior::Notify => ModerationResult {
                warn: true,
                ..ModerationResult::passed(format!("⚠ {}", result))
            },
            DowntimeBehavior::Nothing => ModerationResult::blocked(None),
            DowntimeBehavior::Refuse => {
                let reason = match failure {
                    ApiFailure::Timeout => "Cannot check banphrases right now: the banphrase API timed out.".to_string(),
                    ApiFailure::Status(code) => {
                        format!("Cannot check banphrases right now: the banphrase API returned HTTP {}.", code)
                    }
                    ApiFailure::Unknown(_) => {
                        "Cannot check banphrases right now: the banphrase API failed unexpectedly.".to_string()
                    }
                };
                ModerationResult::blocked(Some(reason))
            }
            DowntimeBehavior::Whisper => ModerationResult {
                passed: true,
                text: Some(format!(
                    "The banphrase API is down, so here is your reply privately: {}",
                    result
                )),
                warn: true,
                private_message: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::denial_log::MemoryDenialLog;
    use crate::bot::rules::{RuleFunctionTable, SharedRuleConfig};
    use crate::types::{ChannelId, PlatformId};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FakeApi {
        reply: Result<ApiVerdict, ApiFailure>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(reply: Result<ApiVerdict, ApiFailure>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BanphraseApi for FakeApi {
        async fn test(&self, _url: &str, message: &str) -> Result<ApiVerdict, ApiFailure> {
            self.seen.lock().await.push(message.to_string());
            self.reply.clone()
        }
    }

    fn context(api: Option<DowntimeBehavior>) -> ModerationContext {
        ModerationContext {
            scope: RuleScope::channel(PlatformId(1), ChannelId(10)),
            label: "#lobby".to_string(),
            banphrase_api: api.map(|downtime| BanphraseApiConfig {
                kind: "pajbot".to_string(),
                url: "https://pajbot.example".to_string(),
                downtime,
            }),
        }
    }

    fn text_rule(
        id: u32,
        rule_type: RuleType,
        priority: i32,
        f: fn(&str) -> Option<String>,
    ) -> Rule {
        Rule::from_function(
            id,
            rule_type,
            RuleScope::global(),
            priority,
            move |message: &str, _: &SharedRuleConfig| -> anyhow::Result<RuleOutcome> {
                Ok(f(message).map(RuleOutcome::Text).unwrap_or(RuleOutcome::Skipped))
            },
        )
    }

    async fn engine_with(rules: Vec<Rule>) -> (ModerationEngine, Arc<MemoryDenialLog>) {
        let registry = Arc::new(RuleRegistry::new(RuleFunctionTable::new()));
        registry.insert_rules(rules).await;
        let log = Arc::new(MemoryDenialLog::new());
        let engine = ModerationEngine::new(registry, log.clone(), ModerationSettings::default());
        (engine, log)
    }

    #[tokio::test]
    async fn test_no_rules_passes_message_through() {
        let (engine, _) = engine_with(vec![]).await;
        for message in ["", "hello", "  spaced  ", "ünïcödé"] {
            let result = engine.run(message, &context(None), RunOptions::default()).await.unwrap();
            assert_eq!(result, ModerationResult::passed(message.to_string()));
        }
    }

    #[tokio::test]
    async fn test_replacements_compose_by_priority() {
        let (engine, _) = engine_with(vec![
            text_rule(1, RuleType::Replacement, 5, |m| Some(format!("{}!", m))),
            text_rule(2, RuleType::Replacement, 10, |m| Some(m.replace("cat", "dog"))),
        ])
        .await;

        let result = engine.run("cat", &context(None), RunOptions::default()).await.unwrap();
        assert_eq!(result.text.as_deref(), Some("dog!"));
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_inactive_rules_are_idempotent() {
        let mut rule = text_rule(1, RuleType::Denial, 0, |_| Some("no".to_string()));
        rule.active = false;
        let (engine, _) = engine_with(vec![rule]).await;

        let first = engine.run("hello", &context(None), RunOptions::default()).await.unwrap();
        let second = engine
            .run(first.text.as_deref().unwrap(), &context(None), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.text.as_deref(), Some("hello"));
        assert_eq!(second.text, first.text);
    }

    #[tokio::test]
    async fn test_denial_rule_blocks() {
        let (engine, _) = engine_with(vec![text_rule(1, RuleType::Denial, 0, |m| {
            m.contains("badword").then(|| "blocked".to_string())
        })])
        .await;

        let result = engine
            .run("this is a badword test", &context(None), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result, ModerationResult::blocked(Some("blocked".to_string())));

        let clean = engine.run("perfectly fine", &context(None), RunOptions::default()).await.unwrap();
        assert!(clean.passed);
    }

    #[tokio::test]
    async fn test_uppercase_replacement() {
        let (engine, _) =
            engine_with(vec![text_rule(1, RuleType::Replacement, 0, |m| Some(m.to_uppercase()))]).await;
        let result = engine.run("hello", &context(None), RunOptions::default()).await.unwrap();
        assert_eq!(result, ModerationResult::passed("HELLO".to_string()));
    }

    #[tokio::test]
    async fn test_highest_priority_terminal_rule_wins() {
        let (engine, _) = engine_with(vec![
            text_rule(1, RuleType::Denial, 1, |_| Some("low".to_string())),
            text_rule(2, RuleType::CustomResponse, 9, |_| Some("high".to_string())),
        ])
        .await;
        let result = engine.run("x", &context(None), RunOptions::default()).await.unwrap();
        assert_eq!(result.text.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_empty_denial_text_means_silent_block() {
        let (engine, _) = engine_with(vec![text_rule(1, RuleType::Denial, 0, |_| Some(String::new()))]).await;
        let result = engine.run("x", &context(None), RunOptions::default()).await.unwrap();
        assert_eq!(result, ModerationResult::blocked(None));
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_and_panicking_rules_are_skipped() {
        let failing = Rule::from_function(
            1,
            RuleType::Denial,
            RuleScope::global(),
            10,
            |_: &str, _: &SharedRuleConfig| -> anyhow::Result<RuleOutcome> { Err(anyhow::anyhow!("broken rule")) },
        );
        let panicking = Rule::from_function(
            2,
            RuleType::Denial,
            RuleScope::global(),
            5,
            |_: &str, _: &SharedRuleConfig| -> anyhow::Result<RuleOutcome> { panic!("rule exploded") },
        );
        let (engine, _) = engine_with(vec![
            failing,
            panicking,
            text_rule(3, RuleType::Replacement, 0, |m| Some(format!("{} ok", m))),
        ])
        .await;

        let result = engine.run("still", &context(None), RunOptions::default()).await.unwrap();
        assert_eq!(result, ModerationResult::passed("still ok".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn test_silent_replacement_is_contract_violation() {
        let rule = Rule::from_function(
            7,
            RuleType::Replacement,
            RuleScope::global(),
            0,
            |_: &str, _: &SharedRuleConfig| -> anyhow::Result<RuleOutcome> { Ok(RuleOutcome::Silent) },
        );
        let (engine, _) = engine_with(vec![rule]).await;
        let error = engine.run("x", &context(None), RunOptions::default()).await.unwrap_err();
        assert!(matches!(error, PipelineError::ContractViolation { rule_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_rules_scoped_to_other_channels_do_not_apply() {
        let rule = Rule::from_function(
            1,
            RuleType::Denial,
            RuleScope::channel(PlatformId(1), ChannelId(99)),
            0,
            |_: &str, _: &SharedRuleConfig| -> anyhow::Result<RuleOutcome> { Ok(RuleOutcome::Silent) },
        );
        let (engine, _) = engine_with(vec![rule]).await;
        let result = engine.run("x", &context(None), RunOptions::default()).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_api_block_uses_default_response_and_logs() {
        let (engine, log) = engine_with(vec![]).await;
        let api = FakeApi::new(Ok(ApiVerdict::Banned(BanphraseData {
            phrase: Some("spam".to_string()),
            ..Default::default()
        })));
        let engine = engine.with_api(ApiKind::Pajbot, api);

        let result = engine
            .run("buy spam", &context(Some(DowntimeBehavior::Ignore)), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result, ModerationResult::blocked(Some("[Banphrased]".to_string())));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let records = log.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "buy spam");
        assert_eq!(records[0].banphrase.phrase.as_deref(), Some("spam"));
    }

    #[tokio::test]
    async fn test_api_block_uses_api_response_rule() {
        let (engine, _) = engine_with(vec![text_rule(1, RuleType::ApiResponse, 0, |m| {
            Some(format!("can't say \"{}\"", m))
        })])
        .await;
        let engine = engine.with_api(ApiKind::Pajbot, FakeApi::new(Ok(ApiVerdict::Banned(BanphraseData::default()))));

        let result = engine
            .run("spam", &context(Some(DowntimeBehavior::Ignore)), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text.as_deref(), Some("can't say \"spam\""));
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_api_response_rules_never_run_in_the_chain() {
        let (engine, _) =
            engine_with(vec![text_rule(1, RuleType::ApiResponse, 0, |_| Some("nope".to_string()))]).await;
        let result = engine.run("hi", &context(None), RunOptions::default()).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_api_receives_truncated_text() {
        let (engine, _) = engine_with(vec![]).await;
        let api = FakeApi::new(Ok(ApiVerdict::Clean));
        let engine = engine.with_api(ApiKind::Pajbot, api.clone());

        let long = "a".repeat(1500);
        let result = engine
            .run(&long, &context(Some(DowntimeBehavior::Ignore)), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text.as_deref(), Some(long.as_str()));
        assert_eq!(api.seen.lock().await[0].chars().count(), API_MESSAGE_LIMIT);
    }

    #[tokio::test]
    async fn test_skip_external_api() {
        let (engine, _) = engine_with(vec![]).await;
        let api = FakeApi::new(Ok(ApiVerdict::Banned(BanphraseData::default())));
        let engine = engine.with_api(ApiKind::Pajbot, api.clone());

        let result = engine
            .run(
                "hi",
                &context(Some(DowntimeBehavior::Ignore)),
                RunOptions { skip_external_api: true },
            )
            .await
            .unwrap();
        assert!(result.passed);
        assert!(api.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_downtime_behaviors() {
        let run = |behavior: DowntimeBehavior, failure: ApiFailure| async move {
            let (engine, _) = engine_with(vec![]).await;
            let engine = engine.with_api(ApiKind::Pajbot, FakeApi::new(Err(failure)));
            engine
                .run("hello", &context(Some(behavior)), RunOptions::default())
                .await
                .unwrap()
        };

        let ignore = run(DowntimeBehavior::Ignore, ApiFailure::Timeout).await;
        assert!(ignore.passed && ignore.warn);
        assert_eq!(ignore.text.as_deref(), Some("hello"));

        let notify = run(DowntimeBehavior::Notify, ApiFailure::Timeout).await;
        assert_eq!(notify.text.as_deref(), Some("⚠ hello"));
        assert!(notify.warn);

        let nothing = run(DowntimeBehavior::Nothing, ApiFailure::Timeout).await;
        assert_eq!(nothing, ModerationResult::blocked(None));

        let refuse = run(DowntimeBehavior::Refuse, ApiFailure::Status(502)).await;
        assert!(!refuse.passed);
        assert!(refuse.text.unwrap().contains("502"));

        let refuse_timeout = run(DowntimeBehavior::Refuse, ApiFailure::Timeout).await;
        assert!(refuse_timeout.text.unwrap().contains("timed out"));

        let whisper = run(DowntimeBehavior::Whisper, ApiFailure::Unknown("reset".to_string())).await;
        assert!(whisper.private_message && whisper.warn && whisper.passed);
        assert!(whisper.text.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_unknown_api_kind_is_internal_error() {
        let (engine, _) = engine_with(vec![]).await;
        let mut ctx = context(Some(DowntimeBehavior::Ignore));
        if let Some(api) = ctx.banphrase_api.as_mut() {
            api.kind = "supibot".to_string();
        }
        let error = engine.run("x", &ctx, RunOptions::default()).await.unwrap_err();
        assert!(matches!(error, PipelineError::UnknownApiKind(kind) if kind == "supibot"));
    }

    #[tokio::test]
    async fn test_pajbot_ban_end_to_end() {
        use crate::bot::banphrase_api::PajbotClient;

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/banphrases/test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"banned": true, "banphrase_data": {"phrase": "spam"}}"#)
            .create_async()
            .await;

        let (engine, _) = engine_with(vec![]).await;
        let client = Arc::new(PajbotClient::new(Duration::from_secs(5)).unwrap());
        let engine = engine.with_api(ApiKind::Pajbot, client);

        let mut ctx = context(Some(DowntimeBehavior::Ignore));
        if let Some(api) = ctx.banphrase_api.as_mut() {
            api.url = server.url();
        }
        let result = engine.run("spam spam", &ctx, RunOptions::default()).await.unwrap();
        assert_eq!(result, ModerationResult::blocked(Some("[Banphrased]".to_string())));
    }
}
