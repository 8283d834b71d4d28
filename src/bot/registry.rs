// src/bot/registry.rs - Hot-swappable rule registry

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use crate::bot::rules::{Rule, RuleDefinition, RuleFunctionTable, RuleScope, RuleType, SharedRuleConfig};

/// Everything a rule source returns on a full load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub shared: SharedRuleConfig,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Persistence boundary for rule definitions
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_all(&self) -> Result<RuleSet>;

    /// Load only the given ids; ids absent from the result no longer exist
    async fn load_by_ids(&self, ids: &[u32]) -> Result<Vec<RuleDefinition>>;
}

/// Rule source backed by the `rules.yaml` configuration file
pub struct YamlRuleSource {
    path: PathBuf,
}

impl YamlRuleSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read(&self) -> Result<RuleSet> {
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let set: RuleSet = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(set)
    }
}

#[async_trait]
impl RuleSource for YamlRuleSource {
    async fn load_all(&self) -> Result<RuleSet> {
        self.read().await
    }

    async fn load_by_ids(&self, ids: &[u32]) -> Result<Vec<RuleDefinition>> {
        let wanted: HashSet<u32> = ids.iter().copied().collect();
        Ok(self
            .read()
            .await?
            .rules
            .into_iter()
            .filter(|r| wanted.contains(&r.id))
            .collect())
    }
}

/// In-memory rule source, handy for embedding and tests
pub struct MemoryRuleSource {
    set: RwLock<RuleSet>,
}

impl MemoryRuleSource {
    pub fn new(set: RuleSet) -> Self {
        Self { set: RwLock::new(set) }
    }

    pub async fn replace(&self, set: RuleSet) {
        *self.set.write().await = set;
    }
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    async fn load_all(&self) -> Result<RuleSet> {
        Ok(self.set.read().await.clone())
    }

    async fn load_by_ids(&self, ids: &[u32]) -> Result<Vec<RuleDefinition>> {
        Ok(self
            .set
            .read()
            .await
            .rules
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }
}

/// Immutable view of the loaded rules, sorted by descending priority
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: Vec<Arc<Rule>>,
    shared: SharedRuleConfig,
    generation: u64,
}

impl RuleSnapshot {
    pub fn new(mut rules: Vec<Arc<Rule>>, shared: SharedRuleConfig, generation: u64) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Self { rules, shared, generation }
    }

    /// Rules that run in the local chain for `scope`, highest priority first
    pub fn chain_for<'a>(&'a self, scope: &'a RuleScope) -> impl Iterator<Item = &'a Arc<Rule>> + 'a {
        self.rules.iter().filter(move |rule| {
            rule.is_enabled() && rule.rule_type != RuleType::ApiResponse && rule.scope.applies_to(scope)
        })
    }

    /// Highest-priority active API response rule for `scope`
    pub fn api_response_for(&self, scope: &RuleScope) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| {
            rule.is_enabled() && rule.rule_type == RuleType::ApiResponse && rule.scope.applies_to(scope)
        })
    }

    pub fn get(&self, id: u32) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn shared(&self) -> &SharedRuleConfig {
        &self.shared
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Owner of the current rule snapshot.
///
/// Readers clone the `Arc` and work on it without holding any lock; reloads
/// build a complete new snapshot and swap it in one step.
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSnapshot>>,
    functions: RuleFunctionTable,
}

impl RuleRegistry {
    pub fn new(functions: RuleFunctionTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSnapshot::default())),
            functions,
        }
    }

    pub async fn snapshot(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Compile definitions, skipping (and logging) any that fail
    fn compile_all(&self, definitions: &[RuleDefinition]) -> Vec<Arc<Rule>> {
        definitions
            .iter()
            .filter_map(|definition| match Rule::compile(definition, &self.functions) {
                Ok(rule) => Some(Arc::new(rule)),
                Err(e) => {
                    error!("Rule {} could not be loaded: {:#}", definition.id, e);
                    None
                }
            })
            .collect()
    }

    /// Replace the whole rule set
    pub async fn install(&self, set: RuleSet) -> usize {
        let compiled = self.compile_all(&set.rules);
        let mut current = self.current.write().await;
        let snapshot = RuleSnapshot::new(compiled, set.shared, current.generation + 1);
        let count = snapshot.len();
        *current = Arc::new(snapshot);
        count
    }

    /// Add already-built rules on top of the current snapshot (replacing equal ids)
    pub async fn insert_rules(&self, rules: Vec<Rule>) {
        let mut current = self.current.write().await;
        let ids: HashSet<u32> = rules.iter().map(|r| r.id).collect();
        let mut merged: Vec<Arc<Rule>> = current
            .rules
            .iter()
            .filter(|r| !ids.contains(&r.id))
            .cloned()
            .collect();
        merged.extend(rules.into_iter().map(Arc::new));
        *current = Arc::new(RuleSnapshot::new(merged, current.shared.clone(), current.generation + 1));
    }

    pub async fn reload_all(&self, source: &dyn RuleSource) -> Result<usize> {
        let set = source.load_all().await?;
        let total = set.rules.len();
        let loaded = self.install(set).await;
        info!("Reloaded banphrase rules: {} of {} loaded", loaded, total);
        Ok(loaded)
    }

    /// Refresh specific rules; ids the source no longer knows are dropped
    pub async fn reload_by_ids(&self, source: &dyn RuleSource, ids: &[u32]) -> Result<usize> {
        let definitions = source.load_by_ids(ids).await?;
        let compiled = self.compile_all(&definitions);
        let refreshed = compiled.len();
        let wanted: HashSet<u32> = ids.iter().copied().collect();

        let mut current = self.current.write().await;
        let mut merged: Vec<Arc<Rule>> = current
            .rules
            .iter()
            .filter(|r| !wanted.contains(&r.id))
            .cloned()
            .collect();
        merged.extend(compiled);
        *current = Arc::new(RuleSnapshot::new(merged, current.shared.clone(), current.generation + 1));

        debug!("Reloaded banphrase rules {:?} ({} present)", ids, refreshed);
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::rules::RuleCode;
    use crate::types::{ChannelId, PlatformId};

    fn def(id: u32, rule_type: RuleType, priority: i32, code: RuleCode) -> RuleDefinition {
        RuleDefinition {
            id,
            rule_type,
            platform: None,
            channel: None,
            active: true,
            priority,
            description: None,
            code,
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_filtered() {
        let registry = RuleRegistry::new(RuleFunctionTable::new());
        let mut scoped = def(3, RuleType::Denial, 100, RuleCode::Uppercase);
        scoped.channel = Some(ChannelId(99));
        let mut inactive = def(4, RuleType::Denial, 50, RuleCode::Uppercase);
        inactive.active = false;

        registry
            .install(RuleSet {
                shared: SharedRuleConfig::new(),
                rules: vec![
                    def(1, RuleType::Replacement, 5, RuleCode::Uppercase),
                    def(2, RuleType::Replacement, 10, RuleCode::Lowercase),
                    scoped,
                    inactive,
                    def(5, RuleType::ApiResponse, 1, RuleCode::Respond { text: None }),
                    def(6, RuleType::Inactive, 70, RuleCode::Uppercase),
                ],
            })
            .await;

        let snapshot = registry.snapshot().await;
        let scope = RuleScope::channel(PlatformId(1), ChannelId(10));
        let ids: Vec<u32> = snapshot.chain_for(&scope).map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(snapshot.api_response_for(&scope).unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_broken_rules_are_skipped() {
        let registry = RuleRegistry::new(RuleFunctionTable::new());
        let loaded = registry
            .install(RuleSet {
                shared: SharedRuleConfig::new(),
                rules: vec![
                    def(1, RuleType::Denial, 0, RuleCode::Native { function: "missing".to_string() }),
                    def(2, RuleType::Denial, 0, RuleCode::Replace { pattern: "(".to_string(), replacement: String::new() }),
                    def(3, RuleType::Denial, 0, RuleCode::Uppercase),
                ],
            })
            .await;
        assert_eq!(loaded, 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_whole_snapshot() {
        let registry = RuleRegistry::new(RuleFunctionTable::new());
        let source = MemoryRuleSource::new(RuleSet {
            shared: SharedRuleConfig::new(),
            rules: vec![def(1, RuleType::Denial, 0, RuleCode::Uppercase)],
        });
        registry.reload_all(&source).await.unwrap();

        let before = registry.snapshot().await;

        source
            .replace(RuleSet {
                shared: SharedRuleConfig::new(),
                rules: vec![
                    def(1, RuleType::Denial, 0, RuleCode::Lowercase),
                    def(2, RuleType::Denial, 0, RuleCode::Uppercase),
                ],
            })
            .await;
        registry.reload_all(&source).await.unwrap();

        // An in-flight reader keeps the old view
        assert_eq!(before.len(), 1);
        let after = registry.snapshot().await;
        assert_eq!(after.len(), 2);
        assert!(after.generation() > before.generation());
    }

    #[tokio::test]
    async fn test_reload_by_ids() {
        let registry = RuleRegistry::new(RuleFunctionTable::new());
        let source = MemoryRuleSource::new(RuleSet {
            shared: SharedRuleConfig::new(),
            rules: vec![
                def(1, RuleType::Denial, 0, RuleCode::Uppercase),
                def(2, RuleType::Denial, 0, RuleCode::Uppercase),
            ],
        });
        registry.reload_all(&source).await.unwrap();

        source
            .replace(RuleSet {
                shared: SharedRuleConfig::new(),
                rules: vec![def(1, RuleType::Denial, 42, RuleCode::Uppercase)],
            })
            .await;

        let refreshed = registry.reload_by_ids(&source, &[1, 2]).await.unwrap();
        assert_eq!(refreshed, 1);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(1).unwrap().priority, 42);
        assert!(snapshot.get(2).is_none());
    }

    #[tokio::test]
    async fn test_yaml_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(
            &path,
            r#"
shared:
  greeting: "hi"
rules:
  - id: 1
    type: Denial
    priority: 3
    code:
      kind: contains
      needles: ["badword"]
      response: "blocked"
  - id: 2
    type: Replacement
    code:
      kind: uppercase
"#,
        )
        .await
        .unwrap();

        let source = YamlRuleSource::new(&path);
        let set = source.load_all().await.unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.shared.get("greeting").unwrap(), "hi");

        let some = source.load_by_ids(&[2]).await.unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].rule_type, RuleType::Replacement);
    }
}
