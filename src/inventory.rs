use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{ObjectStore, ORGA_CACHE_FILENAME};

/// One account of the organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Account {
    pub name: String,
    #[serde(default, rename = "ParentOUs")]
    pub parent_ous: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub enabled_regions: Vec<String>,
}

/// One organizational unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct OrgUnit {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The account/OU/region tree used for scope expansion, cached in the
/// object store with a TTL independent of run boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Inventory {
    pub accounts: BTreeMap<String, Account>,
    #[serde(rename = "OUs")]
    pub ous: BTreeMap<String, OrgUnit>,
}

/// Source of truth for the inventory when the cache is missing or expired.
/// The real organization directory client lives outside the core.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn fetch(&self) -> Result<Inventory>;
}

/// Inventory source backed by a local JSON document.
pub struct FileInventorySource {
    path: PathBuf,
}

impl FileInventorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InventorySource for FileInventorySource {
    async fn fetch(&self) -> Result<Inventory> {
        let body = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read inventory file {}", self.path.display()))?;
        let inventory: Inventory =
            serde_json::from_slice(&body).context("The inventory document is malformed")?;
        Ok(inventory)
    }
}

impl Inventory {
    /// Load the inventory, preferring the cache in the object store when it
    /// is younger than `expiration_secs` and `force_refresh` is not set.
    /// Falls back to the source, refreshing the cache on success. With no
    /// usable cache and no source, the inventory is unavailable and the run
    /// aborts.
    pub async fn load(
        store: &dyn ObjectStore,
        source: Option<&dyn InventorySource>,
        expiration_secs: u64,
        force_refresh: bool,
        name_override_tag: Option<&str>,
    ) -> Result<Self> {
        if !force_refresh {
            if let Some(modified) = store.last_modified(ORGA_CACHE_FILENAME).await? {
                let age = (Utc::now() - modified).num_seconds();
                if age >= 0 && (age as u64) <= expiration_secs {
                    if let Some(body) = store.get(ORGA_CACHE_FILENAME).await? {
                        info!("Loading the inventory from the cache");
                        let mut inventory: Inventory = serde_json::from_slice(&body)
                            .context("The cached inventory document is malformed")?;
                        inventory.apply_name_override(name_override_tag);
                        return Ok(inventory);
                    }
                }
                debug!(age_secs = age, "The cached inventory has expired");
            }
        }
        let source = match source {
            Some(source) => source,
            None => bail!(
                "InventoryUnavailable: no valid inventory cache and no inventory source configured"
            ),
        };
        info!("Querying the inventory source for accounts and organizational units");
        let mut inventory = source.fetch().await?;
        store
            .put(ORGA_CACHE_FILENAME, &serde_json::to_vec_pretty(&inventory)?)
            .await?;
        inventory.apply_name_override(name_override_tag);
        info!(
            accounts = inventory.accounts.len(),
            ous = inventory.ous.len(),
            "Inventory loaded"
        );
        Ok(inventory)
    }

    /// Replace account names by the value of the override tag, when set.
    fn apply_name_override(&mut self, tag_key: Option<&str>) {
        let Some(tag_key) = tag_key else { return };
        for account in self.accounts.values_mut() {
            if let Some(name) = account.tags.get(tag_key) {
                account.name = name.clone();
            }
        }
    }

    pub fn all_accounts(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Accounts whose ID appears in the given list.
    pub fn accounts_by_id(&self, account_ids: &[String]) -> Vec<String> {
        self.accounts
            .keys()
            .filter(|id| account_ids.contains(id))
            .cloned()
            .collect()
    }

    /// Accounts whose name matches one of the glob patterns. Matching is
    /// case-sensitive; `*` is the only wildcard.
    pub fn accounts_by_name(&self, patterns: &[String]) -> Vec<String> {
        let exprs: Vec<Regex> = patterns.iter().map(|p| glob_to_regex(p)).collect();
        self.accounts
            .iter()
            .filter(|(_, account)| exprs.iter().any(|expr| expr.is_match(&account.name)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Accounts carrying every given `Key=Value` tag.
    pub fn accounts_by_tag(&self, tags: &[String]) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|(_, account)| has_all_tags(&account.tags, tags))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Accounts belonging to at least one of the given OUs.
    pub fn accounts_by_ou(&self, ou_ids: &[String]) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|(_, account)| account.parent_ous.iter().any(|ou| ou_ids.contains(ou)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Accounts belonging to at least one OU carrying every given tag.
    pub fn accounts_by_ou_tag(&self, tags: &[String]) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|(_, account)| {
                account.parent_ous.iter().any(|ou_id| {
                    self.ous
                        .get(ou_id)
                        .map(|ou| has_all_tags(&ou.tags, tags))
                        .unwrap_or(false)
                })
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Regions enabled in an account that intersect the given list.
    /// `ALL_ENABLED` selects every enabled region.
    pub fn account_regions(&self, account_id: &str, regions: &[String]) -> Vec<String> {
        let Some(account) = self.accounts.get(account_id) else {
            return Vec::new();
        };
        if regions.iter().any(|r| r == "ALL_ENABLED") {
            return account.enabled_regions.clone();
        }
        account
            .enabled_regions
            .iter()
            .filter(|region| regions.contains(region))
            .cloned()
            .collect()
    }

    /// Regions enabled in at least one account.
    pub fn all_enabled_regions(&self) -> Vec<String> {
        let regions: BTreeSet<String> = self
            .accounts
            .values()
            .flat_map(|account| account.enabled_regions.iter().cloned())
            .collect();
        regions.into_iter().collect()
    }

    /// Account name, or "undefined" when the account no longer exists.
    pub fn account_name(&self, account_id: &str) -> String {
        self.accounts
            .get(account_id)
            .map(|account| account.name.clone())
            .unwrap_or_else(|| "undefined".to_string())
    }

    /// True if the account exists and the region is enabled in it.
    pub fn account_region_exists(&self, account_id: &str, region: &str) -> bool {
        self.accounts
            .get(account_id)
            .map(|account| account.enabled_regions.iter().any(|r| r == region))
            .unwrap_or(false)
    }

    /// Full inventory export for the `orga` command.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "Accounts": self.accounts,
            "OUs": self.ous,
        })
    }
}

fn has_all_tags(assigned: &BTreeMap<String, String>, predicates: &[String]) -> bool {
    predicates.iter().all(|predicate| {
        match predicate.split_once('=') {
            Some((key, value)) => assigned.get(key).map(|v| v == value).unwrap_or(false),
            None => false,
        }
    })
}

/// Compile a `*` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{}$", escaped)).expect("escaped glob is a valid regex")
}
