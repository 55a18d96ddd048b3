use async_trait::async_trait;
use chrono::Utc;
use redress_cache::{Kv as _, KvHandle};
use redress_store::{BankStore, StoreHandle, StoreResult};
use redress_types::BankRecord;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// What the remote bank-reference service returns for a bank code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBank {
    pub name: String,
    pub bic: Option<String>,
    pub sdd_supported: bool,
}

/// Remote bank-reference lookup.
#[async_trait]
pub trait BankLookup: Send + Sync {
    /// `None` means the service does not know the bank (not an error).
    async fn lookup(&self, country: &str, bank_code: &str) -> Option<RemoteBank>;
}

/// Fixed-table lookup for tests and offline runs.
#[derive(Default)]
pub struct StaticBankLookup {
    banks: HashMap<(String, String), RemoteBank>,
}

impl StaticBankLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bank(
        mut self,
        country: &str,
        bank_code: &str,
        name: &str,
        bic: Option<&str>,
        sdd_supported: bool,
    ) -> Self {
        self.banks.insert(
            (country.to_string(), bank_code.to_string()),
            RemoteBank {
                name: name.to_string(),
                bic: bic.map(str::to_string),
                sdd_supported,
            },
        );
        self
    }
}

#[async_trait]
impl BankLookup for StaticBankLookup {
    async fn lookup(&self, country: &str, bank_code: &str) -> Option<RemoteBank> {
        self.banks
            .get(&(country.to_string(), bank_code.to_string()))
            .cloned()
    }
}

/// Bank directory: local table first, remote fallback, results cached in
/// the KV for 24 hours and written back to the table.
pub struct BankDirectory {
    store: StoreHandle,
    kv: KvHandle,
    remote: std::sync::Arc<dyn BankLookup>,
}

impl BankDirectory {
    const KV_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(store: StoreHandle, kv: KvHandle, remote: std::sync::Arc<dyn BankLookup>) -> Self {
        Self { store, kv, remote }
    }

    fn kv_key(country: &str, bank_code: &str) -> String {
        format!("bank_{country}_{bank_code}")
    }

    /// Resolve a bank for a normalized IBAN, or `None` when the country
    /// exposes no bank code or nobody knows the bank.
    pub async fn resolve(&self, iban: &str) -> StoreResult<Option<BankRecord>> {
        let Some(country) = redress_iban::country(iban) else {
            return Ok(None);
        };
        let Some(bank_code) = redress_iban::bank_code(iban) else {
            return Ok(None);
        };
        self.lookup(country, bank_code).await
    }

    pub async fn lookup(&self, country: &str, bank_code: &str) -> StoreResult<Option<BankRecord>> {
        let key = Self::kv_key(country, bank_code);
        if let Some(cached) = self.kv.get(&key).await {
            if let Ok(record) = serde_json::from_str::<BankRecord>(&cached) {
                return Ok(Some(record));
            }
        }

        if let Some(record) = self.store.get_bank(country, bank_code).await? {
            self.cache(&key, &record).await;
            return Ok(Some(record));
        }

        let Some(remote) = self.remote.lookup(country, bank_code).await else {
            debug!(country, bank_code, "bank not identified");
            return Ok(None);
        };
        let record = BankRecord {
            country: country.to_string(),
            bank_code: bank_code.to_string(),
            name: remote.name,
            bic: remote.bic,
            sdd_supported: remote.sdd_supported,
            updated_at: Utc::now(),
        };
        self.store.upsert_bank(record.clone()).await?;
        self.cache(&key, &record).await;
        Ok(Some(record))
    }

    async fn cache(&self, key: &str, record: &BankRecord) {
        if let Ok(serialized) = serde_json::to_string(record) {
            self.kv.set(key, &serialized, Some(Self::KV_TTL)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_store::memory::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn remote_results_are_written_back_and_cached() {
        let store: StoreHandle = Arc::new(MemoryStore::new());
        let kv: KvHandle = Arc::new(redress_cache::MemoryKv::new());
        let remote = Arc::new(StaticBankLookup::new().with_bank(
            "DE",
            "37040044",
            "Commerzbank",
            Some("COBADEFFXXX"),
            true,
        ));
        let directory = BankDirectory::new(store.clone(), kv.clone(), remote);

        let found = directory
            .resolve("DE89370400440532013000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "Commerzbank");
        assert!(found.sdd_supported);

        // Written back to the local table...
        assert!(store.get_bank("DE", "37040044").await.unwrap().is_some());
        // ...and cached in the KV.
        assert!(kv.get("bank_DE_37040044").await.is_some());
    }

    #[tokio::test]
    async fn unknown_banks_resolve_to_none() {
        let store: StoreHandle = Arc::new(MemoryStore::new());
        let kv: KvHandle = Arc::new(redress_cache::MemoryKv::new());
        let directory = BankDirectory::new(store, kv, Arc::new(StaticBankLookup::new()));
        assert!(directory
            .resolve("DE89370400440532013000")
            .await
            .unwrap()
            .is_none());
    }
}
