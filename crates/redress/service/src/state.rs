use anyhow::Context;
use redress_billing::{BillingDeps, BillingOrchestrator};
use redress_cache::{KvHandle, MemoryKv};
use redress_gateway::{GatewayHandle, HttpEmpGateway, HttpGatewayConfig, MockGateway};
use redress_ingest::Ingestor;
use redress_jobs::{JobRunner, QueueName};
use redress_store::{memory::MemoryStore, postgres::PostgresStore, StoreHandle};
use redress_types::{RateLimitConfig, RedressConfig};
use redress_vop::{BankDirectory, MockBavClient, StaticBankLookup, VopRunner};
use redress_webhook::WebhookHandler;
use std::sync::Arc;
use tracing::info;

/// Which relational backend to run on.
#[derive(Debug, Clone)]
pub enum StorageMode {
    Memory,
    Postgres { database_url: String },
}

impl StorageMode {
    /// `auto`: postgres when a database url is configured.
    pub fn auto(database_url: Option<String>) -> Self {
        match database_url {
            Some(database_url) => Self::Postgres { database_url },
            None => Self::Memory,
        }
    }
}

/// Shared handles of the running service.
#[derive(Clone)]
pub struct ServiceState {
    pub config: Arc<RedressConfig>,
    pub store: StoreHandle,
    pub kv: KvHandle,
    pub gateway: GatewayHandle,
    pub runner: Arc<JobRunner>,
    pub ingestor: Arc<Ingestor>,
    pub orchestrator: Arc<BillingOrchestrator>,
    pub vop: Arc<VopRunner>,
    pub webhooks: Arc<WebhookHandler>,
}

impl ServiceState {
    /// Wire every component. The gateway client is HTTP when the
    /// `EMP_BASE_URL`/`EMP_ACCOUNT_ID`/`EMP_API_KEY` variables are set
    /// and the scriptable mock otherwise (local runs, tests).
    pub async fn bootstrap(
        config: RedressConfig,
        storage: StorageMode,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let store: StoreHandle = match storage {
            StorageMode::Memory => {
                info!("storage: in-memory (no DATABASE_URL configured)");
                Arc::new(MemoryStore::new())
            }
            StorageMode::Postgres { database_url } => {
                info!("storage: postgres");
                Arc::new(
                    PostgresStore::connect(&database_url)
                        .await
                        .context("postgres connection failed")?,
                )
            }
        };
        let kv: KvHandle = Arc::new(MemoryKv::new());

        let gateway: GatewayHandle = match (
            std::env::var("EMP_BASE_URL"),
            std::env::var("EMP_ACCOUNT_ID"),
            std::env::var("EMP_API_KEY"),
        ) {
            (Ok(base_url), Ok(account_id), Ok(api_key)) => {
                info!(%base_url, "gateway: http client");
                Arc::new(HttpEmpGateway::new(HttpGatewayConfig::new(
                    base_url, account_id, api_key,
                ))?)
            }
            _ => {
                info!("gateway: mock (no EMP_* credentials configured)");
                Arc::new(MockGateway::new())
            }
        };

        let queues = config.queues.clone();
        let runner = JobRunner::start(kv.clone(), move |queue| workers_for(&queues, queue));

        let deps = BillingDeps {
            store: store.clone(),
            kv: kv.clone(),
            gateway: gateway.clone(),
            config: config.clone(),
        };
        let orchestrator = Arc::new(BillingOrchestrator::new(deps, runner.clone()));

        let directory = Arc::new(BankDirectory::new(
            store.clone(),
            kv.clone(),
            Arc::new(StaticBankLookup::new()),
        ));
        let vop = Arc::new(VopRunner::new(
            store.clone(),
            kv.clone(),
            directory,
            Arc::new(MockBavClient::new()),
            config.bav.clone(),
        ));

        let ingestor = Arc::new(Ingestor::new(store.clone(), runner.clone(), config.clone()));
        let webhooks = Arc::new(WebhookHandler::new(
            store.clone(),
            kv.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            kv,
            gateway,
            runner,
            ingestor,
            orchestrator,
            vop,
            webhooks,
        })
    }
}

fn workers_for(config: &RateLimitConfig, queue: QueueName) -> usize {
    match queue {
        QueueName::Default => config.default_workers,
        QueueName::High => config.high_workers,
        QueueName::Vop => config.vop_workers,
        QueueName::Bav => config.bav_workers,
        QueueName::Billing => config.billing_workers,
        QueueName::Reconciliation => config.reconciliation_workers,
        QueueName::Webhooks => config.webhooks_workers,
        QueueName::Exports => config.exports_workers,
        QueueName::EmpRefresh => config.emp_refresh_workers,
    }
}
