//! Database facade.
//!
//! Composes dialect, connection, metadata, lifecycles, schema and entity
//! manager behind one entry point. Construction wires the ownership graph in
//! dependency order: the dialect is configured first, the pool is initialized
//! against it, then the registry, lifecycle bus and entity manager are built
//! on top.

use crate::config::DatabaseConfig;
use crate::connection::ConnectionManager;
use crate::context::TransactionContext;
use crate::dialect::Dialect;
use crate::error::DbResult;
use crate::lifecycle::LifecycleBus;
use crate::metadata::{EntityDefinition, MetadataRegistry};
use crate::query::QueryBuilder;
use crate::repository::{EntityManager, Repository};
use crate::schema::{Migration, MigrationRunner, SchemaProvider};
use crate::transaction::{TransactionHandle, TransactionHooks};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// The sole external entry point of the data-access layer.
#[derive(Debug)]
pub struct Database {
    config: DatabaseConfig,
    connection: Arc<ConnectionManager>,
    registry: Arc<MetadataRegistry>,
    lifecycles: Arc<LifecycleBus>,
    entity_manager: EntityManager,
}

impl Database {
    /// Build the database layer from configuration and entity definitions.
    ///
    /// Fails when the configuration is invalid, the registry does not
    /// validate, or the connection cannot be established.
    pub async fn new(
        config: DatabaseConfig,
        definitions: BTreeMap<String, EntityDefinition>,
    ) -> DbResult<Self> {
        let dialect = Dialect::configure(&config.connection)?;
        let connection =
            Arc::new(ConnectionManager::connect(&config.connection, &dialect).await?);
        let registry = Arc::new(MetadataRegistry::new(definitions, &dialect)?);
        let lifecycles = Arc::new(LifecycleBus::new());
        let entity_manager = EntityManager::new(
            registry.clone(),
            connection.clone(),
            lifecycles.clone(),
        );

        info!(entities = registry.len(), dialect = %dialect.kind(), "Database layer ready");
        Ok(Self {
            config,
            connection,
            registry,
            lifecycles,
            entity_manager,
        })
    }

    /// Startup entry: apply pending migrations (unless disabled by
    /// `settings.force_migration`) and sync the schema non-destructively.
    pub async fn initialize(&self, migrations: &[Migration]) -> DbResult<()> {
        if self.config.settings.force_migration {
            let runner = MigrationRunner::new(self.connection.clone());
            runner.run(migrations).await?;
        } else if !migrations.is_empty() {
            warn!(
                pending = migrations.len(),
                "Skipping migrations: force_migration is disabled"
            );
        }
        self.schema_provider().sync(false).await
    }

    /// Get the repository for an entity UID. Fails with `UnknownModel` when
    /// the UID is not registered.
    pub fn query(&self, uid: &str) -> DbResult<Repository> {
        self.entity_manager.repository(uid)
    }

    /// Get a query builder for an entity UID.
    pub fn query_builder(&self, uid: &str) -> DbResult<QueryBuilder> {
        self.entity_manager.query_builder(uid)
    }

    /// Run `callback` inside a transaction.
    ///
    /// When the current chain already has an ambient transaction the callback
    /// joins it and finalization stays with the outermost opener. Otherwise a
    /// new transaction is opened, committed on success and rolled back on
    /// failure; the callback's error is re-signaled unmodified.
    pub async fn transaction<T, F, Fut>(&self, callback: F) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.transaction_with_hooks(callback, TransactionHooks::default())
            .await
    }

    /// `transaction` with success/error hooks. Hooks run after finalization;
    /// a rollback failure after a callback error is logged and the original
    /// error is returned.
    pub async fn transaction_with_hooks<T, F, Fut>(
        &self,
        callback: F,
        hooks: TransactionHooks,
    ) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let (handle, nested) = match TransactionContext::current() {
            Some(handle) => (handle, true),
            None => (Arc::new(self.connection.begin().await?), false),
        };

        let result = TransactionContext::run(handle.clone(), callback()).await;

        match result {
            Ok(value) => {
                if !nested {
                    handle.commit().await?;
                }
                if let Some(on_success) = hooks.on_success {
                    on_success();
                }
                Ok(value)
            }
            Err(err) => {
                if !nested {
                    if let Err(rollback_err) = handle.rollback().await {
                        warn!(
                            transaction_id = %handle.id(),
                            error = %rollback_err,
                            "Rollback failed after callback error"
                        );
                    }
                }
                if let Some(on_error) = hooks.on_error {
                    on_error();
                }
                Err(err)
            }
        }
    }

    /// Open a manual transaction handle.
    ///
    /// When called inside an ambient transaction the returned handle joins
    /// it; its `commit`/`rollback` become no-ops, since only the outermost
    /// opener may finalize.
    pub async fn begin_transaction(&self) -> DbResult<ManualTransaction> {
        match TransactionContext::current() {
            Some(handle) => Ok(ManualTransaction {
                handle,
                nested: true,
            }),
            None => Ok(ManualTransaction {
                handle: Arc::new(self.connection.begin().await?),
                nested: false,
            }),
        }
    }

    /// The lifecycle bus, for registering subscribers.
    pub fn lifecycles(&self) -> &Arc<LifecycleBus> {
        &self.lifecycles
    }

    /// The compiled metadata registry.
    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// The connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Schema diff/apply entry point.
    pub fn schema_provider(&self) -> SchemaProvider {
        SchemaProvider::new(self.registry.clone(), self.connection.clone())
    }

    /// Shutdown: deregister all lifecycle subscribers, then release the
    /// connection pool. Called once at teardown.
    pub async fn destroy(&self) -> DbResult<()> {
        self.lifecycles.clear().await;
        self.connection.close().await;
        info!("Database layer destroyed");
        Ok(())
    }
}

/// A manual transaction handle returned by `begin_transaction`.
pub struct ManualTransaction {
    handle: Arc<TransactionHandle>,
    nested: bool,
}

impl ManualTransaction {
    /// The underlying transaction handle.
    pub fn get(&self) -> &Arc<TransactionHandle> {
        &self.handle
    }

    /// Whether this handle joined an already-open transaction.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Run a future with this transaction as the ambient one.
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        TransactionContext::run(self.handle.clone(), fut).await
    }

    /// Commit the transaction. A no-op when nested: the outermost opener
    /// finalizes.
    pub async fn commit(&self) -> DbResult<()> {
        if self.nested {
            return Ok(());
        }
        self.handle.commit().await
    }

    /// Roll back the transaction. A no-op when nested.
    pub async fn rollback(&self) -> DbResult<()> {
        if self.nested {
            return Ok(());
        }
        self.handle.rollback().await
    }
}

impl std::fmt::Debug for ManualTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTransaction")
            .field("id", &self.handle.id())
            .field("nested", &self.nested)
            .finish()
    }
}
