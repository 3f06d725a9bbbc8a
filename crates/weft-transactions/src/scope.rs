//! The `transaction()` scope helper: store synthesis from ambient context.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use weft_records::{RecordStore, ResultFactoryStore};
use weft_results::{
    default_result_storage, FactoryOverrides, FlowRunContext, ResultFactory, ResultSettings,
    TaskRunContext,
};

use crate::transaction::{Transaction, TransactionOptions};

/// Open a transaction scope around `body`, yielding the live transaction.
///
/// When a key is supplied without a store, one is synthesized from ambient
/// context: the task-run factory, else the flow-run factory, else a default
/// factory - forced to persist and wrapped in a [`ResultFactoryStore`]. With
/// no key nothing is persisted or locked.
pub async fn transaction<F, Fut, T>(mut options: TransactionOptions, body: F) -> anyhow::Result<T>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if options.key.is_some() && options.store.is_none() {
        options.store = Some(default_record_store(options.settings.take())?);
    }
    Transaction::new(options).run(body).await
}

fn default_record_store(settings: Option<ResultSettings>) -> anyhow::Result<Arc<dyn RecordStore>> {
    let ambient_factory = TaskRunContext::current()
        .map(|ctx| ctx.result_factory)
        .or_else(|| FlowRunContext::current().map(|ctx| ctx.result_factory));
    let settings = settings.unwrap_or_else(ResultSettings::from_env);

    let factory = match ambient_factory {
        // a factory already bound to a registered block is reused as-is
        Some(factory) if factory.storage_block_id().is_some() => {
            factory.with_persist_result(true)
        }
        Some(factory) => {
            let storage = default_result_storage(&settings)?;
            let storage_block_id = storage.block_id();
            factory
                .with_persist_result(true)
                .with_storage(storage, storage_block_id)
        }
        None => {
            debug!("no ambient run context; synthesizing a default result factory");
            ResultFactory::default_factory(
                &settings,
                FactoryOverrides {
                    persist_result: Some(true),
                    ..Default::default()
                },
            )?
        }
    };

    Ok(Arc::new(ResultFactoryStore::new(factory)))
}
