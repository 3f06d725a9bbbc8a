use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

use weft_records::{IsolationLevel, MemoryRecordStore, RecordStore, ResultFactoryStore};
use weft_results::{
    FactoryOverrides, FlowRunContext, ResultFactory, ResultRef, ResultSettings, ResultStorage,
    UnpersistedResult,
};
use weft_storage::LocalFileSystem;
use weft_transactions::{
    current_transaction, transaction, CommitMode, Transaction, TransactionError, TransactionHook,
    TransactionOptions,
};

fn opts(key: &str) -> TransactionOptions {
    TransactionOptions {
        key: Some(key.to_string()),
        ..Default::default()
    }
}

fn recorder(order: &Arc<Mutex<Vec<String>>>, label: &str) -> TransactionHook {
    let order = order.clone();
    let label = label.to_string();
    Arc::new(move |_txn: &Transaction| {
        order.lock().unwrap().push(label.clone());
        Ok(())
    })
}

fn failing_hook(message: &'static str) -> TransactionHook {
    Arc::new(move |_txn: &Transaction| Err(anyhow!(message)))
}

fn unpersisted(value: serde_json::Value) -> ResultRef {
    ResultRef::from(UnpersistedResult::create(value, true))
}

fn settings_in(dir: &tempfile::TempDir) -> ResultSettings {
    ResultSettings {
        local_storage_path: dir.path().to_path_buf(),
        ..Default::default()
    }
}

//─────────────────────────────
//  Ambient transaction stack
//─────────────────────────────

#[tokio::test]
async fn ambient_transaction_tracks_scopes() -> anyhow::Result<()> {
    assert!(current_transaction().is_none());
    let txn = Transaction::default();
    txn.run(|this| async move {
        assert_eq!(current_transaction().unwrap(), this);
        Ok(())
    })
    .await?;
    assert!(current_transaction().is_none());
    Ok(())
}

#[tokio::test]
async fn nested_scopes_shadow_and_restore() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    outer
        .run(|outer_txn| async move {
            assert_eq!(current_transaction().unwrap(), outer_txn);
            let inner = Transaction::new(opts("inner"));
            inner
                .run(|inner_txn| async move {
                    assert_eq!(current_transaction().unwrap(), inner_txn);
                    Ok(())
                })
                .await?;
            assert_eq!(current_transaction().unwrap(), outer_txn);
            Ok(())
        })
        .await?;
    assert!(current_transaction().is_none());
    Ok(())
}

#[tokio::test]
async fn ambient_stack_resets_on_error() {
    assert!(current_transaction().is_none());
    let txn = Transaction::default();
    let err = txn
        .run(|_txn| async move {
            assert!(current_transaction().is_some());
            Err::<(), _>(anyhow!("foo"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "foo");
    assert!(current_transaction().is_none());
}

#[tokio::test]
async fn parents_are_resolved_from_the_ambient_stack() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    outer
        .run(|outer_txn| async move {
            assert!(outer_txn.parent().is_none());
            let inner = Transaction::new(opts("inner"));
            inner
                .run(|inner_txn| async move {
                    assert_eq!(inner_txn.parent().unwrap(), outer_txn);
                    Ok(())
                })
                .await
        })
        .await?;
    Ok(())
}

//─────────────────────────────
//  Commit modes
//─────────────────────────────

#[tokio::test]
async fn nested_scopes_defer_to_the_parent() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    let inner = Transaction::new(opts("inner"));
    let inner_handle = inner.clone();
    outer
        .run(|outer_txn| async move {
            assert!(!outer_txn.is_committed());
            inner.run(|_inner_txn| async move { Ok(()) }).await?;
            // the inner scope exited, but its commit waits for the parent
            assert!(!inner_handle.is_committed());
            Ok(())
        })
        .await?;

    assert!(outer.is_committed());
    let children = outer.children();
    assert_eq!(children.len(), 1);
    assert!(children[0].is_committed());
    Ok(())
}

#[tokio::test]
async fn eager_scopes_commit_on_exit() -> anyhow::Result<()> {
    let txn = Transaction::new(TransactionOptions {
        commit_mode: Some(CommitMode::Eager),
        ..Default::default()
    });
    txn.run(|this| async move {
        assert!(this.is_active());
        assert!(!this.is_committed());
        Ok(())
    })
    .await?;
    assert!(txn.is_committed());
    Ok(())
}

#[tokio::test]
async fn eager_child_commits_inside_lazy_parent() -> anyhow::Result<()> {
    let outer = Transaction::new(TransactionOptions {
        key: Some("outer".to_string()),
        commit_mode: Some(CommitMode::Lazy),
        ..Default::default()
    });
    outer
        .run(|outer_txn| async move {
            assert!(!outer_txn.is_committed());
            let inner = Transaction::new(TransactionOptions {
                key: Some("inner".to_string()),
                commit_mode: Some(CommitMode::Eager),
                ..Default::default()
            });
            inner.run(|_inner_txn| async move { Ok(()) }).await?;
            assert!(inner.is_committed());
            Ok(())
        })
        .await?;
    assert!(outer.is_committed());
    Ok(())
}

#[tokio::test]
async fn scopes_do_not_commit_on_error() {
    let txn = Transaction::default();
    let result = txn
        .run(|_txn| async move { Err::<(), _>(anyhow!("foo")) })
        .await;
    assert!(result.is_err());
    assert!(!txn.is_committed());
    assert!(txn.is_rolled_back());
}

#[tokio::test]
async fn scopes_do_not_commit_after_rollback() -> anyhow::Result<()> {
    let txn = Transaction::default();
    txn.run(|this| async move {
        this.rollback();
        Ok(())
    })
    .await?;
    assert!(!txn.is_committed());
    assert!(txn.is_rolled_back());
    Ok(())
}

#[tokio::test]
async fn commit_mode_off_rolls_back_on_exit() -> anyhow::Result<()> {
    let txn = Transaction::new(TransactionOptions {
        commit_mode: Some(CommitMode::Off),
        ..Default::default()
    });
    txn.run(|this| async move {
        assert!(!this.is_committed());
        Ok(())
    })
    .await?;
    assert!(!txn.is_committed());
    assert!(txn.is_rolled_back());
    Ok(())
}

#[tokio::test]
async fn commit_mode_off_preserves_explicit_commits() -> anyhow::Result<()> {
    let txn = Transaction::new(TransactionOptions {
        commit_mode: Some(CommitMode::Off),
        ..Default::default()
    });
    txn.run(|this| async move {
        this.commit().await;
        Ok(())
    })
    .await?;
    assert!(txn.is_committed());
    assert!(!txn.is_rolled_back());
    Ok(())
}

#[tokio::test]
async fn failing_child_commit_rolls_the_parent_back() -> anyhow::Result<()> {
    let txn = Transaction::default();
    txn.run(|this| async move {
        let child = Transaction::default();
        child.on_commit(failing_hook("child commit exploded"));
        this.add_child(child);
        Ok(())
    })
    .await?;
    assert!(!txn.is_committed());
    assert!(txn.is_rolled_back());
    Ok(())
}

//─────────────────────────────
//  Rollbacks
//─────────────────────────────

#[tokio::test]
async fn rollback_transitions_the_state() -> anyhow::Result<()> {
    let txn = Transaction::default();
    txn.run(|this| async move {
        assert!(!this.is_rolled_back());
        assert!(this.rollback());
        assert!(this.is_rolled_back());
        Ok(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn rollback_propagates_through_three_levels() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    let inner = Transaction::new(opts("inner"));
    let nested = Transaction::new(opts("nested"));

    let inner_clone = inner.clone();
    let nested_clone = nested.clone();
    outer
        .run(|_outer_txn| async move {
            inner_clone
                .run(|inner_txn| async move {
                    assert!(!inner_txn.is_rolled_back());
                    nested_clone
                        .run(|nested_txn| async move {
                            nested_txn.rollback();
                            assert!(nested_txn.is_rolled_back());
                            Ok(())
                        })
                        .await?;
                    // the nested rollback has already cascaded here
                    assert!(inner_txn.is_rolled_back());
                    Ok(())
                })
                .await
        })
        .await?;

    assert!(outer.is_rolled_back());
    assert!(inner.is_rolled_back());
    assert!(nested.is_rolled_back());
    Ok(())
}

#[tokio::test]
async fn failed_rollback_hook_still_transitions() -> anyhow::Result<()> {
    let txn = Transaction::new(opts("outer"));
    txn.run(|this| async move {
        this.on_rollback(failing_hook("bad rollback hook"));
        assert!(!this.rollback());
        assert!(this.is_rolled_back());
        Ok(())
    })
    .await?;
    assert!(current_transaction().is_none());
    Ok(())
}

#[tokio::test]
async fn terminal_transactions_reject_further_transitions() -> anyhow::Result<()> {
    let txn = Transaction::default();
    txn.run(|_this| async move { Ok(()) }).await?;
    assert!(txn.is_committed());
    assert!(!txn.commit().await);
    assert!(!txn.rollback());
    assert!(txn.is_committed());
    Ok(())
}

//─────────────────────────────
//  Hooks
//─────────────────────────────

#[tokio::test]
async fn commit_hooks_run_in_insertion_order() -> anyhow::Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let txn = Transaction::default();
    txn.on_commit(recorder(&order, "h1"));
    txn.on_commit(recorder(&order, "h2"));

    txn.run(|_this| async move { Ok(()) }).await?;
    assert!(txn.is_committed());
    assert_eq!(*order.lock().unwrap(), ["h1", "h2"]);
    Ok(())
}

#[tokio::test]
async fn rollback_hooks_run_in_reverse_order() -> anyhow::Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let txn = Transaction::default();
    txn.on_rollback(recorder(&order, "r1"));
    txn.on_rollback(recorder(&order, "r2"));

    txn.run(|this| async move {
        this.rollback();
        Ok(())
    })
    .await?;
    assert_eq!(*order.lock().unwrap(), ["r2", "r1"]);
    Ok(())
}

#[tokio::test]
async fn staged_hooks_are_appended() -> anyhow::Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let txn = Transaction::default();
    let staged_commit = vec![recorder(&order, "staged")];
    txn.run(|this| async move {
        this.stage(unpersisted(json!(1)), Vec::new(), staged_commit);
        Ok(())
    })
    .await?;
    assert!(txn.is_committed());
    assert_eq!(*order.lock().unwrap(), ["staged"]);
    Ok(())
}

//─────────────────────────────
//  Stored values
//─────────────────────────────

#[tokio::test]
async fn children_inherit_and_override_stored_values() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    outer
        .run(|outer_txn| async move {
            outer_txn.set("key", json!(42));
            let inner = Transaction::new(opts("inner"));
            inner
                .run(|inner_txn| async move {
                    // children inherit from their parents first
                    assert_eq!(inner_txn.get("key")?, json!(42));
                    // and can override without touching the parent
                    inner_txn.set("key", json!("string"));
                    assert_eq!(inner_txn.get("key")?, json!("string"));
                    Ok(())
                })
                .await?;
            assert_eq!(outer_txn.get("key")?, json!(42));
            Ok(())
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn stored_values_are_deep_copied_at_entry() -> anyhow::Result<()> {
    let outer = Transaction::new(opts("outer"));
    outer
        .run(|outer_txn| async move {
            outer_txn.set("key", json!({"x": [42]}));
            let inner = Transaction::new(opts("inner"));
            inner
                .run(|inner_txn| async move {
                    let mut copied = inner_txn.get("key")?;
                    copied["x"].as_array_mut().unwrap().push(json!(43));
                    inner_txn.set("key", copied);
                    assert_eq!(inner_txn.get("key")?, json!({"x": [42, 43]}));
                    Ok(())
                })
                .await?;
            assert_eq!(outer_txn.get("key")?, json!({"x": [42]}));
            Ok(())
        })
        .await?;
    Ok(())
}

//─────────────────────────────
//  Record stores and read-through
//─────────────────────────────

#[tokio::test]
async fn existing_records_short_circuit_to_committed() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRecordStore::new());
    let committed = unpersisted(json!("already here"));
    store.write("seen", Some(committed.clone())).await?;

    let record_store: Arc<dyn RecordStore> = store.clone();
    let options = TransactionOptions {
        key: Some("seen".to_string()),
        store: Some(record_store),
        ..Default::default()
    };
    transaction(options, |txn| async move {
        assert!(txn.is_committed());
        // the committed value wins; user stages are dropped
        txn.stage_value(unpersisted(json!("usurper")));
        assert!(txn.staged_value().is_none());
        assert!(txn.is_committed());
        Ok(())
    })
    .await?;

    let record = store.read("seen").await.unwrap();
    assert_eq!(record.result, Some(committed));
    Ok(())
}

#[tokio::test]
async fn overwrite_ignores_existing_records() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRecordStore::new());
    store.write("k", Some(unpersisted(json!(1)))).await?;

    let record_store: Arc<dyn RecordStore> = store.clone();
    let options = TransactionOptions {
        key: Some("k".to_string()),
        store: Some(record_store.clone()),
        ..Default::default()
    };
    transaction(options, |txn| async move {
        assert!(txn.is_committed());
        Ok(())
    })
    .await?;

    let options = TransactionOptions {
        key: Some("k".to_string()),
        store: Some(record_store),
        overwrite: true,
        ..Default::default()
    };
    transaction(options, |txn| async move {
        assert!(!txn.is_committed());
        Ok(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn basic_memory_store_transaction() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRecordStore::new());
    let staged = unpersisted(json!({"foo": "bar"}));

    let record_store: Arc<dyn RecordStore> = store.clone();
    let staged_clone = staged.clone();
    let options = TransactionOptions {
        key: Some("basic".to_string()),
        store: Some(record_store),
        ..Default::default()
    };
    let txn = transaction(options, |txn| async move {
        assert_eq!(txn.store().unwrap().name(), "MemoryRecordStore");
        txn.stage_value(staged_clone);
        Ok(txn)
    })
    .await?;

    let result = txn.read().await.unwrap();
    assert_eq!(result.get().await?, json!({"foo": "bar"}));

    let record = store.read("basic").await.unwrap();
    assert_eq!(record.key, "basic");
    assert_eq!(record.result, Some(staged));
    Ok(())
}

//─────────────────────────────
//  Isolation levels
//─────────────────────────────

#[tokio::test]
async fn isolation_defaults_to_read_committed() -> anyhow::Result<()> {
    transaction(opts("test"), |txn| async move {
        assert_eq!(txn.isolation_level(), Some(IsolationLevel::ReadCommitted));
        Ok(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn isolation_level_is_inherited() -> anyhow::Result<()> {
    let outer_store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let options = TransactionOptions {
        key: Some("outer".to_string()),
        store: Some(outer_store),
        isolation_level: Some(IsolationLevel::Serializable),
        ..Default::default()
    };
    transaction(options, |outer_txn| async move {
        let inner_store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let inner_options = TransactionOptions {
            key: Some("nested".to_string()),
            store: Some(inner_store),
            ..Default::default()
        };
        transaction(inner_options, |inner_txn| async move {
            assert_eq!(inner_txn.isolation_level(), Some(IsolationLevel::Serializable));
            Ok(())
        })
        .await?;
        assert_eq!(outer_txn.isolation_level(), Some(IsolationLevel::Serializable));
        Ok(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn unsupported_isolation_level_is_rejected_at_enter() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let factory =
        ResultFactory::default_factory(&settings_in(&dir), FactoryOverrides::default())?;
    let store: Arc<dyn RecordStore> = Arc::new(ResultFactoryStore::new(factory));

    let options = TransactionOptions {
        key: Some("test".to_string()),
        store: Some(store),
        isolation_level: Some(IsolationLevel::Serializable),
        ..Default::default()
    };
    let err = transaction(options, |_txn| async move { Ok(()) })
        .await
        .unwrap_err();

    let err = err.downcast::<TransactionError>()?;
    assert!(matches!(
        err,
        TransactionError::UnsupportedIsolation {
            level: IsolationLevel::Serializable,
            store: "ResultFactoryStore",
        }
    ));
    let message = err.to_string();
    assert!(message.contains("SERIALIZABLE"));
    assert!(message.contains("ResultFactoryStore"));
    Ok(())
}

//─────────────────────────────
//  Competing scopes
//─────────────────────────────

#[tokio::test]
async fn competing_writers_first_commit_wins() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRecordStore::new());
    let first_open = Arc::new(tokio::sync::Notify::new());

    let result_1 = unpersisted(json!({"foo": "bar"}));
    let result_2 = unpersisted(json!({"fizz": "buzz"}));

    let winner_store: Arc<dyn RecordStore> = store.clone();
    let opened = first_open.clone();
    let winner_result = result_1.clone();
    let winner = tokio::spawn(async move {
        let options = TransactionOptions {
            key: Some("competing-write".to_string()),
            store: Some(winner_store),
            isolation_level: Some(IsolationLevel::Serializable),
            ..Default::default()
        };
        transaction(options, |txn| async move {
            opened.notify_one();
            // hold the scope long enough for the second writer to queue on
            // the per-key lock
            tokio::time::sleep(Duration::from_millis(50)).await;
            txn.stage_value(winner_result);
            Ok(())
        })
        .await
    });

    first_open.notified().await;
    let loser_store: Arc<dyn RecordStore> = store.clone();
    let options = TransactionOptions {
        key: Some("competing-write".to_string()),
        store: Some(loser_store),
        isolation_level: Some(IsolationLevel::Serializable),
        ..Default::default()
    };
    transaction(options, |txn| async move {
        // the first writer has already committed by the time the lock is
        // granted, so this scope entered an already-committed transaction
        assert!(txn.is_committed());
        txn.stage_value(result_2);
        Ok(())
    })
    .await?;
    winner.await??;

    let record = store.read("competing-write").await.unwrap();
    assert_eq!(record.result, Some(result_1));
    Ok(())
}

#[tokio::test]
async fn competing_reader_sees_the_committed_result() -> anyhow::Result<()> {
    let store = Arc::new(MemoryRecordStore::new());
    let first_open = Arc::new(tokio::sync::Notify::new());

    let result_1 = unpersisted(json!({"foo": "bar"}));

    let writer_store: Arc<dyn RecordStore> = store.clone();
    let opened = first_open.clone();
    let written = result_1.clone();
    let writer = tokio::spawn(async move {
        let options = TransactionOptions {
            key: Some("competing-read".to_string()),
            store: Some(writer_store),
            isolation_level: Some(IsolationLevel::Serializable),
            ..Default::default()
        };
        transaction(options, |txn| async move {
            opened.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
            txn.stage_value(written);
            Ok(())
        })
        .await
    });

    first_open.notified().await;
    let reader_store: Arc<dyn RecordStore> = store.clone();
    let options = TransactionOptions {
        key: Some("competing-read".to_string()),
        store: Some(reader_store),
        isolation_level: Some(IsolationLevel::Serializable),
        ..Default::default()
    };
    let read_result = transaction(options, |txn| async move { Ok(txn.read().await) }).await?;

    writer.await??;
    assert_eq!(read_result, Some(result_1));
    Ok(())
}

//─────────────────────────────
//  Default store synthesis
//─────────────────────────────

#[tokio::test]
async fn transaction_outside_any_run_uses_default_storage() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let options = TransactionOptions {
        key: Some("outside-run".to_string()),
        settings: Some(settings_in(&dir)),
        ..Default::default()
    };
    let txn = transaction(options, |txn| async move {
        assert_eq!(txn.store().unwrap().name(), "ResultFactoryStore");
        txn.stage_value(unpersisted(json!({"foo": "bar"})));
        Ok(txn)
    })
    .await?;

    let result = txn.read().await.unwrap();
    assert_eq!(result.get().await?, json!({"foo": "bar"}));
    Ok(())
}

#[tokio::test]
async fn transaction_inside_flow_reuses_the_configured_block() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let block_id = Uuid::new_v4();
    let block = Arc::new(
        LocalFileSystem::new(dir.path())?.with_block_id(block_id),
    );
    let factory = ResultFactory::default_factory(
        &settings_in(&dir),
        FactoryOverrides {
            persist_result: Some(true),
            result_storage: Some(ResultStorage::Block(block)),
            ..Default::default()
        },
    )?;

    let txn = FlowRunContext::new(factory)
        .scope(async move {
            let options = TransactionOptions {
                key: Some("inside-flow".to_string()),
                ..Default::default()
            };
            transaction(options, |txn| async move {
                txn.stage_value(unpersisted(json!({"foo": "bar"})));
                Ok(txn)
            })
            .await
        })
        .await?;

    let result = txn.read().await.unwrap();
    // the record landed on the flow's configured block, not an anonymous one
    assert_eq!(result.as_persisted().unwrap().storage_block_id(), Some(block_id));
    assert_eq!(result.get().await?, json!({"foo": "bar"}));
    Ok(())
}
