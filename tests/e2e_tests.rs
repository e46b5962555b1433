//! End-to-end integration tests
//!
//! These tests drive the full engine stack (lifecycle orchestrator,
//! payment executor, idempotency ledger, local store, reconciliation
//! processor) against the in-memory mock provider, and validate the
//! consistency guarantees under failure:
//! - Idempotent replay, including under concurrent callers
//! - Key reuse with a different request is rejected
//! - Remote side effects survive local write failures (orphan adoption)
//! - Ambiguous outcomes never cause duplicate charges
//! - PENDING states are settled by the reconciliation sweep

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::time::Duration;
    use vault_engine::core::{AdoptionQueue, IdempotencyLedger, PaymentExecutor, Reconciler, TokenLifecycle};
    use vault_engine::remote::{MockVaultProvider, Script};
    use vault_engine::types::{
        CardBrand, InstrumentDescriptor, OrderStatus, PaymentTokenStatus, ProviderEntityType,
        ProviderEvent, SetupTokenStatus, VaultError,
    };
    use vault_engine::{
        Currency, DeleteAck, EngineConfig, LocalStore, PaymentToken, TokenizationSource,
    };

    /// Complete engine wired against the mock provider, with every
    /// component sharing the same store, ledger, and adoption queue
    struct Engine {
        provider: Arc<MockVaultProvider>,
        store: Arc<LocalStore>,
        lifecycle: TokenLifecycle<MockVaultProvider>,
        executor: Arc<PaymentExecutor<MockVaultProvider>>,
        reconciler: Reconciler<MockVaultProvider>,
    }

    fn engine() -> Engine {
        let config = EngineConfig {
            retry_base_delay: Duration::from_millis(1),
            sweep_grace: Duration::ZERO,
            ..EngineConfig::default()
        };
        let provider = Arc::new(MockVaultProvider::new());
        let store = Arc::new(LocalStore::new());
        let ledger = Arc::new(IdempotencyLedger::new(config.ledger_ttl));
        let adoption = Arc::new(AdoptionQueue::new());
        let lifecycle = TokenLifecycle::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adoption),
            config.clone(),
        );
        let executor = Arc::new(PaymentExecutor::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adoption),
            config.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adoption),
            config,
        );
        Engine {
            provider,
            store,
            lifecycle,
            executor,
            reconciler,
        }
    }

    fn visa() -> InstrumentDescriptor {
        InstrumentDescriptor {
            brand: CardBrand::Visa,
            number: "4111111111111111".to_string(),
            expiry_month: 12,
            expiry_year: 2030,
            cvv: "123".to_string(),
        }
    }

    /// Runs the vaulting flow end to end: setup token, payer approval
    /// delivered as a provider event, exchange for a payment token
    async fn vaulted_token(engine: &Engine, key_prefix: &str) -> PaymentToken {
        let setup = engine
            .lifecycle
            .create_setup_token(&format!("{}-setup", key_prefix), "cust_1", &visa())
            .await
            .unwrap();
        assert_eq!(setup.status, SetupTokenStatus::Created);

        engine.provider.approve_setup_token(&setup.id).await;
        engine
            .reconciler
            .ingest_event(&ProviderEvent::new(
                ProviderEntityType::SetupToken,
                setup.id.clone(),
                "APPROVED",
                format!("{}-approval", key_prefix),
            ))
            .await
            .unwrap();

        engine
            .lifecycle
            .create_payment_token(
                &format!("{}-exchange", key_prefix),
                TokenizationSource::SetupToken(setup.id),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_vault_charge_delete() {
        let engine = engine();

        let token = vaulted_token(&engine, "flow").await;
        assert_eq!(token.status, PaymentTokenStatus::Active);
        assert_eq!(token.instrument_summary.last4, "1111");

        let order = engine
            .executor
            .charge_with_token("flow-charge", &token.id, Decimal::new(4999, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Captured);
        assert_eq!(order.payment_token_id, token.id);

        let ack = engine
            .lifecycle
            .delete_payment_token("flow-delete", &token.id)
            .await
            .unwrap();
        assert_eq!(ack, DeleteAck::Deleted);
        assert!(engine.lifecycle.get_payment_token(&token.id).is_err());
        assert_eq!(engine.provider.payment_token_count().await, 0);

        // The order record outlives the token.
        assert_eq!(engine.executor.get_order(&order.id).unwrap().id, order.id);
    }

    #[tokio::test]
    async fn test_concurrent_charges_on_one_key_produce_one_order() {
        let engine = engine();
        let token = vaulted_token(&engine, "conc").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let executor = Arc::clone(&engine.executor);
            let token_id = token.id.clone();
            handles.push(tokio::spawn(async move {
                // Contenders that lose the ledger claim back off and retry
                // until they observe the recorded result.
                loop {
                    match executor
                        .charge_with_token("conc-charge", &token_id, Decimal::new(1000, 2), Currency::Usd)
                        .await
                    {
                        Ok(order) => return order,
                        Err(VaultError::OperationInProgress { .. }) => {
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                        Err(other) => panic!("unexpected error: {}", other),
                    }
                }
            }));
        }

        let mut order_ids = Vec::new();
        for handle in handles {
            order_ids.push(handle.await.unwrap().id);
        }

        order_ids.dedup();
        assert_eq!(order_ids.len(), 1, "all callers must see the same order");
        assert_eq!(engine.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_key_reuse_with_different_request_is_rejected() {
        let engine = engine();
        let token = vaulted_token(&engine, "reuse").await;

        engine
            .executor
            .charge_with_token("reuse-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();

        let err = engine
            .executor
            .charge_with_token("reuse-charge", &token.id, Decimal::new(2000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert_eq!(err, VaultError::key_reuse("reuse-charge"));
        assert_eq!(engine.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_charge_survives_local_write_failure_via_adoption() {
        let engine = engine();
        let token = vaulted_token(&engine, "adopt").await;

        engine.store.fail_next_inserts(1);
        let err = engine
            .executor
            .charge_with_token("adopt-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PartialFailure { .. }));

        // The charge happened remotely; the sweep adopts the order locally.
        let report = engine.reconciler.run_sweep().await;
        assert_eq!(report.adopted, 1);

        let order = engine
            .executor
            .get_order_by_idempotency_key("adopt-charge")
            .unwrap();
        assert_eq!(order.status, OrderStatus::Captured);
        assert_eq!(engine.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_lost_charge_response_never_double_charges() {
        let engine = engine();
        let token = vaulted_token(&engine, "lost").await;

        // The charge lands but every resolution attempt stays ambiguous.
        engine
            .provider
            .script_next(
                "charge",
                Script::Unknown {
                    processed: true,
                    reason: "connection reset".to_string(),
                },
            )
            .await;
        for _ in 0..3 {
            engine
                .provider
                .script_next(
                    "fetch_charge_status",
                    Script::Retryable("unavailable".to_string()),
                )
                .await;
        }

        let order = engine
            .executor
            .charge_with_token("lost-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Initiated);

        // Caller retries replay the unresolved order instead of charging.
        let replay = engine
            .executor
            .charge_with_token("lost-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(replay.id, order.id);
        assert_eq!(engine.provider.charge_dispatches(), 1);

        // The sweep settles the order from the landed charge.
        let report = engine.reconciler.run_sweep().await;
        assert_eq!(report.orders_settled, 1);
        let settled = engine.executor.get_order(&order.id).unwrap();
        assert_eq!(settled.status, OrderStatus::Captured);
        assert!(settled.provider_transaction_id.is_some());

        // A retry after settlement sees the final state, still one charge.
        let after = engine
            .executor
            .charge_with_token("lost-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(after.status, OrderStatus::Captured);
        assert_eq!(engine.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_delete_is_finished_by_sweep() {
        let engine = engine();
        let token = vaulted_token(&engine, "pend").await;

        engine
            .provider
            .script_next(
                "delete_payment_token",
                Script::Unknown {
                    processed: true,
                    reason: "connection reset".to_string(),
                },
            )
            .await;

        let ack = engine
            .lifecycle
            .delete_payment_token("pend-delete", &token.id)
            .await
            .unwrap();
        assert_eq!(ack, DeleteAck::Pending);

        let report = engine.reconciler.run_sweep().await;
        assert_eq!(report.deletes_resolved, 1);

        // Both sides agree the token is gone.
        assert!(engine.lifecycle.get_payment_token(&token.id).is_err());
        assert_eq!(engine.provider.payment_token_count().await, 0);
    }

    #[tokio::test]
    async fn test_revoked_token_cannot_be_charged() {
        let engine = engine();
        let token = vaulted_token(&engine, "rev").await;

        engine.provider.revoke_payment_token(&token.id).await;
        engine
            .reconciler
            .ingest_event(&ProviderEvent::new(
                ProviderEntityType::PaymentToken,
                token.id.clone(),
                "REVOKED",
                "rev-event",
            ))
            .await
            .unwrap();

        let err = engine
            .executor
            .charge_with_token("rev-charge", &token.id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidState { .. }));
        assert_eq!(engine.provider.charge_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_setup_token_is_single_use_across_keys() {
        let engine = engine();
        let setup = engine
            .lifecycle
            .create_setup_token("once-setup", "cust_1", &visa())
            .await
            .unwrap();
        engine.provider.approve_setup_token(&setup.id).await;
        engine
            .reconciler
            .ingest_event(&ProviderEvent::new(
                ProviderEntityType::SetupToken,
                setup.id.clone(),
                "APPROVED",
                "once-approval",
            ))
            .await
            .unwrap();

        engine
            .lifecycle
            .create_payment_token("once-a", TokenizationSource::SetupToken(setup.id.clone()))
            .await
            .unwrap();

        // A different key cannot exchange the consumed token again.
        let err = engine
            .lifecycle
            .create_payment_token("once-b", TokenizationSource::SetupToken(setup.id))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidState { .. }));
        assert_eq!(engine.provider.payment_token_count().await, 1);
    }

    #[tokio::test]
    async fn test_customer_sync_converges_after_provider_side_changes() {
        let engine = engine();
        let kept = vaulted_token(&engine, "sync-a").await;
        let revoked = vaulted_token(&engine, "sync-b").await;

        engine.provider.revoke_payment_token(&revoked.id).await;

        let report = engine
            .reconciler
            .sync_customer_payment_tokens("cust_1")
            .await
            .unwrap();
        assert_eq!(report.updated, 1);

        assert_eq!(
            engine.lifecycle.get_payment_token(&kept.id).unwrap().status,
            PaymentTokenStatus::Active
        );
        assert_eq!(
            engine
                .lifecycle
                .get_payment_token(&revoked.id)
                .unwrap()
                .status,
            PaymentTokenStatus::Revoked
        );
    }
}
