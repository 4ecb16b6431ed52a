//! tests/sync_tests.rs - Backfill, subscription and live ingestion

#[cfg(test)]
mod tests {
    use crate::{
        blockchain::{client::TxListener, ClientRegistry, IndexerClient},
        db::{address, paybutton, transaction, trigger},
        models::{AddressState, Network},
        tests::support::{addr, chronik_tx, engine_for, harness, native, MockIndexer, BASE_TS},
    };
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::{atomic::Ordering, Arc};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_network_sync_backfills_and_subscribes() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let a2 = addr(Network::BitcoinCash, 2);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        let row2 = address::upsert_address(&h.pool, &a2, Network::BitcoinCash).await.unwrap();

        // newest first; the middle one only spends from a1
        h.ecash.set_history(
            &a1,
            vec![
                chronik_tx("tx3", &[(&other, 400)], &[(&a1, 300)], Some(BASE_TS + 300)),
                chronik_tx("tx2", &[(&a1, 500)], &[(&other, 400)], Some(BASE_TS + 200)),
                chronik_tx("tx1", &[(&other, 200)], &[(&a1, 100)], Some(BASE_TS + 100)),
            ],
        );

        let report = h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        assert!(report.is_clean(), "No address should fail: {:?}", report.failed);
        assert_eq!(report.successful.get(&a1), Some(&2), "Two transactions pay a1");
        assert_eq!(transaction::count_transactions(&h.pool, row1.id).await.unwrap(), 2);
        assert!(
            transaction::fetch_transaction(&h.pool, "tx2", row1.id).await.unwrap().is_none(),
            "A pure spend is not stored"
        );

        let tx1 = transaction::fetch_transaction(&h.pool, "tx1", row1.id).await.unwrap().unwrap();
        assert_eq!(tx1.amount, Decimal::from_str("1.00").unwrap());
        assert!(tx1.confirmed);

        let row1 = address::fetch_address(&h.pool, &a1).await.unwrap().unwrap();
        assert!(row1.synced, "a1 should be marked synced");
        assert!(row1.last_synced.is_some());
        assert_eq!(h.engine.state(&a1), AddressState::Subscribed);
        assert_eq!(h.ecash.subscribed_addresses(), vec![a1.clone()]);
        assert_eq!(h.ecash.history_calls.load(Ordering::SeqCst), 2, "Second page ends the history");

        // the other network is untouched
        let row2 = address::fetch_address_by_id(&h.pool, row2.id).await.unwrap().unwrap();
        assert!(!row2.synced);
        assert_eq!(h.bch.history_calls.load(Ordering::SeqCst), 0);
        assert!(h.bch.subscribed_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_completes_before_subscription() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let a3 = addr(Network::Ecash, 3);
        let other = addr(Network::Ecash, 9);
        address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        address::upsert_address(&h.pool, &a3, Network::Ecash).await.unwrap();
        h.ecash.set_history(&a1, vec![chronik_tx("tx1", &[(&other, 200)], &[(&a1, 100)], Some(BASE_TS))]);

        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        let events = h.ecash.events();
        for address in [&a1, &a3] {
            let backfill = events.iter().rposition(|e| *e == format!("history:{}", address)).unwrap();
            let subscribe = events.iter().position(|e| *e == format!("subscribe:{}", address)).unwrap();
            assert!(backfill < subscribe, "{} subscribed before its backfill ended: {:?}", address, events);
        }
    }

    #[tokio::test]
    async fn test_failed_backfill_is_isolated() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let a3 = addr(Network::Ecash, 3);
        let other = addr(Network::Ecash, 9);
        address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        address::upsert_address(&h.pool, &a3, Network::Ecash).await.unwrap();
        h.ecash.set_history(&a1, vec![chronik_tx("tx1", &[(&other, 200)], &[(&a1, 100)], Some(BASE_TS))]);
        h.ecash.fail_history_for(&a3);

        let report = h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        assert_eq!(report.successful.get(&a1), Some(&1));
        assert!(report.failed.contains_key(&a3), "a3 should be reported as failed");
        assert!(matches!(h.engine.state(&a3), AddressState::SyncFailed(_)));
        assert_eq!(h.ecash.subscribed_addresses(), vec![a1.clone()], "Failed address is not subscribed");

        let row3 = address::fetch_address(&h.pool, &a3).await.unwrap().unwrap();
        assert!(!row3.synced, "a3 stays unsynced for the next sweep");

        let unsynced = address::fetch_addresses_by_sync_state(&h.pool, None, false).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].address, a3);
    }

    #[tokio::test]
    async fn test_mempool_then_confirmation_leaves_one_confirmed_row() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        h.ecash.push(chronik_tx("live", &[(&other, 900)], &[(&a1, 500)], None)).await;
        let pending = transaction::fetch_transaction(&h.pool, "live", row1.id).await.unwrap().unwrap();
        assert!(!pending.confirmed);

        h.ecash
            .push(chronik_tx("live", &[(&other, 900)], &[(&a1, 500)], Some(BASE_TS + 60)))
            .await;
        let confirmed = transaction::fetch_transaction(&h.pool, "live", row1.id).await.unwrap().unwrap();
        assert!(confirmed.confirmed);
        assert_eq!(confirmed.id, pending.id, "Confirmation updates the same row");
        assert_eq!(confirmed.amount, pending.amount);
        assert_eq!(transaction::count_transactions(&h.pool, row1.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_from_mempool_deletes_only_unconfirmed_rows() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        h.ecash.push(chronik_tx("dropped", &[(&other, 900)], &[(&a1, 500)], None)).await;
        h.ecash
            .push(chronik_tx("mined", &[(&other, 900)], &[(&a1, 500)], Some(BASE_TS)))
            .await;
        assert_eq!(transaction::count_transactions(&h.pool, row1.id).await.unwrap(), 2);

        h.engine.pipeline().on_removed_from_mempool(Network::Ecash, "dropped").await;
        h.engine.pipeline().on_removed_from_mempool(Network::Ecash, "mined").await;

        assert!(transaction::fetch_transaction(&h.pool, "dropped", row1.id).await.unwrap().is_none());
        assert!(transaction::fetch_transaction(&h.pool, "mined", row1.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_waits_for_first_backfill_of_unsynced_address() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let fresh = addr(Network::Ecash, 5);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();
        let fresh_row = address::upsert_address(&h.pool, &fresh, Network::Ecash).await.unwrap();

        let both = chronik_tx("both", &[(&other, 900)], &[(&a1, 300), (&fresh, 400)], None);
        let summary = h
            .engine
            .pipeline()
            .ingest_pushed(&native(Network::Ecash, both.clone()), false)
            .await
            .unwrap();

        assert_eq!(summary.created, 1, "Only the synced address takes the push");
        assert!(transaction::fetch_transaction(&h.pool, "both", row1.id).await.unwrap().is_some());
        assert!(
            transaction::fetch_transaction(&h.pool, "both", fresh_row.id).await.unwrap().is_none(),
            "An unsynced address gets no row before its backfill"
        );

        // the backfill then brings the payment in from history
        h.ecash.set_history(&fresh, vec![both]);
        let report = h.engine.sync_unsynced_addresses().await.unwrap();
        assert_eq!(report.successful.get(&fresh), Some(&1));
        let stored = transaction::fetch_transaction(&h.pool, "both", fresh_row.id).await.unwrap().unwrap();
        assert_eq!(stored.amount, Decimal::from_str("4.00").unwrap());
    }

    #[tokio::test]
    async fn test_sync_and_subscribe_reports_bad_prefix_and_missing_client() {
        let pool = crate::tests::support::test_pool().await;
        let ecash = MockIndexer::new(Network::Ecash);
        let registry = Arc::new(ClientRegistry::new(vec![ecash.clone() as Arc<dyn IndexerClient>]));
        let engine = engine_for(&pool, registry);

        let a1 = addr(Network::Ecash, 1);
        let bch = addr(Network::BitcoinCash, 2);
        let report = engine
            .sync_and_subscribe_addresses(vec![format!("  {}", a1.to_uppercase()), bch.clone(), "bogus:qq".to_string()])
            .await
            .unwrap();

        assert_eq!(report.successful.get(&a1), Some(&0), "Input is trimmed and lowercased");
        assert_eq!(
            report.failed.get(&bch).map(String::as_str),
            Some("No indexer client for bitcoincash")
        );
        assert_eq!(
            report.failed.get("bogus:qq").map(String::as_str),
            Some("Address has no known network prefix")
        );
        assert!(address::fetch_address(&pool, &bch).await.unwrap().is_none());
        assert!(address::fetch_address(&pool, &a1).await.unwrap().unwrap().synced);
        assert_eq!(ecash.subscribed_addresses(), vec![a1]);
    }

    #[tokio::test]
    async fn test_repeated_sweeps_are_idempotent() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        h.ecash.set_history(
            &a1,
            vec![
                chronik_tx("tx2", &[(&other, 400)], &[(&a1, 300)], Some(BASE_TS + 200)),
                chronik_tx("tx1", &[(&other, 200)], &[(&a1, 100)], Some(BASE_TS + 100)),
            ],
        );

        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();
        let second = h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();

        assert_eq!(second.successful.get(&a1), Some(&0), "Catch-up finds nothing newer");
        assert_eq!(transaction::count_transactions(&h.pool, row1.id).await.unwrap(), 2);
        let subscriptions = h.ecash.events().iter().filter(|e| e.starts_with("subscribe:")).count();
        assert_eq!(subscriptions, 1, "Already subscribed addresses are not subscribed again");

        // nothing unsynced is left, so the sweep never reaches the indexer
        let calls = h.ecash.history_calls.load(Ordering::SeqCst);
        let sweep = h.engine.sync_unsynced_addresses().await.unwrap();
        assert!(sweep.successful.is_empty() && sweep.failed.is_empty());
        assert_eq!(h.ecash.history_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_subscribe_all_covers_synced_addresses_only() {
        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let a3 = addr(Network::Ecash, 3);
        let b1 = addr(Network::BitcoinCash, 4);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        address::upsert_address(&h.pool, &a3, Network::Ecash).await.unwrap();
        let rowb = address::upsert_address(&h.pool, &b1, Network::BitcoinCash).await.unwrap();
        address::mark_synced(&h.pool, row1.id, BASE_TS).await.unwrap();
        address::mark_synced(&h.pool, rowb.id, BASE_TS).await.unwrap();

        let report = h.engine.subscribe_all_addresses().await.unwrap();

        assert_eq!(report.successful.keys().cloned().collect::<Vec<_>>(), {
            let mut expected = vec![a1.clone(), b1.clone()];
            expected.sort();
            expected
        });
        assert_eq!(h.ecash.subscribed_addresses(), vec![a1]);
        assert_eq!(h.bch.subscribed_addresses(), vec![b1]);
        assert_eq!(h.ecash.history_calls.load(Ordering::SeqCst), 0, "Subscribing never backfills");
    }

    #[tokio::test]
    async fn test_first_backfill_is_silent_but_live_payments_fire_triggers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness().await;
        let a1 = addr(Network::Ecash, 1);
        let other = addr(Network::Ecash, 9);
        let row1 = address::upsert_address(&h.pool, &a1, Network::Ecash).await.unwrap();
        let button = paybutton::create_paybutton(&h.pool, "Shop", "user-1", None).await.unwrap();
        paybutton::link_addresses(&h.pool, button.id, &[row1]).await.unwrap();
        let hook = trigger::create_trigger(
            &h.pool,
            button.id,
            false,
            &format!("{}/hook", server.uri()),
            r#"{"tx": <txId>}"#,
        )
        .await
        .unwrap();
        h.ecash.set_history(&a1, vec![chronik_tx("old", &[(&other, 200)], &[(&a1, 100)], Some(BASE_TS))]);

        h.engine.sync_all_addresses_for_network(Network::Ecash).await.unwrap();
        assert!(trigger::fetch_trigger_logs(&h.pool, hook.id).await.unwrap().is_empty());

        let live = native(Network::Ecash, chronik_tx("new", &[(&other, 900)], &[(&a1, 500)], None));
        let summary = h.engine.pipeline().ingest_pushed(&live, false).await.unwrap();
        assert_eq!(summary.created, 1);
        let outcomes = summary.triggers.join().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].tx_hash, "new");

        // a replay of the same transaction creates nothing and fires nothing
        let replay = h.engine.pipeline().ingest_pushed(&live, false).await.unwrap();
        assert_eq!(replay.created, 0);
        assert!(replay.triggers.is_empty());

        let logs = trigger::fetch_trigger_logs(&h.pool, hook.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].is_error);
    }
}
