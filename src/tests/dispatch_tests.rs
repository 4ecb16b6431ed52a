//! tests/dispatch_tests.rs - Trigger execution against a mock webhook

#[cfg(test)]
mod tests {
    use crate::{
        db::{address, paybutton, trigger},
        dispatch::{Mailer, TriggerDispatcher},
        models::{Address, BroadcastTxData, BroadcastType, Network, SimplifiedTransaction, TriggerAction},
        tests::support::{addr, test_pool, BASE_TS},
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::json;
    use sqlx::SqlitePool;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), String> {
            self.sent.lock().unwrap().push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    async fn setup(mailer: Arc<RecordingMailer>) -> (SqlitePool, TriggerDispatcher, Address) {
        let pool = test_pool().await;
        let dispatcher = TriggerDispatcher::new(pool.clone(), Duration::from_secs(2), mailer).unwrap();
        let a1 = address::upsert_address(&pool, &addr(Network::Ecash, 1), Network::Ecash)
            .await
            .unwrap();
        (pool, dispatcher, a1)
    }

    fn broadcast(address: &Address, hash: &str) -> BroadcastTxData {
        BroadcastTxData {
            address: address.address.clone(),
            message_type: BroadcastType::NewTx,
            txs: vec![SimplifiedTransaction {
                hash: hash.to_string(),
                amount: Decimal::from_str("1.50").unwrap(),
                address: address.address.clone(),
                timestamp: BASE_TS,
                confirmed: false,
                op_return: None,
                input_addresses: Vec::new(),
                output_addresses: vec![address.address.clone()],
            }],
        }
    }

    async fn button_with_trigger(
        pool: &SqlitePool,
        address: &Address,
        email: Option<&str>,
        send_email: bool,
        url: &str,
        template: &str,
    ) -> i64 {
        let button = paybutton::create_paybutton(pool, "Shop", "user-1", email).await.unwrap();
        paybutton::link_addresses(pool, button.id, &[address.clone()]).await.unwrap();
        trigger::create_trigger(pool, button.id, send_email, url, template)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_webhook_receives_rendered_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({ "tx": "abc", "amount": 1.5, "currency": "XEC", "button": "Shop" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
            .expect(1)
            .mount(&server)
            .await;

        let (pool, dispatcher, a1) = setup(Arc::new(RecordingMailer::default())).await;
        let url = format!("{}/hook", server.uri());
        let trigger_id = button_with_trigger(
            &pool,
            &a1,
            None,
            false,
            &url,
            r#"{"tx": <txId>, "amount": <amount>, "currency": <currency>, "button": <buttonName>}"#,
        )
        .await;

        let outcomes = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap()
            .join()
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].action, TriggerAction::PostData);

        let logs = trigger::fetch_trigger_logs(&pool, trigger_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].is_error);
        assert_eq!(logs[0].action, "PostData");
        assert_eq!(logs[0].data["postedURL"], json!(url));
        assert_eq!(logs[0].data["responseData"], json!("thanks"));
        assert_eq!(logs[0].data["postedData"]["tx"], json!("abc"));
    }

    #[tokio::test]
    async fn test_failing_webhook_does_not_affect_others() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fail"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (pool, dispatcher, a1) = setup(Arc::new(RecordingMailer::default())).await;
        let failing = button_with_trigger(&pool, &a1, None, false, &format!("{}/fail", server.uri()), "{}").await;
        let working = button_with_trigger(&pool, &a1, None, false, &format!("{}/ok", server.uri()), "{}").await;

        let outcomes = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap()
            .join()
            .await;

        assert_eq!(outcomes.len(), 2);
        let failed = outcomes.iter().find(|o| o.trigger_id == failing).unwrap();
        let succeeded = outcomes.iter().find(|o| o.trigger_id == working).unwrap();
        assert!(!failed.success);
        assert!(succeeded.success);

        let logs = trigger::fetch_trigger_logs(&pool, failing).await.unwrap();
        assert!(logs[0].is_error);
        assert_eq!(logs[0].data["errorName"], json!("HttpStatus"));
        assert_eq!(logs[0].data["triggerPostURL"], json!(format!("{}/fail", server.uri())));
        assert!(!trigger::fetch_trigger_logs(&pool, working).await.unwrap()[0].is_error);
    }

    #[tokio::test]
    async fn test_invalid_template_is_logged_without_posting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (pool, dispatcher, a1) = setup(Arc::new(RecordingMailer::default())).await;
        let trigger_id = button_with_trigger(
            &pool,
            &a1,
            None,
            false,
            &format!("{}/hook", server.uri()),
            r#"{"tx": <txId>"#,
        )
        .await;

        let outcomes = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap()
            .join()
            .await;

        assert!(!outcomes[0].success);
        let logs = trigger::fetch_trigger_logs(&pool, trigger_id).await.unwrap();
        assert_eq!(logs[0].data["errorName"], json!("InvalidTemplate"));
        assert_eq!(logs[0].data["triggerPostData"], json!(r#"{"tx": <txId>"#));
    }

    #[tokio::test]
    async fn test_email_trigger_uses_owner_email() {
        let mailer = Arc::new(RecordingMailer::default());
        let (pool, dispatcher, a1) = setup(mailer.clone()).await;
        let trigger_id = button_with_trigger(&pool, &a1, Some("owner@example.com"), true, "", "").await;

        let outcomes = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap()
            .join()
            .await;

        assert_eq!(outcomes.len(), 1, "Empty URL means no webhook");
        assert_eq!(outcomes[0].action, TriggerAction::SendEmail);
        assert!(outcomes[0].success);
        assert_eq!(
            mailer.sent.lock().unwrap().clone(),
            vec![("owner@example.com".to_string(), "Payment received on Shop".to_string())]
        );

        let logs = trigger::fetch_trigger_logs(&pool, trigger_id).await.unwrap();
        assert_eq!(logs[0].action, "SendEmail");
        assert_eq!(logs[0].data, json!({ "email": "owner@example.com", "txId": "abc" }));
    }

    #[tokio::test]
    async fn test_email_trigger_without_owner_email_fails() {
        let mailer = Arc::new(RecordingMailer::default());
        let (pool, dispatcher, a1) = setup(mailer.clone()).await;
        let trigger_id = button_with_trigger(&pool, &a1, None, true, "", "").await;

        let outcomes = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap()
            .join()
            .await;

        assert!(!outcomes[0].success);
        assert!(mailer.sent.lock().unwrap().is_empty());
        let logs = trigger::fetch_trigger_logs(&pool, trigger_id).await.unwrap();
        assert!(logs[0].is_error);
        assert_eq!(logs[0].data["errorName"], json!("MissingEmail"));
    }

    #[tokio::test]
    async fn test_address_without_triggers_spawns_nothing() {
        let (_pool, dispatcher, a1) = setup(Arc::new(RecordingMailer::default())).await;

        let batch = dispatcher
            .execute_address_triggers(&broadcast(&a1, "abc"), Network::Ecash)
            .await
            .unwrap();

        assert!(batch.is_empty());
    }
}
