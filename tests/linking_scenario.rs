// End-to-end linking, notification and profile scenarios against an
// in-memory database.

use async_trait::async_trait;
use doc_inc::{
    AuditAction, AuditFilter, CoreConfig, CoreError, CoreServices, Database, DeliveryError,
    DeliveryStatus, LinkState, NewStatement, NewUser, NotificationMessage, NotificationTransport,
    NotificationType, Role, StatementType, User,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Transports
// ============================================================================

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct FailingTransport;

#[async_trait]
impl NotificationTransport for FailingTransport {
    async fn deliver(&self, _: &NotificationMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Transport("mail relay rejected message".to_string()))
    }
}

struct SlowTransport;

#[async_trait]
impl NotificationTransport for SlowTransport {
    async fn deliver(&self, _: &NotificationMessage) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn services_with(transport: Arc<dyn NotificationTransport>) -> CoreServices {
    CoreServices::new(
        Database::open_in_memory().unwrap(),
        &CoreConfig::for_test(),
        transport,
    )
}

fn register(services: &CoreServices, username: &str) -> User {
    services
        .users
        .register(NewUser {
            username: username.to_string(),
            email: format!("{}@docincorp.com", username),
            password: "SecurePass1".to_string(),
            role: Role::EndUser,
        })
        .unwrap()
}

fn actions_for(services: &CoreServices, account_number: &str) -> Vec<(AuditAction, String)> {
    services
        .linking
        .history(account_number)
        .collect_all()
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.details))
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn verify_link_unlink_scenario() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    assert_eq!(outcome.state, LinkState::Linked);
    assert!(outcome.is_linked());

    assert_eq!(
        actions_for(&services, "ACC123"),
        vec![
            (AuditAction::Verify, "verified".to_string()),
            (AuditAction::Link, "linked".to_string()),
        ]
    );

    let unlink = services.linking.unlink_account("ACC123", None).await.unwrap();
    assert!(unlink.unlinked);
    assert!(!services.accounts.get("ACC123").unwrap().unwrap().linked);

    let history = actions_for(&services, "ACC123");
    assert_eq!(history.len(), 3);
    assert_eq!(history[2], (AuditAction::Unlink, "unlinked".to_string()));

    let kinds: Vec<_> = transport.sent().iter().map(|m| m.notification_type).collect();
    assert_eq!(
        kinds,
        vec![NotificationType::AccountLinked, NotificationType::AccountUnlinked]
    );
}

#[tokio::test]
async fn failed_verify_is_rejected_and_audited_once() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "0000")
        .await
        .unwrap();

    assert_eq!(outcome.state, LinkState::Rejected);
    assert!(outcome.notification.is_none());
    assert!(!services.accounts.get("ACC123").unwrap().unwrap().linked);
    assert_eq!(
        actions_for(&services, "ACC123"),
        vec![(AuditAction::Verify, "failed".to_string())]
    );
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn account_held_by_another_user_conflicts() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let u1 = register(&services, "u1");
    let u2 = register(&services, "u2");
    services.accounts.register("ACC123", "6789").unwrap();

    services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();

    let err = services
        .linking
        .link_account(&u2.user_id, "ACC123", "6789")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(services
        .accounts
        .get("ACC123")
        .unwrap()
        .unwrap()
        .is_linked_to(&u1.user_id));
}

#[tokio::test]
async fn relinking_same_user_only_records_verify() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    let entries_before = services.audit.count().unwrap();

    let again = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    assert_eq!(again.state, LinkState::Linked);
    assert!(again.notification.is_none());
    // Only the VERIFY of the repeated attempt is added; no second LINK
    assert_eq!(services.audit.count().unwrap(), entries_before + 1);
    assert_eq!(
        actions_for(&services, "ACC123").last().unwrap(),
        &(AuditAction::Verify, "verified".to_string())
    );
    assert!(services.accounts.get("ACC123").unwrap().unwrap().verified_at.is_none());
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn relinking_with_wrong_fragment_is_rejected() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    let before = actions_for(&services, "ACC123").len();

    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "0000")
        .await
        .unwrap();
    assert_eq!(outcome.state, LinkState::Rejected);

    let history = actions_for(&services, "ACC123");
    assert_eq!(history.len(), before + 1);
    assert_eq!(history[before], (AuditAction::Verify, "failed".to_string()));
    // The existing link is untouched
    assert!(services
        .accounts
        .get("ACC123")
        .unwrap()
        .unwrap()
        .is_linked_to(&u1.user_id));
}

#[tokio::test]
async fn malformed_account_numbers_are_rejected_before_locking() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let u1 = register(&services, "u1");

    for i in 0..200 {
        let bogus = format!("GHOST-{}", i);
        assert!(matches!(
            services.linking.unlink_account(&bogus, None).await,
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            services.linking.link_account(&u1.user_id, &bogus, "6789").await,
            Err(CoreError::Validation { .. })
        ));
    }
    assert_eq!(services.audit.count().unwrap(), 0);
}

#[tokio::test]
async fn deactivated_user_cannot_link() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let admin = services
        .users
        .register(NewUser {
            username: "root".to_string(),
            email: "root@docincorp.com".to_string(),
            password: "SecurePass1".to_string(),
            role: Role::Admin,
        })
        .unwrap();
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    services
        .users
        .deactivate(admin.admin().unwrap(), &u1.user_id)
        .unwrap();

    let err = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied { .. }));
    assert!(actions_for(&services, "ACC123").is_empty());
}

#[tokio::test]
async fn delivery_failure_does_not_undo_link() {
    let services = services_with(Arc::new(FailingTransport));
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();

    assert_eq!(outcome.state, LinkState::Linked);
    let notification = outcome.notification.unwrap();
    assert_eq!(notification.delivery, DeliveryStatus::Failed);
    assert!(services
        .accounts
        .get("ACC123")
        .unwrap()
        .unwrap()
        .is_linked_to(&u1.user_id));
}

#[tokio::test]
async fn delivery_timeout_does_not_undo_link() {
    let services = services_with(Arc::new(SlowTransport));
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    let started = std::time::Instant::now();
    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.state, LinkState::Linked);
    let notification = outcome.notification.unwrap();
    assert_eq!(notification.delivery, DeliveryStatus::Failed);
    assert!(notification.delivery_error.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_link_attempts_have_one_winner() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    services.accounts.register("ACC123", "6789").unwrap();
    let users: Vec<User> = (0..8)
        .map(|i| register(&services, &format!("user{}", i)))
        .collect();

    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let linking = services.linking.clone();
            let user_id = user.user_id.clone();
            tokio::spawn(async move { linking.link_account(&user_id, "ACC123", "6789").await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.is_linked() => winners += 1,
            Ok(outcome) => panic!("unexpected state {:?}", outcome.state),
            Err(CoreError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(winners, 1);

    let successful_links = services
        .audit
        .query(AuditFilter::new().action(AuditAction::Link).account("ACC123"))
        .collect_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.details == "linked")
        .count();
    assert_eq!(successful_links, 1);
}

#[tokio::test]
async fn audit_is_ordered_by_id() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let u1 = register(&services, "u1");
    for (number, last4) in [("ACC1", "1111"), ("ACC2", "2222"), ("ACC3", "3333")] {
        services.accounts.register(number, last4).unwrap();
        services
            .linking
            .link_account(&u1.user_id, number, last4)
            .await
            .unwrap();
    }

    let ids: Vec<i64> = services
        .audit
        .query(AuditFilter::new())
        .iter()
        .map(|e| e.unwrap().log_id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // Restartable: a second pass yields the same sequence
    let again: Vec<i64> = services
        .audit
        .query(AuditFilter::new())
        .iter()
        .map(|e| e.unwrap().log_id)
        .collect();
    assert_eq!(ids, again);
}

// ============================================================================
// Statements
// ============================================================================

fn monthly(statement_id: &str, account_number: &str) -> NewStatement {
    NewStatement {
        statement_id: statement_id.to_string(),
        account_number: account_number.to_string(),
        statement_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        document_ref: format!("s3://statements/{}.pdf", statement_id),
        statement_type: StatementType::Monthly,
    }
}

#[tokio::test]
async fn issued_statement_notifies_holder() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();
    services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();

    let issued = services.issue_statement(monthly("ST-1", "ACC123")).await.unwrap();
    let notice = issued.notification.unwrap();
    assert_eq!(notice.notification_type, NotificationType::StatementAvailable);
    assert_eq!(notice.delivery, DeliveryStatus::Delivered);
    assert_eq!(
        transport.sent().last().unwrap().notification_type,
        NotificationType::StatementAvailable
    );
}

#[tokio::test]
async fn opted_out_holder_gets_suppressed_statement_notice() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();
    services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    services.users.opt_out(&u1.user_id).unwrap();
    let sent_before = transport.sent().len();

    let issued = services.issue_statement(monthly("ST-1", "ACC123")).await.unwrap();
    assert_eq!(issued.notification.unwrap().delivery, DeliveryStatus::Suppressed);
    assert_eq!(transport.sent().len(), sent_before);
}

#[tokio::test]
async fn statement_for_unlinked_account_sends_nothing() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    services.accounts.register("ACC123", "6789").unwrap();

    let issued = services.issue_statement(monthly("ST-1", "ACC123")).await.unwrap();
    assert!(issued.notification.is_none());
    assert!(transport.sent().is_empty());
    assert!(matches!(
        services.issue_statement(monthly("ST-1", "ACC123")).await,
        Err(CoreError::Conflict(_))
    ));
}

// ============================================================================
// Profile
// ============================================================================

#[tokio::test]
async fn password_reset_sends_one_confirmation() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let user = register(&services, "mgarcia");

    assert!(services
        .profile
        .reset_password(&user.user_id, "NewSecure1")
        .await
        .unwrap());

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "mgarcia@docincorp.com");
    assert_eq!(sent[0].subject, "Password Reset Confirmation");
    assert_eq!(
        sent[0].body,
        "Your password for Doc Inc has been successfully reset."
    );
}

#[tokio::test]
async fn weak_password_reset_sends_nothing() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let user = register(&services, "mgarcia");

    assert!(!services
        .profile
        .reset_password(&user.user_id, "weak")
        .await
        .unwrap());
    assert!(transport.sent().is_empty());
    assert!(services
        .dispatcher
        .list_for_user(&user.user_id)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn email_change_confirmation_goes_to_new_address() {
    let transport = Arc::new(RecordingTransport::default());
    let services = services_with(transport.clone());
    let user = register(&services, "alee");

    assert!(!services
        .profile
        .update_email(&user.user_id, "not-an-email")
        .await
        .unwrap());
    assert!(services
        .profile
        .update_email(&user.user_id, "a.lee@docincorp.com")
        .await
        .unwrap());

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].notification_type, NotificationType::EmailChanged);
    assert_eq!(sent[0].to, "a.lee@docincorp.com");
}

#[tokio::test]
async fn mark_read_is_idempotent_end_to_end() {
    let services = services_with(Arc::new(RecordingTransport::default()));
    let u1 = register(&services, "u1");
    services.accounts.register("ACC123", "6789").unwrap();

    let outcome = services
        .linking
        .link_account(&u1.user_id, "ACC123", "6789")
        .await
        .unwrap();
    let id = outcome.notification.unwrap().notification_id;

    assert!(services.dispatcher.mark_read(&id).unwrap());
    assert!(services.dispatcher.mark_read(&id).unwrap());
    assert!(services.dispatcher.get(&id).unwrap().read);
    assert!(services
        .dispatcher
        .mark_read("no-such-id")
        .unwrap_err()
        .is_not_found());
}
