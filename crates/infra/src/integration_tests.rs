//! Integration tests for the full borrowing pipeline.
//!
//! Tests: Service → EventStore → EventBus → Projection → ReadModel
//!
//! Verifies:
//! - the request lifecycle keeps ledger counters consistent
//! - concurrent approvals cannot oversell stock
//! - the overdue sweep is idempotent and fires notifications
//! - observer failures (audit sink) never fail business transitions

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use serde_json::Value as JsonValue;

    use stockroom_auth::{Principal, Role};
    use stockroom_borrowing::BorrowStatus;
    use stockroom_core::{DomainError, UserId};
    use stockroom_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use stockroom_inventory::{ItemCondition, ItemDetails, ItemId};

    use crate::audit::{AuditActor, AuditSink, FailingAuditSink, InMemoryAuditSink};
    use crate::event_store::InMemoryEventStore;
    use crate::notify::{OverdueNotifier, RecordingNotifier};
    use crate::projections::StockLevelsProjection;
    use crate::read_model::InMemoryReadStore;
    use crate::service::{BorrowService, NewItem, ServiceError, TransactionFilter};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Service = BorrowService<Arc<InMemoryEventStore>, Bus>;

    struct Harness {
        service: Arc<Service>,
        bus: Bus,
        audit: Arc<InMemoryAuditSink>,
        notifier: Arc<RecordingNotifier>,
    }

    fn setup() -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let service = Arc::new(BorrowService::new(
            store,
            bus.clone(),
            audit.clone() as Arc<dyn AuditSink>,
            notifier.clone() as Arc<dyn OverdueNotifier>,
        ));

        Harness {
            service,
            bus,
            audit,
            notifier,
        }
    }

    fn staff() -> Principal {
        Principal::with_role(UserId::new(), Role::new("sao"))
    }

    fn student() -> Principal {
        Principal::with_role(UserId::new(), Role::new("student"))
    }

    fn item_details(borrowable: bool) -> ItemDetails {
        ItemDetails {
            name: "Projector".to_string(),
            category: "AV Equipment".to_string(),
            description: "Portable HDMI projector".to_string(),
            location: "Cabinet 2".to_string(),
            borrowable,
        }
    }

    fn create_item(harness: &Harness, sao: &Principal, total: u32, now: DateTime<Utc>) -> ItemId {
        harness
            .service
            .create_item(
                sao,
                NewItem {
                    code: format!("AV-{}", uuid::Uuid::now_v7().simple()),
                    details: item_details(true),
                    condition: ItemCondition::Good,
                    quantity_total: total,
                },
                now,
            )
            .unwrap()
            .item_id
    }

    fn expect_domain<T: core::fmt::Debug>(result: Result<T, ServiceError>) -> DomainError {
        match result {
            Err(ServiceError::Domain(e)) => e,
            other => panic!("expected a domain error, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_restores_ledger_counters() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let item_id = create_item(&harness, &sao, 5, now);

        let txn = harness
            .service
            .request(
                &borrower,
                item_id,
                3,
                now + Duration::days(7),
                "Science fair",
                now,
            )
            .unwrap();
        assert_eq!(txn.status, BorrowStatus::Pending);

        let txn = harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();
        assert_eq!(txn.status, BorrowStatus::Approved);

        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 2);
        assert_eq!(item.quantity_borrowed, 3);

        let txn = harness
            .service
            .mark_borrowed(&sao, txn.transaction_id, now)
            .unwrap();
        assert_eq!(txn.status, BorrowStatus::Borrowed);

        let txn = harness
            .service
            .mark_returned(&sao, txn.transaction_id, ItemCondition::Good, None, now)
            .unwrap();
        assert_eq!(txn.status, BorrowStatus::Returned);
        assert_eq!(txn.return_condition, Some(ItemCondition::Good));

        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 5);
        assert_eq!(item.quantity_borrowed, 0);
        assert_eq!(item.quantity_total, 5);
        // Item condition untouched by a clean return.
        assert_eq!(item.condition, ItemCondition::Good);
    }

    #[test]
    fn full_scenario_with_reject_sweep_and_return() {
        let harness = setup();
        let sao = staff();
        let first = student();
        let second = student();
        let now = Utc::now();
        let due = now + Duration::days(2);

        let item_id = create_item(&harness, &sao, 5, now);

        // Both requests open while all 5 units are still available.
        let txn1 = harness
            .service
            .request(&first, item_id, 3, due, "Robotics club", now)
            .unwrap();
        let txn2 = harness
            .service
            .request(&second, item_id, 3, due, "Drama rehearsal", now)
            .unwrap();

        harness
            .service
            .approve(&sao, txn1.transaction_id, now)
            .unwrap();
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 2);
        assert_eq!(item.quantity_borrowed, 3);

        // Rejection never touches the ledger.
        let rejected = harness
            .service
            .reject(&sao, txn2.transaction_id, "Not enough stock left", now)
            .unwrap();
        assert_eq!(rejected.status, BorrowStatus::Cancelled);
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 2);
        assert_eq!(item.quantity_borrowed, 3);

        harness
            .service
            .mark_borrowed(&sao, txn1.transaction_id, now)
            .unwrap();

        // Past the due date, any read promotes the transaction.
        let later = due + Duration::days(1);
        let listed = harness
            .service
            .list_transactions(&sao, TransactionFilter::default(), later)
            .unwrap();
        let overdue = listed
            .iter()
            .find(|t| t.transaction_id == txn1.transaction_id)
            .unwrap();
        assert_eq!(overdue.status, BorrowStatus::Overdue);

        // Return still works from overdue and restores the ledger.
        let returned = harness
            .service
            .mark_returned(
                &sao,
                txn1.transaction_id,
                ItemCondition::Good,
                Some("Late return".to_string()),
                later,
            )
            .unwrap();
        assert_eq!(returned.status, BorrowStatus::Returned);

        let item = harness.service.get_item(&sao, item_id, later).unwrap();
        assert_eq!(item.quantity_available, 5);
        assert_eq!(item.quantity_borrowed, 0);
    }

    #[test]
    fn damaged_return_sets_item_condition() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let item_id = create_item(&harness, &sao, 2, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 1, now + Duration::days(3), "Hiking trip", now)
            .unwrap();
        harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();
        harness
            .service
            .mark_borrowed(&sao, txn.transaction_id, now)
            .unwrap();

        harness
            .service
            .mark_returned(
                &sao,
                txn.transaction_id,
                ItemCondition::Damaged,
                Some("Cracked casing".to_string()),
                now,
            )
            .unwrap();

        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.condition, ItemCondition::Damaged);
        assert_eq!(item.quantity_available, 2);
        assert_eq!(item.quantity_borrowed, 0);
    }

    #[test]
    fn approve_boundary_exact_stock() {
        let harness = setup();
        let sao = staff();
        let now = Utc::now();
        let due = now + Duration::days(5);

        let item_id = create_item(&harness, &sao, 3, now);

        let a = harness
            .service
            .request(&student(), item_id, 2, due, "Workshop", now)
            .unwrap();
        let b = harness
            .service
            .request(&student(), item_id, 2, due, "Exhibit", now)
            .unwrap();

        // Exact match: available (3) >= qty (2) → approved, leaving 1.
        harness.service.approve(&sao, a.transaction_id, now).unwrap();

        // One short: available (1) == qty - 1 → insufficient stock.
        let err = expect_domain(harness.service.approve(&sao, b.transaction_id, now));
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                requested: 2,
                available: 1
            }
        );

        // The loser's request is untouched and the ledger is consistent.
        let b_after = harness
            .service
            .get_transaction(&sao, b.transaction_id, now)
            .unwrap();
        assert_eq!(b_after.status, BorrowStatus::Pending);
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 1);
        assert_eq!(item.quantity_borrowed, 2);
    }

    #[test]
    fn concurrent_approvals_cannot_oversell() {
        let harness = setup();
        let sao = staff();
        let now = Utc::now();
        let due = now + Duration::days(5);

        let item_id = create_item(&harness, &sao, 1, now);

        let a = harness
            .service
            .request(&student(), item_id, 1, due, "Club night", now)
            .unwrap();
        let b = harness
            .service
            .request(&student(), item_id, 1, due, "Open day", now)
            .unwrap();

        let mut handles = Vec::new();
        for txn_id in [a.transaction_id, b.transaction_id] {
            let service = harness.service.clone();
            let reviewer = sao.clone();
            handles.push(std::thread::spawn(move || {
                service.approve(&reviewer, txn_id, now)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let approved = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(approved, 1, "exactly one concurrent approval may win");

        // The loser got a typed failure, never a silent retry.
        let loser = results.into_iter().find(|r| r.is_err()).unwrap();
        match expect_domain(loser) {
            DomainError::InsufficientStock { .. } | DomainError::ConcurrentModification(_) => {}
            other => panic!("unexpected loser error: {other:?}"),
        }

        // Counters reconcile: one unit out, none left, never negative.
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 0);
        assert_eq!(item.quantity_borrowed, 1);
        assert_eq!(item.quantity_total, 1);
    }

    #[test]
    fn sweep_is_idempotent_and_notifies_once() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();
        let due = now + Duration::days(1);

        let item_id = create_item(&harness, &sao, 1, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 1, due, "Field recording", now)
            .unwrap();
        harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();
        harness
            .service
            .mark_borrowed(&sao, txn.transaction_id, now)
            .unwrap();

        let later = due + Duration::days(3);
        let promoted = harness.service.run_sweep(later).unwrap();
        assert_eq!(promoted, vec![txn.transaction_id]);

        // Running the sweep again (and again) changes nothing.
        assert!(harness.service.run_sweep(later).unwrap().is_empty());
        assert!(harness
            .service
            .run_sweep(later + Duration::days(30))
            .unwrap()
            .is_empty());

        let view = harness
            .service
            .get_transaction(&sao, txn.transaction_id, later)
            .unwrap();
        assert_eq!(view.status, BorrowStatus::Overdue);

        // One notification, one system audit record.
        let notices = harness.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].transaction_id, txn.transaction_id);
        assert_eq!(notices[0].borrower, borrower.user_id);

        let overdue_audits: Vec<_> = harness
            .audit
            .events()
            .into_iter()
            .filter(|e| e.action == "overdue")
            .collect();
        assert_eq!(overdue_audits.len(), 1);
        assert_eq!(overdue_audits[0].actor, AuditActor::System);
    }

    #[test]
    fn cancel_releases_stock_only_after_approval() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();
        let due = now + Duration::days(4);

        let item_id = create_item(&harness, &sao, 5, now);

        // Cancel while pending: ledger never touched.
        let pending = harness
            .service
            .request(&borrower, item_id, 2, due, "Band practice", now)
            .unwrap();
        harness
            .service
            .cancel(&borrower, pending.transaction_id, now)
            .unwrap();
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 5);

        // Cancel after approval: the reservation comes back.
        let approved = harness
            .service
            .request(&borrower, item_id, 2, due, "Band practice", now)
            .unwrap();
        harness
            .service
            .approve(&sao, approved.transaction_id, now)
            .unwrap();
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 3);

        harness
            .service
            .cancel(&borrower, approved.transaction_id, now)
            .unwrap();
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 5);
        assert_eq!(item.quantity_borrowed, 0);
    }

    #[test]
    fn request_guards() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();
        let due = now + Duration::days(4);

        let item_id = create_item(&harness, &sao, 2, now);

        // Unknown item.
        let missing = ItemId::new(stockroom_core::AggregateId::new());
        assert_eq!(
            expect_domain(harness.service.request(&borrower, missing, 1, due, "x", now)),
            DomainError::NotFound
        );

        // Stock-exceeding quantity at request time.
        let err = expect_domain(
            harness
                .service
                .request(&borrower, item_id, 3, due, "Too many", now),
        );
        assert!(matches!(err, DomainError::InvalidQuantity(_)));

        // Return date not in the future.
        let err = expect_domain(harness.service.request(
            &borrower,
            item_id,
            1,
            now - Duration::days(1),
            "Backdated",
            now,
        ));
        assert!(matches!(err, DomainError::Validation(_)));

        // Second live request on the same item by the same borrower.
        harness
            .service
            .request(&borrower, item_id, 1, due, "First", now)
            .unwrap();
        let err = expect_domain(
            harness
                .service
                .request(&borrower, item_id, 1, due, "Second", now),
        );
        assert!(matches!(err, DomainError::Validation(_)));

        // Non-borrowable item.
        let fixed = harness
            .service
            .create_item(
                &sao,
                NewItem {
                    code: "FIX-001".to_string(),
                    details: item_details(false),
                    condition: ItemCondition::Good,
                    quantity_total: 4,
                },
                now,
            )
            .unwrap();
        let err = expect_domain(
            harness
                .service
                .request(&borrower, fixed.item_id, 1, due, "Nope", now),
        );
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn role_and_ownership_checks() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let other = student();
        let now = Utc::now();
        let due = now + Duration::days(4);

        let item_id = create_item(&harness, &sao, 2, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 1, due, "Lab demo", now)
            .unwrap();

        // Students cannot review.
        assert_eq!(
            expect_domain(harness.service.approve(&borrower, txn.transaction_id, now)),
            DomainError::Unauthorized
        );
        assert_eq!(
            expect_domain(harness.service.mark_borrowed(&borrower, txn.transaction_id, now)),
            DomainError::Unauthorized
        );

        // A different student cannot cancel someone else's request...
        assert_eq!(
            expect_domain(harness.service.cancel(&other, txn.transaction_id, now)),
            DomainError::Unauthorized
        );

        // ...but staff can.
        harness
            .service
            .cancel(&sao, txn.transaction_id, now)
            .unwrap();
    }

    #[test]
    fn invalid_transitions_leave_everything_unchanged() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();
        let due = now + Duration::days(4);

        let item_id = create_item(&harness, &sao, 3, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 2, due, "Debate night", now)
            .unwrap();

        // Pickup before approval is invalid.
        let err = expect_domain(harness.service.mark_borrowed(&sao, txn.transaction_id, now));
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        // Return before pickup is invalid, and never touches the ledger.
        let err = expect_domain(harness.service.mark_returned(
            &sao,
            txn.transaction_id,
            ItemCondition::Good,
            None,
            now,
        ));
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        let view = harness
            .service
            .get_transaction(&sao, txn.transaction_id, now)
            .unwrap();
        assert_eq!(view.status, BorrowStatus::Pending);
        let item = harness.service.get_item(&sao, item_id, now).unwrap();
        assert_eq!(item.quantity_available, 3);
        assert_eq!(item.quantity_borrowed, 0);
    }

    #[test]
    fn audit_sink_failure_never_fails_the_transition() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let service = BorrowService::new(
            store,
            bus,
            Arc::new(FailingAuditSink) as Arc<dyn AuditSink>,
            Arc::new(RecordingNotifier::new()) as Arc<dyn OverdueNotifier>,
        );

        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let item = service
            .create_item(
                &sao,
                NewItem {
                    code: "AV-900".to_string(),
                    details: item_details(true),
                    condition: ItemCondition::Good,
                    quantity_total: 1,
                },
                now,
            )
            .unwrap();

        let txn = service
            .request(&borrower, item.item_id, 1, now + Duration::days(2), "Demo", now)
            .unwrap();
        let approved = service.approve(&sao, txn.transaction_id, now).unwrap();
        assert_eq!(approved.status, BorrowStatus::Approved);
    }

    #[test]
    fn audit_trail_records_each_transition() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let item_id = create_item(&harness, &sao, 2, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 1, now + Duration::days(2), "Demo", now)
            .unwrap();
        harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();
        harness
            .service
            .mark_borrowed(&sao, txn.transaction_id, now)
            .unwrap();
        harness
            .service
            .mark_returned(&sao, txn.transaction_id, ItemCondition::Good, None, now)
            .unwrap();

        let actions: Vec<String> = harness
            .audit
            .events()
            .into_iter()
            .filter(|e| e.transaction_id == txn.transaction_id)
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, ["request", "approve", "pickup", "return"]);

        let events = harness.audit.events();
        assert_eq!(events[0].actor, AuditActor::User(borrower.user_id));
        assert_eq!(events[1].actor, AuditActor::User(sao.user_id));
    }

    #[test]
    fn stock_projection_follows_the_bus() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let read_store = Arc::new(InMemoryReadStore::new());
        let projection = Arc::new(StockLevelsProjection::new(read_store));

        // Subscribe before publishing anything.
        let subscription = harness.bus.subscribe();
        let projection_clone = projection.clone();
        let worker = std::thread::spawn(move || {
            while let Ok(envelope) = subscription.recv() {
                if let Err(e) = projection_clone.apply_envelope(&envelope) {
                    panic!("projection failed to apply envelope: {e:?}");
                }
            }
        });

        let item_id = create_item(&harness, &sao, 4, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 3, now + Duration::days(2), "Fair", now)
            .unwrap();
        harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();

        // Drop the harness's service-side bus handle so the worker drains and
        // exits once all published envelopes are consumed.
        drop(harness);
        worker.join().unwrap();

        let level = projection.get(&item_id).unwrap();
        assert_eq!(level.quantity_total, 4);
        assert_eq!(level.quantity_available, 1);
        assert_eq!(level.quantity_borrowed, 3);
        assert_eq!(
            level.quantity_available + level.quantity_borrowed,
            level.quantity_total
        );
    }

    #[test]
    fn resize_through_the_service() {
        let harness = setup();
        let sao = staff();
        let borrower = student();
        let now = Utc::now();

        let item_id = create_item(&harness, &sao, 5, now);
        let txn = harness
            .service
            .request(&borrower, item_id, 4, now + Duration::days(2), "Parade", now)
            .unwrap();
        harness
            .service
            .approve(&sao, txn.transaction_id, now)
            .unwrap();

        // Growing re-derives availability from the delta.
        let item = harness.service.resize_item(&sao, item_id, 8, now).unwrap();
        assert_eq!(item.quantity_available, 4);
        assert_eq!(item.quantity_borrowed, 4);

        // Shrinking below the outstanding loans is refused.
        let err = expect_domain(harness.service.resize_item(&sao, item_id, 3, now));
        assert!(matches!(err, DomainError::InvalidQuantity(_)));

        // Students cannot resize at all.
        assert_eq!(
            expect_domain(harness.service.resize_item(&borrower, item_id, 9, now)),
            DomainError::Unauthorized
        );
    }

    #[test]
    fn duplicate_item_codes_are_rejected() {
        let harness = setup();
        let sao = staff();
        let now = Utc::now();

        let new_item = NewItem {
            code: "AV-100".to_string(),
            details: item_details(true),
            condition: ItemCondition::Good,
            quantity_total: 1,
        };

        harness
            .service
            .create_item(&sao, new_item.clone(), now)
            .unwrap();
        let err = expect_domain(harness.service.create_item(&sao, new_item, now));
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn students_only_see_their_own_transactions() {
        let harness = setup();
        let sao = staff();
        let alice = student();
        let bob = student();
        let now = Utc::now();
        let due = now + Duration::days(2);

        let item_id = create_item(&harness, &sao, 4, now);
        let a = harness
            .service
            .request(&alice, item_id, 1, due, "Chess club", now)
            .unwrap();
        harness
            .service
            .request(&bob, item_id, 1, due, "Art class", now)
            .unwrap();

        // Listing narrows to the caller's own transactions.
        let mine = harness
            .service
            .list_transactions(&alice, TransactionFilter::default(), now)
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].borrower, alice.user_id);

        // Staff see everything.
        let all = harness
            .service
            .list_transactions(&sao, TransactionFilter::default(), now)
            .unwrap();
        assert_eq!(all.len(), 2);

        // Direct fetch of someone else's transaction is refused.
        assert_eq!(
            expect_domain(harness.service.get_transaction(&bob, a.transaction_id, now)),
            DomainError::Unauthorized
        );
    }
}
