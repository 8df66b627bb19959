//! Integration test: payout requests racing each other and the gateway.
//!
//! Covers double submission against a small balance, the one-active-request
//! rule, idempotent settlement under concurrent callbacks and the
//! transient-then-permanent failure path.

use std::thread;

use creatorpay_integration_tests::{Platform, BASE_TIME};
use creatorpay_ledger::EntryFilter;
use creatorpay_payout::{
    Decision, FailureClass, ManualGateway, PayoutError, SettlementOutcome,
};
use creatorpay_types::ledger::{EntryStatus, RevenueSource};
use creatorpay_types::payout::{PayoutMethod, PayoutRequest, PayoutStatus};
use creatorpay_types::UserId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn fund(platform: &Platform, creator: &str, gross: Decimal) {
    platform.post(RevenueSource::Subscription, gross, creator, BASE_TIME);
}

fn submit(platform: &Platform, creator: &str, amount: Decimal) -> Result<PayoutRequest, PayoutError> {
    platform.payouts.submit(
        &UserId::from(creator),
        amount,
        PayoutMethod::Stripe,
        serde_json::json!({ "account": format!("acct_{creator}") }),
        BASE_TIME + 10,
    )
}

/// Submit, approve and dispatch through the manual gateway.
fn processing(platform: &Platform, gateway: &ManualGateway, creator: &str, amount: Decimal) -> PayoutRequest {
    let request = submit(platform, creator, amount).expect("submit");
    platform
        .payouts
        .decide(request.id, Decision::Approve, &UserId::from("admin"), None, BASE_TIME + 20)
        .expect("approve");
    platform
        .payouts
        .dispatch(request.id, gateway, BASE_TIME + 30)
        .expect("dispatch")
}

fn withdrawals(platform: &Platform, creator: &str) -> Decimal {
    platform
        .store
        .sum_by_creator(&UserId::from(creator), &EntryFilter::withdrawals())
        .expect("sum")
}

#[test]
fn double_submit_against_small_balance() {
    let platform = Platform::new();
    fund(&platform, "c1", dec!(12.50));
    assert_eq!(platform.available("c1"), dec!(12.50));

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let platform = &platform;
                s.spawn(move || submit(platform, "c1", dec!(10.00)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("submit thread"))
            .collect()
    });

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    // Submits are serialised per creator, so the loser always finds the
    // winner's open request.
    for result in &results {
        match result {
            Ok(request) => assert_eq!(request.status, PayoutStatus::Pending),
            Err(PayoutError::ActiveRequestExists { creator_id }) => {
                assert_eq!(*creator_id, UserId::from("c1"));
            }
            Err(PayoutError::ConcurrencyConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let open = platform
        .payouts
        .list_for_creator(&UserId::from("c1"))
        .expect("list");
    assert_eq!(open.len(), 1);
}

#[test]
fn one_active_request_per_creator() {
    let platform = Platform::new();
    let gateway = ManualGateway::new();
    fund(&platform, "c1", dec!(500.00));

    let first = processing(&platform, &gateway, "c1", dec!(100.00));
    assert_eq!(first.status, PayoutStatus::Processing);

    match submit(&platform, "c1", dec!(50.00)) {
        Err(PayoutError::ActiveRequestExists { creator_id }) => {
            assert_eq!(creator_id, UserId::from("c1"));
        }
        other => panic!("expected ActiveRequestExists, got {other:?}"),
    }

    // Other creators are unaffected.
    fund(&platform, "c2", dec!(20.00));
    submit(&platform, "c2", dec!(20.00)).expect("c2 submit");

    platform
        .payouts
        .settle(first.id, SettlementOutcome::Success { external_reference: None }, BASE_TIME + 40)
        .expect("settle");
    let second = submit(&platform, "c1", dec!(50.00)).expect("submit after completion");
    assert_eq!(second.status, PayoutStatus::Pending);
}

#[test]
fn concurrent_success_callbacks_settle_once() {
    let platform = Platform::new();
    let gateway = ManualGateway::new();
    fund(&platform, "c1", dec!(80.00));
    let request = processing(&platform, &gateway, "c1", dec!(50.00));
    assert_eq!(gateway.queued().len(), 1);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let platform = &platform;
                s.spawn(move || {
                    platform.payouts.settle(
                        request.id,
                        SettlementOutcome::Success {
                            external_reference: Some("tr_001".to_string()),
                        },
                        BASE_TIME + 40 + i,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("settle thread").expect("settle"))
            .collect()
    });

    assert_eq!(results.iter().filter(|r| !r.replayed).count(), 1);
    let entry_ids: Vec<_> = results.iter().map(|r| r.withdrawal_entry).collect();
    assert!(entry_ids.iter().all(|id| id.is_some() && *id == entry_ids[0]));

    assert_eq!(withdrawals(&platform, "c1"), dec!(-50.00));
    assert_eq!(platform.available("c1"), dec!(30.00));
    let settled = platform.payouts.get(request.id).expect("get");
    assert_eq!(settled.status, PayoutStatus::Completed);
    assert_eq!(settled.external_reference.as_deref(), Some("tr_001"));

    // $50 does not cover the whole $80 entry, so it stays pending.
    let paid = platform
        .store
        .sum_by_creator(&UserId::from("c1"), &EntryFilter::earnings().with_status(EntryStatus::Paid))
        .expect("sum");
    assert_eq!(paid, Decimal::ZERO);
}

#[test]
fn completed_payout_flips_covered_earnings() {
    let platform = Platform::new();
    let gateway = ManualGateway::new();
    for (i, gross) in [dec!(20.00), dec!(30.00), dec!(40.00)].into_iter().enumerate() {
        platform.post(RevenueSource::Subscription, gross, "c1", BASE_TIME + i as u64);
    }
    let request = processing(&platform, &gateway, "c1", dec!(60.00));
    platform
        .payouts
        .settle(request.id, SettlementOutcome::Success { external_reference: None }, BASE_TIME + 40)
        .expect("settle");

    let creator = UserId::from("c1");
    let paid = platform
        .store
        .sum_by_creator(&creator, &EntryFilter::earnings().with_status(EntryStatus::Paid))
        .expect("sum");
    let pending = platform
        .store
        .sum_by_creator(&creator, &EntryFilter::earnings().with_status(EntryStatus::Pending))
        .expect("sum");
    assert_eq!(paid, dec!(50.00));
    assert_eq!(pending, dec!(40.00));
    assert_eq!(platform.available("c1"), dec!(30.00));
}

#[test]
fn transient_then_permanent_failure() {
    let platform = Platform::new();
    let gateway = ManualGateway::new();
    fund(&platform, "c1", dec!(80.00));
    let request = processing(&platform, &gateway, "c1", dec!(50.00));

    let retried = platform
        .payouts
        .settle(
            request.id,
            SettlementOutcome::Failure {
                class: FailureClass::Transient,
                reason: "bank timeout".to_string(),
            },
            BASE_TIME + 40,
        )
        .expect("transient");
    assert_eq!(retried.request.status, PayoutStatus::Pending);
    assert_eq!(retried.withdrawal_entry, None);
    assert_eq!(platform.available("c1"), dec!(80.00));
    assert_eq!(withdrawals(&platform, "c1"), Decimal::ZERO);

    platform
        .payouts
        .decide(request.id, Decision::Approve, &UserId::from("admin"), None, BASE_TIME + 50)
        .expect("re-approve");
    platform
        .payouts
        .dispatch(request.id, &gateway, BASE_TIME + 60)
        .expect("re-dispatch");

    let failed = platform
        .payouts
        .settle(
            request.id,
            SettlementOutcome::Failure {
                class: FailureClass::Permanent,
                reason: "account closed".to_string(),
            },
            BASE_TIME + 70,
        )
        .expect("permanent");
    assert_eq!(failed.request.status, PayoutStatus::Failed);
    assert_eq!(platform.available("c1"), dec!(80.00));
    assert_eq!(withdrawals(&platform, "c1"), Decimal::ZERO);

    let notes = failed.request.notes.unwrap_or_default();
    assert!(notes.contains("bank timeout"));
    assert!(notes.contains("account closed"));

    let trail = platform.payouts.audit_trail(request.id).expect("audit");
    let statuses: Vec<_> = trail.iter().map(|row| row.to_status).collect();
    assert_eq!(
        statuses,
        vec![
            PayoutStatus::Pending,
            PayoutStatus::Approved,
            PayoutStatus::Processing,
            PayoutStatus::Pending,
            PayoutStatus::Approved,
            PayoutStatus::Processing,
            PayoutStatus::Failed,
        ]
    );
    assert_eq!(trail.last().and_then(|row| row.note.as_deref()), Some("permanent failure: account closed"));

    // A failed request is terminal and frees the creator to ask again.
    assert!(matches!(
        platform.payouts.settle(
            request.id,
            SettlementOutcome::Success { external_reference: None },
            BASE_TIME + 80,
        ),
        Err(PayoutError::InvalidTransition { .. })
    ));
    submit(&platform, "c1", dec!(40.00)).expect("new request");
}
