//! Integration tests for the PostgreSQL ledger store
//!
//! These run real SQL and need a database, so they are ignored by default:
//!
//! ```text
//! BOND_LEDGER_TEST_DATABASE_URL=postgres://localhost/bond_test \
//!     cargo test -p bond-store --test postgres_store -- --ignored
//! ```
//!
//! Each test works in its own schema, dropped on success.

#![cfg(feature = "postgres")]

use std::sync::Arc;

use bond_core::*;
use bond_store::{LedgerStore, PgLedgerStore, PurchaseOrder, TxRetry};
use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;
use sqlx::postgres::{PgPool, PgPoolOptions};

const DATABASE_URL_VAR: &str = "BOND_LEDGER_TEST_DATABASE_URL";

struct TestDb {
    pool: PgPool,
    schema: String,
    store: Arc<PgLedgerStore>,
}

impl TestDb {
    /// None when no database is configured
    async fn connect() -> Option<Self> {
        let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
            eprintln!("{} not set; skipping", DATABASE_URL_VAR);
            return None;
        };
        let schema = format!("ledger_test_{}", uuid::Uuid::new_v4().simple());

        let admin = PgPool::connect(&url).await.unwrap();
        sqlx::query(&format!("CREATE SCHEMA {}", schema))
            .execute(&admin)
            .await
            .unwrap();
        admin.close().await;

        let search_path = format!("SET search_path TO {}", schema);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    sqlx::query(&search_path).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .unwrap();

        let store = PgLedgerStore::from_pool(pool.clone(), TxRetry::default(), FeeSchedule::default());
        store.init_schema().await.unwrap();
        Some(Self {
            pool,
            schema,
            store: Arc::new(store),
        })
    }

    async fn funded_user(&self, balance: Amount) -> UserId {
        let user = UserId::new();
        self.store.open_account(user, t0()).await.unwrap();
        if balance > 0 {
            self.store.credit_balance(&user, balance).await.unwrap();
        }
        user
    }

    async fn drop_schema(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.pool)
            .await
            .unwrap();
        self.pool.close().await;
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn new_bond(tenor_days: u32, issued: DateTime<Utc>, amount: Amount) -> Bond {
    NewBond {
        tenor_days,
        issue_date: issued,
        interest_rate: dec!(20),
        amount,
        maturity_date: None,
    }
    .into_bond()
    .unwrap()
}

fn order(user: UserId, amount: Amount, tenor_days: u32) -> PurchaseOrder {
    PurchaseOrder {
        user_id: user,
        amount,
        tenor_days,
        now: t0(),
    }
}

async fn with_rate(db: &TestDb) {
    db.store
        .append_interest_rate(InterestRateRecord::new(t0() - Duration::days(1), dec!(13)).unwrap())
        .await
        .unwrap();
}

/// The settlement lock is shared by every schema on the server, so a run
/// may lose to a test running in parallel.
async fn settle_until_completed(store: &PgLedgerStore, now: DateTime<Utc>) -> SettlementReport {
    loop {
        match store.settle_matured(now).await.unwrap() {
            SettlementOutcome::Completed(report) => return report,
            SettlementOutcome::Skipped => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
        }
    }
}

#[tokio::test]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_purchase_waterfall_split() {
    let Some(db) = TestDb::connect().await else { return };
    with_rate(&db).await;
    let user = db.funded_user(50_000).await;

    let first = new_bond(90, t0() - Duration::days(2), 2_000);
    let second = new_bond(90, t0() - Duration::days(1), 5_000);
    let (first_id, second_id) = (first.id, second.id);
    let first = Bond { maturity_date: t0() + Duration::days(120), ..first };
    let second = Bond { maturity_date: t0() + Duration::days(120), ..second };
    db.store.issue_bonds(vec![second, first]).await.unwrap();

    let receipt = db.store.purchase(order(user, 4_000, 90)).await.unwrap();

    let used: Vec<(BondId, Amount)> = receipt
        .fragments
        .iter()
        .map(|f| (f.bond_id, f.amount_used))
        .collect();
    assert_eq!(used, vec![(first_id, 2_000), (second_id, 2_000)]);
    assert_eq!(receipt.balance_after, 46_000);
    assert_eq!(receipt.interest_rate, dec!(13));

    assert_eq!(db.store.get_bond(&first_id).await.unwrap().unwrap().available_amount, 0);
    assert_eq!(db.store.get_bond(&second_id).await.unwrap().unwrap().available_amount, 3_000);
    let tokens = db.store.list_user_tokens(&user, true).await.unwrap();
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().all(|t| t.holding_id == receipt.holding_id));

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_insufficient_inventory_leaves_no_trace() {
    let Some(db) = TestDb::connect().await else { return };
    with_rate(&db).await;
    let user = db.funded_user(50_000).await;
    let bond = new_bond(90, t0(), 3_000);
    let bond_id = bond.id;
    db.store.issue_bonds(vec![bond]).await.unwrap();

    let err = db.store.purchase(order(user, 5_000, 90)).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientInventory { .. }));

    assert_eq!(db.store.get_account(&user).await.unwrap().unwrap().balance, 50_000);
    assert_eq!(db.store.get_bond(&bond_id).await.unwrap().unwrap().available_amount, 3_000);
    assert!(db.store.list_user_tokens(&user, false).await.unwrap().is_empty());

    db.drop_schema().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_concurrent_purchases_never_oversell() {
    let Some(db) = TestDb::connect().await else { return };
    with_rate(&db).await;
    let bond = new_bond(90, t0(), 10_000);
    let bond_id = bond.id;
    db.store.issue_bonds(vec![bond]).await.unwrap();

    let mut users = Vec::new();
    for _ in 0..25 {
        users.push(db.funded_user(1_500).await);
    }

    let mut handles = Vec::new();
    for user in users.iter().copied() {
        let store = Arc::clone(&db.store);
        handles.push(tokio::spawn(async move { store.purchase(order(user, 1_000, 90)).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert!(matches!(err, LedgerError::InsufficientInventory { .. })),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(db.store.get_bond(&bond_id).await.unwrap().unwrap().available_amount, 0);
    let invested: Amount = db
        .store
        .list_active_tokens()
        .await
        .unwrap()
        .iter()
        .map(|t| t.amount_invested)
        .sum();
    assert_eq!(invested, 10_000);
    let mut spent = 0;
    for user in &users {
        spent += 1_500 - db.store.get_account(user).await.unwrap().unwrap().balance;
    }
    assert_eq!(spent, 10_000);

    db.drop_schema().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_double_withdrawal_exactly_one_succeeds() {
    let Some(db) = TestDb::connect().await else { return };
    let user = db.funded_user(5_000).await;

    let first = {
        let store = Arc::clone(&db.store);
        tokio::spawn(async move { store.request_withdrawal(&user, 1_000, t0()).await })
    };
    let second = {
        let store = Arc::clone(&db.store);
        tokio::spawn(async move { store.request_withdrawal(&user, 1_000, t0()).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::RequestAlreadyPending { .. }))));
    assert_eq!(db.store.get_account(&user).await.unwrap().unwrap().balance, 4_000);
    assert_eq!(db.store.list_pending_withdrawals().await.unwrap().len(), 1);

    db.drop_schema().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_redeem_and_settle_race_credits_once() {
    let Some(db) = TestDb::connect().await else { return };
    with_rate(&db).await;
    let early = AccrualCalculator::default()
        .early_return(10_000, dec!(13), t0(), t0() + Duration::days(89))
        .unwrap();

    for _ in 0..5 {
        let user = db.funded_user(10_000).await;
        db.store.issue_bonds(vec![new_bond(90, t0(), 10_000)]).await.unwrap();
        let receipt = db.store.purchase(order(user, 10_000, 90)).await.unwrap();

        let redeemer = {
            let store = Arc::clone(&db.store);
            let holding = receipt.holding_id;
            tokio::spawn(async move {
                store.redeem_early(&user, &holding, t0() + Duration::days(89)).await
            })
        };
        let settler = {
            let store = Arc::clone(&db.store);
            tokio::spawn(async move { settle_until_completed(&store, t0() + Duration::days(90)).await })
        };

        let redeemed = redeemer.await.unwrap();
        let report = settler.await.unwrap();

        match redeemed {
            Ok(_) => assert_eq!(report.tokens_matured, 0),
            Err(err) => {
                assert!(matches!(err, LedgerError::HoldingNotActive { .. }));
                assert_eq!(report.tokens_matured, 1);
            }
        }

        let balance = db.store.get_account(&user).await.unwrap().unwrap().balance;
        assert!(balance == early || balance == 10_251);
        assert!(db.store.list_user_tokens(&user, true).await.unwrap().is_empty());
    }

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "needs BOND_LEDGER_TEST_DATABASE_URL"]
async fn test_pg_settlement_credits_and_retires() {
    let Some(db) = TestDb::connect().await else { return };
    with_rate(&db).await;
    let user = db.funded_user(10_000).await;
    let bond = new_bond(90, t0(), 10_000);
    let bond_id = bond.id;
    db.store.issue_bonds(vec![bond]).await.unwrap();
    db.store.purchase(order(user, 10_000, 90)).await.unwrap();

    let report = settle_until_completed(&db.store, t0() + Duration::days(90)).await;
    assert_eq!(report.tokens_matured, 1);
    assert_eq!(db.store.get_account(&user).await.unwrap().unwrap().balance, 10_251);
    assert!(!db.store.get_bond(&bond_id).await.unwrap().unwrap().valid);

    // A second run finds nothing left to pay
    let report = settle_until_completed(&db.store, t0() + Duration::days(91)).await;
    assert_eq!(report.tokens_matured, 0);
    assert_eq!(db.store.get_account(&user).await.unwrap().unwrap().balance, 10_251);

    db.drop_schema().await;
}
