//! Ledger persistence
//!
//! `credit` is the only write path for payments. It inserts the payment
//! record, reads the owner's subscription and upserts the renewed one as a
//! single atomic unit; a duplicate transaction id aborts it before anything
//! is written.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::types::{tx_key, PaymentRecord, Subscription};

/// Computes the next subscription from the current one (if any)
pub type Renewal<'a> = &'a dyn Fn(Option<&Subscription>) -> Subscription;

/// Storage for payment records and subscriptions
pub trait LedgerStore: Send + Sync {
    /// Record a payment and apply `renew` to the payer's subscription atomically.
    ///
    /// Fails with `ReplayedPayment` and writes nothing if the transaction id
    /// was already credited.
    fn credit(&self, record: &PaymentRecord, renew: Renewal<'_>) -> Result<Subscription>;

    fn payment(&self, tx_id: &B256) -> Result<Option<PaymentRecord>>;

    fn subscription(&self, owner: Address) -> Result<Option<Subscription>>;

    /// Consume one generation of the owner's quota
    fn record_usage(&self, owner: Address, quota: u32, now: DateTime<Utc>) -> Result<Subscription>;
}

/// Shared usage rule for both stores
fn consume(current: Option<Subscription>, owner: Address, quota: u32, now: DateTime<Utc>) -> Result<Subscription> {
    let mut subscription = current.ok_or_else(|| Error::NoSubscription(owner.to_string()))?;

    if !subscription.is_active(now) {
        return Err(Error::SubscriptionExpired(owner.to_string()));
    }
    if subscription.usage_count >= quota {
        return Err(Error::QuotaExhausted {
            used: subscription.usage_count,
            quota,
        });
    }

    subscription.usage_count += 1;
    subscription.updated_at = now;
    Ok(subscription)
}

/// SQLite-backed ledger
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Ledger journal mode: {}", mode);
        info!("Opened ledger at {:?}", path);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payments (
                tx_id TEXT PRIMARY KEY,
                payer TEXT NOT NULL,
                amount REAL NOT NULL,
                tier TEXT NOT NULL,
                observed_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subscriptions (
                owner TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                start_date INTEGER NOT NULL,
                end_date INTEGER NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("ledger connection lock poisoned".to_string()))
    }

    fn owner_key(owner: Address) -> String {
        format!("{:#x}", owner)
    }

    fn read_subscription(conn: &Connection, owner: Address) -> Result<Option<Subscription>> {
        let row = conn
            .query_row(
                "SELECT tier, start_date, end_date, usage_count, updated_at
                 FROM subscriptions WHERE owner = ?1",
                params![Self::owner_key(owner)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(tier, start, end, usage_count, updated)| {
            Ok(Subscription {
                owner,
                tier,
                start_date: from_millis(start)?,
                end_date: from_millis(end)?,
                usage_count,
                updated_at: from_millis(updated)?,
            })
        })
        .transpose()
    }

    fn write_subscription(conn: &Connection, subscription: &Subscription) -> Result<()> {
        conn.execute(
            "INSERT INTO subscriptions (owner, tier, start_date, end_date, usage_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner) DO UPDATE SET
                tier = excluded.tier,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                usage_count = excluded.usage_count,
                updated_at = excluded.updated_at",
            params![
                Self::owner_key(subscription.owner),
                subscription.tier,
                subscription.start_date.timestamp_millis(),
                subscription.end_date.timestamp_millis(),
                subscription.usage_count,
                subscription.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Persistence(format!("Invalid stored timestamp {}", ms)))
}

impl LedgerStore for SqliteLedgerStore {
    fn credit(&self, record: &PaymentRecord, renew: Renewal<'_>) -> Result<Subscription> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO payments (tx_id, payer, amount, tier, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tx_key(&record.tx_id),
                Self::owner_key(record.payer_owner),
                record.amount_paid,
                record.tier_purchased,
                record.observed_at.timestamp_millis(),
            ],
        )?;

        if inserted == 0 {
            // Dropping the transaction rolls it back
            return Err(Error::ReplayedPayment(tx_key(&record.tx_id)));
        }

        let current = Self::read_subscription(&tx, record.payer_owner)?;
        let next = renew(current.as_ref());
        Self::write_subscription(&tx, &next)?;

        tx.commit()?;
        debug!("Credited {} to {}", tx_key(&record.tx_id), record.payer_owner);
        Ok(next)
    }

    fn payment(&self, tx_id: &B256) -> Result<Option<PaymentRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT payer, amount, tier, observed_at FROM payments WHERE tx_id = ?1",
                params![tx_key(tx_id)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(payer, amount_paid, tier_purchased, observed)| {
            Ok(PaymentRecord {
                tx_id: *tx_id,
                payer_owner: Address::from_str(&payer)
                    .map_err(|e| Error::Persistence(format!("Invalid stored payer {}: {}", payer, e)))?,
                amount_paid,
                tier_purchased,
                observed_at: from_millis(observed)?,
            })
        })
        .transpose()
    }

    fn subscription(&self, owner: Address) -> Result<Option<Subscription>> {
        let conn = self.lock()?;
        Self::read_subscription(&conn, owner)
    }

    fn record_usage(&self, owner: Address, quota: u32, now: DateTime<Utc>) -> Result<Subscription> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::read_subscription(&tx, owner)?;
        let next = consume(current, owner, quota, now)?;
        Self::write_subscription(&tx, &next)?;

        tx.commit()?;
        Ok(next)
    }
}

#[derive(Default)]
struct MemoryLedger {
    payments: HashMap<B256, PaymentRecord>,
    subscriptions: HashMap<Address, Subscription>,
}

/// In-process ledger with the same atomicity as the SQLite store
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<MemoryLedger>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryLedger>> {
        self.inner
            .lock()
            .map_err(|_| Error::Persistence("ledger lock poisoned".to_string()))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn credit(&self, record: &PaymentRecord, renew: Renewal<'_>) -> Result<Subscription> {
        let mut ledger = self.lock()?;
        if ledger.payments.contains_key(&record.tx_id) {
            return Err(Error::ReplayedPayment(tx_key(&record.tx_id)));
        }

        let next = renew(ledger.subscriptions.get(&record.payer_owner));
        ledger.payments.insert(record.tx_id, record.clone());
        ledger.subscriptions.insert(record.payer_owner, next.clone());
        Ok(next)
    }

    fn payment(&self, tx_id: &B256) -> Result<Option<PaymentRecord>> {
        Ok(self.lock()?.payments.get(tx_id).cloned())
    }

    fn subscription(&self, owner: Address) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(&owner).cloned())
    }

    fn record_usage(&self, owner: Address, quota: u32, now: DateTime<Utc>) -> Result<Subscription> {
        let mut ledger = self.lock()?;
        let next = consume(ledger.subscriptions.get(&owner).cloned(), owner, quota, now)?;
        ledger.subscriptions.insert(owner, next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use alloy::primitives::{address, b256};
    use chrono::Duration as ChronoDuration;

    const OWNER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const TX: B256 = b256!("88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b");

    fn record(tx_id: B256, now: DateTime<Utc>) -> PaymentRecord {
        PaymentRecord {
            tx_id,
            payer_owner: OWNER,
            amount_paid: 5.0,
            tier_purchased: "basic".to_string(),
            observed_at: now,
        }
    }

    fn fresh(now: DateTime<Utc>) -> impl Fn(Option<&Subscription>) -> Subscription {
        move |_| Subscription {
            owner: OWNER,
            tier: "basic".to_string(),
            start_date: now,
            end_date: now + ChronoDuration::days(30),
            usage_count: 0,
            updated_at: now,
        }
    }

    fn stores() -> Vec<Box<dyn LedgerStore>> {
        vec![
            Box::new(SqliteLedgerStore::open_in_memory().unwrap()),
            Box::new(MemoryLedgerStore::new()),
        ]
    }

    /// Stored timestamps keep millisecond precision
    fn now() -> DateTime<Utc> {
        from_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[test]
    fn test_credit_and_read_back() {
        for store in stores() {
            let now = now();
            let sub = store.credit(&record(TX, now), &fresh(now)).unwrap();
            assert_eq!(store.subscription(OWNER).unwrap(), Some(sub));
            assert_eq!(store.payment(&TX).unwrap(), Some(record(TX, now)));
        }
    }

    #[test]
    fn test_duplicate_tx_writes_nothing() {
        for store in stores() {
            let now = now();
            let first = store.credit(&record(TX, now), &fresh(now)).unwrap();

            let later = now + ChronoDuration::days(3);
            let renew = |_: Option<&Subscription>| -> Subscription {
                panic!("renewal must not run for a replayed payment")
            };
            let err = store.credit(&record(TX, later), &renew).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ReplayedPayment);
            assert_eq!(store.subscription(OWNER).unwrap(), Some(first));
        }
    }

    #[test]
    fn test_record_usage_rules() {
        for store in stores() {
            let now = now();
            let err = store.record_usage(OWNER, 2, now).unwrap_err();
            assert!(matches!(err, Error::NoSubscription(_)));

            store.credit(&record(TX, now), &fresh(now)).unwrap();
            assert_eq!(store.record_usage(OWNER, 2, now).unwrap().usage_count, 1);
            assert_eq!(store.record_usage(OWNER, 2, now).unwrap().usage_count, 2);
            let err = store.record_usage(OWNER, 2, now).unwrap_err();
            assert!(matches!(err, Error::QuotaExhausted { used: 2, quota: 2 }));

            let expired = now + ChronoDuration::days(31);
            let err = store.record_usage(OWNER, 100, expired).unwrap_err();
            assert!(matches!(err, Error::SubscriptionExpired(_)));
        }
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("ledger.sqlite");
        let now = now();

        {
            let store = SqliteLedgerStore::open(&path).unwrap();
            store.credit(&record(TX, now), &fresh(now)).unwrap();
        }

        let store = SqliteLedgerStore::open(&path).unwrap();
        assert!(store.payment(&TX).unwrap().is_some());
        let err = store.credit(&record(TX, now), &fresh(now)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayedPayment);
    }
}
