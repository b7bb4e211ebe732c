//! Best-effort sqlite persistence for signal and simulated-trade batches.
//! Never on the decision path: callers log failures and move on.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::sim::SimTradeRecord;
use crate::sink::SignalRecord;

pub struct SignalStore {
    conn: Connection,
}

impl SignalStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS dislocation_signals (
                run_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                exchange_ts INTEGER NOT NULL,
                ingest_ts INTEGER NOT NULL,
                dt_ms INTEGER,
                pm_mid REAL NOT NULL,
                expected_prob REAL NOT NULL,
                delta_spd REAL NOT NULL,
                state TEXT NOT NULL,
                ordering_collision INTEGER NOT NULL,
                intent_id TEXT,
                UNIQUE(run_id, condition_id, asset_id, exchange_ts)
            );
            CREATE TABLE IF NOT EXISTS simulated_trades (
                run_id TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                UNIQUE(run_id, intent_id, timestamp)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Idempotent batch insert keyed on (run, market, exchange_ts).
    pub fn insert_signals(&mut self, run_id: &str, records: &[SignalRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for rec in records {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO dislocation_signals
                 (run_id, condition_id, asset_id, exchange_ts, ingest_ts, dt_ms,
                  pm_mid, expected_prob, delta_spd, state, ordering_collision, intent_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    run_id,
                    rec.condition_id,
                    rec.asset_id,
                    rec.signal.exchange_ts,
                    rec.signal.ingest_ts,
                    rec.dt_ms,
                    rec.signal.pm_mid,
                    rec.signal.expected_prob,
                    rec.signal.delta_spd,
                    rec.state.as_str(),
                    rec.ordering_collision as i64,
                    rec.intent.as_ref().map(|i| i.intent_id.as_str()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn insert_trades(&mut self, run_id: &str, trades: &[SimTradeRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for trade in trades {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO simulated_trades
                 (run_id, intent_id, condition_id, asset_id, side, price, size,
                  timestamp, latency_ms, failed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    trade.intent_id,
                    trade.condition_id,
                    trade.asset_id,
                    trade.side.as_str(),
                    trade.price,
                    trade.size,
                    trade.timestamp,
                    trade.latency_ms,
                    trade.failed as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn signal_count(&self, run_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM dislocation_signals WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn trade_count(&self, run_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM simulated_trades WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dislocation::DislocationSignal;
    use crate::health::TraderState;

    fn record(ts: i64) -> SignalRecord {
        SignalRecord {
            condition_id: "c1".to_string(),
            asset_id: "a1".to_string(),
            signal: DislocationSignal {
                expected_prob: 0.5,
                pm_mid: 0.53,
                delta_spd: -0.03,
                exchange_ts: ts,
                ingest_ts: ts + 1,
            },
            state: TraderState::Running,
            ordering_collision: false,
            dt_ms: Some(10),
            intent: None,
        }
    }

    fn open_store() -> (tempfile::TempDir, SignalStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let mut store = SignalStore::new(path.to_str().unwrap()).unwrap();
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_signals_and_count() {
        let (_dir, mut store) = open_store();
        let n = store
            .insert_signals("run-1", &[record(1_000), record(2_000)])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.signal_count("run-1").unwrap(), 2);
        assert_eq!(store.signal_count("run-2").unwrap(), 0);
    }

    #[test]
    fn test_reinsert_is_idempotent() {
        let (_dir, mut store) = open_store();
        store.insert_signals("run-1", &[record(1_000)]).unwrap();
        let n = store.insert_signals("run-1", &[record(1_000)]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.signal_count("run-1").unwrap(), 1);
    }

    #[test]
    fn test_insert_trades() {
        use crate::events::Side;
        use crate::sim::SimTradeRecord;
        let (_dir, mut store) = open_store();
        let trade = SimTradeRecord {
            intent_id: "i-1".to_string(),
            condition_id: "c1".to_string(),
            asset_id: "a1".to_string(),
            side: Side::Sell,
            price: 0.52,
            size: 5.0,
            timestamp: 1_000,
            latency_ms: 250,
            failed: false,
        };
        assert_eq!(store.insert_trades("run-1", &[trade]).unwrap(), 1);
        assert_eq!(store.trade_count("run-1").unwrap(), 1);
    }
}
