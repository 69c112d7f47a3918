//! State Store - crash-recovery snapshot
//!
//! One document holds everything needed to resume: agent ledgers, risk
//! counters and exposures, the position book, regime memory, open trades,
//! the trade log and the calendar markers that drive day rolls. Two
//! backends:
//! - JSON file, written to a temp file and renamed into place
//! - SQLite, one row holding the same JSON document
//!
//! A missing snapshot loads as a fresh default state. A snapshot that exists
//! but cannot be parsed is an error: the process must not silently start
//! over with zeroed exposures.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{StateBackend, StateConfig};
use crate::core::book::PositionBook;
use crate::core::guardian::RiskState;
use crate::core::ledger::AgentSnapshot;
use crate::core::regime::Regime;
use crate::core::types::{AgentVote, Direction};

/// Document format version
pub const STATE_VERSION: u32 = 1;

/// Day and session markers derived from slice timestamps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub trading_day: Option<NaiveDate>,
    /// Intraday session index within the trading day
    pub session: Option<u32>,
    pub last_reoptimized: Option<NaiveDate>,
}

/// Filled quantity not yet offset by an opposite fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTrade {
    pub client_order_id: Uuid,
    pub instrument: String,
    pub strategy_id: String,
    pub side: Direction,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Audit entry for every executed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub client_order_id: Uuid,
    pub venue_order_id: Option<String>,
    pub instrument: String,
    pub strategy_id: String,
    pub regime: String,
    pub side: Direction,
    pub quantity: Decimal,
    pub fill_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub edge: f64,
    /// Every agent's vote in the round that produced the trade
    #[serde(default)]
    pub votes: Vec<AgentVote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSnapshot>,
    #[serde(default)]
    pub risk: RiskState,
    #[serde(default)]
    pub positions: PositionBook,
    /// Last regime per instrument, for the hysteresis band
    #[serde(default)]
    pub regimes: BTreeMap<String, Regime>,
    #[serde(default)]
    pub open_trades: Vec<OpenTrade>,
    #[serde(default)]
    pub trade_log: Vec<TradeRecord>,
    #[serde(default)]
    pub calendar: Calendar,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            agents: BTreeMap::new(),
            risk: RiskState::default(),
            positions: PositionBook::default(),
            regimes: BTreeMap::new(),
            open_trades: Vec::new(),
            trade_log: Vec::new(),
            calendar: Calendar::default(),
        }
    }
}

impl PersistedState {
    fn from_json(text: &str) -> Result<Self> {
        let state: PersistedState = serde_json::from_str(text)?;
        if state.version > STATE_VERSION {
            bail!(
                "state document version {} is newer than supported version {}",
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }
}

/// Durable snapshot backend
pub trait StateStore: Send {
    fn save(&self, state: &PersistedState) -> Result<()>;

    /// Missing snapshot => default state; unreadable snapshot => error
    fn load(&self) -> Result<PersistedState>;

    fn describe(&self) -> String;
}

/// Pretty JSON document on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &PersistedState) -> Result<()> {
        let text = serde_json::to_string_pretty(state).context("failed to encode state")?;
        let tmp = self.temp_path();
        fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move state into {}", self.path.display()))?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no state file, starting fresh");
            return Ok(PersistedState::default());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        PersistedState::from_json(&text)
            .with_context(|| format!("corrupt state file {}", self.path.display()))
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

/// Single-row snapshot table in SQLite
pub struct SqliteStateStore {
    conn: rusqlite::Connection,
    path: String,
}

impl SqliteStateStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("failed to open state database {}", path))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                saved_at TEXT NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn, path: path.to_string() })
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, state: &PersistedState) -> Result<()> {
        let document = serde_json::to_string(state).context("failed to encode state")?;
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshot (id, version, saved_at, document)
             VALUES (1, ?1, ?2, ?3)",
            rusqlite::params![state.version, Utc::now().to_rfc3339(), document],
        )?;
        debug!(path = %self.path, "state saved");
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        let document: Option<String> = self
            .conn
            .query_row("SELECT document FROM snapshot WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match document {
            None => {
                info!(path = %self.path, "no stored snapshot, starting fresh");
                Ok(PersistedState::default())
            }
            Some(text) => PersistedState::from_json(&text)
                .with_context(|| format!("corrupt snapshot in {}", self.path)),
        }
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Open the configured backend
pub fn open_store(cfg: &StateConfig) -> Result<Box<dyn StateStore>> {
    match cfg.backend {
        StateBackend::Json => Ok(Box::new(JsonFileStore::new(Path::new(&cfg.path)))),
        StateBackend::Sqlite => Ok(Box::new(SqliteStateStore::open(&cfg.path)?)),
    }
}
