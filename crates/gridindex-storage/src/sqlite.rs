//! SQLite storage backend for GridIndex.
//!
//! Persists the projected entities, the global counters and the block
//! checkpoint to a single SQLite file. Amounts are stored as base-10 text.
//! Ids, capacities and counters live in signed 64-bit INTEGER columns, so a
//! value above `i64::MAX` is refused with `Overflow` before anything is
//! written. Counters are read, checked and written back inside the unit of
//! work that moves them.
//!
//! Every mutating call runs in one transaction. Writers inside the process
//! are serialized, so a unit of work never sees a conflicting commit between
//! its read and its write. Running two processes against one file is not
//! supported.
//!
//! # Usage
//! ```rust,no_run
//! use gridindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./grid.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use gridindex_core::entity::{
    normalize_address, parse_amount, CapacitySpec, CpuSpec, GlobalCounters, GpuSpec, Node,
    NodeFlag, NodeKey, Order, OrderStatus, ProfitEntry, Provider, GLOBAL_ROW_ID,
};
use gridindex_core::error::ProjectionError;
use gridindex_core::store::{
    Checkpoint, CheckpointStore, Completion, EntityStore, OrderCreated,
};

fn db_err(e: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

const GLOBAL_ROW: i64 = GLOBAL_ROW_ID as i64;

/// Narrow a value for an INTEGER column.
fn int(value: u64, what: &str) -> Result<i64, ProjectionError> {
    i64::try_from(value).map_err(|_| ProjectionError::Overflow {
        context: format!("{what} {value} does not fit a SQLite integer"),
    })
}

/// A key that cannot have been stored is simply absent.
fn lookup(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}

fn node_missing(key: &NodeKey) -> ProjectionError {
    ProjectionError::NotFound {
        entity: "node",
        key: key.to_string(),
    }
}

fn order_missing(id: u64) -> ProjectionError {
    ProjectionError::NotFound {
        entity: "order",
        key: id.to_string(),
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS providers (
        address TEXT PRIMARY KEY,
        name    TEXT NOT NULL,
        ip      TEXT NOT NULL,
        domain  TEXT NOT NULL,
        port    TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS nodes (
        provider        TEXT    NOT NULL,
        id              INTEGER NOT NULL,
        cpu_price_mon   TEXT    NOT NULL,
        cpu_price_sec   TEXT    NOT NULL,
        cpu_core        INTEGER NOT NULL,
        cpu_model       TEXT    NOT NULL,
        gpu_price_mon   TEXT    NOT NULL,
        gpu_price_sec   TEXT    NOT NULL,
        gpu_model       TEXT    NOT NULL,
        mem_price_mon   TEXT    NOT NULL,
        mem_price_sec   TEXT    NOT NULL,
        mem_capacity    INTEGER NOT NULL,
        disk_price_mon  TEXT    NOT NULL,
        disk_price_sec  TEXT    NOT NULL,
        disk_capacity   INTEGER NOT NULL,
        exist           INTEGER NOT NULL,
        sold            INTEGER NOT NULL,
        avail           INTEGER NOT NULL,
        online          INTEGER NOT NULL,
        PRIMARY KEY (provider, id)
    );",
    "CREATE TABLE IF NOT EXISTS orders (
        id            INTEGER PRIMARY KEY,
        user          TEXT    NOT NULL,
        provider      TEXT    NOT NULL,
        node_id       INTEGER NOT NULL,
        activate_time INTEGER NOT NULL,
        start_time    INTEGER NOT NULL,
        end_time      INTEGER NOT NULL,
        probation     INTEGER NOT NULL,
        duration      INTEGER NOT NULL,
        status        INTEGER NOT NULL,
        fee           TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_orders_end ON orders (end_time, status);",
    "CREATE INDEX IF NOT EXISTS idx_orders_node ON orders (provider, node_id);",
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user);",
    "CREATE TABLE IF NOT EXISTS profits (
        address   TEXT PRIMARY KEY,
        balance   TEXT    NOT NULL,
        profit    TEXT    NOT NULL,
        penalty   TEXT    NOT NULL,
        last_time INTEGER NOT NULL,
        end_time  INTEGER NOT NULL,
        nonce     INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS global_counters (
        id          INTEGER PRIMARY KEY,
        cp_num      INTEGER NOT NULL DEFAULT 0,
        node_global INTEGER NOT NULL DEFAULT 0,
        node_used   INTEGER NOT NULL DEFAULT 0,
        mem_global  INTEGER NOT NULL DEFAULT 0,
        disk_global INTEGER NOT NULL DEFAULT 0,
        mem_used    INTEGER NOT NULL DEFAULT 0,
        disk_used   INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        key          TEXT PRIMARY KEY,
        block_number INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL,
        log_index    INTEGER
    );",
];

/// SQLite-backed entity and checkpoint store.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./grid.db"`) or a full
    /// SQLite URL (`"sqlite:./grid.db"`).
    pub async fn open(path: &str) -> Result<Self, ProjectionError> {
        if path == ":memory:" || path == "sqlite::memory:" {
            return Self::in_memory().await;
        }
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single connection that is never recycled: every connection to
    /// `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, ProjectionError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, ProjectionError> {
        let store = Self {
            pool,
            writer: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ProjectionError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("INSERT OR IGNORE INTO global_counters (id) VALUES (?)")
            .bind(GLOBAL_ROW)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// The underlying pool, for ad-hoc queries and maintenance.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─── Units of work ────────────────────────────────────────────────────────

    /// Flip `sold` on a node and move its resources in or out of the used
    /// counters, both inside the caller's transaction.
    async fn set_sold(
        conn: &mut SqliteConnection,
        key: &NodeKey,
        sold: bool,
    ) -> Result<bool, ProjectionError> {
        let id = lookup(key.id).ok_or_else(|| node_missing(key))?;
        let row = sqlx::query(
            "SELECT sold, mem_capacity, disk_capacity FROM nodes WHERE provider = ? AND id = ?",
        )
        .bind(&key.provider)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| node_missing(key))?;

        let current: bool = col(&row, "sold")?;
        if current == sold {
            return Ok(false);
        }
        let k = key.to_string();
        let mem = unsigned(&row, "node", &k, "mem_capacity")?;
        let disk = unsigned(&row, "node", &k, "disk_capacity")?;

        let mut global = Self::load_counters(conn).await?;
        if sold {
            global.allocate(mem, disk)?;
        } else {
            global.deallocate(mem, disk)?;
        }
        Self::store_counters(conn, &global).await?;

        sqlx::query("UPDATE nodes SET sold = ? WHERE provider = ? AND id = ?")
            .bind(sold)
            .bind(&key.provider)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        debug!(node = %key, sold, "node sold flag flipped");
        Ok(true)
    }

    async fn load_counters(conn: &mut SqliteConnection) -> Result<GlobalCounters, ProjectionError> {
        let row = sqlx::query("SELECT * FROM global_counters WHERE id = ?")
            .bind(GLOBAL_ROW)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;
        counters_from_row(&row)
    }

    async fn store_counters(
        conn: &mut SqliteConnection,
        g: &GlobalCounters,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            "UPDATE global_counters SET cp_num = ?, node_global = ?, node_used = ?,
                mem_global = ?, disk_global = ?, mem_used = ?, disk_used = ?
             WHERE id = ?",
        )
        .bind(int(g.cp_num, "cp_num")?)
        .bind(int(g.node_global, "node_global")?)
        .bind(int(g.node_used, "node_used")?)
        .bind(int(g.mem_global, "mem_global")?)
        .bind(int(g.disk_global, "disk_global")?)
        .bind(int(g.mem_used, "mem_used")?)
        .bind(int(g.disk_used, "disk_used")?)
        .bind(GLOBAL_ROW)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_profit(
        conn: &mut SqliteConnection,
        address: &str,
    ) -> Result<ProfitEntry, ProjectionError> {
        let row = sqlx::query("SELECT * FROM profits WHERE address = ?")
            .bind(address)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?
            .ok_or_else(|| ProjectionError::NotFound {
                entity: "profit",
                key: address.to_string(),
            })?;
        profit_from_row(&row)
    }

    async fn store_profit(
        conn: &mut SqliteConnection,
        ledger: &ProfitEntry,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            "UPDATE profits SET balance = ?, profit = ?, penalty = ?, last_time = ?,
                end_time = ?, nonce = ?
             WHERE address = ?",
        )
        .bind(ledger.balance.to_string())
        .bind(ledger.profit.to_string())
        .bind(ledger.penalty.to_string())
        .bind(ledger.last_time)
        .bind(ledger.end_time)
        .bind(int(ledger.nonce, "nonce")?)
        .bind(&ledger.address)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

async fn node_exists(conn: &mut SqliteConnection, key: &NodeKey) -> Result<(), ProjectionError> {
    let id = lookup(key.id).ok_or_else(|| node_missing(key))?;
    let found = sqlx::query("SELECT 1 FROM nodes WHERE provider = ? AND id = ?")
        .bind(&key.provider)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match found {
        Some(_) => Ok(()),
        None => Err(node_missing(key)),
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, ProjectionError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(db_err)
}

fn amount(
    row: &SqliteRow,
    entity: &'static str,
    key: &str,
    field: &'static str,
) -> Result<U256, ProjectionError> {
    let text: String = col(row, field)?;
    parse_amount(entity, key, field, &text)
}

fn unsigned(
    row: &SqliteRow,
    entity: &'static str,
    key: &str,
    field: &'static str,
) -> Result<u64, ProjectionError> {
    let v: i64 = col(row, field)?;
    u64::try_from(v).map_err(|_| ProjectionError::CorruptState {
        entity,
        key: key.to_string(),
        field,
        value: v.to_string(),
    })
}

fn provider_from_row(row: &SqliteRow) -> Result<Provider, ProjectionError> {
    Ok(Provider {
        address: col(row, "address")?,
        name: col(row, "name")?,
        ip: col(row, "ip")?,
        domain: col(row, "domain")?,
        port: col(row, "port")?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<Node, ProjectionError> {
    let provider: String = col(row, "provider")?;
    let id: i64 = col(row, "id")?;
    let key = format!("{provider}/{id}");
    let e = "node";
    Ok(Node {
        id: unsigned(row, e, &key, "id")?,
        cpu: CpuSpec {
            price_mon: amount(row, e, &key, "cpu_price_mon")?,
            price_sec: amount(row, e, &key, "cpu_price_sec")?,
            core: unsigned(row, e, &key, "cpu_core")?,
            model: col(row, "cpu_model")?,
        },
        gpu: GpuSpec {
            price_mon: amount(row, e, &key, "gpu_price_mon")?,
            price_sec: amount(row, e, &key, "gpu_price_sec")?,
            model: col(row, "gpu_model")?,
        },
        mem: CapacitySpec {
            price_mon: amount(row, e, &key, "mem_price_mon")?,
            price_sec: amount(row, e, &key, "mem_price_sec")?,
            capacity: unsigned(row, e, &key, "mem_capacity")?,
        },
        disk: CapacitySpec {
            price_mon: amount(row, e, &key, "disk_price_mon")?,
            price_sec: amount(row, e, &key, "disk_price_sec")?,
            capacity: unsigned(row, e, &key, "disk_capacity")?,
        },
        exist: col(row, "exist")?,
        sold: col(row, "sold")?,
        avail: col(row, "avail")?,
        online: col(row, "online")?,
        provider,
    })
}

fn order_from_row(row: &SqliteRow) -> Result<Order, ProjectionError> {
    let id: i64 = col(row, "id")?;
    let key = id.to_string();
    let e = "order";
    let status: i64 = col(row, "status")?;
    let status = u8::try_from(status)
        .ok()
        .and_then(|s| OrderStatus::try_from(s).ok())
        .ok_or_else(|| ProjectionError::CorruptState {
            entity: e,
            key: key.clone(),
            field: "status",
            value: status.to_string(),
        })?;
    Ok(Order {
        id: unsigned(row, e, &key, "id")?,
        user: col(row, "user")?,
        provider: col(row, "provider")?,
        node_id: unsigned(row, e, &key, "node_id")?,
        activate_time: col(row, "activate_time")?,
        start_time: col(row, "start_time")?,
        end_time: col(row, "end_time")?,
        probation: unsigned(row, e, &key, "probation")?,
        duration: unsigned(row, e, &key, "duration")?,
        status,
        fee: amount(row, e, &key, "fee")?,
    })
}

fn profit_from_row(row: &SqliteRow) -> Result<ProfitEntry, ProjectionError> {
    let address: String = col(row, "address")?;
    let e = "profit";
    Ok(ProfitEntry {
        balance: amount(row, e, &address, "balance")?,
        profit: amount(row, e, &address, "profit")?,
        penalty: amount(row, e, &address, "penalty")?,
        last_time: col(row, "last_time")?,
        end_time: col(row, "end_time")?,
        nonce: unsigned(row, e, &address, "nonce")?,
        address,
    })
}

fn counters_from_row(row: &SqliteRow) -> Result<GlobalCounters, ProjectionError> {
    let e = "global_counters";
    let k = GLOBAL_ROW_ID.to_string();
    Ok(GlobalCounters {
        cp_num: unsigned(row, e, &k, "cp_num")?,
        node_global: unsigned(row, e, &k, "node_global")?,
        node_used: unsigned(row, e, &k, "node_used")?,
        mem_global: unsigned(row, e, &k, "mem_global")?,
        disk_global: unsigned(row, e, &k, "disk_global")?,
        mem_used: unsigned(row, e, &k, "mem_used")?,
        disk_used: unsigned(row, e, &k, "disk_used")?,
    })
}

fn orders_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<Order>, ProjectionError> {
    rows.iter().map(order_from_row).collect()
}

// ─── EntityStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for SqliteStore {
    async fn create_provider(
        &self,
        provider: Provider,
        ledger: ProfitEntry,
    ) -> Result<(), ProjectionError> {
        let address = normalize_address(&provider.address);
        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query(
            "SELECT address FROM providers WHERE address = ?
             UNION SELECT address FROM profits WHERE address = ?",
        )
        .bind(&address)
        .bind(&address)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if existing.is_some() {
            return Err(ProjectionError::DuplicateEntity {
                entity: "provider",
                key: address,
            });
        }

        sqlx::query(
            "INSERT INTO providers (address, name, ip, domain, port) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&address)
        .bind(&provider.name)
        .bind(&provider.ip)
        .bind(&provider.domain)
        .bind(&provider.port)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO profits (address, balance, profit, penalty, last_time, end_time, nonce)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&address)
        .bind(ledger.balance.to_string())
        .bind(ledger.profit.to_string())
        .bind(ledger.penalty.to_string())
        .bind(ledger.last_time)
        .bind(ledger.end_time)
        .bind(int(ledger.nonce, "nonce")?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(provider = %address, "provider stored");
        Ok(())
    }

    async fn provider(&self, address: &str) -> Result<Option<Provider>, ProjectionError> {
        let row = sqlx::query("SELECT * FROM providers WHERE address = ?")
            .bind(normalize_address(address))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn list_providers(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Provider>, ProjectionError> {
        let rows = sqlx::query("SELECT * FROM providers ORDER BY address LIMIT ? OFFSET ?")
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(provider_from_row).collect()
    }

    async fn create_node(&self, node: Node) -> Result<(), ProjectionError> {
        let key = node.key();
        let id = int(key.id, "node id")?;
        let core = int(node.cpu.core, "cpu core")?;
        let mem = int(node.mem.capacity, "mem capacity")?;
        let disk = int(node.disk.capacity, "disk capacity")?;

        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if node_exists(&mut tx, &key).await.is_ok() {
            return Err(ProjectionError::DuplicateEntity {
                entity: "node",
                key: key.to_string(),
            });
        }

        let mut global = Self::load_counters(&mut tx).await?;
        global.register_node(node.mem.capacity, node.disk.capacity, node.sold)?;
        Self::store_counters(&mut tx, &global).await?;

        sqlx::query(
            "INSERT INTO nodes (
                provider, id,
                cpu_price_mon, cpu_price_sec, cpu_core, cpu_model,
                gpu_price_mon, gpu_price_sec, gpu_model,
                mem_price_mon, mem_price_sec, mem_capacity,
                disk_price_mon, disk_price_sec, disk_capacity,
                exist, sold, avail, online
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.provider)
        .bind(id)
        .bind(node.cpu.price_mon.to_string())
        .bind(node.cpu.price_sec.to_string())
        .bind(core)
        .bind(&node.cpu.model)
        .bind(node.gpu.price_mon.to_string())
        .bind(node.gpu.price_sec.to_string())
        .bind(&node.gpu.model)
        .bind(node.mem.price_mon.to_string())
        .bind(node.mem.price_sec.to_string())
        .bind(mem)
        .bind(node.disk.price_mon.to_string())
        .bind(node.disk.price_sec.to_string())
        .bind(disk)
        .bind(node.exist)
        .bind(node.sold)
        .bind(node.avail)
        .bind(node.online)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(node = %key, "node stored");
        Ok(())
    }

    async fn node(&self, key: &NodeKey) -> Result<Option<Node>, ProjectionError> {
        let Some(id) = lookup(key.id) else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT * FROM nodes WHERE provider = ? AND id = ?")
            .bind(&key.provider)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn nodes_by_provider(&self, provider: &str) -> Result<Vec<Node>, ProjectionError> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE provider = ? ORDER BY id")
            .bind(normalize_address(provider))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn set_node_flag(
        &self,
        key: &NodeKey,
        flag: NodeFlag,
        value: bool,
    ) -> Result<bool, ProjectionError> {
        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let changed = if flag == NodeFlag::Sold {
            Self::set_sold(&mut tx, key, value).await?
        } else {
            let id = lookup(key.id).ok_or_else(|| node_missing(key))?;
            let column = flag.column();
            let sql = format!(
                "UPDATE nodes SET {column} = ? WHERE provider = ? AND id = ? AND {column} != ?"
            );
            let n = sqlx::query(&sql)
                .bind(value)
                .bind(&key.provider)
                .bind(id)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
            if n == 0 {
                node_exists(&mut tx, key).await?;
            }
            n > 0
        };
        tx.commit().await.map_err(db_err)?;
        Ok(changed)
    }

    async fn create_order(&self, order: Order, now: i64) -> Result<OrderCreated, ProjectionError> {
        let key = order.node_key();
        let id = int(order.id, "order id")?;
        let probation = int(order.probation, "probation")?;
        let duration = int(order.duration, "duration")?;

        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        node_exists(&mut tx, &key).await?;
        let node_id = int(key.id, "node id")?;
        let existing = sqlx::query("SELECT 1 FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(ProjectionError::DuplicateEntity {
                entity: "order",
                key: order.id.to_string(),
            });
        }

        let mut ledger = Self::load_profit(&mut tx, &key.provider).await?;
        ledger.accrue(order.fee, order.end_time, now)?;
        Self::store_profit(&mut tx, &ledger).await?;

        sqlx::query(
            "INSERT INTO orders (
                id, user, provider, node_id, activate_time, start_time, end_time,
                probation, duration, status, fee
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&order.user)
        .bind(&key.provider)
        .bind(node_id)
        .bind(order.activate_time)
        .bind(order.start_time)
        .bind(order.end_time)
        .bind(probation)
        .bind(duration)
        .bind(i64::from(order.status.as_u8()))
        .bind(order.fee.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let node_sold = Self::set_sold(&mut tx, &key, true).await?;
        let mut global = Self::load_counters(&mut tx).await?;
        global.count_order()?;
        Self::store_counters(&mut tx, &global).await?;

        tx.commit().await.map_err(db_err)?;
        debug!(order_id = order.id, node = %key, "order stored");
        Ok(OrderCreated { node_sold })
    }

    async fn order(&self, id: u64) -> Result<Option<Order>, ProjectionError> {
        let Some(id) = lookup(id) else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn orders_by_user(&self, user: &str) -> Result<Vec<Order>, ProjectionError> {
        let rows = sqlx::query("SELECT * FROM orders WHERE user = ? ORDER BY id")
            .bind(normalize_address(user))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        orders_from_rows(rows)
    }

    async fn orders_by_provider(&self, provider: &str) -> Result<Vec<Order>, ProjectionError> {
        let rows = sqlx::query("SELECT * FROM orders WHERE provider = ? ORDER BY id")
            .bind(normalize_address(provider))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        orders_from_rows(rows)
    }

    async fn order_count(&self, provider: &str) -> Result<u64, ProjectionError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM orders WHERE provider = ?")
            .bind(normalize_address(provider))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = col(&row, "cnt")?;
        Ok(cnt as u64)
    }

    async fn active_orders(&self, now: i64) -> Result<Vec<Order>, ProjectionError> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE start_time < ? AND end_time > ? ORDER BY id",
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        orders_from_rows(rows)
    }

    async fn expired_order_ids(
        &self,
        provider: Option<&str>,
        now: i64,
    ) -> Result<Vec<u64>, ProjectionError> {
        let completed = i64::from(OrderStatus::Completed.as_u8());
        let rows = match provider {
            Some(p) => {
                sqlx::query(
                    "SELECT id FROM orders
                     WHERE end_time < ? AND status != ? AND provider = ?
                     ORDER BY id",
                )
                .bind(now)
                .bind(completed)
                .bind(normalize_address(p))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id FROM orders WHERE end_time < ? AND status != ? ORDER BY id",
                )
                .bind(now)
                .bind(completed)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                let id: i64 = col(r, "id")?;
                unsigned(r, "order", &id.to_string(), "id")
            })
            .collect()
    }

    async fn complete_order(&self, order_id: u64, now: i64) -> Result<Completion, ProjectionError> {
        let id = lookup(order_id).ok_or_else(|| order_missing(order_id))?;
        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| order_missing(order_id))?;
        let order = order_from_row(&row)?;
        if order.status == OrderStatus::Completed {
            return Ok(Completion::AlreadyCompleted);
        }
        let key = order.node_key();
        node_exists(&mut tx, &key).await?;

        let mut ledger = Self::load_profit(&mut tx, &order.provider).await?;
        ledger.release(order.fee, now)?;
        Self::store_profit(&mut tx, &ledger).await?;

        let completed = i64::from(OrderStatus::Completed.as_u8());
        sqlx::query("UPDATE orders SET status = ? WHERE id = ? AND status != ?")
            .bind(completed)
            .bind(id)
            .bind(completed)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let holders = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM orders
             WHERE provider = ? AND node_id = ? AND id != ? AND status != ? AND end_time >= ?",
        )
        .bind(&key.provider)
        .bind(int(key.id, "node id")?)
        .bind(id)
        .bind(completed)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let holders: i64 = col(&holders, "cnt")?;

        let node_released = if holders == 0 {
            Self::set_sold(&mut tx, &key, false).await?
        } else {
            false
        };

        tx.commit().await.map_err(db_err)?;
        debug!(order_id, node_released, "order completed");
        Ok(Completion::Completed { node_released })
    }

    async fn update_order_status(
        &self,
        order_id: u64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, ProjectionError> {
        let id = lookup(order_id).ok_or_else(|| order_missing(order_id))?;
        let _w = self.writer.lock().await;
        let n = sqlx::query("UPDATE orders SET status = ? WHERE id = ? AND status = ?")
            .bind(i64::from(to.as_u8()))
            .bind(id)
            .bind(i64::from(from.as_u8()))
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        if n == 0 && self.order(order_id).await?.is_none() {
            return Err(order_missing(order_id));
        }
        Ok(n > 0)
    }

    async fn profit(&self, address: &str) -> Result<Option<ProfitEntry>, ProjectionError> {
        let row = sqlx::query("SELECT * FROM profits WHERE address = ?")
            .bind(normalize_address(address))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(profit_from_row).transpose()
    }

    async fn withdraw(
        &self,
        address: &str,
        amount: U256,
        now: i64,
    ) -> Result<ProfitEntry, ProjectionError> {
        let address = normalize_address(address);
        let _w = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut ledger = Self::load_profit(&mut tx, &address).await?;
        ledger.withdraw(amount, now)?;
        Self::store_profit(&mut tx, &ledger).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(ledger)
    }

    async fn global_counters(&self) -> Result<GlobalCounters, ProjectionError> {
        let row = sqlx::query("SELECT * FROM global_counters WHERE id = ?")
            .bind(GLOBAL_ROW)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        counters_from_row(&row)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, ProjectionError> {
        let row = sqlx::query(
            "SELECT key, block_number, updated_at, log_index FROM checkpoints WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| -> Result<Checkpoint, ProjectionError> {
            let log_index: Option<i64> = col(&r, "log_index")?;
            let log_index = log_index
                .map(|v| {
                    u32::try_from(v).map_err(|_| ProjectionError::CorruptState {
                        entity: "checkpoint",
                        key: key.to_string(),
                        field: "log_index",
                        value: v.to_string(),
                    })
                })
                .transpose()?;
            Ok(Checkpoint {
                key: col(&r, "key")?,
                block_number: unsigned(&r, "checkpoint", key, "block_number")?,
                updated_at: col(&r, "updated_at")?,
                log_index,
            })
        })
        .transpose()
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), ProjectionError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (key, block_number, updated_at, log_index)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.key)
        .bind(int(checkpoint.block_number, "checkpoint block")?)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.log_index.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(key = %checkpoint.key, block = checkpoint.block_number, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM checkpoints WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
