//! SQLite database with Diesel ORM
//!
//! Stores visions, KPI nodes, completion logs, and the denormalized
//! progress cache. Uses embedded migrations for schema management.

use crate::schema::*;
use chrono::NaiveDate;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::Path;
use uuid::Uuid;

/// Format a calendar date the way it is stored (YYYY-MM-DD)
pub fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a stored calendar date; None on malformed input
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Walk up directory tree to find .trellis folder (like git finds .git)
/// Can be overridden with TRELLIS_DB_PATH env var
fn get_db_path() -> std::path::PathBuf {
    // Check env var first - always takes priority
    if let Ok(path) = std::env::var("TRELLIS_DB_PATH") {
        return std::path::PathBuf::from(path);
    }

    // Walk up directory tree to find .trellis folder
    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let trellis_dir = dir.join(".trellis");
            if trellis_dir.exists() && trellis_dir.is_dir() {
                return trellis_dir.join("trellis.db");
            }
            // Move to parent directory
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break, // Reached filesystem root
            }
        }
    }

    // No .trellis found - default to current directory
    // (trellis init will create it here)
    std::path::PathBuf::from(".trellis/trellis.db")
}

/// Current schema version for trellis
pub const CURRENT_SCHEMA: EngineSchema = EngineSchema {
    major: 1,
    minor: 0,
    patch: 0,
    name: "kpi-progress",
    features: &[
        "visions",
        "kpi_nodes",
        "completion_logs",
        "progress_cache",
        "streak_recoveries",
    ],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct EngineSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl EngineSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn is_compatible_with(&self, other: &EngineSchema) -> bool {
        self.major == other.major
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(&feature)
    }
}

impl std::fmt::Display for EngineSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

// ============================================================================
// KPI Levels
// ============================================================================

/// Granularity of a KPI node, root (quarterly) to leaf (daily).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KpiLevel {
    Quarterly,
    Monthly,
    Weekly,
    Daily,
}

impl KpiLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            KpiLevel::Quarterly => "quarterly",
            KpiLevel::Monthly => "monthly",
            KpiLevel::Weekly => "weekly",
            KpiLevel::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quarterly" => Some(KpiLevel::Quarterly),
            "monthly" => Some(KpiLevel::Monthly),
            "weekly" => Some(KpiLevel::Weekly),
            "daily" => Some(KpiLevel::Daily),
            _ => None,
        }
    }

    /// The level a child of this node must have. Daily nodes have no children.
    pub fn child_level(&self) -> Option<KpiLevel> {
        match self {
            KpiLevel::Quarterly => Some(KpiLevel::Monthly),
            KpiLevel::Monthly => Some(KpiLevel::Weekly),
            KpiLevel::Weekly => Some(KpiLevel::Daily),
            KpiLevel::Daily => None,
        }
    }
}

impl std::fmt::Display for KpiLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for KpiLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KpiLevel::parse(s)
            .ok_or_else(|| format!("unknown level '{}' (expected quarterly, monthly, weekly, or daily)", s))
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub features: &'a str,
    pub introduced_at: &'a str,
}

/// Insertable vision
#[derive(Insertable)]
#[diesel(table_name = visions)]
pub struct NewVision<'a> {
    pub change_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub created_at: &'a str,
}

/// Queryable vision - the root goal owning a forest of KPI nodes
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = visions)]
pub struct Vision {
    pub id: i32,
    pub change_id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// Insertable KPI node
#[derive(Insertable)]
#[diesel(table_name = kpi_nodes)]
pub struct NewKpiNode<'a> {
    pub change_id: &'a str,
    pub vision_id: i32,
    pub parent_kpi_id: Option<i32>,
    pub level: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub weight: f64,
    pub target_value: Option<f64>,
    pub target_date: Option<&'a str>,
    pub period_start: Option<&'a str>,
    pub period_end: Option<&'a str>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Queryable KPI node
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = kpi_nodes)]
pub struct KpiNode {
    pub id: i32,
    pub change_id: String,
    pub vision_id: i32,
    pub parent_kpi_id: Option<i32>,
    pub level: String,
    pub title: String,
    pub description: Option<String>,
    pub weight: f64,
    pub target_value: Option<f64>,
    pub target_date: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl KpiNode {
    /// The node's level as a typed value; daily if the stored text is unrecognized
    pub fn kpi_level(&self) -> KpiLevel {
        KpiLevel::parse(&self.level).unwrap_or(KpiLevel::Daily)
    }
}

/// Insertable completion log
#[derive(Insertable)]
#[diesel(table_name = completion_logs)]
pub struct NewCompletionLog<'a> {
    pub kpi_id: i32,
    pub log_date: &'a str,
    pub completed: bool,
    pub value: Option<f64>,
    pub logged_at: &'a str,
}

/// Queryable completion log - one row per (kpi, calendar date)
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = completion_logs)]
pub struct CompletionLog {
    pub id: i32,
    pub kpi_id: i32,
    pub log_date: String,
    pub completed: bool,
    pub value: Option<f64>,
    pub logged_at: String,
}

/// Insertable progress cache row
#[derive(Insertable)]
#[diesel(table_name = progress_cache)]
pub struct NewProgressCache<'a> {
    pub kpi_id: i32,
    pub progress_percentage: f64,
    pub status: &'a str,
    pub child_count: i32,
    pub completed_child_count: i32,
    pub calculation_method: &'a str,
    pub manual_override_reason: Option<&'a str>,
    pub formula_json: Option<&'a str>,
    pub row_version: i32,
    pub last_calculated_at: &'a str,
}

/// Queryable progress cache row
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = progress_cache)]
pub struct ProgressCache {
    pub id: i32,
    pub kpi_id: i32,
    pub progress_percentage: f64,
    pub status: String,
    pub child_count: i32,
    pub completed_child_count: i32,
    pub calculation_method: String,
    pub manual_override_reason: Option<String>,
    pub formula_json: Option<String>,
    pub row_version: i32,
    pub last_calculated_at: String,
}

/// Insertable streak recovery
#[derive(Insertable)]
#[diesel(table_name = streak_recoveries)]
pub struct NewStreakRecovery<'a> {
    pub kpi_id: i32,
    pub iso_year: i32,
    pub iso_week: i32,
    pub gap_date: &'a str,
    pub recovered_on: &'a str,
}

/// Queryable streak recovery - presence marks the week's recovery as used
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = streak_recoveries)]
pub struct StreakRecovery {
    pub id: i32,
    pub kpi_id: i32,
    pub iso_year: i32,
    pub iso_week: i32,
    pub gap_date: String,
    pub recovered_on: String,
}

/// A KPI node joined with its cache row (absent until first recalculation)
#[derive(Debug, Clone, serde::Serialize)]
pub struct KpiRecord {
    pub node: KpiNode,
    pub cache: Option<ProgressCache>,
}

/// Pending fields for a cache upsert; versioning and timestamps are
/// filled in by the write itself.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub kpi_id: i32,
    pub progress_percentage: f64,
    pub status: String,
    pub child_count: i32,
    pub completed_child_count: i32,
    pub calculation_method: String,
    pub manual_override_reason: Option<String>,
    pub formula_json: Option<String>,
}

/// Fields for creating a KPI node
#[derive(Debug, Clone, serde::Deserialize)]
pub struct KpiDraft {
    pub vision_id: i32,
    pub parent_kpi_id: Option<i32>,
    pub level: KpiLevel,
    pub title: String,
    pub description: Option<String>,
    pub weight: Option<f64>,
    pub target_value: Option<f64>,
    pub target_date: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug)]
pub enum DbError {
    Connection(String),
    Query(diesel::result::Error),
    Pool(diesel::r2d2::Error),
    Validation(String),
    NotFound(String),
    InvalidHierarchy(String),
    /// A write observed a row modified since it was read; retryable
    StaleWrite(String),
}

impl DbError {
    /// Whether the recalculation trigger should retry the write
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::StaleWrite(_))
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connection(msg) => write!(f, "Connection error: {}", msg),
            DbError::Query(e) => write!(f, "Query error: {}", e),
            DbError::Pool(e) => write!(f, "Pool error: {}", e),
            DbError::Validation(msg) => write!(f, "{}", msg),
            DbError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DbError::InvalidHierarchy(msg) => write!(f, "Invalid hierarchy: {}", msg),
            DbError::StaleWrite(msg) => write!(f, "Stale write: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        DbError::Query(e)
    }
}

impl From<diesel::r2d2::Error> for DbError {
    fn from(e: diesel::r2d2::Error) -> Self {
        DbError::Pool(e)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> std::path::PathBuf {
        get_db_path()
    }

    /// Create a new database at a custom path
    pub fn new(path: &str) -> Result<Self> {
        Self::open_at(path)
    }

    /// Open database at default path (respects TRELLIS_DB_PATH env var)
    pub fn open() -> Result<Self> {
        let path = get_db_path();
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        // Run raw SQL to create tables if they don't exist
        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS visions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                change_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS kpi_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                change_id TEXT NOT NULL UNIQUE,
                vision_id INTEGER NOT NULL,
                parent_kpi_id INTEGER,
                level TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                target_value REAL,
                target_date TEXT,
                period_start TEXT,
                period_end TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (vision_id) REFERENCES visions(id),
                FOREIGN KEY (parent_kpi_id) REFERENCES kpi_nodes(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS completion_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                kpi_id INTEGER NOT NULL,
                log_date TEXT NOT NULL,
                completed INTEGER NOT NULL,
                value REAL,
                logged_at TEXT NOT NULL,
                FOREIGN KEY (kpi_id) REFERENCES kpi_nodes(id),
                UNIQUE(kpi_id, log_date)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS progress_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                kpi_id INTEGER NOT NULL UNIQUE,
                progress_percentage REAL NOT NULL,
                status TEXT NOT NULL,
                child_count INTEGER NOT NULL DEFAULT 0,
                completed_child_count INTEGER NOT NULL DEFAULT 0,
                calculation_method TEXT NOT NULL,
                manual_override_reason TEXT,
                formula_json TEXT,
                row_version INTEGER NOT NULL DEFAULT 1,
                last_calculated_at TEXT NOT NULL,
                FOREIGN KEY (kpi_id) REFERENCES kpi_nodes(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS streak_recoveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                kpi_id INTEGER NOT NULL,
                iso_year INTEGER NOT NULL,
                iso_week INTEGER NOT NULL,
                gap_date TEXT NOT NULL,
                recovered_on TEXT NOT NULL,
                FOREIGN KEY (kpi_id) REFERENCES kpi_nodes(id),
                UNIQUE(kpi_id, iso_year, iso_week)
            )
        "#).execute(&mut conn)?;

        // Create indexes
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_kpi_vision ON kpi_nodes(vision_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_kpi_parent ON kpi_nodes(parent_kpi_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_kpi_active ON kpi_nodes(is_active)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_logs_kpi_date ON completion_logs(kpi_id, log_date)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_cache_calculated ON progress_cache(last_calculated_at)").execute(&mut conn)?;

        // Register current schema
        self.register_schema(&CURRENT_SCHEMA)?;
        Ok(())
    }

    fn register_schema(&self, schema: &EngineSchema) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        let features_json = serde_json::to_string(&schema.features).unwrap_or_default();

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: &now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(&mut conn)?;

        Ok(())
    }

    // ========================================================================
    // Vision Operations
    // ========================================================================

    /// Create a new vision
    pub fn create_vision(&self, title: &str, description: Option<&str>) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        let change_id = Uuid::new_v4().to_string();

        let new_vision = NewVision {
            change_id: &change_id,
            title,
            description,
            created_at: &now,
        };

        diesel::insert_into(visions::table)
            .values(&new_vision)
            .execute(&mut conn)?;

        let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
            .first(&mut conn)?;

        Ok(id)
    }

    /// Get a vision by id
    pub fn get_vision(&self, vision_id: i32) -> Result<Vision> {
        let mut conn = self.get_conn()?;
        visions::table
            .filter(visions::id.eq(vision_id))
            .first::<Vision>(&mut conn)
            .optional()?
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "vision {} does not exist. Run 'trellis vision list' to see existing visions.",
                    vision_id
                ))
            })
    }

    /// Get all visions
    pub fn list_visions(&self) -> Result<Vec<Vision>> {
        let mut conn = self.get_conn()?;
        let all = visions::table
            .order(visions::created_at.asc())
            .load::<Vision>(&mut conn)?;
        Ok(all)
    }

    // ========================================================================
    // KPI Node Operations
    // ========================================================================

    /// Create a new KPI node, validating the level hierarchy
    pub fn create_kpi(&self, draft: &KpiDraft) -> Result<i32> {
        let weight = draft.weight.unwrap_or(1.0);
        if weight <= 0.0 {
            return Err(DbError::Validation(format!(
                "weight must be positive, got {}",
                weight
            )));
        }

        // Owning vision must exist
        self.get_vision(draft.vision_id)?;

        match draft.parent_kpi_id {
            Some(parent_id) => {
                let parent = self.get_kpi(parent_id)?;
                self.check_parent_link(&parent, draft.vision_id, draft.level)?;
            }
            None => {
                if draft.level != KpiLevel::Quarterly {
                    return Err(DbError::InvalidHierarchy(format!(
                        "a {} KPI needs a parent; only quarterly KPIs sit at the root",
                        draft.level
                    )));
                }
            }
        }

        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        let change_id = Uuid::new_v4().to_string();
        let sort_order = self.next_sort_order(draft.vision_id, draft.parent_kpi_id)?;

        let new_node = NewKpiNode {
            change_id: &change_id,
            vision_id: draft.vision_id,
            parent_kpi_id: draft.parent_kpi_id,
            level: draft.level.as_str(),
            title: &draft.title,
            description: draft.description.as_deref(),
            weight,
            target_value: draft.target_value,
            target_date: draft.target_date.as_deref(),
            period_start: draft.period_start.as_deref(),
            period_end: draft.period_end.as_deref(),
            is_active: true,
            sort_order,
            created_at: &now,
            updated_at: &now,
        };

        diesel::insert_into(kpi_nodes::table)
            .values(&new_node)
            .execute(&mut conn)?;

        let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
            .first(&mut conn)?;

        Ok(id)
    }

    fn next_sort_order(&self, vision_id: i32, parent_kpi_id: Option<i32>) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let count: i64 = match parent_kpi_id {
            Some(parent_id) => kpi_nodes::table
                .filter(kpi_nodes::parent_kpi_id.eq(parent_id))
                .count()
                .get_result(&mut conn)?,
            None => kpi_nodes::table
                .filter(kpi_nodes::vision_id.eq(vision_id))
                .filter(kpi_nodes::parent_kpi_id.is_null())
                .count()
                .get_result(&mut conn)?,
        };
        Ok(count as i32)
    }

    fn check_parent_link(&self, parent: &KpiNode, vision_id: i32, child_level: KpiLevel) -> Result<()> {
        if !parent.is_active {
            return Err(DbError::InvalidHierarchy(format!(
                "parent KPI {} is deleted",
                parent.id
            )));
        }
        if parent.vision_id != vision_id {
            return Err(DbError::InvalidHierarchy(format!(
                "parent KPI {} belongs to vision {}, not vision {}",
                parent.id, parent.vision_id, vision_id
            )));
        }
        match parent.kpi_level().child_level() {
            Some(expected) if expected == child_level => Ok(()),
            Some(expected) => Err(DbError::InvalidHierarchy(format!(
                "a {} KPI can only hold {} children, got {}",
                parent.kpi_level(),
                expected,
                child_level
            ))),
            None => Err(DbError::InvalidHierarchy(format!(
                "daily KPI {} cannot have children",
                parent.id
            ))),
        }
    }

    /// Get a KPI node by id (active or not)
    pub fn get_kpi(&self, kpi_id: i32) -> Result<KpiNode> {
        let mut conn = self.get_conn()?;
        kpi_nodes::table
            .filter(kpi_nodes::id.eq(kpi_id))
            .first::<KpiNode>(&mut conn)
            .optional()?
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "KPI {} does not exist. Run 'trellis tree <vision>' to see existing KPIs.",
                    kpi_id
                ))
            })
    }

    /// Update a KPI's weight
    pub fn set_weight(&self, kpi_id: i32, weight: f64) -> Result<()> {
        if weight <= 0.0 {
            return Err(DbError::Validation(format!(
                "weight must be positive, got {}",
                weight
            )));
        }
        // Ensure the node exists before updating
        self.get_kpi(kpi_id)?;

        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        diesel::update(kpi_nodes::table.filter(kpi_nodes::id.eq(kpi_id)))
            .set((kpi_nodes::weight.eq(weight), kpi_nodes::updated_at.eq(&now)))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Move a KPI under a new parent (None moves it to the root level).
    /// Validates level fit and rejects links that would close a cycle.
    pub fn reparent_kpi(&self, kpi_id: i32, new_parent_id: Option<i32>) -> Result<()> {
        let node = self.get_kpi(kpi_id)?;

        match new_parent_id {
            Some(parent_id) => {
                if parent_id == kpi_id {
                    return Err(DbError::InvalidHierarchy(format!(
                        "KPI {} cannot be its own parent",
                        kpi_id
                    )));
                }
                let parent = self.get_kpi(parent_id)?;
                self.check_parent_link(&parent, node.vision_id, node.kpi_level())?;

                // Walk the new parent's ancestor chain; finding the moved node
                // there means the link would close a cycle.
                let mut seen = std::collections::HashSet::new();
                let mut cursor = parent.clone();
                loop {
                    if cursor.id == kpi_id {
                        return Err(DbError::InvalidHierarchy(format!(
                            "moving KPI {} under {} would create a cycle",
                            kpi_id, parent_id
                        )));
                    }
                    if !seen.insert(cursor.id) {
                        break;
                    }
                    match cursor.parent_kpi_id {
                        Some(next) => cursor = self.get_kpi(next)?,
                        None => break,
                    }
                }
            }
            None => {
                if node.kpi_level() != KpiLevel::Quarterly {
                    return Err(DbError::InvalidHierarchy(format!(
                        "a {} KPI needs a parent; only quarterly KPIs sit at the root",
                        node.kpi_level()
                    )));
                }
            }
        }

        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        diesel::update(kpi_nodes::table.filter(kpi_nodes::id.eq(kpi_id)))
            .set((
                kpi_nodes::parent_kpi_id.eq(new_parent_id),
                kpi_nodes::updated_at.eq(&now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Soft-delete a KPI. Returns its former parent id so the caller can
    /// retrigger that chain.
    pub fn deactivate_kpi(&self, kpi_id: i32) -> Result<Option<i32>> {
        let node = self.get_kpi(kpi_id)?;

        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        diesel::update(kpi_nodes::table.filter(kpi_nodes::id.eq(kpi_id)))
            .set((kpi_nodes::is_active.eq(false), kpi_nodes::updated_at.eq(&now)))
            .execute(&mut conn)?;
        Ok(node.parent_kpi_id)
    }

    /// All active KPIs + their cache rows for one vision, in a single query
    pub fn vision_records(&self, vision_id: i32) -> Result<Vec<KpiRecord>> {
        // Surface a clear NotFound instead of an empty forest
        self.get_vision(vision_id)?;

        let mut conn = self.get_conn()?;
        let rows: Vec<(KpiNode, Option<ProgressCache>)> = kpi_nodes::table
            .left_join(progress_cache::table)
            .filter(kpi_nodes::vision_id.eq(vision_id))
            .filter(kpi_nodes::is_active.eq(true))
            .order((kpi_nodes::sort_order.asc(), kpi_nodes::id.asc()))
            .select((KpiNode::as_select(), Option::<ProgressCache>::as_select()))
            .load(&mut conn)?;

        Ok(rows
            .into_iter()
            .map(|(node, cache)| KpiRecord { node, cache })
            .collect())
    }

    /// Active children of a node with their current cache rows, freshly read
    pub fn active_children_with_cache(&self, kpi_id: i32) -> Result<Vec<KpiRecord>> {
        let mut conn = self.get_conn()?;
        let rows: Vec<(KpiNode, Option<ProgressCache>)> = kpi_nodes::table
            .left_join(progress_cache::table)
            .filter(kpi_nodes::parent_kpi_id.eq(kpi_id))
            .filter(kpi_nodes::is_active.eq(true))
            .order((kpi_nodes::sort_order.asc(), kpi_nodes::id.asc()))
            .select((KpiNode::as_select(), Option::<ProgressCache>::as_select()))
            .load(&mut conn)?;

        Ok(rows
            .into_iter()
            .map(|(node, cache)| KpiRecord { node, cache })
            .collect())
    }

    // ========================================================================
    // Completion Log Operations
    // ========================================================================

    /// Record a completion for a calendar date. A second log on the same date
    /// overwrites the day's row rather than duplicating it.
    pub fn upsert_completion_log(
        &self,
        kpi_id: i32,
        date: NaiveDate,
        completed: bool,
        value: Option<f64>,
    ) -> Result<CompletionLog> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        let day = date_str(date);

        let new_log = NewCompletionLog {
            kpi_id,
            log_date: &day,
            completed,
            value,
            logged_at: &now,
        };

        diesel::insert_into(completion_logs::table)
            .values(&new_log)
            .on_conflict((completion_logs::kpi_id, completion_logs::log_date))
            .do_update()
            .set((
                completion_logs::completed.eq(completed),
                completion_logs::value.eq(value),
                completion_logs::logged_at.eq(&now),
            ))
            .execute(&mut conn)?;

        completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::log_date.eq(&day))
            .first::<CompletionLog>(&mut conn)
            .map_err(DbError::from)
    }

    /// All logs for a KPI, most recent first
    pub fn get_logs(&self, kpi_id: i32) -> Result<Vec<CompletionLog>> {
        let mut conn = self.get_conn()?;
        let logs = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .order(completion_logs::log_date.desc())
            .load::<CompletionLog>(&mut conn)?;
        Ok(logs)
    }

    /// Dates with a completed log for a KPI, most recent first
    pub fn completed_dates(&self, kpi_id: i32) -> Result<Vec<NaiveDate>> {
        let mut conn = self.get_conn()?;
        let days: Vec<String> = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::completed.eq(true))
            .order(completion_logs::log_date.desc())
            .select(completion_logs::log_date)
            .load(&mut conn)?;
        Ok(days.iter().filter_map(|d| parse_date(d)).collect())
    }

    /// The log for one calendar date, if any
    pub fn log_on(&self, kpi_id: i32, date: NaiveDate) -> Result<Option<CompletionLog>> {
        let mut conn = self.get_conn()?;
        let log = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::log_date.eq(date_str(date)))
            .first::<CompletionLog>(&mut conn)
            .optional()?;
        Ok(log)
    }

    /// The most recently logged numeric value for a KPI, if any
    pub fn latest_value(&self, kpi_id: i32) -> Result<Option<f64>> {
        let mut conn = self.get_conn()?;
        let value: Option<Option<f64>> = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::value.is_not_null())
            .order(completion_logs::log_date.desc())
            .select(completion_logs::value)
            .first(&mut conn)
            .optional()?;
        Ok(value.flatten())
    }

    /// Whether a completed log exists in the inclusive date range
    pub fn completed_in_range(&self, kpi_id: i32, start: NaiveDate, end: NaiveDate) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count: i64 = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::completed.eq(true))
            .filter(completion_logs::log_date.ge(date_str(start)))
            .filter(completion_logs::log_date.le(date_str(end)))
            .count()
            .get_result(&mut conn)?;
        Ok(count > 0)
    }

    /// Whether any completed log exists for a KPI
    pub fn any_completed(&self, kpi_id: i32) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count: i64 = completion_logs::table
            .filter(completion_logs::kpi_id.eq(kpi_id))
            .filter(completion_logs::completed.eq(true))
            .count()
            .get_result(&mut conn)?;
        Ok(count > 0)
    }

    /// Count of completed logs across a vision on one date (streak recovery
    /// counts these as qualifying actions)
    pub fn vision_completed_count_on(&self, vision_id: i32, date: NaiveDate) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let kpi_ids: Vec<i32> = kpi_nodes::table
            .filter(kpi_nodes::vision_id.eq(vision_id))
            .filter(kpi_nodes::is_active.eq(true))
            .select(kpi_nodes::id)
            .load(&mut conn)?;

        let count: i64 = completion_logs::table
            .filter(completion_logs::kpi_id.eq_any(kpi_ids))
            .filter(completion_logs::completed.eq(true))
            .filter(completion_logs::log_date.eq(date_str(date)))
            .count()
            .get_result(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Progress Cache Operations
    // ========================================================================

    /// Get the cache row for a KPI, if one has been calculated
    pub fn get_cache(&self, kpi_id: i32) -> Result<Option<ProgressCache>> {
        let mut conn = self.get_conn()?;
        let row = progress_cache::table
            .filter(progress_cache::kpi_id.eq(kpi_id))
            .first::<ProgressCache>(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// Atomically upsert one cache row. expected_version is the row_version
    /// the caller read before computing (None when no row existed). A
    /// concurrent writer bumping the version first surfaces as StaleWrite so
    /// the caller re-reads children and recomputes.
    pub fn upsert_cache(&self, write: &CacheWrite, expected_version: Option<i32>) -> Result<ProgressCache> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();

        conn.transaction::<ProgressCache, DbError, _>(|conn| {
            match expected_version {
                None => {
                    let new_row = NewProgressCache {
                        kpi_id: write.kpi_id,
                        progress_percentage: write.progress_percentage,
                        status: &write.status,
                        child_count: write.child_count,
                        completed_child_count: write.completed_child_count,
                        calculation_method: &write.calculation_method,
                        manual_override_reason: write.manual_override_reason.as_deref(),
                        formula_json: write.formula_json.as_deref(),
                        row_version: 1,
                        last_calculated_at: &now,
                    };
                    let inserted = diesel::insert_or_ignore_into(progress_cache::table)
                        .values(&new_row)
                        .execute(conn)?;
                    if inserted == 0 {
                        return Err(DbError::StaleWrite(format!(
                            "cache row for KPI {} was created by another writer",
                            write.kpi_id
                        )));
                    }
                }
                Some(version) => {
                    let updated = diesel::update(
                        progress_cache::table
                            .filter(progress_cache::kpi_id.eq(write.kpi_id))
                            .filter(progress_cache::row_version.eq(version)),
                    )
                    .set((
                        progress_cache::progress_percentage.eq(write.progress_percentage),
                        progress_cache::status.eq(&write.status),
                        progress_cache::child_count.eq(write.child_count),
                        progress_cache::completed_child_count.eq(write.completed_child_count),
                        progress_cache::calculation_method.eq(&write.calculation_method),
                        progress_cache::manual_override_reason.eq(write.manual_override_reason.as_deref()),
                        progress_cache::formula_json.eq(write.formula_json.as_deref()),
                        progress_cache::row_version.eq(version + 1),
                        progress_cache::last_calculated_at.eq(&now),
                    ))
                    .execute(conn)?;
                    if updated == 0 {
                        return Err(DbError::StaleWrite(format!(
                            "cache row for KPI {} changed since it was read",
                            write.kpi_id
                        )));
                    }
                }
            }

            progress_cache::table
                .filter(progress_cache::kpi_id.eq(write.kpi_id))
                .first::<ProgressCache>(conn)
                .map_err(DbError::from)
        })
    }

    /// Update only the child counts on an overridden node's cache row,
    /// leaving its percentage and method untouched
    pub fn update_cache_child_counts(
        &self,
        kpi_id: i32,
        child_count: i32,
        completed_child_count: i32,
    ) -> Result<()> {
        let mut conn = self.get_conn()?;
        diesel::update(progress_cache::table.filter(progress_cache::kpi_id.eq(kpi_id)))
            .set((
                progress_cache::child_count.eq(child_count),
                progress_cache::completed_child_count.eq(completed_child_count),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    // ========================================================================
    // Streak Recovery Operations
    // ========================================================================

    /// The recovery row for a KPI's ISO week, if the week's recovery is used
    pub fn recovery_for_week(&self, kpi_id: i32, iso_year: i32, iso_week: i32) -> Result<Option<StreakRecovery>> {
        let mut conn = self.get_conn()?;
        let row = streak_recoveries::table
            .filter(streak_recoveries::kpi_id.eq(kpi_id))
            .filter(streak_recoveries::iso_year.eq(iso_year))
            .filter(streak_recoveries::iso_week.eq(iso_week))
            .first::<StreakRecovery>(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// All recovery rows for a KPI (their gap dates bridge streak scans)
    pub fn recoveries_for(&self, kpi_id: i32) -> Result<Vec<StreakRecovery>> {
        let mut conn = self.get_conn()?;
        let rows = streak_recoveries::table
            .filter(streak_recoveries::kpi_id.eq(kpi_id))
            .order(streak_recoveries::gap_date.asc())
            .load::<StreakRecovery>(&mut conn)?;
        Ok(rows)
    }

    /// Mark this ISO week's recovery as used. Errors if it already was
    /// (the unique constraint makes the transition one-shot under races).
    pub fn record_recovery(
        &self,
        kpi_id: i32,
        iso_year: i32,
        iso_week: i32,
        gap_date: NaiveDate,
        recovered_on: NaiveDate,
    ) -> Result<StreakRecovery> {
        let mut conn = self.get_conn()?;
        let gap = date_str(gap_date);
        let on = date_str(recovered_on);

        let new_row = NewStreakRecovery {
            kpi_id,
            iso_year,
            iso_week,
            gap_date: &gap,
            recovered_on: &on,
        };

        let inserted = diesel::insert_or_ignore_into(streak_recoveries::table)
            .values(&new_row)
            .execute(&mut conn)?;
        if inserted == 0 {
            return Err(DbError::Validation(format!(
                "streak recovery for KPI {} already used in week {}-W{:02}",
                kpi_id, iso_year, iso_week
            )));
        }

        streak_recoveries::table
            .filter(streak_recoveries::kpi_id.eq(kpi_id))
            .filter(streak_recoveries::iso_year.eq(iso_year))
            .filter(streak_recoveries::iso_week.eq(iso_week))
            .first::<StreakRecovery>(&mut conn)
            .map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trellis.db");
        let db = Database::open_at(&path).unwrap();
        (dir, db)
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_level_parse_round_trip() {
        for level in [KpiLevel::Quarterly, KpiLevel::Monthly, KpiLevel::Weekly, KpiLevel::Daily] {
            assert_eq!(KpiLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(KpiLevel::parse("yearly"), None);
    }

    #[test]
    fn test_level_chain() {
        assert_eq!(KpiLevel::Quarterly.child_level(), Some(KpiLevel::Monthly));
        assert_eq!(KpiLevel::Monthly.child_level(), Some(KpiLevel::Weekly));
        assert_eq!(KpiLevel::Weekly.child_level(), Some(KpiLevel::Daily));
        assert_eq!(KpiLevel::Daily.child_level(), None);
    }

    fn draft(vision_id: i32, parent: Option<i32>, level: KpiLevel, title: &str) -> KpiDraft {
        KpiDraft {
            vision_id,
            parent_kpi_id: parent,
            level,
            title: title.to_string(),
            description: None,
            weight: None,
            target_value: None,
            target_date: None,
            period_start: None,
            period_end: None,
        }
    }

    #[test]
    fn test_create_kpi_validates_levels() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Run a marathon", None).unwrap();

        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Base building")).unwrap();
        let m = db.create_kpi(&draft(vision, Some(q), KpiLevel::Monthly, "January mileage")).unwrap();

        // A monthly child under a quarterly parent is the only valid step
        let err = db
            .create_kpi(&draft(vision, Some(q), KpiLevel::Daily, "Morning run"))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidHierarchy(_)));

        // Non-quarterly nodes cannot sit at the root
        let err = db
            .create_kpi(&draft(vision, None, KpiLevel::Weekly, "Week 1"))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidHierarchy(_)));

        let node = db.get_kpi(m).unwrap();
        assert_eq!(node.parent_kpi_id, Some(q));
        assert_eq!(node.kpi_level(), KpiLevel::Monthly);
    }

    #[test]
    fn test_create_kpi_rejects_nonpositive_weight() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let mut d = draft(vision, None, KpiLevel::Quarterly, "Q1");
        d.weight = Some(0.0);
        assert!(matches!(db.create_kpi(&d).unwrap_err(), DbError::Validation(_)));
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Q1")).unwrap();
        let m = db.create_kpi(&draft(vision, Some(q), KpiLevel::Monthly, "M1")).unwrap();

        let err = db.reparent_kpi(q, Some(m)).unwrap_err();
        assert!(matches!(err, DbError::InvalidHierarchy(_)));

        let err = db.reparent_kpi(q, Some(q)).unwrap_err();
        assert!(matches!(err, DbError::InvalidHierarchy(_)));
    }

    #[test]
    fn test_log_is_idempotent_by_date() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Q1")).unwrap();

        let day = date("2024-01-05");
        db.upsert_completion_log(q, day, true, Some(3.0)).unwrap();
        let second = db.upsert_completion_log(q, day, true, Some(5.0)).unwrap();

        let logs = db.get_logs(q).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(second.value, Some(5.0));
        assert_eq!(db.latest_value(q).unwrap(), Some(5.0));
    }

    #[test]
    fn test_cache_upsert_detects_stale_writers() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Q1")).unwrap();

        let write = CacheWrite {
            kpi_id: q,
            progress_percentage: 40.0,
            status: "in_progress".to_string(),
            child_count: 2,
            completed_child_count: 0,
            calculation_method: "weighted_rollup".to_string(),
            manual_override_reason: None,
            formula_json: None,
        };

        let first = db.upsert_cache(&write, None).unwrap();
        assert_eq!(first.row_version, 1);

        // Inserting again when a row exists is a lost race
        assert!(db.upsert_cache(&write, None).unwrap_err().is_retryable());

        // Updating with the version we read succeeds and bumps it
        let second = db.upsert_cache(&write, Some(first.row_version)).unwrap();
        assert_eq!(second.row_version, 2);

        // Updating with the old version is stale
        assert!(db
            .upsert_cache(&write, Some(first.row_version))
            .unwrap_err()
            .is_retryable());
    }

    #[test]
    fn test_recovery_is_one_shot_per_week() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Q1")).unwrap();

        let gap = date("2024-01-04");
        let on = date("2024-01-05");
        db.record_recovery(q, 2024, 1, gap, on).unwrap();
        assert!(db.record_recovery(q, 2024, 1, gap, on).is_err());
        // A different week starts fresh
        db.record_recovery(q, 2024, 2, date("2024-01-11"), date("2024-01-12")).unwrap();
    }

    #[test]
    fn test_vision_records_excludes_inactive() {
        let (_dir, db) = temp_db();
        let vision = db.create_vision("Vision", None).unwrap();
        let q = db.create_kpi(&draft(vision, None, KpiLevel::Quarterly, "Q1")).unwrap();
        let m = db.create_kpi(&draft(vision, Some(q), KpiLevel::Monthly, "M1")).unwrap();

        assert_eq!(db.vision_records(vision).unwrap().len(), 2);

        let former_parent = db.deactivate_kpi(m).unwrap();
        assert_eq!(former_parent, Some(q));
        assert_eq!(db.vision_records(vision).unwrap().len(), 1);
    }
}
