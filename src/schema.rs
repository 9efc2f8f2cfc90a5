//! The `messages` table an external message processor appends to.
//!
//! Two layouts are in use: the basic one and one that also keeps a
//! denormalized copy of the quoted message. Nothing here migrates between them.
use log::info;
use rusqlite::{params, Connection, Row};

const CREATE_BASIC: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    sourceName TEXT,
    timestamp INTEGER,
    message TEXT,
    groupId TEXT,
    groupName TEXT,
    attachmentPaths TEXT,
    attachmentDescriptions TEXT,
    processedAt INTEGER
)";

const CREATE_WITH_QUOTES: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    sourceName TEXT,
    timestamp INTEGER,
    message TEXT,
    groupId TEXT,
    groupName TEXT,
    attachmentPaths TEXT,
    attachmentDescriptions TEXT,
    processedAt INTEGER,
    quoteId INTEGER,
    quoteAuthor TEXT,
    quoteText TEXT
)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVariant {
    Basic,
    #[default]
    WithQuotes,
}

impl SchemaVariant {
    pub const fn ddl(&self) -> &'static str {
        match self {
            SchemaVariant::Basic => CREATE_BASIC,
            SchemaVariant::WithQuotes => CREATE_WITH_QUOTES,
        }
    }
}

/// One processed message. Attachment columns are stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub id: Option<i64>,
    pub source: Option<String>,
    pub source_name: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: Option<i64>,
    pub message: Option<String>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub attachment_paths: Option<String>,
    pub attachment_descriptions: Option<String>,
    pub processed_at: Option<i64>,
    pub quote_id: Option<i64>,
    pub quote_author: Option<String>,
    pub quote_text: Option<String>,
}

/// Creates the `messages` table in `variant` unless a table of that name exists.
pub fn ensure_table(conn: &Connection, variant: SchemaVariant) -> rusqlite::Result<()> {
    conn.execute_batch(variant.ddl())?;
    info!("messages table ready ({:?})", variant);
    Ok(())
}

/// Layout of the existing `messages` table, if there is one.
pub fn detect_variant(conn: &Connection) -> rusqlite::Result<Option<SchemaVariant>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('messages')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if columns.is_empty() {
        Ok(None)
    } else if columns.iter().any(|column| column == "quoteId") {
        Ok(Some(SchemaVariant::WithQuotes))
    } else {
        Ok(Some(SchemaVariant::Basic))
    }
}

/// Inserts `record`, ignoring its `id`, and returns the assigned row id.
/// Quote fields are dropped on a basic table.
pub fn append(conn: &Connection, record: &LogRecord) -> rusqlite::Result<i64> {
    match detect_variant(conn)? {
        Some(SchemaVariant::WithQuotes) => conn.execute(
            "INSERT INTO messages (source, sourceName, timestamp, message, groupId, groupName,
                attachmentPaths, attachmentDescriptions, processedAt, quoteId, quoteAuthor, quoteText)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.source,
                record.source_name,
                record.timestamp,
                record.message,
                record.group_id,
                record.group_name,
                record.attachment_paths,
                record.attachment_descriptions,
                record.processed_at,
                record.quote_id,
                record.quote_author,
                record.quote_text,
            ],
        )?,
        _ => conn.execute(
            "INSERT INTO messages (source, sourceName, timestamp, message, groupId, groupName,
                attachmentPaths, attachmentDescriptions, processedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.source,
                record.source_name,
                record.timestamp,
                record.message,
                record.group_id,
                record.group_name,
                record.attachment_paths,
                record.attachment_descriptions,
                record.processed_at,
            ],
        )?,
    };

    Ok(conn.last_insert_rowid())
}

/// Newest `limit` records first.
pub fn recent(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<LogRecord>> {
    let quotes = detect_variant(conn)? == Some(SchemaVariant::WithQuotes);
    let sql = if quotes {
        "SELECT id, source, sourceName, timestamp, message, groupId, groupName, attachmentPaths,
                attachmentDescriptions, processedAt, quoteId, quoteAuthor, quoteText
         FROM messages ORDER BY id DESC LIMIT ?1"
    } else {
        "SELECT id, source, sourceName, timestamp, message, groupId, groupName, attachmentPaths,
                attachmentDescriptions, processedAt
         FROM messages ORDER BY id DESC LIMIT ?1"
    };

    let mut stmt = conn.prepare(sql)?;
    let records = stmt
        .query_map(params![limit as i64], |row| from_row(row, quotes))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

fn from_row(row: &Row<'_>, quotes: bool) -> rusqlite::Result<LogRecord> {
    let mut record = LogRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        source_name: row.get(2)?,
        timestamp: row.get(3)?,
        message: row.get(4)?,
        group_id: row.get(5)?,
        group_name: row.get(6)?,
        attachment_paths: row.get(7)?,
        attachment_descriptions: row.get(8)?,
        processed_at: row.get(9)?,
        ..LogRecord::default()
    };

    if quotes {
        record.quote_id = row.get(10)?;
        record.quote_author = row.get(11)?;
        record.quote_text = row.get(12)?;
    }

    Ok(record)
}
