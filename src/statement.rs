//! Statement classification for the ingestion side.
//!
//! Decides whether a statement is ordinary work (recorded as a query) or one
//! of the bracketing statements a transaction manager issues (routed to the
//! transaction timeline instead), and derives a short label for it.

use once_cell::sync::Lazy;
use regex::Regex;

/// Leading keyword of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Set,
    Other,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Create => "CREATE",
            Operation::Drop => "DROP",
            Operation::Alter => "ALTER",
            Operation::Truncate => "TRUNCATE",
            Operation::Begin => "BEGIN",
            Operation::Commit => "COMMIT",
            Operation::Rollback => "ROLLBACK",
            Operation::Savepoint => "SAVEPOINT",
            Operation::Set => "SET",
            Operation::Other => "QUERY",
        }
    }

    /// How this operation affects the transaction timeline.
    pub fn bracket(&self) -> Bracket {
        match self {
            Operation::Begin => Bracket::Open,
            Operation::Commit | Operation::Rollback => Bracket::Close,
            _ => Bracket::None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction bracketing role of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    /// Opens a transaction (`BEGIN`, `START TRANSACTION`).
    Open,
    /// Closes the open transaction (`COMMIT`, `ROLLBACK`).
    Close,
    None,
}

// One pattern per statement family; group 1 is the table.
static TABLE_PATTERNS: Lazy<Vec<(Operation, Regex)>> = Lazy::new(|| {
    const IDENT: &str = r#"[`"\[]?(\w+)[`"\]]?"#;
    [
        (Operation::Select, r"(?i)\bFROM\s+"),
        (Operation::Insert, r"(?i)\bINSERT\s+INTO\s+"),
        (Operation::Update, r"(?i)\bUPDATE\s+"),
        (Operation::Delete, r"(?i)\bDELETE\s+FROM\s+"),
        (
            Operation::Create,
            r"(?i)\bCREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?",
        ),
        (Operation::Drop, r"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?"),
        (Operation::Alter, r"(?i)\bALTER\s+TABLE\s+"),
        (Operation::Truncate, r"(?i)\bTRUNCATE\s+(?:TABLE\s+)?"),
    ]
    .into_iter()
    .filter_map(|(op, prefix)| Regex::new(&format!("{prefix}{IDENT}")).ok().map(|re| (op, re)))
    .collect()
});

/// Classify a statement by its leading keyword.
///
/// `ROLLBACK TO SAVEPOINT` and `RELEASE SAVEPOINT` only rewind part of a
/// transaction and are reported as [`Operation::Savepoint`], never as a
/// bracket.
pub fn classify(sql: &str) -> Operation {
    let head: String = sql
        .trim_start()
        .chars()
        .take(24)
        .collect::<String>()
        .to_uppercase();

    if head.starts_with("SELECT") || head.starts_with("WITH") {
        Operation::Select
    } else if head.starts_with("INSERT") {
        Operation::Insert
    } else if head.starts_with("UPDATE") {
        Operation::Update
    } else if head.starts_with("DELETE") {
        Operation::Delete
    } else if head.starts_with("CREATE") {
        Operation::Create
    } else if head.starts_with("DROP") {
        Operation::Drop
    } else if head.starts_with("ALTER") {
        Operation::Alter
    } else if head.starts_with("TRUNCATE") {
        Operation::Truncate
    } else if head.starts_with("SAVEPOINT")
        || head.starts_with("RELEASE")
        || (head.starts_with("ROLLBACK") && head.contains(" TO "))
    {
        Operation::Savepoint
    } else if head.starts_with("BEGIN") || head.starts_with("START TRANSACTION") {
        Operation::Begin
    } else if head.starts_with("COMMIT") || head.starts_with("END") {
        Operation::Commit
    } else if head.starts_with("ROLLBACK") || head.starts_with("ABORT") {
        Operation::Rollback
    } else if head.starts_with("SET") {
        Operation::Set
    } else {
        Operation::Other
    }
}

/// Primary table touched by the statement, lower-cased, when detectable.
pub fn primary_table(sql: &str) -> Option<String> {
    let operation = classify(sql);
    let (_, regex) = TABLE_PATTERNS.iter().find(|(op, _)| *op == operation)?;

    regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// A classified statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub operation: Operation,
    pub table: Option<String>,
}

impl StatementInfo {
    pub fn parse(sql: &str) -> Self {
        Self {
            operation: classify(sql),
            table: primary_table(sql),
        }
    }

    pub fn bracket(&self) -> Bracket {
        self.operation.bracket()
    }

    /// Short label such as `"SELECT users"`, safe to show when the SQL text
    /// itself must not be captured.
    pub fn label(&self) -> String {
        match &self.table {
            Some(table) => format!("{} {}", self.operation, table),
            None => self.operation.as_str().to_string(),
        }
    }
}
