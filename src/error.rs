//! Error types.
//!
//! Two layers live here:
//! - [`DriverError`]: what an executor reports when a statement fails. It keeps the
//!   server's SQLSTATE and detail fields so a translator can classify it.
//! - [`StoreError`]: the domain error every public operation returns. Callers branch
//!   on [`ErrorKind`] instead of parsing driver strings.

use std::fmt;

/// Server-reported failure with its SQLSTATE and optional detail fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFailure {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub constraint: Option<String>,
    pub table: Option<String>,
}

impl DbFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            constraint: None,
            table: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Single-line rendering of every populated field.
    pub fn pretty(&self) -> String {
        let mut out = format!("{} (SQLSTATE {})", self.message, self.code);
        if let Some(table) = &self.table {
            out.push_str(&format!(", table: {table}"));
        }
        if let Some(constraint) = &self.constraint {
            out.push_str(&format!(", constraint: {constraint}"));
        }
        if let Some(detail) = &self.detail {
            out.push_str(&format!(", detail: {detail}"));
        }
        out
    }
}

/// Executor-level error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Error reported by the database server
    Database(DbFailure),
    /// Connection could not be established or was lost
    Connection(String),
    /// Parameter or column value could not be converted
    Conversion(String),
    /// Transaction has already been committed or rolled back
    TransactionClosed,
    /// Statement was not sent because the caller's context was cancelled or timed out
    Canceled(String),
    /// Other execution errors
    Other(String),
}

impl DriverError {
    /// SQLSTATE code, when the server reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            DriverError::Database(f) => Some(f.code.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Database(failure) => write!(f, "Database error: {}", failure.pretty()),
            DriverError::Connection(s) => write!(f, "Connection error: {s}"),
            DriverError::Conversion(s) => write!(f, "Conversion error: {s}"),
            DriverError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
            DriverError::Canceled(s) => write!(f, "Canceled: {s}"),
            DriverError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<may_postgres::Error> for DriverError {
    fn from(err: may_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => {
                let mut failure = DbFailure::new(db.code().code(), db.message());
                failure.detail = db.detail().map(str::to_string);
                failure.constraint = db.constraint().map(str::to_string);
                failure.table = db.table().map(str::to_string);
                DriverError::Database(failure)
            }
            None if err.is_closed() => DriverError::Connection(err.to_string()),
            None => DriverError::Other(err.to_string()),
        }
    }
}

/// Domain error taxonomy. Callers branch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A lookup that must yield a row yielded none
    RowNotFound,
    /// A unique constraint rejected the write
    RowAlreadyExist,
    /// An owner/model argument was absent
    ModelIsNil,
    /// Commit/rollback without an open transaction, or a stale transaction context
    NoTransaction,
    /// A bulk delete was attempted without any filter
    FiltersRequired,
    /// The statement could not be rendered (unknown field, bad pagination, ...)
    QueryBuild,
    /// A returned row could not be scanned into the entity
    Scan,
    /// Check, not-null, foreign-key or exclusion constraint violation
    ConstraintViolation,
    /// The caller's context was cancelled or its deadline elapsed
    Canceled,
    /// Any other storage failure
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RowNotFound => "row not found",
            ErrorKind::RowAlreadyExist => "row already exists",
            ErrorKind::ModelIsNil => "model is nil",
            ErrorKind::NoTransaction => "no transaction",
            ErrorKind::FiltersRequired => "filters required",
            ErrorKind::QueryBuild => "query build error",
            ErrorKind::Scan => "scan error",
            ErrorKind::ConstraintViolation => "constraint violation",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Storage => "storage error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every store, loader and transaction operation.
///
/// Carries the operation and entity names so a caller can log it without
/// re-deriving where it came from.
#[derive(Debug, Clone)]
pub struct StoreError {
    kind: ErrorKind,
    operation: &'static str,
    entity: &'static str,
    message: String,
    source: Option<DriverError>,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: "",
            entity: "",
            message: message.into(),
            source: None,
        }
    }

    pub fn row_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RowNotFound, message)
    }

    pub fn query_build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueryBuild, message)
    }

    pub fn scan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Scan, message)
    }

    pub fn no_transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoTransaction, message)
    }

    #[must_use]
    pub fn with_source(mut self, source: DriverError) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach operation and entity names. Existing context is kept, so the
    /// innermost operation wins when errors bubble through nested calls.
    #[must_use]
    pub fn during(mut self, operation: &'static str, entity: &'static str) -> Self {
        if self.operation.is_empty() {
            self.operation = operation;
        }
        if self.entity.is_empty() {
            self.entity = entity;
        }
        self
    }

    /// Append a note to the message without changing the kind.
    #[must_use]
    pub fn annotate(mut self, note: impl fmt::Display) -> Self {
        self.message = format!("{}; {}", self.message, note);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn driver_error(&self) -> Option<&DriverError> {
        self.source.as_ref()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.entity.is_empty(), self.operation.is_empty()) {
            (false, false) => write!(f, "{}.{}: ", self.entity, self.operation)?,
            (true, false) => write!(f, "{}: ", self.operation)?,
            (false, true) => write!(f, "{}: ", self.entity)?,
            (true, true) => {}
        }
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
