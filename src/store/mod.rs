//! The remote `companies` table and the dedup-then-insert logic on top of it.

pub mod local;
pub mod supabase;

use tracing::{debug, info, warn};

pub use local::LocalStore;
pub use supabase::SupabaseStore;

use crate::error::StoreError;
use crate::model::CompanyRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Description,
    Location,
}

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::Description => "description",
            Column::Location => "location",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    NameEq(String),
    NotNull(Column),
}

/// Minimal table operations the harvester needs from a store.
#[allow(async_fn_in_trait)]
pub trait TableStore {
    async fn select(&self, filter: &Filter, limit: Option<usize>)
        -> Result<Vec<CompanyRecord>, StoreError>;
    async fn insert(&self, row: &CompanyRecord) -> Result<(), StoreError>;
    /// Returns the number of rows removed.
    async fn delete(&self, filter: &Filter) -> Result<usize, StoreError>;
    /// Rows matching `filter`, counted by the store rather than fetched.
    async fn count(&self, filter: &Filter) -> Result<usize, StoreError>;
}

/// Store chosen at startup.
pub enum Backend {
    Remote(SupabaseStore),
    Local(LocalStore),
}

impl TableStore for Backend {
    async fn select(
        &self,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        match self {
            Backend::Remote(s) => s.select(filter, limit).await,
            Backend::Local(s) => s.select(filter, limit).await,
        }
    }

    async fn insert(&self, row: &CompanyRecord) -> Result<(), StoreError> {
        match self {
            Backend::Remote(s) => s.insert(row).await,
            Backend::Local(s) => s.insert(row).await,
        }
    }

    async fn delete(&self, filter: &Filter) -> Result<usize, StoreError> {
        match self {
            Backend::Remote(s) => s.delete(filter).await,
            Backend::Local(s) => s.delete(filter).await,
        }
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        match self {
            Backend::Remote(s) => s.count(filter).await,
            Backend::Local(s) => s.count(filter).await,
        }
    }
}

/// How much of the directory is stored, plus a few rows to eyeball.
#[derive(Debug)]
pub struct StoreStats {
    pub total: usize,
    pub with_description: usize,
    pub with_location: usize,
    pub sample: Vec<CompanyRecord>,
}

pub async fn collect_stats<S: TableStore>(
    table: &S,
    sample_size: usize,
) -> Result<StoreStats, StoreError> {
    Ok(StoreStats {
        total: table.count(&Filter::All).await?,
        with_description: table.count(&Filter::NotNull(Column::Description)).await?,
        with_location: table.count(&Filter::NotNull(Column::Location)).await?,
        sample: table.select(&Filter::All, Some(sample_size)).await?,
    })
}

#[derive(Debug, Clone)]
pub struct FailedInsert {
    pub record: CompanyRecord,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub inserted: usize,
    pub skipped_existing: usize,
    pub failed: Vec<FailedInsert>,
}

/// Check-then-insert on the company name. Not atomic: a concurrent writer
/// between the check and the insert can still produce a duplicate.
pub struct IngestionStore<S> {
    table: S,
}

impl<S: TableStore> IngestionStore<S> {
    pub fn new(table: S) -> Self {
        IngestionStore { table }
    }

    #[cfg(test)]
    pub fn table(&self) -> &S {
        &self.table
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let rows = self
            .table
            .select(&Filter::NameEq(name.to_string()), Some(1))
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn insert_if_absent(&self, record: &CompanyRecord) -> Result<bool, StoreError> {
        if self.exists(&record.name).await? {
            debug!("Company '{}' already exists, skipping", record.name);
            return Ok(false);
        }
        self.table.insert(record).await?;
        Ok(true)
    }

    /// One record's failure never aborts the rest of the batch.
    pub async fn flush_batch(&self, records: &[CompanyRecord]) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        for record in records {
            match self.insert_if_absent(record).await {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.skipped_existing += 1,
                Err(e) => {
                    warn!("Error saving company '{}': {}", record.name, e);
                    outcome.failed.push(FailedInsert {
                        record: record.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if outcome.inserted > 0 {
            info!("Saved {} new companies to database", outcome.inserted);
        }
        outcome
    }
}
