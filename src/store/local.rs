use std::path::Path;

use rusqlite::Connection;

use super::{Filter, TableStore};
use crate::db;
use crate::error::StoreError;
use crate::model::CompanyRecord;

/// `companies` table in the local SQLite state database.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(LocalStore {
            conn: db::connect(path)?,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        db::init_schema(&conn)?;
        Ok(LocalStore { conn })
    }
}

fn where_clause(filter: &Filter) -> (String, Option<String>) {
    match filter {
        Filter::All => (String::new(), None),
        Filter::NameEq(name) => (" WHERE name = ?1".to_string(), Some(name.clone())),
        Filter::NotNull(col) => (format!(" WHERE {} IS NOT NULL", col.as_str()), None),
    }
}

impl TableStore for LocalStore {
    async fn select(
        &self,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        let (clause, param) = where_clause(filter);
        let sql = format!(
            "SELECT name, source_url, description, location FROM companies{} ORDER BY id{}",
            clause,
            match limit {
                Some(n) => format!(" LIMIT {}", n),
                None => String::new(),
            }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = match &param {
            Some(p) => vec![p as &dyn rusqlite::ToSql],
            None => vec![],
        };
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                Ok(CompanyRecord {
                    name: row.get(0)?,
                    source_url: row.get(1)?,
                    description: row.get(2)?,
                    location: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn insert(&self, row: &CompanyRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO companies (name, source_url, description, location)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![row.name, row.source_url, row.description, row.location],
        )?;
        Ok(())
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        let (clause, param) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM companies{}", clause);
        let count = |row: &rusqlite::Row<'_>| row.get::<_, i64>(0);
        let n = match param {
            Some(p) => self.conn.query_row(&sql, [p], count)?,
            None => self.conn.query_row(&sql, [], count)?,
        };
        Ok(n as usize)
    }

    async fn delete(&self, filter: &Filter) -> Result<usize, StoreError> {
        let (clause, param) = where_clause(filter);
        let sql = format!("DELETE FROM companies{}", clause);
        let removed = match param {
            Some(p) => self.conn.execute(&sql, [p])?,
            None => self.conn.execute(&sql, [])?,
        };
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Column;

    fn rec(name: &str, location: Option<&str>) -> CompanyRecord {
        CompanyRecord {
            name: name.into(),
            source_url: format!("https://example.com/{}", name),
            description: None,
            location: location.map(String::from),
        }
    }

    #[tokio::test]
    async fn filters_and_delete() {
        let store = LocalStore::in_memory().unwrap();
        store.insert(&rec("a", Some("東京都"))).await.unwrap();
        store.insert(&rec("b", None)).await.unwrap();

        assert_eq!(store.select(&Filter::All, None).await.unwrap().len(), 2);
        assert_eq!(store.count(&Filter::All).await.unwrap(), 2);
        assert_eq!(store.count(&Filter::NotNull(Column::Location)).await.unwrap(), 1);
        assert_eq!(store.count(&Filter::NameEq("b".into())).await.unwrap(), 1);
        let located = store.select(&Filter::NotNull(Column::Location), None).await.unwrap();
        assert_eq!(located, vec![rec("a", Some("東京都"))]);

        assert_eq!(store.delete(&Filter::NameEq("a".into())).await.unwrap(), 1);
        assert_eq!(store.select(&Filter::All, Some(10)).await.unwrap(), vec![rec("b", None)]);
    }
}
