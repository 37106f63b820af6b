use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use std::future::Future;

use crate::db::client::Db;
use crate::db::query::{self, Record, RowScope};
use crate::error::WardenError;

/// Model-level operations shared by the raw client and the policy-enforcing wrapper.
pub trait ModelClient: Send + Sync {
    fn find_many(
        &self,
        model: &str,
        filter: &Record,
    ) -> impl Future<Output = Result<Vec<Record>, WardenError>> + Send;

    fn find_first(
        &self,
        model: &str,
        filter: &Record,
    ) -> impl Future<Output = Result<Option<Record>, WardenError>> + Send;

    fn count(
        &self,
        model: &str,
        filter: &Record,
    ) -> impl Future<Output = Result<i64, WardenError>> + Send;

    /// A policy-checked client refuses a record the caller could not read back.
    fn create(
        &self,
        model: &str,
        data: Record,
    ) -> impl Future<Output = Result<Record, WardenError>> + Send;

    /// Returns the updated rows. A policy-checked client returns only the rows the caller
    /// may read, so the result can be shorter than the number of rows changed.
    fn update_many(
        &self,
        model: &str,
        filter: &Record,
        data: Record,
    ) -> impl Future<Output = Result<Vec<Record>, WardenError>> + Send;

    /// Returns the deleted rows, filtered by read access like [`ModelClient::update_many`].
    fn delete_many(
        &self,
        model: &str,
        filter: &Record,
    ) -> impl Future<Output = Result<Vec<Record>, WardenError>> + Send;
}

fn row_to_record(row: PgRow) -> Result<Record, WardenError> {
    let Json(record): Json<Record> = row.try_get("row")?;
    Ok(record)
}

impl Db {
    pub(crate) async fn find_scoped(
        &self,
        model: &str,
        filter: &Record,
        scope: &RowScope,
        limit: Option<i64>,
    ) -> Result<Vec<Record>, WardenError> {
        let mut qb = query::select(model, filter, scope, limit)?;
        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub(crate) async fn count_scoped(
        &self,
        model: &str,
        filter: &Record,
        scope: &RowScope,
    ) -> Result<i64, WardenError> {
        let mut qb = query::count(model, filter, scope)?;
        let (n,) = qb.build_query_as::<(i64,)>().fetch_one(self.pool()).await?;
        Ok(n)
    }

    /// Insert `data` and keep the row only if `accept` approves what the database stored.
    /// A rejected row is rolled back and `None` is returned.
    pub(crate) async fn create_checked<F>(
        &self,
        model: &str,
        data: &Record,
        accept: F,
    ) -> Result<Option<Record>, WardenError>
    where
        F: FnOnce(&Record) -> bool + Send,
    {
        let mut qb = query::insert(model, data)?;
        let mut tx = self.pool().begin().await?;
        let row = qb.build().fetch_one(&mut *tx).await?;
        let record = row_to_record(row)?;

        if accept(&record) {
            tx.commit().await?;
            Ok(Some(record))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }

    pub(crate) async fn update_scoped(
        &self,
        model: &str,
        filter: &Record,
        scope: &RowScope,
        data: &Record,
    ) -> Result<Vec<Record>, WardenError> {
        let mut qb = query::update(model, filter, scope, data)?;
        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub(crate) async fn delete_scoped(
        &self,
        model: &str,
        filter: &Record,
        scope: &RowScope,
    ) -> Result<Vec<Record>, WardenError> {
        let mut qb = query::delete(model, filter, scope)?;
        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.into_iter().map(row_to_record).collect()
    }
}

impl ModelClient for Db {
    async fn find_many(&self, model: &str, filter: &Record) -> Result<Vec<Record>, WardenError> {
        self.find_scoped(model, filter, &RowScope::unrestricted(), None)
            .await
    }

    async fn find_first(
        &self,
        model: &str,
        filter: &Record,
    ) -> Result<Option<Record>, WardenError> {
        let rows = self
            .find_scoped(model, filter, &RowScope::unrestricted(), Some(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn count(&self, model: &str, filter: &Record) -> Result<i64, WardenError> {
        self.count_scoped(model, filter, &RowScope::unrestricted())
            .await
    }

    async fn create(&self, model: &str, data: Record) -> Result<Record, WardenError> {
        let mut qb = query::insert(model, &data)?;
        let row = qb.build().fetch_one(self.pool()).await?;
        row_to_record(row)
    }

    async fn update_many(
        &self,
        model: &str,
        filter: &Record,
        data: Record,
    ) -> Result<Vec<Record>, WardenError> {
        self.update_scoped(model, filter, &RowScope::unrestricted(), &data)
            .await
    }

    async fn delete_many(&self, model: &str, filter: &Record) -> Result<Vec<Record>, WardenError> {
        self.delete_scoped(model, filter, &RowScope::unrestricted())
            .await
    }
}
