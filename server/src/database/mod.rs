//! Metadata index.
//!
//! One relational record per locally stored narinfo, with signatures
//! and references in child tables. The index powers listing, LRU
//! accounting, and HEAD responses that would otherwise require
//! opening the stored artifact.

pub mod entity;
pub mod migration;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ConnectionTrait, DatabaseConnection, QueryOrder, QuerySelect,
    TransactionTrait,
};

use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use entity::nar_info::{self, Entity as NarInfoEntity, NarInfoModel};
use entity::reference::{self, Entity as Reference};
use entity::signature::{self, Entity as Signature};

/// A metadata record together with its child rows.
#[derive(Debug, Clone)]
pub struct NarInfoRecord {
    pub record: NarInfoModel,
    pub signatures: Vec<String>,
    pub references: Vec<String>,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Creates or replaces the metadata record for a narinfo.
    async fn upsert_nar_info(&self, hash: &str, nar_info: &NarInfo) -> ServerResult<()>;

    /// Retrieves a metadata record with its signatures and references.
    async fn find_nar_info_by_hash(&self, hash: &str) -> ServerResult<Option<NarInfoRecord>>;

    /// Deletes a metadata record and its child rows.
    async fn delete_nar_info_by_hash(&self, hash: &str) -> ServerResult<()>;

    /// Bumps the last-accessed timestamp of a record.
    ///
    /// Records touched more recently than `ignore_touch` ago are left
    /// alone to keep read-heavy workloads from rewriting the same row.
    async fn touch_last_accessed(&self, hash: &str, ignore_touch: Duration) -> ServerResult<()>;

    /// Like [`MetadataIndex::touch_last_accessed`], but keyed by the
    /// NAR URL hash.
    async fn touch_last_accessed_by_nar_hash(
        &self,
        nar_hash: &str,
        ignore_touch: Duration,
    ) -> ServerResult<()>;

    /// Lists records by ascending last access time.
    async fn list_least_recently_accessed(&self, limit: u64) -> ServerResult<Vec<NarInfoModel>>;

    /// Looks up the compressed file size and hash by the NAR URL hash.
    ///
    /// Returns `None` when no record matches or the record carries no
    /// file size.
    async fn find_file_size_and_hash_by_nar_hash(
        &self,
        nar_hash: &str,
    ) -> ServerResult<Option<(u64, Option<String>)>>;
}

fn touch_cutoff(ignore_touch: Duration) -> chrono::DateTime<Utc> {
    let floor = ChronoDuration::from_std(ignore_touch).unwrap_or_else(|_| ChronoDuration::zero());
    Utc::now() - floor
}

async fn insert_children<C: ConnectionTrait>(
    txn: &C,
    nar_info_id: i64,
    nar_info: &NarInfo,
) -> Result<(), DbErr> {
    for sig in &nar_info.signatures {
        signature::ActiveModel {
            nar_info_id: Set(nar_info_id),
            signature: Set(sig.clone()),
            ..Default::default()
        }
        .insert(txn)
        .await?;
    }

    for r in &nar_info.references {
        reference::ActiveModel {
            nar_info_id: Set(nar_info_id),
            reference: Set(r.clone()),
            ..Default::default()
        }
        .insert(txn)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl MetadataIndex for DatabaseConnection {
    async fn upsert_nar_info(&self, hash: &str, nar_info: &NarInfo) -> ServerResult<()> {
        let now = Utc::now();

        let txn = self.begin().await.map_err(ServerError::database_error)?;

        let existing = NarInfoEntity::find()
            .filter(nar_info::Column::Hash.eq(hash))
            .one(&txn)
            .await
            .map_err(ServerError::database_error)?;

        let fields = nar_info::ActiveModel {
            hash: Set(hash.to_string()),
            store_path: Set(nar_info.store_path.to_string_lossy().into_owned()),
            url: Set(nar_info.url.to_string()),
            compression: Set(nar_info.compression.as_str().to_string()),
            file_hash: Set(nar_info.file_hash.as_ref().map(|h| h.to_typed_base16())),
            file_size: Set(nar_info.file_size.map(|s| s as i64)),
            nar_hash: Set(nar_info.url.hash.clone()),
            nar_size: Set(nar_info.nar_size as i64),
            deriver: Set(nar_info.deriver.clone()),
            last_accessed_at: Set(now),
            ..Default::default()
        };

        let nar_info_id = match existing {
            Some(model) => {
                let id = model.id;

                let mut fields = fields;
                fields.id = Set(id);
                fields
                    .update(&txn)
                    .await
                    .map_err(ServerError::database_error)?;

                Signature::delete_many()
                    .filter(signature::Column::NarInfoId.eq(id))
                    .exec(&txn)
                    .await
                    .map_err(ServerError::database_error)?;
                Reference::delete_many()
                    .filter(reference::Column::NarInfoId.eq(id))
                    .exec(&txn)
                    .await
                    .map_err(ServerError::database_error)?;

                id
            }
            None => {
                let mut fields = fields;
                fields.created_at = Set(now);
                let inserted = fields
                    .insert(&txn)
                    .await
                    .map_err(ServerError::database_error)?;
                inserted.id
            }
        };

        insert_children(&txn, nar_info_id, nar_info)
            .await
            .map_err(ServerError::database_error)?;

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn find_nar_info_by_hash(&self, hash: &str) -> ServerResult<Option<NarInfoRecord>> {
        let Some(record) = NarInfoEntity::find()
            .filter(nar_info::Column::Hash.eq(hash))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
        else {
            return Ok(None);
        };

        let signatures = Signature::find()
            .filter(signature::Column::NarInfoId.eq(record.id))
            .all(self)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .map(|m| m.signature)
            .collect();

        let references = Reference::find()
            .filter(reference::Column::NarInfoId.eq(record.id))
            .all(self)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .map(|m| m.reference)
            .collect();

        Ok(Some(NarInfoRecord {
            record,
            signatures,
            references,
        }))
    }

    async fn delete_nar_info_by_hash(&self, hash: &str) -> ServerResult<()> {
        let txn = self.begin().await.map_err(ServerError::database_error)?;

        let Some(record) = NarInfoEntity::find()
            .filter(nar_info::Column::Hash.eq(hash))
            .one(&txn)
            .await
            .map_err(ServerError::database_error)?
        else {
            txn.commit().await.map_err(ServerError::database_error)?;
            return Ok(());
        };

        Signature::delete_many()
            .filter(signature::Column::NarInfoId.eq(record.id))
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;
        Reference::delete_many()
            .filter(reference::Column::NarInfoId.eq(record.id))
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;
        NarInfoEntity::delete_by_id(record.id)
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn touch_last_accessed(&self, hash: &str, ignore_touch: Duration) -> ServerResult<()> {
        NarInfoEntity::update_many()
            .col_expr(nar_info::Column::LastAccessedAt, Expr::value(Utc::now()))
            .filter(nar_info::Column::Hash.eq(hash))
            .filter(nar_info::Column::LastAccessedAt.lt(touch_cutoff(ignore_touch)))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn touch_last_accessed_by_nar_hash(
        &self,
        nar_hash: &str,
        ignore_touch: Duration,
    ) -> ServerResult<()> {
        NarInfoEntity::update_many()
            .col_expr(nar_info::Column::LastAccessedAt, Expr::value(Utc::now()))
            .filter(nar_info::Column::NarHash.eq(nar_hash))
            .filter(nar_info::Column::LastAccessedAt.lt(touch_cutoff(ignore_touch)))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn list_least_recently_accessed(&self, limit: u64) -> ServerResult<Vec<NarInfoModel>> {
        NarInfoEntity::find()
            .order_by_asc(nar_info::Column::LastAccessedAt)
            .limit(limit)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_file_size_and_hash_by_nar_hash(
        &self,
        nar_hash: &str,
    ) -> ServerResult<Option<(u64, Option<String>)>> {
        let record = NarInfoEntity::find()
            .filter(nar_info::Column::NarHash.eq(nar_hash))
            .one(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(record.and_then(|record| {
            record
                .file_size
                .map(|size| (size as u64, record.file_hash))
        }))
    }
}
