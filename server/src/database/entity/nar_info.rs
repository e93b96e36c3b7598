//! A narinfo held in local storage.
//!
//! This is the mutable projection of the immutable narinfo document:
//! it powers listing, HEAD-without-streaming, and LRU accounting.
//! Signatures and references live in child tables.

use sea_orm::entity::prelude::*;

pub type NarInfoModel = Model;

/// A narinfo held in local storage.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nar_info")]
pub struct Model {
    /// Unique numeric ID of the record.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The 32-character base32 narinfo hash.
    #[sea_orm(unique)]
    pub hash: String,

    /// The full store path described by the narinfo.
    pub store_path: String,

    /// The normalized relative URL of the NAR.
    pub url: String,

    /// The compression type of the stored NAR.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// The hash of the compressed file, in typed hexadecimal form.
    pub file_hash: Option<String>,

    /// The size of the compressed file.
    pub file_size: Option<i64>,

    /// The hash portion of the NAR URL.
    ///
    /// This is the bare base32 (or hexadecimal) string clients put in
    /// `/nar/{hash}.nar` requests, so HEAD lookups are a single
    /// indexed equality.
    #[sea_orm(indexed)]
    pub nar_hash: String,

    /// The size of the uncompressed NAR archive.
    pub nar_size: i64,

    /// The derivation that produced this object.
    pub deriver: Option<String>,

    /// Timestamp when the record was created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp of the last read, subject to the touch floor.
    pub last_accessed_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::signature::Entity")]
    Signature,

    #[sea_orm(has_many = "super::reference::Entity")]
    Reference,
}

impl ActiveModelBehavior for ActiveModel {}
