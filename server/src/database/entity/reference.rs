//! A store path referenced by a narinfo record.

use sea_orm::entity::prelude::*;

pub type ReferenceModel = Model;

/// A store path referenced by a narinfo record.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "reference")]
pub struct Model {
    /// Unique numeric ID of the reference.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the owning narinfo record.
    #[sea_orm(indexed)]
    pub nar_info_id: i64,

    /// The referenced store path base name.
    pub reference: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::nar_info::Entity",
        from = "Column::NarInfoId",
        to = "super::nar_info::Column::Id"
    )]
    NarInfo,
}

impl Related<super::nar_info::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarInfo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
