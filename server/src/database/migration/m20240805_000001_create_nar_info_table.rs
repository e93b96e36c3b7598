use sea_orm_migration::prelude::*;

use crate::database::entity::nar_info::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240805_000001_create_nar_info_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Column::Hash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::StorePath).string().not_null())
                    .col(ColumnDef::new(Column::Url).string().not_null())
                    .col(ColumnDef::new(Column::Compression).string().not_null())
                    .col(ColumnDef::new(Column::FileHash).string().null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().null())
                    .col(ColumnDef::new(Column::NarHash).string().not_null())
                    .col(ColumnDef::new(Column::NarSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::Deriver).string().null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar-info-nar-hash")
                    .table(Entity)
                    .col(Column::NarHash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar-info-last-accessed-at")
                    .table(Entity)
                    .col(Column::LastAccessedAt)
                    .to_owned(),
            )
            .await
    }
}
