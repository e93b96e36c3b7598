use sea_orm_migration::prelude::*;

use crate::database::entity::nar_info;
use crate::database::entity::signature::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240805_000002_create_signature_table"
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
                    .col(ColumnDef::new(Column::NarInfoId).big_integer().not_null())
                    .col(ColumnDef::new(Column::Signature).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-signature-nar-info-id")
                            .from(Entity, Column::NarInfoId)
                            .to(nar_info::Entity, nar_info::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-signature-nar-info-id")
                    .table(Entity)
                    .col(Column::NarInfoId)
                    .to_owned(),
            )
            .await
    }
}
