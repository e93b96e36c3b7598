//! Database migrations.

pub use sea_orm_migration::*;

mod m20240805_000001_create_nar_info_table;
mod m20240805_000002_create_signature_table;
mod m20240805_000003_create_reference_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240805_000001_create_nar_info_table::Migration),
            Box::new(m20240805_000002_create_signature_table::Migration),
            Box::new(m20240805_000003_create_reference_table::Migration),
        ]
    }
}
