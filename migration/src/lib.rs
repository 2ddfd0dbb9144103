//! Database migrations for the route optimization job worker.

pub use sea_orm_migration::prelude::*;

mod m2025_06_02_090000_create_optimization_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(
            m2025_06_02_090000_create_optimization_jobs::Migration,
        )]
    }
}
