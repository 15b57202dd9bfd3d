use sea_orm_migration::prelude::*;

mod m0001_create_registrations;
mod m0002_create_resources;
mod m0003_create_resource_id_lists;
mod m0004_create_id_counters;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_registrations::Migration),
            Box::new(m0002_create_resources::Migration),
            Box::new(m0003_create_resource_id_lists::Migration),
            Box::new(m0004_create_id_counters::Migration),
        ]
    }
}
