pub use sea_orm_migration::prelude::*;

mod m20241101_000001_create_anchors_table;
mod m20241101_000002_create_lives_table;
mod m20241101_000003_create_users_table;
mod m20241101_000004_create_chats_table;
mod m20241101_000005_create_consumes_table;
mod m20241101_000006_create_system_settings_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241101_000001_create_anchors_table::Migration),
            Box::new(m20241101_000002_create_lives_table::Migration),
            Box::new(m20241101_000003_create_users_table::Migration),
            Box::new(m20241101_000004_create_chats_table::Migration),
            Box::new(m20241101_000005_create_consumes_table::Migration),
            Box::new(m20241101_000006_create_system_settings_table::Migration),
        ]
    }
}
