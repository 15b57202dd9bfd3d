use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "registrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub registration_id: i64,
    pub origin: String,
    #[sea_orm(unique)]
    pub scope: String,
    pub script_url: String,
    pub version_id: i64,
    pub is_active: bool,
    pub has_fetch_handler: bool,
    pub last_update_check: DateTimeWithTimeZone,
    pub resources_total_size_bytes: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
