use sea_orm::entity::prelude::*;

pub const UNCOMMITTED: &str = "uncommitted";
pub const PURGEABLE: &str = "purgeable";

/// Resource ids not referenced by any stored version. `list` is either
/// [`UNCOMMITTED`] or [`PURGEABLE`]; the primary key keeps an id on one list.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "resource_id_lists")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub resource_id: i64,
    pub list: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
