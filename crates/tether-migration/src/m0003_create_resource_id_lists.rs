use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ResourceIdLists::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ResourceIdLists::ResourceId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ResourceIdLists::List).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_resource_id_lists_list")
                    .table(ResourceIdLists::Table)
                    .col(ResourceIdLists::List)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_resource_id_lists_list")
                    .table(ResourceIdLists::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ResourceIdLists::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ResourceIdLists {
    Table,
    ResourceId,
    List,
}
