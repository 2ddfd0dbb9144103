//! Migration to create the optimization_jobs table.
//!
//! Each row tracks one route optimization request from enqueue through its
//! terminal state, including the parameters handed to the optimizer and the
//! outcome written back by the worker.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OptimizationJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OptimizationJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::TargetRouteId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::OptimizationMode)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::AvoidTolls)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::PreserveOrder)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::IsTimeDeviationOptimization)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::RequestedBy)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OptimizationJobs::Message)
                            .string_len(1000)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(OptimizationJobs::Error).text().null())
                    .col(
                        ColumnDef::new(OptimizationJobs::ResultPayload)
                            .json_binary()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // FIFO claim of the oldest pending job
        manager
            .create_index(
                Index::create()
                    .name("idx_optimization_jobs_status_created")
                    .table(OptimizationJobs::Table)
                    .col(OptimizationJobs::Status)
                    .col(OptimizationJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Stuck-job sweep over running rows
        manager
            .create_index(
                Index::create()
                    .name("idx_optimization_jobs_status_started")
                    .table(OptimizationJobs::Table)
                    .col(OptimizationJobs::Status)
                    .col(OptimizationJobs::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_optimization_jobs_status_created")
                    .table(OptimizationJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_optimization_jobs_status_started")
                    .table(OptimizationJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(OptimizationJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OptimizationJobs {
    Table,
    Id,
    TargetRouteId,
    Status,
    OptimizationMode,
    AvoidTolls,
    PreserveOrder,
    IsTimeDeviationOptimization,
    RequestedBy,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
    Message,
    Error,
    ResultPayload,
}
