use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::queue::{ConsumeJob, IngestJob};
use crate::scheduler::SyncTarget;
use chrono::Utc;
use entity::live;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl SyncEngine {
    /// One consume-sync tick. Walks the contribution ranking page by page,
    /// queues every entry and stores the summed amount as the session's
    /// beans.
    ///
    /// Returns `Ok(None)` when cancelled mid-way: whatever was fetched is
    /// still queued but the beans total is left alone since it would be
    /// partial.
    pub async fn sync_consume(
        &self,
        target: &SyncTarget,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>, SyncError> {
        let mut beans = 0_i64;

        for page in 1..=self.settings.max_consume_pages {
            if cancel.is_cancelled() {
                debug!("Consume sync for {} cancelled at page {}", target.anchor_name, page);
                return Ok(None);
            }

            let entries = self
                .api
                .fetch_consume_page(target.anchor_uid, target.lid, page)
                .await?;
            if entries.is_empty() {
                break;
            }

            for consume in entries {
                beans += consume.amount;
                self.queue
                    .enqueue(IngestJob::Consume(ConsumeJob {
                        consume,
                        lid: target.lid,
                    }))
                    .await?;
            }
        }

        live::Entity::update_many()
            .col_expr(live::Column::Beans, Expr::value(beans))
            .col_expr(live::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(live::Column::Lid.eq(target.lid))
            .exec(&self.db)
            .await?;

        Ok(Some(beans))
    }
}
