use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tgmart_core::{
    ChannelDim, DateDim, ImageDetectionFact, MartTables, MessageFact, RawDetectionBatch,
    RawMessageRecord, StagedDetection, StagedMessage, StagingTables,
};
use tracing::{debug, info};

use crate::{InsertOutcome, StorageError, Warehouse};

/// Rows per multi-row INSERT; keeps bind counts well under the protocol limit.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("warehouse migrations applied");
        Ok(())
    }

    async fn insert_raw_messages(
        &self,
        records: &[RawMessageRecord],
    ) -> Result<InsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = InsertOutcome::default();
        for record in records {
            let exists: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM raw.telegram_messages
                     WHERE message_id = $1 AND channel_username = $2
                )
                "#,
            )
            .bind(record.message_id)
            .bind(&record.channel_username)
            .fetch_one(&mut *tx)
            .await?;
            if exists {
                outcome.duplicates += 1;
                continue;
            }

            // A concurrent loader may win the race between the check and the insert.
            let result = sqlx::query(
                r#"
                INSERT INTO raw.telegram_messages
                    (message_id, channel_username, scraped_date, message_data, inserted_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (message_id, channel_username) DO NOTHING
                "#,
            )
            .bind(record.message_id)
            .bind(&record.channel_username)
            .bind(record.partition_date)
            .bind(Json(&record.payload))
            .bind(record.ingested_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn detection_batch_exists(&self, file_name: &str) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM raw.yolo_detections WHERE file_name = $1)",
        )
        .bind(file_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_detection_batch(&self, batch: &RawDetectionBatch) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO raw.yolo_detections (file_name, detection_data, content_sha256, inserted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (file_name) DO NOTHING
            "#,
        )
        .bind(&batch.file_name)
        .bind(Json(&batch.payload))
        .bind(&batch.content_sha256)
        .bind(batch.inserted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn raw_messages(&self) -> Result<Vec<RawMessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, channel_username, scraped_date, message_data, inserted_at
              FROM raw.telegram_messages
             ORDER BY channel_username, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawMessageRecord {
                message_id: row.try_get("message_id")?,
                channel_username: row.try_get("channel_username")?,
                partition_date: row.try_get("scraped_date")?,
                payload: row.try_get("message_data")?,
                ingested_at: row.try_get("inserted_at")?,
            });
        }
        Ok(out)
    }

    async fn raw_detection_batches(&self) -> Result<Vec<RawDetectionBatch>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, detection_data, content_sha256, inserted_at
              FROM raw.yolo_detections
             ORDER BY file_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawDetectionBatch {
                file_name: row.try_get("file_name")?,
                payload: row.try_get("detection_data")?,
                content_sha256: row.try_get("content_sha256")?,
                inserted_at: row.try_get("inserted_at")?,
            });
        }
        Ok(out)
    }

    async fn replace_staging(&self, tables: &StagingTables) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM analytics.stg_telegram_messages")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM analytics.stg_image_detections")
            .execute(&mut *tx)
            .await?;
        insert_staged_messages(&mut tx, &tables.messages).await?;
        insert_staged_detections(&mut tx, &tables.detections).await?;
        tx.commit().await?;
        debug!(
            messages = tables.messages.len(),
            detections = tables.detections.len(),
            "staging tables replaced"
        );
        Ok(())
    }

    async fn staging(&self) -> Result<StagingTables, StorageError> {
        let messages = sqlx::query(
            r#"
            SELECT message_id, channel_username, scraped_date, message_text, message_timestamp_utc,
                   views_count, forwards_count, replies_count, has_media, media_type,
                   media_file_name, media_mime_type, media_file_size, is_photo, is_document
              FROM analytics.stg_telegram_messages
             ORDER BY channel_username, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(staged_message_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let detections = sqlx::query(
            r#"
            SELECT detection_key, source_file, source_index, message_id, detected_object_class,
                   confidence_score, detection_timestamp, box_top_left_x, box_top_left_y, box_width,
                   box_height
              FROM analytics.stg_image_detections
             ORDER BY source_file, source_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(staged_detection_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(StagingTables {
            messages,
            detections,
        })
    }

    async fn replace_marts(&self, marts: &MartTables) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "analytics.fct_image_detections",
            "analytics.fct_messages",
            "analytics.dim_dates",
            "analytics.dim_channels",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        insert_channels(&mut tx, &marts.channels).await?;
        insert_dates(&mut tx, &marts.dates).await?;
        insert_message_facts(&mut tx, &marts.messages).await?;
        insert_detection_facts(&mut tx, &marts.detections).await?;
        tx.commit().await?;
        debug!(counts = ?marts.row_counts(), "mart tables replaced");
        Ok(())
    }

    async fn marts(&self) -> Result<MartTables, StorageError> {
        let channels = sqlx::query(
            "SELECT channel_pk, channel_username FROM analytics.dim_channels ORDER BY channel_username",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(ChannelDim {
                channel_pk: row.try_get("channel_pk")?,
                channel_username: row.try_get("channel_username")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let dates = sqlx::query(
            r#"
            SELECT date_pk, day, month, month_name, year, quarter, day_of_week, day_of_year,
                   iso_week, is_weekend
              FROM analytics.dim_dates
             ORDER BY date_pk
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(DateDim {
                date_pk: row.try_get("date_pk")?,
                day: row.try_get("day")?,
                month: row.try_get("month")?,
                month_name: row.try_get("month_name")?,
                year: row.try_get("year")?,
                quarter: row.try_get("quarter")?,
                day_of_week: row.try_get("day_of_week")?,
                day_of_year: row.try_get("day_of_year")?,
                iso_week: row.try_get("iso_week")?,
                is_weekend: row.try_get("is_weekend")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let messages = sqlx::query(
            r#"
            SELECT message_id, channel_pk, date_pk, message_text, message_timestamp_utc, has_media,
                   views_count, forwards_count, replies_count, media_type, media_file_name,
                   media_mime_type, media_file_size, is_photo, is_document
              FROM analytics.fct_messages
             ORDER BY channel_pk NULLS LAST, message_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(MessageFact {
                message_id: row.try_get("message_id")?,
                channel_pk: row.try_get("channel_pk")?,
                date_pk: row.try_get("date_pk")?,
                message_text: row.try_get("message_text")?,
                message_timestamp_utc: row.try_get("message_timestamp_utc")?,
                has_media: row.try_get("has_media")?,
                views_count: row.try_get("views_count")?,
                forwards_count: row.try_get("forwards_count")?,
                replies_count: row.try_get("replies_count")?,
                media_type: row.try_get("media_type")?,
                media_file_name: row.try_get("media_file_name")?,
                media_mime_type: row.try_get("media_mime_type")?,
                media_file_size: row.try_get("media_file_size")?,
                is_photo: row.try_get("is_photo")?,
                is_document: row.try_get("is_document")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let detections = sqlx::query(
            r#"
            SELECT detection_key, message_id, detected_object_class, confidence_score,
                   box_top_left_x, box_top_left_y, box_width, box_height, detection_timestamp,
                   loaded_at
              FROM analytics.fct_image_detections
             ORDER BY detection_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(ImageDetectionFact {
                detection_key: row.try_get("detection_key")?,
                message_id: row.try_get("message_id")?,
                detected_object_class: row.try_get("detected_object_class")?,
                confidence_score: row.try_get("confidence_score")?,
                box_top_left_x: row.try_get("box_top_left_x")?,
                box_top_left_y: row.try_get("box_top_left_y")?,
                box_width: row.try_get("box_width")?,
                box_height: row.try_get("box_height")?,
                detection_timestamp: row.try_get("detection_timestamp")?,
                loaded_at: row.try_get("loaded_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(MartTables {
            channels,
            dates,
            messages,
            detections,
        })
    }
}

fn staged_message_from_row(row: &PgRow) -> Result<StagedMessage, sqlx::Error> {
    Ok(StagedMessage {
        message_id: row.try_get("message_id")?,
        channel_username: row.try_get("channel_username")?,
        partition_date: row.try_get("scraped_date")?,
        message_text: row.try_get("message_text")?,
        message_timestamp_utc: row.try_get("message_timestamp_utc")?,
        views_count: row.try_get("views_count")?,
        forwards_count: row.try_get("forwards_count")?,
        replies_count: row.try_get("replies_count")?,
        has_media: row.try_get("has_media")?,
        media_type: row.try_get("media_type")?,
        media_file_name: row.try_get("media_file_name")?,
        media_mime_type: row.try_get("media_mime_type")?,
        media_file_size: row.try_get("media_file_size")?,
        is_photo: row.try_get("is_photo")?,
        is_document: row.try_get("is_document")?,
    })
}

fn staged_detection_from_row(row: &PgRow) -> Result<StagedDetection, sqlx::Error> {
    Ok(StagedDetection {
        detection_key: row.try_get("detection_key")?,
        source_file: row.try_get("source_file")?,
        source_index: row.try_get("source_index")?,
        message_id: row.try_get("message_id")?,
        detected_object_class: row.try_get("detected_object_class")?,
        confidence_score: row.try_get("confidence_score")?,
        detection_timestamp: row.try_get("detection_timestamp")?,
        box_top_left_x: row.try_get("box_top_left_x")?,
        box_top_left_y: row.try_get("box_top_left_y")?,
        box_width: row.try_get("box_width")?,
        box_height: row.try_get("box_height")?,
    })
}

async fn insert_staged_messages(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[StagedMessage],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.stg_telegram_messages (message_id, channel_username, scraped_date, \
             message_text, message_timestamp_utc, views_count, forwards_count, replies_count, has_media, \
             media_type, media_file_name, media_mime_type, media_file_size, is_photo, is_document) ",
        );
        qb.push_values(chunk, |mut b, m| {
            b.push_bind(m.message_id)
                .push_bind(&m.channel_username)
                .push_bind(m.partition_date)
                .push_bind(&m.message_text)
                .push_bind(m.message_timestamp_utc)
                .push_bind(m.views_count)
                .push_bind(m.forwards_count)
                .push_bind(m.replies_count)
                .push_bind(m.has_media)
                .push_bind(&m.media_type)
                .push_bind(&m.media_file_name)
                .push_bind(&m.media_mime_type)
                .push_bind(m.media_file_size)
                .push_bind(m.is_photo)
                .push_bind(m.is_document);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_staged_detections(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[StagedDetection],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.stg_image_detections (detection_key, source_file, source_index, \
             message_id, detected_object_class, confidence_score, detection_timestamp, box_top_left_x, \
             box_top_left_y, box_width, box_height) ",
        );
        qb.push_values(chunk, |mut b, d| {
            b.push_bind(&d.detection_key)
                .push_bind(&d.source_file)
                .push_bind(d.source_index)
                .push_bind(d.message_id)
                .push_bind(&d.detected_object_class)
                .push_bind(d.confidence_score)
                .push_bind(d.detection_timestamp)
                .push_bind(d.box_top_left_x)
                .push_bind(d.box_top_left_y)
                .push_bind(d.box_width)
                .push_bind(d.box_height);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_channels(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[ChannelDim],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.dim_channels (channel_pk, channel_username) ",
        );
        qb.push_values(chunk, |mut b, c| {
            b.push_bind(&c.channel_pk).push_bind(&c.channel_username);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_dates(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[DateDim],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.dim_dates (date_pk, day, month, month_name, year, quarter, \
             day_of_week, day_of_year, iso_week, is_weekend) ",
        );
        qb.push_values(chunk, |mut b, d| {
            b.push_bind(d.date_pk)
                .push_bind(d.day)
                .push_bind(d.month)
                .push_bind(&d.month_name)
                .push_bind(d.year)
                .push_bind(d.quarter)
                .push_bind(d.day_of_week)
                .push_bind(d.day_of_year)
                .push_bind(d.iso_week)
                .push_bind(d.is_weekend);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_message_facts(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[MessageFact],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.fct_messages (message_id, channel_pk, date_pk, message_text, \
             message_timestamp_utc, has_media, views_count, forwards_count, replies_count, media_type, \
             media_file_name, media_mime_type, media_file_size, is_photo, is_document) ",
        );
        qb.push_values(chunk, |mut b, m| {
            b.push_bind(m.message_id)
                .push_bind(&m.channel_pk)
                .push_bind(m.date_pk)
                .push_bind(&m.message_text)
                .push_bind(m.message_timestamp_utc)
                .push_bind(m.has_media)
                .push_bind(m.views_count)
                .push_bind(m.forwards_count)
                .push_bind(m.replies_count)
                .push_bind(&m.media_type)
                .push_bind(&m.media_file_name)
                .push_bind(&m.media_mime_type)
                .push_bind(m.media_file_size)
                .push_bind(m.is_photo)
                .push_bind(m.is_document);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_detection_facts(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[ImageDetectionFact],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO analytics.fct_image_detections (detection_key, message_id, \
             detected_object_class, confidence_score, box_top_left_x, box_top_left_y, box_width, \
             box_height, detection_timestamp, loaded_at) ",
        );
        qb.push_values(chunk, |mut b, d| {
            b.push_bind(&d.detection_key)
                .push_bind(d.message_id)
                .push_bind(&d.detected_object_class)
                .push_bind(d.confidence_score)
                .push_bind(d.box_top_left_x)
                .push_bind(d.box_top_left_y)
                .push_bind(d.box_width)
                .push_bind(d.box_height)
                .push_bind(d.detection_timestamp)
                .push_bind(d.loaded_at);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}
