//! Append-only store of classification events.

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use halo_protocol::Label;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur in the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One successful classification. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEvent {
    pub id: Uuid,
    pub label: Label,
    pub confidence: f32,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

impl ClassificationEvent {
    pub fn new(label: Label, confidence: f32, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            confidence,
            observed_at,
        }
    }
}

/// Filters for reading events back, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub label: Option<Label>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Number of events for one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: Label,
    pub count: i64,
}

/// Per-label counts covering every label, zeros included, in model order.
fn complete_summary(counts: impl IntoIterator<Item = (Label, i64)>) -> Vec<LabelCount> {
    let mut summary: Vec<LabelCount> = Label::ALL
        .iter()
        .map(|&label| LabelCount { label, count: 0 })
        .collect();

    for (label, count) in counts {
        if let Some(entry) = summary.iter_mut().find(|c| c.label == label) {
            entry.count += count;
        }
    }
    summary
}

/// Where classification events are kept.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event.
    async fn append(&self, event: &ClassificationEvent) -> Result<(), StoreError>;

    /// Read events matching `query`, newest first.
    async fn query(&self, query: &EventQuery) -> Result<Vec<ClassificationEvent>, StoreError>;

    /// Count events per label observed at or after `since`.
    async fn summary(&self, since: Option<DateTime<Utc>>) -> Result<Vec<LabelCount>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Event store kept in process memory.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<ClassificationEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Snapshot of every stored event in insertion order.
    pub fn events(&self) -> Vec<ClassificationEvent> {
        self.events.read().clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &ClassificationEvent) -> Result<(), StoreError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<ClassificationEvent>, StoreError> {
        let mut matching: Vec<ClassificationEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| query.label.map_or(true, |l| e.label == l))
            .filter(|e| query.since.map_or(true, |s| e.observed_at >= s))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        if let Some(limit) = query.limit {
            matching.truncate(limit.max(0) as usize);
        }
        Ok(matching)
    }

    async fn summary(&self, since: Option<DateTime<Utc>>) -> Result<Vec<LabelCount>, StoreError> {
        let events = self.events.read();
        Ok(complete_summary(
            events
                .iter()
                .filter(|e| since.map_or(true, |s| e.observed_at >= s))
                .map(|e| (e.label, 1)),
        ))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    label: String,
    confidence: f32,
    observed_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ClassificationEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let label = row
            .label
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown label {:?} in event {}", row.label, row.id)))?;
        Ok(Self {
            id: row.id,
            label,
            confidence: row.confidence,
            observed_at: row.observed_at,
        })
    }
}

/// Event store backed by PostgreSQL.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Connect to PostgreSQL, retrying with exponential backoff for up to the
    /// configured connect timeout.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(config.connect_timeout()),
            ..Default::default()
        };

        let pool = backoff::future::retry(policy, || async {
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(config.connect_timeout())
                .idle_timeout(Some(config.idle_timeout()))
                .connect(&config.url)
                .await
                .map_err(|e| {
                    warn!(error = %e, "PostgreSQL connection failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, event), fields(event_id = %event.id, label = %event.label))]
    async fn append(&self, event: &ClassificationEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO classification_events (id, label, confidence, observed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.id)
        .bind(event.label.as_str())
        .bind(event.confidence)
        .bind(event.observed_at)
        .execute(&self.pool)
        .await?;

        debug!("Classification event stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &EventQuery) -> Result<Vec<ClassificationEvent>, StoreError> {
        let mut sql = String::from(
            r#"
            SELECT id, label, confidence, observed_at
            FROM classification_events
            WHERE 1=1
            "#,
        );
        let mut param_count = 0;

        if query.label.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND label = ${}", param_count));
        }
        if query.since.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND observed_at >= ${}", param_count));
        }

        sql.push_str(" ORDER BY observed_at DESC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${}", param_count));
        }

        let mut query_builder = sqlx::query_as::<_, EventRow>(&sql);
        if let Some(label) = query.label {
            query_builder = query_builder.bind(label.as_str());
        }
        if let Some(since) = query.since {
            query_builder = query_builder.bind(since);
        }
        if let Some(limit) = query.limit {
            query_builder = query_builder.bind(limit);
        }

        query_builder
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ClassificationEvent::try_from)
            .collect()
    }

    async fn summary(&self, since: Option<DateTime<Utc>>) -> Result<Vec<LabelCount>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT label, COUNT(*)
            FROM classification_events
            WHERE ($1::timestamptz IS NULL OR observed_at >= $1)
            GROUP BY label
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for (label, count) in rows {
            let label: Label = label
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("unknown label {:?}", label)))?;
            counts.push((label, count));
        }
        Ok(complete_summary(counts))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(minutes_ago)
    }

    #[test]
    fn test_event_serializes_label_and_timestamp() {
        let event = ClassificationEvent::new(Label::Paper, 0.91, Utc::now());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["label"], "paper");
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_summary_covers_every_label() {
        let summary = complete_summary([(Label::Plastic, 3), (Label::Paper, 1)]);
        assert_eq!(
            summary,
            vec![
                LabelCount { label: Label::Metal, count: 0 },
                LabelCount { label: Label::Paper, count: 1 },
                LabelCount { label: Label::Plastic, count: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_in_memory_query_newest_first() {
        let store = InMemoryEventStore::new();
        store.append(&ClassificationEvent::new(Label::Paper, 0.9, at(30))).await.unwrap();
        store.append(&ClassificationEvent::new(Label::Plastic, 0.8, at(5))).await.unwrap();
        store.append(&ClassificationEvent::new(Label::Paper, 0.7, at(10))).await.unwrap();

        let all = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].observed_at >= w[1].observed_at));
        assert_eq!(all[0].label, Label::Plastic);

        let paper = store
            .query(&EventQuery {
                label: Some(Label::Paper),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paper.len(), 1);
        assert!((paper[0].confidence - 0.7).abs() < 1e-6);

        let recent = store
            .query(&EventQuery {
                since: Some(at(15)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_summary_since() {
        let store = InMemoryEventStore::new();
        store.append(&ClassificationEvent::new(Label::Metal, 0.6, at(120))).await.unwrap();
        store.append(&ClassificationEvent::new(Label::Paper, 0.6, at(3))).await.unwrap();
        store.append(&ClassificationEvent::new(Label::Paper, 0.6, at(2))).await.unwrap();

        let summary = store.summary(Some(at(60))).await.unwrap();
        let count = |label| summary.iter().find(|c| c.label == label).unwrap().count;
        assert_eq!(count(Label::Metal), 0);
        assert_eq!(count(Label::Paper), 2);
        assert_eq!(count(Label::Plastic), 0);

        let total: i64 = store.summary(None).await.unwrap().iter().map(|c| c.count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_corrupt_row_rejected() {
        let row = EventRow {
            id: Uuid::new_v4(),
            label: "glass".to_string(),
            confidence: 0.5,
            observed_at: Utc::now(),
        };
        assert!(matches!(
            ClassificationEvent::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}
