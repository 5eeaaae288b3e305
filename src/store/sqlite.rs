//! SQLite implementation of the persistence gateway
//!
//! One connection behind `Arc<Mutex<_>>`, WAL journal, embedded idempotent
//! schema migrations from `sql/`. Every write runs inside a transaction.

use super::{
    from_millis, Checkpoint, ChronoPosition, HydrationCandidate, InteractionUpdate, NewPost, Post,
    PostRepository, StoreError, StoreResult,
};
use crate::hydrator::client::CredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Schema files, applied in order on every open (all use IF NOT EXISTS)
const MIGRATIONS: &[(&str, &str)] = &[
    ("00_post.sql", include_str!("../../sql/00_post.sql")),
    (
        "01_subscription_state.sql",
        include_str!("../../sql/01_subscription_state.sql"),
    ),
    ("02_session_state.sql", include_str!("../../sql/02_session_state.sql")),
    ("03_request_log.sql", include_str!("../../sql/03_request_log.sql")),
];

/// Row key for the upstream API session in `session_state`
const SESSION_SERVICE: &str = "atproto";

const POST_COLUMNS: &str =
    "uri, cid, author, reply_parent, reply_root, indexed_at, interactions, text";

/// Apply connection pragmas: WAL, relaxed fsync, larger page cache and a
/// generous busy timeout so the hydrator and ingestion loop can share a file.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -131_072i64)?;
    conn.busy_timeout(Duration::from_secs(30))?;
    log::debug!("📊 SQLite journal_mode={}", mode);
    Ok(())
}

/// Run the embedded schema migrations against `conn`
pub fn run_schema_migrations(conn: &Connection) -> StoreResult<()> {
    log::info!("🔧 Running {} schema migrations", MIGRATIONS.len());

    for &(file, sql) in MIGRATIONS {
        conn.execute_batch(sql)
            .map_err(|source| StoreError::Migration { file, source })?;
        log::debug!("   ├─ ✅ {}", file);
    }

    Ok(())
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        uri: row.get(0)?,
        cid: row.get(1)?,
        author: row.get(2)?,
        reply_parent: row.get(3)?,
        reply_root: row.get(4)?,
        indexed_at: from_millis(row.get(5)?),
        interactions: row.get(6)?,
        text: row.get(7)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let last_indexed_at: Option<i64> = row.get(2)?;
    Ok(Checkpoint {
        service: row.get(0)?,
        cursor: row.get(1)?,
        last_indexed_at: last_indexed_at.map(from_millis),
    })
}

/// SQLite-backed [`PostRepository`] and [`CredentialStore`]
#[derive(Debug, Clone)]
pub struct SqlitePostStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqlitePostStore {
    /// Open (or create) the database at `db_path` and bring the schema up to date
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_schema_migrations(&conn)?;

        log::info!("✅ SQLite store ready at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl PostRepository for SqlitePostStore {
    async fn get_checkpoint(&self, service: &str) -> StoreResult<Option<Checkpoint>> {
        let conn = self.conn()?;
        let checkpoint = conn
            .query_row(
                "SELECT service, cursor, last_indexed_at FROM subscription_state WHERE service = ?1",
                params![service],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    async fn load_or_init_checkpoint(&self, service: &str) -> StoreResult<Checkpoint> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO subscription_state (service, cursor) VALUES (?1, 0)",
            params![service],
        )?;
        if created > 0 {
            log::info!("📍 Initialized subscription state for {} at cursor 0", service);
        }

        let checkpoint = conn.query_row(
            "SELECT service, cursor, last_indexed_at FROM subscription_state WHERE service = ?1",
            params![service],
            checkpoint_from_row,
        )?;
        Ok(checkpoint)
    }

    async fn save_checkpoint(
        &self,
        service: &str,
        cursor: i64,
        last_indexed_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO subscription_state (service, cursor, last_indexed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(service) DO UPDATE SET
                cursor = MAX(subscription_state.cursor, excluded.cursor),
                last_indexed_at = excluded.last_indexed_at
            "#,
            params![service, cursor, last_indexed_at.timestamp_millis()],
        )?;
        let stored: i64 = tx.query_row(
            "SELECT cursor FROM subscription_state WHERE service = ?1",
            params![service],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(stored)
    }

    async fn batch_upsert_posts(&self, posts: &[NewPost]) -> StoreResult<usize> {
        if posts.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO post (uri, cid, author, reply_parent, reply_root, indexed_at, interactions, text)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                ON CONFLICT(uri) DO UPDATE SET
                    cid = excluded.cid,
                    author = excluded.author,
                    reply_parent = excluded.reply_parent,
                    reply_root = excluded.reply_root,
                    text = COALESCE(excluded.text, post.text)
                "#,
            )?;

            for post in posts {
                written += stmt.execute(params![
                    post.uri,
                    post.cid,
                    post.author,
                    post.reply_parent,
                    post.reply_root,
                    post.indexed_at.timestamp_millis(),
                    post.text,
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    async fn batch_delete_posts(&self, uris: &[String]) -> StoreResult<usize> {
        if uris.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;

        {
            let mut stmt = tx.prepare_cached("DELETE FROM post WHERE uri = ?1")?;
            for uri in uris {
                deleted += stmt.execute(params![uri])?;
            }
        }

        tx.commit()?;
        Ok(deleted)
    }

    async fn query_chronological(
        &self,
        after: Option<&ChronoPosition>,
        exclude: &[String],
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let mut sql = format!("SELECT {POST_COLUMNS} FROM post WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::with_capacity(exclude.len() + 4);

        if let Some(position) = after {
            sql.push_str(" AND (indexed_at < ? OR (indexed_at = ? AND uri < ?))");
            values.push(Value::Integer(position.indexed_at_ms));
            values.push(Value::Integer(position.indexed_at_ms));
            values.push(Value::Text(position.uri.clone()));
        }

        if !exclude.is_empty() {
            let placeholders = vec!["?"; exclude.len()].join(", ");
            sql.push_str(&format!(" AND uri NOT IN ({placeholders})"));
            values.extend(exclude.iter().cloned().map(Value::Text));
        }

        sql.push_str(" ORDER BY indexed_at DESC, uri DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let posts = stmt
            .query_map(params_from_iter(values.iter()), post_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    async fn query_ranked(
        &self,
        since: DateTime<Utc>,
        min_interactions: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM post
             WHERE indexed_at > ?1 AND interactions >= ?2
             ORDER BY interactions DESC, indexed_at DESC, uri DESC
             LIMIT ?3 OFFSET ?4"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let posts = stmt
            .query_map(
                params![
                    since.timestamp_millis(),
                    min_interactions,
                    limit as i64,
                    offset as i64
                ],
                post_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    async fn posts_indexed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<HydrationCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT uri, interactions, text IS NOT NULL FROM post
             WHERE indexed_at >= ?1
             ORDER BY indexed_at DESC",
        )?;
        let candidates = stmt
            .query_map(params![since.timestamp_millis()], |row| {
                Ok(HydrationCandidate {
                    uri: row.get(0)?,
                    interactions: row.get(1)?,
                    has_text: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }

    async fn bulk_update_interactions(&self, updates: &[InteractionUpdate]) -> StoreResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;

        {
            let mut stmt = tx.prepare_cached(
                r#"
                UPDATE post
                SET interactions = ?1, text = COALESCE(text, ?2)
                WHERE uri = ?3
                  AND (interactions != ?1 OR (text IS NULL AND ?2 IS NOT NULL))
                "#,
            )?;

            for update in updates {
                changed += stmt.execute(params![update.interactions, update.text, update.uri])?;
            }
        }

        tx.commit()?;
        Ok(changed)
    }

    async fn log_request(&self, requester: Option<&str>, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO request_log (indexed_at, did) VALUES (?1, ?2)",
            params![at.timestamp_millis(), requester],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqlitePostStore {
    async fn get(&self) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT session_string FROM session_state WHERE service = ?1",
                params![SESSION_SERVICE],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(session.flatten())
    }

    async fn put(&self, token: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO session_state (service, session_string) VALUES (?1, ?2)
            ON CONFLICT(service) DO UPDATE SET session_string = excluded.session_string
            "#,
            params![SESSION_SERVICE, token],
        )?;
        log::info!("🔑 Session saved to database");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    pub(crate) fn create_test_store() -> (NamedTempFile, SqlitePostStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqlitePostStore::open(temp_file.path()).unwrap();
        (temp_file, store)
    }

    pub(crate) fn make_post(uri: &str, indexed_at: DateTime<Utc>) -> NewPost {
        NewPost {
            uri: uri.to_string(),
            cid: format!("cid-{}", uri.rsplit('/').next().unwrap()),
            author: "did:plc:author".to_string(),
            reply_parent: None,
            reply_root: None,
            indexed_at,
            text: Some("words of radiance".to_string()),
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 1, 12, 0, 0).unwrap()
    }

    fn count_posts(store: &SqlitePostStore) -> i64 {
        store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM post", [], |row| row.get(0))
            .unwrap()
    }

    fn set_interactions(store: &SqlitePostStore, uri: &str, interactions: i64) {
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE post SET interactions = ?1 WHERE uri = ?2",
                params![interactions, uri],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_reingesting_same_uri_never_duplicates() {
        let (_temp, store) = create_test_store();
        let post = make_post("at://did:plc:a/app.bsky.feed.post/1", base_time());

        store.batch_upsert_posts(&[post.clone()]).await.unwrap();
        set_interactions(&store, &post.uri, 42);

        let mut replayed = post.clone();
        replayed.cid = "cid-new".to_string();
        replayed.indexed_at = base_time() + ChronoDuration::hours(1);
        store.batch_upsert_posts(&[replayed]).await.unwrap();

        assert_eq!(count_posts(&store), 1);
        let stored = store.query_chronological(None, &[], 10).await.unwrap();
        assert_eq!(stored[0].cid, "cid-new");
        assert_eq!(stored[0].interactions, 42); // score survives replay
        assert_eq!(stored[0].indexed_at, base_time()); // sort key survives replay
    }

    #[tokio::test]
    async fn test_batch_delete_is_unconditional() {
        let (_temp, store) = create_test_store();
        let posts = vec![
            make_post("at://did:plc:a/app.bsky.feed.post/1", base_time()),
            make_post("at://did:plc:a/app.bsky.feed.post/2", base_time()),
        ];
        store.batch_upsert_posts(&posts).await.unwrap();

        let deleted = store
            .batch_delete_posts(&[
                "at://did:plc:a/app.bsky.feed.post/1".to_string(),
                "at://did:plc:a/app.bsky.feed.post/never-stored".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(count_posts(&store), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_initialized_at_zero() {
        let (_temp, store) = create_test_store();

        assert!(store.get_checkpoint("firehose").await.unwrap().is_none());

        let checkpoint = store.load_or_init_checkpoint("firehose").await.unwrap();
        assert_eq!(checkpoint.cursor, 0);
        assert!(checkpoint.last_indexed_at.is_none());
        assert!(store.get_checkpoint("firehose").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_never_decreases() {
        let (_temp, store) = create_test_store();

        assert_eq!(store.save_checkpoint("firehose", 20_000, base_time()).await.unwrap(), 20_000);
        assert_eq!(store.save_checkpoint("firehose", 10_000, base_time()).await.unwrap(), 20_000);
        assert_eq!(store.save_checkpoint("firehose", 30_000, base_time()).await.unwrap(), 30_000);

        let checkpoint = store.load_or_init_checkpoint("firehose").await.unwrap();
        assert_eq!(checkpoint.cursor, 30_000);
        assert_eq!(checkpoint.last_indexed_at, Some(base_time()));
    }

    #[tokio::test]
    async fn test_chronological_order_and_resume() {
        let (_temp, store) = create_test_store();
        let t = base_time();
        store
            .batch_upsert_posts(&[
                make_post("at://did:plc:a/app.bsky.feed.post/a", t),
                make_post("at://did:plc:a/app.bsky.feed.post/b", t),
                make_post("at://did:plc:a/app.bsky.feed.post/c", t - ChronoDuration::minutes(1)),
                make_post("at://did:plc:a/app.bsky.feed.post/d", t + ChronoDuration::minutes(1)),
            ])
            .await
            .unwrap();

        let first = store.query_chronological(None, &[], 2).await.unwrap();
        let uris: Vec<_> = first.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "at://did:plc:a/app.bsky.feed.post/d",
                "at://did:plc:a/app.bsky.feed.post/b",
            ]
        );

        // Resume strictly after "b": same timestamp, smaller uri first
        let rest = store
            .query_chronological(Some(&first[1].position()), &[], 10)
            .await
            .unwrap();
        let uris: Vec<_> = rest.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "at://did:plc:a/app.bsky.feed.post/a",
                "at://did:plc:a/app.bsky.feed.post/c",
            ]
        );
    }

    #[tokio::test]
    async fn test_chronological_excludes_uris() {
        let (_temp, store) = create_test_store();
        let t = base_time();
        store
            .batch_upsert_posts(&[
                make_post("at://did:plc:a/app.bsky.feed.post/a", t),
                make_post("at://did:plc:a/app.bsky.feed.post/b", t - ChronoDuration::seconds(1)),
            ])
            .await
            .unwrap();

        let posts = store
            .query_chronological(None, &["at://did:plc:a/app.bsky.feed.post/a".to_string()], 10)
            .await
            .unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].uri, "at://did:plc:a/app.bsky.feed.post/b");
    }

    #[tokio::test]
    async fn test_ranked_threshold_window_and_offset() {
        let (_temp, store) = create_test_store();
        let now = base_time();
        store
            .batch_upsert_posts(&[
                make_post("at://did:plc:a/app.bsky.feed.post/hot", now - ChronoDuration::hours(1)),
                make_post("at://did:plc:a/app.bsky.feed.post/warm", now - ChronoDuration::hours(2)),
                make_post("at://did:plc:a/app.bsky.feed.post/cold", now - ChronoDuration::hours(3)),
                make_post("at://did:plc:a/app.bsky.feed.post/stale", now - ChronoDuration::hours(30)),
            ])
            .await
            .unwrap();
        set_interactions(&store, "at://did:plc:a/app.bsky.feed.post/hot", 500);
        set_interactions(&store, "at://did:plc:a/app.bsky.feed.post/warm", 40);
        set_interactions(&store, "at://did:plc:a/app.bsky.feed.post/cold", 29);
        set_interactions(&store, "at://did:plc:a/app.bsky.feed.post/stale", 900);

        let since = now - ChronoDuration::hours(24);
        let ranked = store.query_ranked(since, 30, 0, 10).await.unwrap();
        let uris: Vec<_> = ranked.iter().map(|p| p.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "at://did:plc:a/app.bsky.feed.post/hot",
                "at://did:plc:a/app.bsky.feed.post/warm",
            ]
        );

        let page_two = store.query_ranked(since, 30, 1, 10).await.unwrap();
        assert_eq!(page_two.len(), 1);
        assert_eq!(page_two[0].uri, "at://did:plc:a/app.bsky.feed.post/warm");
    }

    #[tokio::test]
    async fn test_bulk_update_only_touches_changed_rows() {
        let (_temp, store) = create_test_store();
        let mut without_text = make_post("at://did:plc:a/app.bsky.feed.post/2", base_time());
        without_text.text = None;
        store
            .batch_upsert_posts(&[
                make_post("at://did:plc:a/app.bsky.feed.post/1", base_time()),
                without_text,
            ])
            .await
            .unwrap();

        let changed = store
            .bulk_update_interactions(&[
                // unchanged score, text already present
                InteractionUpdate {
                    uri: "at://did:plc:a/app.bsky.feed.post/1".to_string(),
                    interactions: 0,
                    text: Some("ignored".to_string()),
                },
                // unchanged score but text can be backfilled
                InteractionUpdate {
                    uri: "at://did:plc:a/app.bsky.feed.post/2".to_string(),
                    interactions: 0,
                    text: Some("backfilled".to_string()),
                },
            ])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let changed = store
            .bulk_update_interactions(&[InteractionUpdate {
                uri: "at://did:plc:a/app.bsky.feed.post/1".to_string(),
                interactions: 232,
                text: None,
            }])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let posts = store.query_chronological(None, &[], 10).await.unwrap();
        let one = posts.iter().find(|p| p.uri.ends_with("/1")).unwrap();
        let two = posts.iter().find(|p| p.uri.ends_with("/2")).unwrap();
        assert_eq!(one.interactions, 232);
        assert_eq!(one.text.as_deref(), Some("words of radiance"));
        assert_eq!(two.text.as_deref(), Some("backfilled"));
    }

    #[tokio::test]
    async fn test_posts_indexed_since() {
        let (_temp, store) = create_test_store();
        let now = base_time();
        store
            .batch_upsert_posts(&[
                make_post("at://did:plc:a/app.bsky.feed.post/new", now - ChronoDuration::days(1)),
                make_post("at://did:plc:a/app.bsky.feed.post/old", now - ChronoDuration::days(5)),
            ])
            .await
            .unwrap();

        let candidates = store
            .posts_indexed_since(now - ChronoDuration::days(3))
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].uri, "at://did:plc:a/app.bsky.feed.post/new");
        assert!(candidates[0].has_text);
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (_temp, store) = create_test_store();

        assert!(CredentialStore::get(&store).await.unwrap().is_none());
        store.put("token-1").await.unwrap();
        store.put("token-2").await.unwrap();
        assert_eq!(CredentialStore::get(&store).await.unwrap().as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn test_request_log() {
        let (_temp, store) = create_test_store();
        store.log_request(Some("did:plc:reader"), base_time()).await.unwrap();
        store.log_request(None, base_time()).await.unwrap();

        let count: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM request_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
