//! Metadata store: the relational database is the source of truth for all
//! references between accounts, repos, blobs, manifests and tags. Blob and
//! manifest contents live in the storage driver; the write discipline
//! (storage before DB commit for creates, DB before storage for deletes)
//! is enforced by the processor, not here.

pub mod models;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteExecutor};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub use models::*;

pub type DbPool = Pool<Sqlite>;

/// Ordered schema migrations; each entry runs at most once, tracked in
/// `schema_migrations` by index.
const MIGRATIONS: &[&str] = &[
    // 0: initial schema
    r#"
    CREATE TABLE accounts (
        name TEXT PRIMARY KEY,
        auth_tenant_id TEXT NOT NULL,
        upstream_peer_hostname TEXT NOT NULL DEFAULT '',
        external_peer_url TEXT NOT NULL DEFAULT '',
        external_peer_username TEXT NOT NULL DEFAULT '',
        external_peer_password TEXT NOT NULL DEFAULT '',
        platform_filter TEXT NOT NULL DEFAULT '',
        gc_policies_json TEXT NOT NULL DEFAULT '[]',
        rbac_policies_json TEXT NOT NULL DEFAULT '[]',
        tag_policies_json TEXT NOT NULL DEFAULT '[]',
        validation_policy_json TEXT NOT NULL DEFAULT '',
        security_scan_policies_json TEXT NOT NULL DEFAULT '[]',
        is_deleting INTEGER NOT NULL DEFAULT FALSE,
        is_managed INTEGER NOT NULL DEFAULT FALSE,
        next_blob_sweep_at INTEGER,
        next_storage_sweep_at INTEGER,
        next_federation_announcement_at INTEGER,
        next_deletion_attempt_at INTEGER
    );

    CREATE TABLE repos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name TEXT NOT NULL REFERENCES accounts(name),
        name TEXT NOT NULL,
        next_blob_mount_sweep_at INTEGER,
        next_manifest_sync_at INTEGER,
        next_gc_at INTEGER,
        UNIQUE (account_name, name)
    );

    CREATE TABLE blobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name TEXT NOT NULL REFERENCES accounts(name),
        digest TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        storage_id TEXT NOT NULL,
        media_type TEXT NOT NULL DEFAULT '',
        pushed_at INTEGER NOT NULL,
        next_validation_at INTEGER NOT NULL,
        validation_error_message TEXT NOT NULL DEFAULT '',
        can_be_deleted_at INTEGER,
        UNIQUE (account_name, digest)
    );

    CREATE TABLE blob_mounts (
        blob_id INTEGER NOT NULL REFERENCES blobs(id) ON DELETE CASCADE,
        repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        can_be_deleted_at INTEGER,
        UNIQUE (blob_id, repo_id)
    );

    CREATE TABLE manifests (
        repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        digest TEXT NOT NULL,
        media_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        pushed_at INTEGER NOT NULL,
        last_pulled_at INTEGER,
        next_validation_at INTEGER NOT NULL,
        validation_error_message TEXT NOT NULL DEFAULT '',
        labels_json TEXT NOT NULL DEFAULT '',
        min_layer_created_at INTEGER,
        max_layer_created_at INTEGER,
        PRIMARY KEY (repo_id, digest)
    );

    CREATE TABLE manifest_contents (
        repo_id INTEGER NOT NULL,
        digest TEXT NOT NULL,
        content BLOB NOT NULL,
        PRIMARY KEY (repo_id, digest),
        FOREIGN KEY (repo_id, digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );

    CREATE TABLE manifest_blob_refs (
        repo_id INTEGER NOT NULL,
        digest TEXT NOT NULL,
        blob_id INTEGER NOT NULL REFERENCES blobs(id),
        UNIQUE (repo_id, digest, blob_id),
        FOREIGN KEY (repo_id, digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );

    CREATE TABLE manifest_manifest_refs (
        repo_id INTEGER NOT NULL,
        parent_digest TEXT NOT NULL,
        child_digest TEXT NOT NULL,
        UNIQUE (repo_id, parent_digest, child_digest),
        FOREIGN KEY (repo_id, parent_digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );

    CREATE TABLE tags (
        repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        digest TEXT NOT NULL,
        pushed_at INTEGER NOT NULL,
        last_pulled_at INTEGER,
        PRIMARY KEY (repo_id, name)
    );

    CREATE TABLE uploads (
        repo_id INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        uuid TEXT NOT NULL,
        storage_id TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        num_chunks INTEGER NOT NULL,
        hash_state TEXT NOT NULL DEFAULT '',
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (repo_id, uuid)
    );

    CREATE TABLE pending_blobs (
        account_name TEXT NOT NULL REFERENCES accounts(name),
        digest TEXT NOT NULL,
        reason TEXT NOT NULL,
        pending_since INTEGER NOT NULL,
        PRIMARY KEY (account_name, digest)
    );

    CREATE TABLE quotas (
        auth_tenant_id TEXT PRIMARY KEY,
        max_manifests INTEGER NOT NULL
    );

    CREATE TABLE peers (
        hostname TEXT PRIMARY KEY,
        our_password TEXT NOT NULL DEFAULT '',
        their_current_password_hash TEXT NOT NULL DEFAULT '',
        their_previous_password_hash TEXT NOT NULL DEFAULT '',
        last_peered_at INTEGER,
        use_for_pull_delegation INTEGER NOT NULL DEFAULT FALSE
    );

    CREATE TABLE security_info (
        repo_id INTEGER NOT NULL,
        digest TEXT NOT NULL,
        vuln_status TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        next_check_at INTEGER NOT NULL,
        checked_at INTEGER,
        has_enriched_report INTEGER NOT NULL DEFAULT FALSE,
        PRIMARY KEY (repo_id, digest),
        FOREIGN KEY (repo_id, digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );
    "#,
    // 1: job-clock indexes for the janitor's due-time producers
    r#"
    CREATE INDEX idx_blobs_next_validation ON blobs (next_validation_at);
    CREATE INDEX idx_manifests_next_validation ON manifests (next_validation_at);
    CREATE INDEX idx_blobs_account ON blobs (account_name);
    CREATE INDEX idx_repos_account ON repos (account_name);
    "#,
    // 2: mark-and-sweep bookkeeping for storage objects without a DB record
    r#"
    CREATE TABLE unknown_blobs (
        account_name TEXT NOT NULL,
        storage_id TEXT NOT NULL,
        can_be_deleted_at INTEGER NOT NULL,
        PRIMARY KEY (account_name, storage_id)
    );

    CREATE TABLE unknown_manifests (
        account_name TEXT NOT NULL,
        repo_name TEXT NOT NULL,
        digest TEXT NOT NULL,
        can_be_deleted_at INTEGER NOT NULL,
        PRIMARY KEY (account_name, repo_name, digest)
    );
    "#,
];

pub async fn connect(url: &str) -> Result<DbPool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // SQLite permits limited write concurrency; a single connection avoids
    // "database is locked" failures under concurrent handlers.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_migrations (idx INTEGER PRIMARY KEY)")
        .execute(pool)
        .await?;

    for (idx, step) in MIGRATIONS.iter().enumerate() {
        let idx = idx as i64;
        let applied: Option<(i64,)> = sqlx::query_as("SELECT idx FROM schema_migrations WHERE idx = $1")
            .bind(idx)
            .fetch_optional(pool)
            .await?;
        if applied.is_some() {
            continue;
        }

        debug!("applying schema migration {idx}");
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(step).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (idx) VALUES ($1)")
            .bind(idx)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

pub async fn find_account(
    ex: impl SqliteExecutor<'_>,
    name: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM accounts WHERE name = $1")
        .bind(name)
        .fetch_optional(ex)
        .await
}

pub async fn find_repo(
    ex: impl SqliteExecutor<'_>,
    account_name: &str,
    repo_name: &str,
) -> Result<Option<Repo>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM repos WHERE account_name = $1 AND name = $2")
        .bind(account_name)
        .bind(repo_name)
        .fetch_optional(ex)
        .await
}

pub async fn get_or_create_repo(
    pool: &DbPool,
    account_name: &str,
    repo_name: &str,
) -> Result<Repo, sqlx::Error> {
    sqlx::query("INSERT INTO repos (account_name, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(account_name)
        .bind(repo_name)
        .execute(pool)
        .await?;
    sqlx::query_as("SELECT * FROM repos WHERE account_name = $1 AND name = $2")
        .bind(account_name)
        .bind(repo_name)
        .fetch_one(pool)
        .await
}

pub async fn find_blob(
    ex: impl SqliteExecutor<'_>,
    account_name: &str,
    digest: &str,
) -> Result<Option<Blob>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM blobs WHERE account_name = $1 AND digest = $2")
        .bind(account_name)
        .bind(digest)
        .fetch_optional(ex)
        .await
}

/// Finds a blob by digest, but only if it is mounted into the given repo.
/// This is the visibility rule for all registry API blob reads.
pub async fn find_blob_in_repo(
    ex: impl SqliteExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Option<Blob>, sqlx::Error> {
    sqlx::query_as(
        "SELECT b.* FROM blobs b
           JOIN blob_mounts bm ON bm.blob_id = b.id
          WHERE bm.repo_id = $1 AND b.digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(ex)
    .await
}

/// Makes a blob visible in a repository. Idempotent; a fresh mount always
/// starts out unmarked for deletion.
pub async fn mount_blob(
    ex: impl SqliteExecutor<'_>,
    blob_id: i64,
    repo_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2)
         ON CONFLICT (blob_id, repo_id) DO UPDATE SET can_be_deleted_at = NULL",
    )
    .bind(blob_id)
    .bind(repo_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn find_manifest(
    ex: impl SqliteExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Option<Manifest>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(ex)
        .await
}

pub async fn find_manifest_content(
    ex: impl SqliteExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Option<Vec<u8>>, sqlx::Error> {
    let row: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT content FROM manifest_contents WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .fetch_optional(ex)
            .await?;
    Ok(row.map(|(content,)| content))
}

pub async fn find_tag(
    ex: impl SqliteExecutor<'_>,
    repo_id: i64,
    name: &str,
) -> Result<Option<Tag>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_id)
        .bind(name)
        .fetch_optional(ex)
        .await
}

pub async fn find_upload(
    ex: impl SqliteExecutor<'_>,
    repo_id: i64,
    uuid: &str,
) -> Result<Option<Upload>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(repo_id)
        .bind(uuid)
        .fetch_optional(ex)
        .await
}

pub async fn find_peer(
    ex: impl SqliteExecutor<'_>,
    hostname: &str,
) -> Result<Option<Peer>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM peers WHERE hostname = $1")
        .bind(hostname)
        .fetch_optional(ex)
        .await
}

pub async fn find_quota(
    ex: impl SqliteExecutor<'_>,
    auth_tenant_id: &str,
) -> Result<Option<Quota>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM quotas WHERE auth_tenant_id = $1")
        .bind(auth_tenant_id)
        .fetch_optional(ex)
        .await
}

/// Counts the manifests owned by a tenant, across all of its accounts.
pub async fn manifest_count_for_tenant(
    ex: impl SqliteExecutor<'_>,
    auth_tenant_id: &str,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM manifests m
           JOIN repos r ON m.repo_id = r.id
           JOIN accounts a ON r.account_name = a.name
          WHERE a.auth_tenant_id = $1",
    )
    .bind(auth_tenant_id)
    .fetch_one(ex)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub async fn test_pool() -> DbPool {
        connect("sqlite::memory:").await.expect("failed to open in-memory database")
    }

    async fn insert_test_account(pool: &DbPool, name: &str) {
        sqlx::query("INSERT INTO accounts (name, auth_tenant_id) VALUES ($1, 'tenant1')")
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_account_round_trip() {
        let pool = test_pool().await;
        insert_test_account(&pool, "library").await;

        let account = find_account(&pool, "library").await.unwrap().unwrap();
        assert_eq!(account.auth_tenant_id, "tenant1");
        assert!(!account.is_replica());
        assert!(account.next_blob_sweep_at.is_none());

        assert!(find_account(&pool, "no-such").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_repo_is_idempotent() {
        let pool = test_pool().await;
        insert_test_account(&pool, "library").await;

        let repo1 = get_or_create_repo(&pool, "library", "alpine").await.unwrap();
        let repo2 = get_or_create_repo(&pool, "library", "alpine").await.unwrap();
        assert_eq!(repo1.id, repo2.id);
        assert_eq!(repo1.full_name(), "library/alpine");
    }

    #[tokio::test]
    async fn test_blob_mount_visibility() {
        let pool = test_pool().await;
        insert_test_account(&pool, "library").await;
        let repo = get_or_create_repo(&pool, "library", "alpine").await.unwrap();

        sqlx::query(
            "INSERT INTO blobs (account_name, digest, size_bytes, storage_id, pushed_at, next_validation_at)
             VALUES ('library', 'sha256:abc', 42, 'sid', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let blob = find_blob(&pool, "library", "sha256:abc").await.unwrap().unwrap();

        // not mounted yet: invisible in the repo
        assert!(find_blob_in_repo(&pool, repo.id, "sha256:abc").await.unwrap().is_none());

        mount_blob(&pool, blob.id, repo.id).await.unwrap();
        let visible = find_blob_in_repo(&pool, repo.id, "sha256:abc").await.unwrap().unwrap();
        assert_eq!(visible.id, blob.id);

        // mounting again clears a deletion marker
        sqlx::query("UPDATE blob_mounts SET can_be_deleted_at = 123 WHERE blob_id = $1")
            .bind(blob.id)
            .execute(&pool)
            .await
            .unwrap();
        mount_blob(&pool, blob.id, repo.id).await.unwrap();
        let (marker,): (Option<i64>,) =
            sqlx::query_as("SELECT can_be_deleted_at FROM blob_mounts WHERE blob_id = $1")
                .bind(blob.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(marker.is_none());
    }
}
