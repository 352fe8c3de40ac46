//! Durable device and message records over embedded SQLite.
//!
//! Every method is a single statement; writes are committed before the call
//! returns. The pool runs in WAL mode so concurrent readers do not block the
//! writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::AppError;
use crate::models::{Device, DeviceKind, Message};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Fields for a device row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_key: String,
    pub kind: DeviceKind,
    pub device_token: String,
    pub public_key: String,
    pub name: String,
}

/// Fields for a message row about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub device_id: i64,
    pub message_id: String,
    pub title: String,
    pub body: String,
    pub group: String,
    pub icon: String,
    pub url: String,
    pub sound: String,
    pub badge: i64,
    pub encrypted_payload: Vec<u8>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `db_path` and run migrations.
    pub async fn connect(db_path: &str) -> Result<Self, AppError> {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| AppError::StartServer(format!("create db dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store for tests.
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AppError::StartServer(format!("db options: {e}")))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    pub async fn get_device(&self, device_key: &str) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, device_key, device_type, device_token, public_key, name, created_at, last_seen \
             FROM devices WHERE device_key = ?",
        )
        .bind(device_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn create_device(&self, new: &NewDevice) -> Result<Device, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO devices (device_key, device_type, device_token, public_key, name, created_at, last_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.device_key)
        .bind(new.kind)
        .bind(&new.device_token)
        .bind(&new.public_key)
        .bind(&new.name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Device {
            id: result.last_insert_rowid(),
            device_key: new.device_key.clone(),
            kind: new.kind,
            device_token: new.device_token.clone(),
            public_key: new.public_key.clone(),
            name: new.name.clone(),
            created_at: now,
            last_seen: now,
        })
    }

    pub async fn update_device(&self, device: &Device) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE devices SET device_type = ?, device_token = ?, public_key = ?, name = ?, last_seen = ? \
             WHERE device_key = ?",
        )
        .bind(device.kind)
        .bind(&device.device_token)
        .bind(&device.public_key)
        .bind(&device.name)
        .bind(Utc::now())
        .bind(&device.device_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set the provider token; an empty string clears it (invalidation).
    pub async fn update_device_token(&self, device_key: &str, token: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET device_token = ?, last_seen = ? WHERE device_key = ?")
            .bind(token)
            .bind(Utc::now())
            .bind(device_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_device_last_seen(&self, device_key: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE device_key = ?")
            .bind(Utc::now())
            .bind(device_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_devices(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn create_message(&self, new: &NewMessage) -> Result<Message, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (device_id, message_id, title, body, group_name, icon, url, sound, badge, encrypted_payload, created_at, delivered) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE)",
        )
        .bind(new.device_id)
        .bind(&new.message_id)
        .bind(&new.title)
        .bind(&new.body)
        .bind(&new.group)
        .bind(&new.icon)
        .bind(&new.url)
        .bind(&new.sound)
        .bind(new.badge)
        .bind(&new.encrypted_payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            device_id: new.device_id,
            message_id: new.message_id.clone(),
            title: new.title.clone(),
            body: new.body.clone(),
            group: new.group.clone(),
            icon: new.icon.clone(),
            url: new.url.clone(),
            sound: new.sound.clone(),
            badge: new.badge,
            encrypted_payload: new.encrypted_payload.clone(),
            created_at: now,
            delivered: false,
        })
    }

    /// Idempotent: repeated calls leave the row delivered.
    pub async fn mark_message_delivered(&self, message_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE messages SET delivered = TRUE WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Undelivered messages for a device, oldest first.
    pub async fn get_undelivered(&self, device_id: i64) -> Result<Vec<Message>, AppError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, device_id, message_id, title, body, group_name, icon, url, sound, badge, encrypted_payload, created_at, delivered \
             FROM messages WHERE device_id = ? AND delivered = FALSE \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Delete messages older than `age`; returns the number removed.
    pub async fn delete_older_than(&self, age: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|e| AppError::BadRequest(format!("invalid age: {e}")))?;
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::connect_in_memory().await.unwrap()
    }

    fn android_device(key: &str) -> NewDevice {
        NewDevice {
            device_key: key.into(),
            kind: DeviceKind::Android,
            device_token: String::new(),
            public_key: String::new(),
            name: String::new(),
        }
    }

    fn message(device_id: i64, message_id: &str, body: &str) -> NewMessage {
        NewMessage {
            device_id,
            message_id: message_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_device() {
        let store = store().await;
        let created = store.create_device(&android_device("k1")).await.unwrap();
        assert!(created.id > 0);

        let found = store.get_device("k1").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.kind, DeviceKind::Android);

        assert!(store.get_device("missing").await.unwrap().is_none());
        assert_eq!(store.count_devices().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_device_key_rejected() {
        let store = store().await;
        store.create_device(&android_device("dup")).await.unwrap();
        assert!(store.create_device(&android_device("dup")).await.is_err());
    }

    #[tokio::test]
    async fn update_device_token_clears_on_empty() {
        let store = store().await;
        let mut dev = android_device("ios1");
        dev.kind = DeviceKind::Ios;
        dev.device_token = "tok".into();
        store.create_device(&dev).await.unwrap();

        store.update_device_token("ios1", "").await.unwrap();
        let found = store.get_device("ios1").await.unwrap().unwrap();
        assert!(found.device_token.is_empty());
    }

    #[tokio::test]
    async fn undelivered_returned_in_creation_order() {
        let store = store().await;
        let dev = store.create_device(&android_device("ord")).await.unwrap();

        for (i, body) in ["m1", "m2", "m3"].iter().enumerate() {
            store
                .create_message(&message(dev.id, &format!("id-{i}"), body))
                .await
                .unwrap();
        }

        let pending = store.get_undelivered(dev.id).await.unwrap();
        assert_eq!(
            pending.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2", "m3"]
        );
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent() {
        let store = store().await;
        let dev = store.create_device(&android_device("ack")).await.unwrap();
        store
            .create_message(&message(dev.id, "mid", "hello"))
            .await
            .unwrap();

        store.mark_message_delivered("mid").await.unwrap();
        store.mark_message_delivered("mid").await.unwrap();

        assert!(store.get_undelivered(dev.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_older_than_sweeps_by_age() {
        let store = store().await;
        let dev = store.create_device(&android_device("ttl")).await.unwrap();
        store
            .create_message(&message(dev.id, "fresh", "keep me"))
            .await
            .unwrap();

        // Nothing is older than a day yet.
        assert_eq!(
            store
                .delete_older_than(Duration::from_secs(86_400))
                .await
                .unwrap(),
            0
        );
        // Everything is older than zero seconds.
        assert_eq!(
            store.delete_older_than(Duration::from_secs(0)).await.unwrap(),
            1
        );
        assert!(store.get_undelivered(dev.id).await.unwrap().is_empty());
    }
}
