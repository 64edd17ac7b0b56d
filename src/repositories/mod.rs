//! Repository pattern implementation for data access
//!
//! The core consumes rooms and configuration through these traits; the
//! sqlite implementations below are the only concrete storage. Trait-based
//! interfaces keep the monitor and web layer testable with in-memory stubs.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use crate::errors::AppError;
use crate::models::{ConfigEntry, Platform, Room, RoomAddInfo};

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn get_enabled_rooms(&self) -> Result<Vec<Room>, AppError>;
    async fn get_room_by_id(&self, id: i64) -> Result<Option<Room>, AppError>;
    async fn find_room(&self, platform: Platform, real_id: &str)
        -> Result<Option<Room>, AppError>;
    async fn list_rooms(&self) -> Result<Vec<Room>, AppError>;
    /// Insert a room and stamp its proxy URL (which embeds the new id).
    async fn insert_room(
        &self,
        info: &RoomAddInfo,
        record_enabled: bool,
        proxy_url_template: &str,
    ) -> Result<Room, AppError>;
    async fn update_room_flags(
        &self,
        id: i64,
        enabled: Option<bool>,
        record_enabled: Option<bool>,
    ) -> Result<(), AppError>;
    async fn delete_room(&self, id: i64) -> Result<(), AppError>;
}

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn list_configs(&self) -> Result<Vec<ConfigEntry>, AppError>;
    async fn get_config_by_key(&self, key: &str) -> Result<Option<ConfigEntry>, AppError>;
    async fn upsert_config(&self, key: &str, value: &str) -> Result<(), AppError>;
}

const ROOM_COLUMNS: &str = "id, platform, real_id, short_id, name, url, cover_url, \
     anchor_id, anchor_name, anchor_avatar, proxy_url, enabled, record_enabled, \
     created_at, updated_at";

pub struct SqliteRoomRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRoomRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for SqliteRoomRepository {
    async fn get_enabled_rooms(&self) -> Result<Vec<Room>, AppError> {
        let rooms = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE enabled = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    async fn get_room_by_id(&self, id: i64) -> Result<Option<Room>, AppError> {
        let room = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    async fn find_room(
        &self,
        platform: Platform,
        real_id: &str,
    ) -> Result<Option<Room>, AppError> {
        let room = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE platform = ? AND real_id = ?"
        ))
        .bind(platform)
        .bind(real_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, AppError> {
        let rooms = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    async fn insert_room(
        &self,
        info: &RoomAddInfo,
        record_enabled: bool,
        proxy_url_template: &str,
    ) -> Result<Room, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO rooms (platform, real_id, short_id, name, url, cover_url,
                anchor_id, anchor_name, anchor_avatar, proxy_url, enabled,
                record_enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '', 1, ?, ?, ?)
            "#,
        )
        .bind(info.platform)
        .bind(&info.real_id)
        .bind(&info.short_id)
        .bind(&info.name)
        .bind(&info.url)
        .bind(&info.cover_url)
        .bind(&info.anchor_id)
        .bind(&info.anchor_name)
        .bind(&info.anchor_avatar)
        .bind(record_enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let proxy_url = proxy_url_template.replace("{id}", &id.to_string());
        sqlx::query("UPDATE rooms SET proxy_url = ? WHERE id = ?")
            .bind(&proxy_url)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.get_room_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found("room", id.to_string()))
    }

    async fn update_room_flags(
        &self,
        id: i64,
        enabled: Option<bool>,
        record_enabled: Option<bool>,
    ) -> Result<(), AppError> {
        if let Some(enabled) = enabled {
            sqlx::query("UPDATE rooms SET enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(record_enabled) = record_enabled {
            sqlx::query("UPDATE rooms SET record_enabled = ?, updated_at = ? WHERE id = ?")
                .bind(record_enabled)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_room(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM rooms WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct SqliteConfigRepository {
    pool: Pool<Sqlite>,
}

impl SqliteConfigRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for SqliteConfigRepository {
    async fn list_configs(&self) -> Result<Vec<ConfigEntry>, AppError> {
        let entries = sqlx::query_as::<_, ConfigEntry>(
            "SELECT key, value, updated_at FROM configs ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn get_config_by_key(&self, key: &str) -> Result<Option<ConfigEntry>, AppError> {
        let entry = sqlx::query_as::<_, ConfigEntry>(
            "SELECT key, value, updated_at FROM configs WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn upsert_config(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO configs (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
