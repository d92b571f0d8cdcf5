//! Local SQLite store for application records.
//!
//! `reasoning` is free text spoken about a person's circumstances, so it is
//! encrypted at rest (AES-256-GCM, key derived from the machine identity and
//! database path).

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{TimeZone, Utc};
use rand::RngCore;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub id: String,
    pub created_at: String,
    pub session_id: Option<String>,
    pub qualification_status: String,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct ApplicationInput {
    pub session_id: Option<String>,
    pub qualification_status: String,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct ApplicationStore {
    db_path: PathBuf,
    cipher: TextCipher,
}

#[derive(Debug, Clone)]
struct TextCipher {
    key: [u8; 32],
}

impl TextCipher {
    fn new(scope: &Path) -> Self {
        let user = std::env::var("USERNAME")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_default();
        let host = std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_default();
        let material = format!(
            "{user}|{host}|{}|voxline-applications-v1",
            scope.to_string_lossy()
        );
        let digest = Sha256::digest(material.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        Self { key }
    }

    /// `base64(nonce || ciphertext)`.
    fn encrypt(&self, plain: &str) -> Result<String, String> {
        if plain.is_empty() {
            return Ok(String::new());
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| e.to_string())?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let encrypted = cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|e| e.to_string())?;
        let mut out = Vec::with_capacity(12 + encrypted.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&encrypted);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, encoded: &str) -> Option<String> {
        if encoded.is_empty() {
            return Some(String::new());
        }
        let bytes = BASE64.decode(encoded).ok()?;
        if bytes.len() <= 12 {
            return None;
        }
        let (nonce_bytes, cipher_bytes) = bytes.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), cipher_bytes)
            .ok()?;
        String::from_utf8(plain).ok()
    }
}

impl ApplicationStore {
    pub fn default_db_path() -> PathBuf {
        crate::settings::default_data_dir().join("voxline.db")
    }

    pub fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let store = Self {
            cipher: TextCipher::new(&db_path),
            db_path,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, String> {
        Connection::open(&self.db_path).map_err(|e| e.to_string())
    }

    fn init_schema(&self) -> Result<(), String> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS applications (
              id TEXT PRIMARY KEY,
              created_at INTEGER NOT NULL,
              session_id TEXT,
              qualification_status TEXT NOT NULL,
              reasoning_enc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applications_created_at ON applications(created_at DESC);
            "#,
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Returns the new record's id.
    pub fn insert_application(&self, input: ApplicationInput) -> Result<String, String> {
        let id = new_id("app");
        let reasoning_enc = self.cipher.encrypt(&input.reasoning)?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO applications (id, created_at, session_id, qualification_status, reasoning_enc)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                id,
                Utc::now().timestamp_micros(),
                input.session_id,
                input.qualification_status,
                reasoning_enc
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(id)
    }

    /// Newest first. Rows whose reasoning cannot be decrypted (e.g. copied
    /// from another machine) are skipped.
    pub fn list_applications(&self, limit: usize) -> Result<Vec<ApplicationRecord>, String> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, session_id, qualification_status, reasoning_enc
                 FROM applications ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let mut rows = stmt.query(params![limit]).map_err(|e| e.to_string())?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().map_err(|e| e.to_string())? {
            let enc: String = row.get(4).map_err(|e| e.to_string())?;
            let Some(reasoning) = self.cipher.decrypt(&enc) else {
                continue;
            };
            let created_at: i64 = row.get(1).map_err(|e| e.to_string())?;
            let created = Utc
                .timestamp_micros(created_at)
                .single()
                .unwrap_or_else(Utc::now)
                .to_rfc3339();
            items.push(ApplicationRecord {
                id: row.get(0).map_err(|e| e.to_string())?,
                created_at: created,
                session_id: row.get(2).map_err(|e| e.to_string())?,
                qualification_status: row.get(3).map_err(|e| e.to_string())?,
                reasoning,
            });
        }
        Ok(items)
    }

    pub fn count_applications(&self) -> Result<usize, String> {
        let conn = self.open()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM applications", [], |row| row.get(0))
            .map_err(|e| e.to_string())?;
        Ok(count as usize)
    }
}

fn new_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{:08x}",
        Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}
