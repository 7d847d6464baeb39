//! Users table and access tokens for the signup/login endpoints.

use std::{
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// bcrypt only looks at the first 72 bytes of a password.
const BCRYPT_MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email already registered")]
    EmailTaken,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("token signing secret is not configured")]
    MissingSecret,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("user store lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
}

pub struct UserStore {
    conn: Mutex<Connection>,
    bcrypt_cost: u32,
}

impl UserStore {
    pub fn open(path: &Path, bcrypt_cost: u32) -> Result<Self, AuthError> {
        Self::with_connection(Connection::open(path)?, bcrypt_cost)
    }

    pub fn open_in_memory(bcrypt_cost: u32) -> Result<Self, AuthError> {
        Self::with_connection(Connection::open_in_memory()?, bcrypt_cost)
    }

    fn with_connection(conn: Connection, bcrypt_cost: u32) -> Result<Self, AuthError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                password TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_users_username ON users (username);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            bcrypt_cost,
        })
    }

    pub fn signup(&self, username: &str, email: &str, password: &str) -> Result<User, AuthError> {
        let conn = self.conn.lock().map_err(|_| AuthError::Poisoned)?;

        let existing: Option<i64> = conn
            .query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| {
                row.get(0)
            })
            .optional()?;
        if existing.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let hashed = bcrypt::hash(significant_bytes(password), self.bcrypt_cost)?;
        match conn.execute(
            "INSERT INTO users (username, email, password) VALUES (?1, ?2, ?3)",
            params![username, email, hashed],
        ) {
            Ok(_) => {}
            // a concurrent signup can still win the race to the unique index
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(AuthError::EmailTaken);
            }
            Err(err) => return Err(err.into()),
        }

        log::info!("registered user {email}");
        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
        })
    }

    pub fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let conn = self.conn.lock().map_err(|_| AuthError::Poisoned)?;
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT id, username, password FROM users WHERE email = ?1",
                params![email],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, username, hashed)) = row else {
            return Err(AuthError::InvalidCredentials);
        };
        if !bcrypt::verify(significant_bytes(password), &hashed)? {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(User {
            id,
            username,
            email: email.to_string(),
        })
    }

    pub fn count(&self) -> Result<usize, AuthError> {
        let conn = self.conn.lock().map_err(|_| AuthError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn significant_bytes(password: &str) -> &[u8] {
    let bytes = password.as_bytes();
    &bytes[..bytes.len().min(BCRYPT_MAX_PASSWORD_BYTES)]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub iat: u64,
    pub exp: u64,
}

/// HS256 access tokens with an expiry.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.issue_at(user, now)
    }

    fn issue_at(&self, user: &User, now: u64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.email.clone(),
            name: user.username.clone(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )?;
        Ok(data.claims)
    }
}
