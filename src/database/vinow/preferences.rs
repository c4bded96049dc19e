//! User preferences repository

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parse_datetime;

/// Stored preferences of one user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub language: String,
    pub notification_enabled: bool,
    pub dietary_restrictions: Vec<String>,
    pub favorite_cuisines: Vec<String>,
    pub notification_settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Writable preference fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesInput {
    pub language: String,
    pub notification_enabled: bool,
    pub dietary_restrictions: Vec<String>,
    pub favorite_cuisines: Vec<String>,
    pub notification_settings: Value,
}

impl Default for PreferencesInput {
    fn default() -> Self {
        Self {
            language: "vi".to_string(),
            notification_enabled: true,
            dietary_restrictions: Vec::new(),
            favorite_cuisines: Vec::new(),
            notification_settings: Value::Object(Default::default()),
        }
    }
}

impl PreferencesInput {
    fn encoded(&self) -> Result<(String, String, String)> {
        Ok((
            serde_json::to_string(&self.dietary_restrictions)?,
            serde_json::to_string(&self.favorite_cuisines)?,
            serde_json::to_string(&self.notification_settings)?,
        ))
    }
}

/// Repository for user preferences
pub struct UserPreferencesRepository<'a> {
    conn: &'a Connection,
}

impl<'a> UserPreferencesRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, user_id: &str, input: &PreferencesInput) -> Result<()> {
        let (dietary, cuisines, settings) = input.encoded()?;
        self.conn
            .execute(
                "INSERT INTO user_preferences
                    (user_id, language, notification_enabled, dietary_restrictions,
                     favorite_cuisines, notification_settings)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    input.language,
                    input.notification_enabled,
                    dietary,
                    cuisines,
                    settings
                ],
            )
            .map_err(|e| anyhow!("Failed to create preferences for '{}': {}", user_id, e))?;
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        self.conn
            .query_row(
                "SELECT user_id, language, notification_enabled, dietary_restrictions,
                        favorite_cuisines, notification_settings, created_at, updated_at
                 FROM user_preferences_select_policy WHERE user_id = ?1",
                [user_id],
                Self::row_to_preferences,
            )
            .optional()
            .map_err(|e| anyhow!("Failed to get preferences for '{}': {}", user_id, e))
    }

    /// Every preferences row visible to the caller
    pub fn list(&self) -> Result<Vec<UserPreferences>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, language, notification_enabled, dietary_restrictions,
                        favorite_cuisines, notification_settings, created_at, updated_at
                 FROM user_preferences_select_policy ORDER BY user_id",
            )
            .map_err(|e| anyhow!("Failed to prepare preferences query: {}", e))?;
        let rows = stmt
            .query_map([], Self::row_to_preferences)
            .map_err(|e| anyhow!("Failed to list preferences: {}", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| anyhow!("Failed to read preferences row: {}", e))
    }

    /// Replace all writable fields; false when the caller owns no such row
    pub fn update(&self, user_id: &str, input: &PreferencesInput) -> Result<bool> {
        let (dietary, cuisines, settings) = input.encoded()?;
        let changed = self
            .conn
            .execute(
                "UPDATE user_preferences SET
                    language = ?2,
                    notification_enabled = ?3,
                    dietary_restrictions = ?4,
                    favorite_cuisines = ?5,
                    notification_settings = ?6
                 WHERE user_id = ?1",
                params![
                    user_id,
                    input.language,
                    input.notification_enabled,
                    dietary,
                    cuisines,
                    settings
                ],
            )
            .map_err(|e| anyhow!("Failed to update preferences for '{}': {}", user_id, e))?;
        Ok(changed > 0)
    }

    pub fn delete(&self, user_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM user_preferences WHERE user_id = ?1", [user_id])
            .map_err(|e| anyhow!("Failed to delete preferences for '{}': {}", user_id, e))?;
        Ok(changed > 0)
    }

    fn row_to_preferences(row: &Row<'_>) -> rusqlite::Result<UserPreferences> {
        let dietary: String = row.get(3)?;
        let cuisines: String = row.get(4)?;
        let settings: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;

        Ok(UserPreferences {
            user_id: row.get(0)?,
            language: row.get(1)?,
            notification_enabled: row.get(2)?,
            dietary_restrictions: serde_json::from_str(&dietary).unwrap_or_default(),
            favorite_cuisines: serde_json::from_str(&cuisines).unwrap_or_default(),
            notification_settings: serde_json::from_str(&settings).unwrap_or(Value::Null),
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::Principal;
    use crate::database::vinow::{NewUserProfile, VinowDatabase};
    use serde_json::json;

    fn with_users(ids: &[&str]) -> VinowDatabase {
        let db = VinowDatabase::open_in_memory().unwrap();
        for id in ids {
            db.profiles().create(&NewUserProfile::new(*id)).unwrap();
        }
        db
    }

    #[test]
    fn test_defaults_and_json_fields() {
        let db = with_users(&["alice"]);
        let _alice = db.as_principal(Principal::user("alice"));
        let repo = db.preferences();

        repo.create(
            "alice",
            &PreferencesInput {
                favorite_cuisines: vec!["pho".to_string(), "banh mi".to_string()],
                notification_settings: json!({"email": false}),
                ..Default::default()
            },
        )
        .unwrap();

        let prefs = repo.get("alice").unwrap().unwrap();
        assert_eq!(prefs.language, "vi");
        assert!(prefs.notification_enabled);
        assert_eq!(prefs.favorite_cuisines, vec!["pho", "banh mi"]);
        assert_eq!(prefs.notification_settings, json!({"email": false}));
    }

    #[test]
    fn test_updated_at_advances_on_every_update() {
        let db = with_users(&["alice"]);
        let _alice = db.as_principal(Principal::user("alice"));
        let repo = db.preferences();
        let mut input = PreferencesInput::default();
        repo.create("alice", &input).unwrap();

        let mut previous = repo.get("alice").unwrap().unwrap().updated_at;
        for language in ["en", "vi", "en"] {
            input.language = language.to_string();
            assert!(repo.update("alice", &input).unwrap());
            let current = repo.get("alice").unwrap().unwrap().updated_at;
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn test_cross_principal_access_denied() {
        let db = with_users(&["alice", "bob"]);
        {
            let _alice = db.as_principal(Principal::user("alice"));
            db.preferences()
                .create("alice", &PreferencesInput::default())
                .unwrap();
        }

        assert_eq!(db.preferences().list().unwrap().len(), 1);

        let _bob = db.as_principal(Principal::user("bob"));
        let repo = db.preferences();
        assert!(repo.get("alice").unwrap().is_none());
        assert!(repo.list().unwrap().is_empty());
        let input = PreferencesInput {
            language: "en".to_string(),
            ..Default::default()
        };
        assert!(!repo.update("alice", &input).unwrap());
        assert!(!repo.delete("alice").unwrap());
        assert!(repo.create("alice", &input).is_err());
    }
}
