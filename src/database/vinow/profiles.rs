//! User profile repository
//!
//! A profile's primary key is the principal identifier itself, so the
//! ownership policies compare `id` against the caller.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::parse_datetime;

const PROFILE_COLUMNS: &str =
    "id, username, full_name, avatar_url, phone, date_of_birth, gender, created_at, updated_at";

/// A stored user profile
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a profile
#[derive(Debug, Clone, Default)]
pub struct NewUserProfile {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
}

impl NewUserProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub gender: Option<String>,
}

/// Repository for user profiles
pub struct UserProfileRepository<'a> {
    conn: &'a Connection,
}

impl<'a> UserProfileRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a profile; rejected unless the caller owns `profile.id`
    pub fn create(&self, profile: &NewUserProfile) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_profiles (id, username, full_name, avatar_url, phone, date_of_birth, gender)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    profile.id,
                    profile.username,
                    profile.full_name,
                    profile.avatar_url,
                    profile.phone,
                    profile.date_of_birth.map(|d| d.format("%Y-%m-%d").to_string()),
                    profile.gender,
                ],
            )
            .map_err(|e| anyhow!("Failed to create profile '{}': {}", profile.id, e))?;
        Ok(())
    }

    /// Get a profile if it is visible to the caller
    pub fn get(&self, id: &str) -> Result<Option<UserProfile>> {
        let query = format!(
            "SELECT {} FROM user_profiles_select_policy WHERE id = ?1",
            PROFILE_COLUMNS
        );
        self.conn
            .query_row(&query, [id], Self::row_to_profile)
            .optional()
            .map_err(|e| anyhow!("Failed to get profile '{}': {}", id, e))
    }

    /// All profiles visible to the caller
    pub fn list(&self) -> Result<Vec<UserProfile>> {
        let query = format!(
            "SELECT {} FROM user_profiles_select_policy ORDER BY created_at, id",
            PROFILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], Self::row_to_profile)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to list profiles: {}", e))
    }

    /// Number of profiles visible to the caller
    pub fn count(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM user_profiles_select_policy", [], |row| {
                row.get(0)
            })
            .map_err(|e| anyhow!("Failed to count profiles: {}", e))?;
        Ok(count)
    }

    /// Apply `update`; returns false when no row owned by the caller matched
    ///
    /// The visible row is read through the policy view and written back with
    /// every field bound, so the statement itself names only the owner column.
    pub fn update(&self, id: &str, update: &ProfileUpdate) -> Result<bool> {
        let Some(current) = self.get(id)? else {
            return Ok(false);
        };
        let merged = |new: &Option<String>, old: Option<String>| new.clone().or(old);

        let changed = self
            .conn
            .execute(
                "UPDATE user_profiles SET
                    username = ?2,
                    full_name = ?3,
                    avatar_url = ?4,
                    phone = ?5,
                    gender = ?6
                 WHERE id = ?1",
                params![
                    id,
                    merged(&update.username, current.username),
                    merged(&update.full_name, current.full_name),
                    merged(&update.avatar_url, current.avatar_url),
                    merged(&update.phone, current.phone),
                    merged(&update.gender, current.gender),
                ],
            )
            .map_err(|e| anyhow!("Failed to update profile '{}': {}", id, e))?;
        Ok(changed > 0)
    }

    /// Delete a profile; returns false when no row owned by the caller matched
    pub fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM user_profiles WHERE id = ?1", [id])
            .map_err(|e| anyhow!("Failed to delete profile '{}': {}", id, e))?;
        Ok(changed > 0)
    }

    fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
        let date_of_birth: Option<String> = row.get(5)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(UserProfile {
            id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            avatar_url: row.get(3)?,
            phone: row.get(4)?,
            date_of_birth: date_of_birth
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            gender: row.get(6)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::database::core::Principal;
    use crate::database::vinow::{NewUserProfile, ProfileUpdate, VinowDatabase};
    use chrono::NaiveDate;

    fn profile(id: &str, phone: &str) -> NewUserProfile {
        NewUserProfile {
            phone: Some(phone.to_string()),
            ..NewUserProfile::new(id)
        }
    }

    #[test]
    fn test_owner_round_trip() {
        let db = VinowDatabase::open_in_memory().unwrap();
        let _alice = db.as_principal(Principal::user("alice"));
        let repo = db.profiles();

        repo.create(&NewUserProfile {
            username: Some("alice".to_string()),
            date_of_birth: NaiveDate::from_ymd_opt(1995, 4, 30),
            gender: Some("female".to_string()),
            ..profile("alice", "+84900000001")
        })
        .unwrap();

        let stored = repo.get("alice").unwrap().unwrap();
        assert_eq!(stored.username.as_deref(), Some("alice"));
        assert_eq!(stored.date_of_birth, NaiveDate::from_ymd_opt(1995, 4, 30));

        let changed = repo
            .update(
                "alice",
                &ProfileUpdate {
                    full_name: Some("Alice Nguyen".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(changed);
        let stored = repo.get("alice").unwrap().unwrap();
        assert_eq!(stored.full_name.as_deref(), Some("Alice Nguyen"));
        assert_eq!(stored.username.as_deref(), Some("alice"));
        assert!(stored.updated_at > stored.created_at);
    }

    #[test]
    fn test_principals_are_isolated() {
        let db = VinowDatabase::open_in_memory().unwrap();
        for (id, phone) in [("alice", "+84900000001"), ("bob", "+84900000002")] {
            let _guard = db.as_principal(Principal::user(id));
            db.profiles().create(&profile(id, phone)).unwrap();
        }

        let _bob = db.as_principal(Principal::user("bob"));
        let repo = db.profiles();
        assert!(repo.get("alice").unwrap().is_none());
        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(repo.list().unwrap()[0].id, "bob");

        let hijack = ProfileUpdate {
            full_name: Some("mallory".to_string()),
            ..Default::default()
        };
        assert!(!repo.update("alice", &hijack).unwrap());
        assert!(!repo.delete("alice").unwrap());
        assert!(repo.create(&profile("carol", "+84900000003")).is_err());
        drop(_bob);

        // Service sees both rows, alice's untouched
        let repo = db.profiles();
        assert_eq!(repo.count().unwrap(), 2);
        assert!(repo.get("alice").unwrap().unwrap().full_name.is_none());
    }

    #[test]
    fn test_anonymous_denied() {
        let db = VinowDatabase::open_in_memory().unwrap();
        db.profiles().create(&profile("alice", "+84900000001")).unwrap();

        let _anon = db.as_principal(Principal::Anonymous);
        let repo = db.profiles();
        assert_eq!(repo.count().unwrap(), 0);
        assert!(repo.create(&profile("anon", "+84900000009")).is_err());
        assert!(!repo.delete("alice").unwrap());
    }

    #[test]
    fn test_owner_can_delete() {
        let db = VinowDatabase::open_in_memory().unwrap();
        let _alice = db.as_principal(Principal::user("alice"));
        db.profiles().create(&profile("alice", "+84900000001")).unwrap();
        assert!(db.profiles().delete("alice").unwrap());
        assert!(db.profiles().get("alice").unwrap().is_none());
    }
}
