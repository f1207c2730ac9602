use std::collections::BTreeSet;

use rusqlite::{Row, params, types::Type};

use super::Storage;
use crate::core::error::{Error, Result};
use crate::core::types::{CredentialData, SessionRecord, SessionUpsert};

const SESSION_COLUMNS: &str = "owner_id, credential_data, requested_scopes, granted_scopes, \
     authenticated, profile, token_version, created_at, updated_at";

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        owner_id: row.get(0)?,
        credential_data: json_col(row, 1)?,
        requested_scopes: json_col(row, 2)?,
        granted_scopes: json_col(row, 3)?,
        authenticated: row.get(4)?,
        profile: json_col(row, 5)?,
        token_version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl Storage {
    pub async fn get_session(&self, owner_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE owner_id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![owner_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(session_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Create-or-merge: only the populated fields of `fields` are written,
    /// everything else on an existing record is preserved. Used by the
    /// authorization flow on callback and by anything updating profile or
    /// scope state out of band.
    pub async fn upsert_session(
        &self,
        owner_id: &str,
        fields: SessionUpsert,
    ) -> Result<SessionRecord> {
        let db = self.db.lock().await;

        let existing = {
            let mut stmt = db.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE owner_id = ?1 LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![owner_id])?;
            match rows.next()? {
                Some(row) => Some(session_from_row(row)?),
                None => None,
            }
        };

        // Merge in memory; the connection mutex serializes concurrent upserts.
        let merged_credentials = fields
            .credential_data
            .or_else(|| existing.as_ref().map(|s| s.credential_data.clone()))
            .unwrap_or_default();
        let merged_requested = fields
            .requested_scopes
            .or_else(|| existing.as_ref().map(|s| s.requested_scopes.clone()))
            .unwrap_or_default();
        let merged_granted = fields
            .granted_scopes
            .or_else(|| existing.as_ref().map(|s| s.granted_scopes.clone()))
            .unwrap_or_default();
        let merged_authenticated = fields
            .authenticated
            .or(existing.as_ref().map(|s| s.authenticated))
            .unwrap_or(false);
        let merged_profile = fields
            .profile
            .or_else(|| existing.as_ref().map(|s| s.profile.clone()))
            .unwrap_or_default();
        let token_version = existing.as_ref().map(|s| s.token_version).unwrap_or(0);

        db.execute(
            "INSERT INTO user_sessions
               (owner_id, credential_data, requested_scopes, granted_scopes,
                authenticated, profile, token_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(owner_id) DO UPDATE SET
               credential_data = excluded.credential_data,
               requested_scopes = excluded.requested_scopes,
               granted_scopes = excluded.granted_scopes,
               authenticated = excluded.authenticated,
               profile = excluded.profile,
               updated_at = CURRENT_TIMESTAMP",
            params![
                owner_id,
                serde_json::to_string(&merged_credentials)?,
                serde_json::to_string(&merged_requested)?,
                serde_json::to_string(&merged_granted)?,
                merged_authenticated,
                serde_json::to_string(&merged_profile)?,
                token_version,
            ],
        )?;

        let rec = db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE owner_id = ?1"),
            params![owner_id],
            session_from_row,
        )?;
        Ok(rec)
    }

    /// Intersect the requested capabilities with what the owner actually
    /// granted. Pure read; output is sorted for determinism.
    pub async fn scope_filter(&self, owner_id: &str, requested: &[String]) -> Result<Vec<String>> {
        let session = self.get_session(owner_id).await?.ok_or(Error::NotFound)?;
        let granted: BTreeSet<&str> = session.granted_scopes.iter().map(String::as_str).collect();
        let allowed: BTreeSet<&str> = requested
            .iter()
            .map(String::as_str)
            .filter(|s| granted.contains(s))
            .collect();
        Ok(allowed.into_iter().map(str::to_string).collect())
    }

    /// Compare-and-set credential refresh. Succeeds only when the stored
    /// `token_version` still matches `expected_version`; a loser must re-read
    /// the session and use the winner's fresher token instead of overwriting
    /// it.
    pub async fn update_credentials(
        &self,
        owner_id: &str,
        expected_version: i64,
        credentials: &CredentialData,
    ) -> Result<bool> {
        let json = serde_json::to_string(credentials)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE user_sessions
             SET credential_data = ?1, token_version = token_version + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE owner_id = ?2 AND token_version = ?3",
            params![json, owner_id, expected_version],
        )?;
        Ok(rows > 0)
    }
}
