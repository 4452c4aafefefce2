//! Session store & token controller (C4): a thin transactional layer over
//! the persistence engine. Every operation here runs within a
//! caller-provided executor (pool or transaction) so the orchestrator can
//! compose several of these into one atomic SUCCESS mint sequence.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::auth::internal_token::InternalToken;
use crate::db::crypto;
use crate::db::models::{SessionToken, User};
use crate::db::queries::{ExternalUserQuery, LoginRecordQuery, SessionTokenQuery, UserQuery};

/// Look up a user by their IdP identity. Returns `None` on first login.
///
/// Takes a concrete connection rather than a generic executor: this issues
/// two sequential queries, and a reborrowed `&mut *tx` isn't `Copy`, so a
/// generic `E: Executor + Copy` bound can't be satisfied by a transaction.
pub async fn get_user_by_external_subject(
    conn: &mut SqliteConnection,
    identity_provider: &str,
    external_subject: &str,
) -> anyhow::Result<Option<User>> {
    let Some(external_user) = ExternalUserQuery::new()
        .has_identity_provider(identity_provider)
        .has_external_subject(external_subject)
        .one_or_none(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    Ok(sqlx::query_as::<_, User>(
        "SELECT subject, ssn_enc, tin, created_at FROM user WHERE subject = ?",
    )
    .bind(&external_user.subject)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Look up an existing user by `tin` (the only lookup key the supported IdP
/// flow provides), or insert a new one with a freshly generated `subject`.
///
/// `ssn`, when provided, is encrypted before being stored.
pub async fn get_or_create_user(
    conn: &mut SqliteConnection,
    ssn: Option<&str>,
    tin: Option<&str>,
    ssn_encryption_key: &str,
) -> anyhow::Result<User> {
    if let Some(tin) = tin {
        if let Some(existing) = UserQuery::new().has_tin(tin).one_or_none(&mut *conn).await? {
            return Ok(existing);
        }
    }
    if let Some(ssn) = ssn {
        let ssn_enc = crypto::encrypt(ssn, ssn_encryption_key)?;
        if let Some(existing) = UserQuery::new()
            .has_ssn(&ssn_enc)
            .one_or_none(&mut *conn)
            .await?
        {
            return Ok(existing);
        }
    }

    let subject = Uuid::new_v4().to_string();
    let ssn_enc = ssn.map(|s| crypto::encrypt(s, ssn_encryption_key)).transpose()?;
    let created_at = Utc::now();

    sqlx::query("INSERT INTO user (subject, ssn_enc, tin, created_at) VALUES (?, ?, ?, ?)")
        .bind(&subject)
        .bind(&ssn_enc)
        .bind(tin)
        .bind(created_at)
        .execute(&mut *conn)
        .await?;

    Ok(User {
        subject,
        ssn_enc,
        tin: tin.map(String::from),
        created_at,
    })
}

/// Idempotently link an IdP identity to a user: a no-op if the link already
/// exists (the unique constraint on `(identity_provider, external_subject)`
/// is the authority here, not this check — callers that race land on the
/// same conflict and are expected to retry once).
pub async fn attach_external_user(
    conn: &mut SqliteConnection,
    user: &User,
    identity_provider: &str,
    external_subject: &str,
) -> anyhow::Result<()> {
    let already_linked = ExternalUserQuery::new()
        .has_identity_provider(identity_provider)
        .has_external_subject(external_subject)
        .exists(&mut *conn)
        .await?;
    if already_linked {
        return Ok(());
    }

    let result = sqlx::query(
        "INSERT INTO external_user (id, subject, identity_provider, external_subject, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&user.subject)
    .bind(identity_provider)
    .bind(external_subject)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        // Lost the race against a concurrent first-login for the same
        // identity: the unique constraint fired, the link now exists.
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Append a `LoginRecord` for this user. Never mutated afterward.
pub async fn register_user_login<'e, E>(executor: E, user: &User) -> anyhow::Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT INTO login_record (id, subject, created_at) VALUES (?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&user.subject)
        .bind(Utc::now())
        .execute(executor)
        .await?;
    Ok(())
}

/// Sign an `InternalToken` and insert the corresponding `SessionToken` row.
/// Returns the freshly generated opaque token.
#[allow(clippy::too_many_arguments)]
pub async fn create_token<'e, E>(
    executor: E,
    issued: DateTime<Utc>,
    expires: DateTime<Utc>,
    subject: &str,
    id_token: &str,
    scope: Vec<String>,
    internal_token_secret: &str,
) -> anyhow::Result<String>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let internal_token = InternalToken {
        issued,
        expires,
        actor: subject.to_string(),
        subject: subject.to_string(),
        scope,
    };
    let internal_token_enc = internal_token.encode(internal_token_secret);
    let opaque_token = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO session_token (opaque_token, internal_token, id_token, subject, issued, expires)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&opaque_token)
    .bind(&internal_token_enc)
    .bind(id_token)
    .bind(subject)
    .bind(issued)
    .bind(expires)
    .execute(executor)
    .await?;

    Ok(opaque_token)
}

/// Look up a session by its opaque token. When `only_valid` is set,
/// restricts to `issued <= now < expires`.
pub async fn get_token<'e, E>(
    executor: E,
    opaque_token: &str,
    only_valid: bool,
) -> anyhow::Result<Option<SessionToken>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut query = SessionTokenQuery::new().has_opaque_token(opaque_token);
    if only_valid {
        query = query.is_valid();
    }
    Ok(query.one_or_none(executor).await?)
}

/// Delete a session by its opaque token, returning the row if one existed
/// (the caller needs its `id_token` to invalidate the IdP-side session).
pub async fn delete_token(
    conn: &mut SqliteConnection,
    opaque_token: &str,
) -> anyhow::Result<Option<SessionToken>> {
    let token = get_token(&mut *conn, opaque_token, false).await?;
    if token.is_some() {
        sqlx::query("DELETE FROM session_token WHERE opaque_token = ?")
            .bind(opaque_token)
            .execute(&mut *conn)
            .await?;
    }
    Ok(token)
}

/// Delete a user's current session looked up by subject rather than by
/// opaque cookie value, returning the row if one existed. Used by `/logout`
/// when the caller authenticates with a bearer `InternalToken` instead of
/// the session cookie.
pub async fn delete_session_by_subject(
    conn: &mut SqliteConnection,
    subject: &str,
) -> anyhow::Result<Option<SessionToken>> {
    let token = SessionTokenQuery::new()
        .has_subject(subject)
        .one_or_none(&mut *conn)
        .await?;
    if let Some(token) = &token {
        sqlx::query("DELETE FROM session_token WHERE opaque_token = ?")
            .bind(&token.opaque_token)
            .execute(&mut *conn)
            .await?;
    }
    Ok(token)
}

/// Count logins recorded for a subject — exercised by tests exercising C7's
/// `LoginRecordQuery`.
pub async fn count_logins<'e, E>(executor: E, subject: &str) -> anyhow::Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    LoginRecordQuery::new()
        .has_subject(subject)
        .count(executor)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const SSN_KEY: &str = "ssn-encryption-key";
    const TOKEN_SECRET: &str = "internal-token-secret";

    #[tokio::test]
    async fn get_or_create_user_creates_on_miss_and_reuses_on_hit() {
        let db = Database::test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let created = get_or_create_user(&mut conn, None, Some("39315041"), SSN_KEY)
            .await
            .unwrap();
        assert_eq!(created.tin.as_deref(), Some("39315041"));

        let reused = get_or_create_user(&mut conn, None, Some("39315041"), SSN_KEY)
            .await
            .unwrap();
        assert_eq!(reused.subject, created.subject);
    }

    #[tokio::test]
    async fn attach_external_user_is_idempotent() {
        let db = Database::test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let user = get_or_create_user(&mut conn, None, Some("39315041"), SSN_KEY)
            .await
            .unwrap();

        attach_external_user(&mut conn, &user, "mitid", "S1")
            .await
            .unwrap();
        attach_external_user(&mut conn, &user, "mitid", "S1")
            .await
            .unwrap();

        let count = ExternalUserQuery::new()
            .has_identity_provider("mitid")
            .has_external_subject("S1")
            .all(&mut *conn)
            .await
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn create_token_round_trips_through_get_token() {
        let db = Database::test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let user = get_or_create_user(&mut conn, None, Some("39315041"), SSN_KEY)
            .await
            .unwrap();
        let issued = Utc::now();
        let expires = issued + chrono::Duration::hours(1);

        let opaque = create_token(
            &mut *conn,
            issued,
            expires,
            &user.subject,
            "raw-id-token",
            vec!["meteringpoints.read".into()],
            TOKEN_SECRET,
        )
        .await
        .unwrap();

        let fetched = get_token(&mut *conn, &opaque, true).await.unwrap().unwrap();
        assert_eq!(fetched.subject, user.subject);
        let internal = InternalToken::decode(&fetched.internal_token, TOKEN_SECRET).unwrap();
        assert_eq!(internal.subject, user.subject);
    }

    #[tokio::test]
    async fn delete_token_removes_row_and_returns_it() {
        let db = Database::test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let user = get_or_create_user(&mut conn, None, Some("39315041"), SSN_KEY)
            .await
            .unwrap();
        let issued = Utc::now();
        let opaque = create_token(
            &mut *conn,
            issued,
            issued + chrono::Duration::hours(1),
            &user.subject,
            "raw-id-token",
            vec![],
            TOKEN_SECRET,
        )
        .await
        .unwrap();

        let deleted = delete_token(&mut conn, &opaque).await.unwrap();
        assert!(deleted.is_some());
        assert!(get_token(&mut *conn, &opaque, false).await.unwrap().is_none());

        let second = delete_token(&mut conn, &opaque).await.unwrap();
        assert!(second.is_none());
    }
}
