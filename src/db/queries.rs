//! A small fluent query API per entity, each predicate ANDed onto the
//! current filter chain and terminated by `one_or_none`/`all`/`count`/`exists`.
//!
//! Every terminator is generic over the executor so the same query can run
//! against a bare pool or inside a caller-held transaction.

use anyhow::Result;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

use super::models::{ExternalUser, LoginRecord, SessionToken, User};

#[derive(Debug, Default, Clone)]
pub struct UserQuery {
    ssn_enc: Option<String>,
    tin: Option<String>,
}

impl UserQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_ssn(mut self, ssn_enc: impl Into<String>) -> Self {
        self.ssn_enc = Some(ssn_enc.into());
        self
    }

    pub fn has_tin(mut self, tin: impl Into<String>) -> Self {
        self.tin = Some(tin.into());
        self
    }

    fn builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb =
            QueryBuilder::new("SELECT subject, ssn_enc, tin, created_at FROM user WHERE 1=1");
        if let Some(ssn) = &self.ssn_enc {
            qb.push(" AND ssn_enc = ").push_bind(ssn.clone());
        }
        if let Some(tin) = &self.tin {
            qb.push(" AND tin = ").push_bind(tin.clone());
        }
        qb
    }

    pub async fn one_or_none<'e, E>(&self, executor: E) -> Result<Option<User>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<User>()
            .fetch_optional(executor)
            .await?)
    }

    pub async fn all<'e, E>(&self, executor: E) -> Result<Vec<User>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.builder().build_query_as::<User>().fetch_all(executor).await?)
    }

    pub async fn count<'e, E>(&self, executor: E) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.all(executor).await?.len() as i64)
    }

    pub async fn exists<'e, E>(&self, executor: E) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.one_or_none(executor).await?.is_some())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExternalUserQuery {
    external_subject: Option<String>,
    identity_provider: Option<String>,
}

impl ExternalUserQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_external_subject(mut self, subject: impl Into<String>) -> Self {
        self.external_subject = Some(subject.into());
        self
    }

    pub fn has_identity_provider(mut self, idp: impl Into<String>) -> Self {
        self.identity_provider = Some(idp.into());
        self
    }

    fn builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT id, subject, identity_provider, external_subject, created_at FROM external_user WHERE 1=1",
        );
        if let Some(subject) = &self.external_subject {
            qb.push(" AND external_subject = ").push_bind(subject.clone());
        }
        if let Some(idp) = &self.identity_provider {
            qb.push(" AND identity_provider = ").push_bind(idp.clone());
        }
        qb
    }

    pub async fn one_or_none<'e, E>(&self, executor: E) -> Result<Option<ExternalUser>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<ExternalUser>()
            .fetch_optional(executor)
            .await?)
    }

    pub async fn all<'e, E>(&self, executor: E) -> Result<Vec<ExternalUser>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<ExternalUser>()
            .fetch_all(executor)
            .await?)
    }

    pub async fn count<'e, E>(&self, executor: E) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.all(executor).await?.len() as i64)
    }

    pub async fn exists<'e, E>(&self, executor: E) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.one_or_none(executor).await?.is_some())
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoginRecordQuery {
    subject: Option<String>,
}

impl LoginRecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    fn builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new("SELECT id, subject, created_at FROM login_record WHERE 1=1");
        if let Some(subject) = &self.subject {
            qb.push(" AND subject = ").push_bind(subject.clone());
        }
        qb
    }

    pub async fn one_or_none<'e, E>(&self, executor: E) -> Result<Option<LoginRecord>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<LoginRecord>()
            .fetch_optional(executor)
            .await?)
    }

    pub async fn all<'e, E>(&self, executor: E) -> Result<Vec<LoginRecord>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<LoginRecord>()
            .fetch_all(executor)
            .await?)
    }

    pub async fn count<'e, E>(&self, executor: E) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.all(executor).await?.len() as i64)
    }

    pub async fn exists<'e, E>(&self, executor: E) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.one_or_none(executor).await?.is_some())
    }
}

/// Queries the `session_token` table — the opaque handle handed to browsers
/// and exchanged for a signed `InternalToken` by forward-auth.
#[derive(Debug, Default, Clone)]
pub struct SessionTokenQuery {
    opaque_token: Option<String>,
    subject: Option<String>,
    only_valid: bool,
}

impl SessionTokenQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_opaque_token(mut self, opaque_token: impl Into<String>) -> Self {
        self.opaque_token = Some(opaque_token.into());
        self
    }

    pub fn has_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Restrict to rows where `issued <= now < expires`.
    pub fn is_valid(mut self) -> Self {
        self.only_valid = true;
        self
    }

    fn builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT opaque_token, internal_token, id_token, subject, issued, expires FROM session_token WHERE 1=1",
        );
        if let Some(token) = &self.opaque_token {
            qb.push(" AND opaque_token = ").push_bind(token.clone());
        }
        if let Some(subject) = &self.subject {
            qb.push(" AND subject = ").push_bind(subject.clone());
        }
        if self.only_valid {
            let now = Utc::now();
            qb.push(" AND issued <= ").push_bind(now);
            qb.push(" AND expires > ").push_bind(now);
        }
        qb
    }

    pub async fn one_or_none<'e, E>(&self, executor: E) -> Result<Option<SessionToken>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<SessionToken>()
            .fetch_optional(executor)
            .await?)
    }

    pub async fn all<'e, E>(&self, executor: E) -> Result<Vec<SessionToken>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self
            .builder()
            .build_query_as::<SessionToken>()
            .fetch_all(executor)
            .await?)
    }

    pub async fn count<'e, E>(&self, executor: E) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.all(executor).await?.len() as i64)
    }

    pub async fn exists<'e, E>(&self, executor: E) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        Ok(self.one_or_none(executor).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;
    use uuid::Uuid;

    async fn seed_user(db: &Database, subject: &str, tin: &str) {
        sqlx::query("INSERT INTO user (subject, tin, created_at) VALUES (?, ?, ?)")
            .bind(subject)
            .bind(tin)
            .bind(Utc::now())
            .execute(&db.pool)
            .await
            .unwrap();
    }

    async fn seed_external_user(db: &Database, subject: &str, idp: &str, ext: &str) {
        sqlx::query(
            "INSERT INTO external_user (id, subject, identity_provider, external_subject, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(subject)
        .bind(idp)
        .bind(ext)
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn user_query_has_tin_finds_match() {
        let db = Database::test_db().await;
        seed_user(&db, "sub-1", "39315041").await;

        let found = UserQuery::new()
            .has_tin("39315041")
            .one_or_none(&db.pool)
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().subject, "sub-1");
    }

    #[tokio::test]
    async fn user_query_has_tin_no_match_returns_none() {
        let db = Database::test_db().await;
        seed_user(&db, "sub-1", "39315041").await;

        let found = UserQuery::new()
            .has_tin("00000000")
            .one_or_none(&db.pool)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn external_user_query_predicates_and_together() {
        let db = Database::test_db().await;
        seed_user(&db, "sub-1", "39315041").await;
        seed_external_user(&db, "sub-1", "mitid", "S1").await;

        let exists = ExternalUserQuery::new()
            .has_identity_provider("mitid")
            .has_external_subject("S1")
            .exists(&db.pool)
            .await
            .unwrap();
        assert!(exists);

        let missing = ExternalUserQuery::new()
            .has_identity_provider("nemid")
            .has_external_subject("S1")
            .exists(&db.pool)
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn session_token_query_is_valid_excludes_expired() {
        let db = Database::test_db().await;
        seed_user(&db, "sub-1", "39315041").await;

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO session_token (opaque_token, internal_token, id_token, subject, issued, expires)
             VALUES (?, 'it', 'idt', 'sub-1', ?, ?)",
        )
        .bind("expired-token")
        .bind(now - Duration::hours(2))
        .bind(now - Duration::hours(1))
        .execute(&db.pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO session_token (opaque_token, internal_token, id_token, subject, issued, expires)
             VALUES (?, 'it', 'idt', 'sub-1', ?, ?)",
        )
        .bind("valid-token")
        .bind(now - Duration::minutes(5))
        .bind(now + Duration::hours(1))
        .execute(&db.pool)
        .await
        .unwrap();

        let valid = SessionTokenQuery::new()
            .has_opaque_token("expired-token")
            .is_valid()
            .one_or_none(&db.pool)
            .await
            .unwrap();
        assert!(valid.is_none());

        let valid = SessionTokenQuery::new()
            .has_opaque_token("valid-token")
            .is_valid()
            .one_or_none(&db.pool)
            .await
            .unwrap();
        assert!(valid.is_some());
    }
}
