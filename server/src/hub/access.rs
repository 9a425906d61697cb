//! Tenant membership and lead ownership checks.
//!
//! Consulted when a socket subscribes to `lead:{id}:timeline` and before an
//! event is routed to a user or lead channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::error::HubError;
use crate::events::DomainEvent;
use crate::util::with_timeout;

/// Answers who belongs to a tenant and who may follow a lead.
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Whether `user_id` may follow the timeline of `lead_id`.
    async fn can_access(&self, tenant_id: Uuid, user_id: Uuid, lead_id: Uuid)
        -> Result<bool, HubError>;

    /// Whether `user_id` is a member of `tenant_id`.
    async fn is_member(&self, tenant_id: Uuid, user_id: Uuid) -> Result<bool, HubError>;

    /// Whether `lead_id` belongs to `tenant_id`.
    async fn owns_lead(&self, tenant_id: Uuid, lead_id: Uuid) -> Result<bool, HubError>;
}

/// Which of an event's user and lead targets the directory admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCheck {
    pub user_allowed: bool,
    pub lead_allowed: bool,
}

impl RouteCheck {
    pub const fn all_allowed(self) -> bool {
        self.user_allowed && self.lead_allowed
    }
}

/// Check the user and lead an event is routed to against its tenant.
///
/// With an `actor`, that user may always target itself and needs follow
/// access to the lead. Without one, the user must be a member of the tenant
/// and the lead must belong to it. Absent targets are allowed.
pub async fn check_routes(
    directory: &dyn AccessDirectory,
    event: &DomainEvent,
    actor: Option<Uuid>,
) -> Result<RouteCheck, HubError> {
    let tenant_id = event.tenant_id;
    let user_allowed = match event.user_id {
        None => true,
        Some(user_id) if actor == Some(user_id) => true,
        Some(user_id) => directory.is_member(tenant_id, user_id).await?,
    };
    let lead_allowed = match (event.lead_id, actor) {
        (None, _) => true,
        (Some(lead_id), Some(actor)) => directory.can_access(tenant_id, actor, lead_id).await?,
        (Some(lead_id), None) => directory.owns_lead(tenant_id, lead_id).await?,
    };
    Ok(RouteCheck {
        user_allowed,
        lead_allowed,
    })
}

/// Looks users and leads up in the `tenant_members` and `lead_access`
/// projections.
///
/// A `lead_access` row with `user_id IS NULL` opens the lead to every user of
/// its tenant.
#[derive(Debug, Clone)]
pub struct PgAccessDirectory {
    pool: PgPool,
    timeout: Duration,
}

impl PgAccessDirectory {
    pub const fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn exists<F>(&self, query: F, what: &'static str) -> Result<bool, HubError>
    where
        F: Future<Output = Result<bool, sqlx::Error>> + Send,
    {
        with_timeout(self.timeout, async { Ok(query.await?) }, || {
            HubError::AccessUnavailable(format!("{what} lookup timed out"))
        })
        .await
    }
}

#[async_trait]
impl AccessDirectory for PgAccessDirectory {
    #[tracing::instrument(skip(self))]
    async fn can_access(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        lead_id: Uuid,
    ) -> Result<bool, HubError> {
        let query = sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM lead_access
                WHERE lead_id = $1
                  AND tenant_id = $2
                  AND (user_id IS NULL OR user_id = $3)
            )
            ",
        )
        .bind(lead_id)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_one(&self.pool);
        self.exists(query, "lead").await
    }

    #[tracing::instrument(skip(self))]
    async fn is_member(&self, tenant_id: Uuid, user_id: Uuid) -> Result<bool, HubError> {
        let query = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM tenant_members WHERE tenant_id = $1 AND user_id = $2)",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_one(&self.pool);
        self.exists(query, "membership").await
    }

    #[tracing::instrument(skip(self))]
    async fn owns_lead(&self, tenant_id: Uuid, lead_id: Uuid) -> Result<bool, HubError> {
        let query = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM lead_access WHERE lead_id = $1 AND tenant_id = $2)",
        )
        .bind(lead_id)
        .bind(tenant_id)
        .fetch_one(&self.pool);
        self.exists(query, "lead").await
    }
}

/// Knows nobody: every lead and foreign user is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl AccessDirectory for DenyAll {
    async fn can_access(&self, _: Uuid, _: Uuid, _: Uuid) -> Result<bool, HubError> {
        Ok(false)
    }

    async fn is_member(&self, _: Uuid, _: Uuid) -> Result<bool, HubError> {
        Ok(false)
    }

    async fn owns_lead(&self, _: Uuid, _: Uuid) -> Result<bool, HubError> {
        Ok(false)
    }
}

/// In-memory directory: lead id to owning tenant, plus (tenant, user) pairs.
#[derive(Debug, Default)]
pub struct StaticAccessDirectory {
    owners: RwLock<HashMap<Uuid, Uuid>>,
    members: RwLock<HashSet<(Uuid, Uuid)>>,
}

impl StaticAccessDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_lead(&self, lead_id: Uuid, tenant_id: Uuid) {
        if let Ok(mut owners) = self.owners.write() {
            owners.insert(lead_id, tenant_id);
        }
    }

    pub fn add_member(&self, user_id: Uuid, tenant_id: Uuid) {
        if let Ok(mut members) = self.members.write() {
            members.insert((tenant_id, user_id));
        }
    }
}

#[async_trait]
impl AccessDirectory for StaticAccessDirectory {
    async fn can_access(
        &self,
        tenant_id: Uuid,
        _user_id: Uuid,
        lead_id: Uuid,
    ) -> Result<bool, HubError> {
        self.owns_lead(tenant_id, lead_id).await
    }

    async fn is_member(&self, tenant_id: Uuid, user_id: Uuid) -> Result<bool, HubError> {
        let members = self
            .members
            .read()
            .map_err(|_| HubError::AccessUnavailable("member set poisoned".into()))?;
        Ok(members.contains(&(tenant_id, user_id)))
    }

    async fn owns_lead(&self, tenant_id: Uuid, lead_id: Uuid) -> Result<bool, HubError> {
        let owners = self
            .owners
            .read()
            .map_err(|_| HubError::AccessUnavailable("lead map poisoned".into()))?;
        Ok(owners.get(&lead_id) == Some(&tenant_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_leads_are_tenant_scoped() {
        let directory = StaticAccessDirectory::new();
        let lead = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        directory.grant_lead(lead, tenant);

        assert!(directory.can_access(tenant, Uuid::new_v4(), lead).await.unwrap());
        assert!(directory.owns_lead(tenant, lead).await.unwrap());
        assert!(!directory.can_access(Uuid::new_v4(), Uuid::new_v4(), lead).await.unwrap());
        assert!(!directory.can_access(tenant, Uuid::new_v4(), Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn static_membership_is_tenant_scoped() {
        let directory = StaticAccessDirectory::new();
        let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
        directory.add_member(user, tenant);

        assert!(directory.is_member(tenant, user).await.unwrap());
        assert!(!directory.is_member(Uuid::new_v4(), user).await.unwrap());
        assert!(!directory.is_member(tenant, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn deny_all_denies() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(!DenyAll.can_access(a, b, c).await.unwrap());
        assert!(!DenyAll.is_member(a, b).await.unwrap());
        assert!(!DenyAll.owns_lead(a, c).await.unwrap());
    }

    #[tokio::test]
    async fn routes_to_foreign_targets_are_refused() {
        let directory = StaticAccessDirectory::new();
        let (tenant, actor, colleague) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (own_lead, foreign_lead) = (Uuid::new_v4(), Uuid::new_v4());
        directory.add_member(colleague, tenant);
        directory.grant_lead(own_lead, tenant);
        directory.grant_lead(foreign_lead, Uuid::new_v4());

        let event = |user: Uuid, lead: Uuid| {
            DomainEvent::new("task.created", tenant, serde_json::json!({}))
                .with_user(user)
                .with_lead(lead)
        };

        let own = check_routes(&directory, &event(actor, own_lead), Some(actor)).await.unwrap();
        assert!(own.all_allowed());

        let colleague_route = check_routes(&directory, &event(colleague, own_lead), None)
            .await
            .unwrap();
        assert!(colleague_route.all_allowed());

        let foreign = check_routes(&directory, &event(Uuid::new_v4(), foreign_lead), Some(actor))
            .await
            .unwrap();
        assert_eq!(
            foreign,
            RouteCheck {
                user_allowed: false,
                lead_allowed: false
            }
        );

        // An actor is not a member unless the directory says so
        let actor_only = check_routes(&directory, &event(actor, own_lead), None).await.unwrap();
        assert!(!actor_only.user_allowed);
        assert!(actor_only.lead_allowed);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn pg_directory_checks_tenant_and_user() {
        let config = crate::config::Config::default_for_test();
        let pool = crate::db::create_pool(&config.database_url, Duration::from_secs(5))
            .await
            .expect("Failed to connect to PostgreSQL");
        crate::db::run_migrations(&pool).await.expect("Failed to run migrations");

        let (lead, tenant, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        sqlx::query("INSERT INTO lead_access (lead_id, tenant_id, user_id) VALUES ($1, $2, $3)")
            .bind(lead)
            .bind(tenant)
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tenant_members (tenant_id, user_id) VALUES ($1, $2)")
            .bind(tenant)
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();

        let directory = PgAccessDirectory::new(pool, Duration::from_secs(2));
        assert!(directory.can_access(tenant, user, lead).await.unwrap());
        assert!(!directory.can_access(tenant, Uuid::new_v4(), lead).await.unwrap());
        assert!(!directory.can_access(Uuid::new_v4(), user, lead).await.unwrap());
        assert!(directory.owns_lead(tenant, lead).await.unwrap());
        assert!(!directory.owns_lead(Uuid::new_v4(), lead).await.unwrap());
        assert!(directory.is_member(tenant, user).await.unwrap());
        assert!(!directory.is_member(Uuid::new_v4(), user).await.unwrap());
    }
}
