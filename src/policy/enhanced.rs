use std::sync::Arc;
use tracing::debug;

use crate::db::client::Db;
use crate::db::model::ModelClient;
use crate::db::query::{Record, RowScope, json_eq, record_matches};
use crate::error::WardenError;
use crate::policy::context::AuthContext;
use crate::policy::rules::{Grant, ModelPolicy, Operation, PolicySet, grant};

/// A client view that enforces a [`PolicySet`] for one caller.
///
/// Shares the pool of the [`Db`] it wraps; it is a separate handle, not a copy of the client.
#[derive(Debug, Clone)]
pub struct EnhancedDb {
    db: Db,
    policy: Arc<PolicySet>,
    ctx: AuthContext,
}

/// Wrap `db` so every operation is checked against `policy` for the caller in `ctx`.
pub fn enhance(db: &Db, policy: Arc<PolicySet>, ctx: AuthContext) -> EnhancedDb {
    EnhancedDb {
        db: db.clone(),
        policy,
        ctx,
    }
}

/// True when writing `data` would give a row a value the filter forbids.
fn contradicts(data: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .any(|(k, v)| data.get(k).is_some_and(|written| !json_eq(written, v)))
}

impl EnhancedDb {
    /// The unchecked client underneath.
    pub fn raw(&self) -> &Db {
        &self.db
    }

    pub fn context(&self) -> &AuthContext {
        &self.ctx
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    /// Same pool and policy, different caller.
    pub fn with_context(&self, ctx: AuthContext) -> EnhancedDb {
        EnhancedDb {
            db: self.db.clone(),
            policy: Arc::clone(&self.policy),
            ctx,
        }
    }

    fn deny(&self, model: &str, operation: Operation, reason: impl Into<String>) -> WardenError {
        let reason = reason.into();
        debug!(
            model,
            %operation,
            anonymous = self.ctx.is_anonymous(),
            reason = %reason,
            "policy denied"
        );
        WardenError::denied(model, operation, reason)
    }

    fn scope(
        &self,
        model: &str,
        operation: Operation,
    ) -> Result<(&ModelPolicy, RowScope), WardenError> {
        let Some(policy) = self.policy.model(model) else {
            return Err(self.deny(model, operation, "model has no access policy"));
        };
        match policy.rules(operation).scope(&self.ctx) {
            Some(scope) => Ok((policy, scope)),
            None => Err(self.deny(model, operation, "no allow rule matched")),
        }
    }

    fn strip_all(&self, policy: &ModelPolicy, rows: Vec<Record>) -> Vec<Record> {
        rows.into_iter()
            .map(|row| policy.strip_unreadable(&self.ctx, row))
            .collect()
    }

    /// Rows returned by a write, cut down to what a read would have shown.
    fn readable(&self, policy: &ModelPolicy, rows: Vec<Record>) -> Vec<Record> {
        let Some(read) = policy.read.scope(&self.ctx) else {
            return Vec::new();
        };
        let rows = rows.into_iter().filter(|row| read.admits(row)).collect();
        self.strip_all(policy, rows)
    }

    /// Filtering on a column the caller may not read would reveal its values through
    /// which rows match. Refuse it, or narrow `scope` to rows where the column is readable.
    fn check_filterable(
        &self,
        policy: &ModelPolicy,
        model: &str,
        operation: Operation,
        filter: &Record,
        scope: &mut RowScope,
    ) -> Result<(), WardenError> {
        for field in filter.keys() {
            let Some(rules) = policy.fields.get(field).and_then(|p| p.read.as_ref()) else {
                continue;
            };
            match grant(rules, &self.ctx) {
                Grant::All => {}
                Grant::None => {
                    return Err(self.deny(
                        model,
                        operation,
                        format!("filter on unreadable field `{field}`"),
                    ));
                }
                Grant::Rows(filters) => scope.restrict(filters),
            }
        }
        Ok(())
    }

    fn filtered_scope(
        &self,
        model: &str,
        operation: Operation,
        filter: &Record,
    ) -> Result<(&ModelPolicy, RowScope), WardenError> {
        let (policy, mut scope) = self.scope(model, operation)?;
        self.check_filterable(policy, model, operation, filter, &mut scope)?;
        Ok((policy, scope))
    }

    /// Column write rules for `data`. Row-dependent grants narrow `scope` (update) or are
    /// checked against `data` itself (create, where `scope` is `None`).
    fn check_writable(
        &self,
        policy: &ModelPolicy,
        model: &str,
        operation: Operation,
        data: &Record,
        mut scope: Option<&mut RowScope>,
    ) -> Result<(), WardenError> {
        for field in data.keys() {
            let Some(rules) = policy.fields.get(field).and_then(|p| p.write.as_ref()) else {
                continue;
            };
            match grant(rules, &self.ctx) {
                Grant::All => {}
                Grant::None => {
                    return Err(self.deny(
                        model,
                        operation,
                        format!("field `{field}` is not writable"),
                    ));
                }
                Grant::Rows(filters) => match scope.as_deref_mut() {
                    Some(scope) => scope.restrict(filters),
                    None => {
                        if !filters.iter().any(|f| record_matches(data, f)) {
                            return Err(self.deny(
                                model,
                                operation,
                                format!("field `{field}` is not writable on this record"),
                            ));
                        }
                    }
                },
            }
        }
        Ok(())
    }
}

impl ModelClient for EnhancedDb {
    async fn find_many(&self, model: &str, filter: &Record) -> Result<Vec<Record>, WardenError> {
        let (policy, scope) = self.filtered_scope(model, Operation::Read, filter)?;
        let rows = self.db.find_scoped(model, filter, &scope, None).await?;
        Ok(self.strip_all(policy, rows))
    }

    async fn find_first(
        &self,
        model: &str,
        filter: &Record,
    ) -> Result<Option<Record>, WardenError> {
        let (policy, scope) = self.filtered_scope(model, Operation::Read, filter)?;
        let rows = self.db.find_scoped(model, filter, &scope, Some(1)).await?;
        Ok(self.strip_all(policy, rows).into_iter().next())
    }

    async fn count(&self, model: &str, filter: &Record) -> Result<i64, WardenError> {
        let (_, scope) = self.filtered_scope(model, Operation::Read, filter)?;
        self.db.count_scoped(model, filter, &scope).await
    }

    async fn create(&self, model: &str, data: Record) -> Result<Record, WardenError> {
        let (policy, scope) = self.scope(model, Operation::Create)?;
        if !scope.admits(&data) {
            return Err(self.deny(
                model,
                Operation::Create,
                "record does not satisfy the create rules",
            ));
        }
        self.check_writable(policy, model, Operation::Create, &data, None)?;

        let read = policy.read.scope(&self.ctx);
        let created = self
            .db
            .create_checked(model, &data, |row| {
                read.as_ref().is_some_and(|scope| scope.admits(row))
            })
            .await?;
        match created {
            Some(row) => Ok(policy.strip_unreadable(&self.ctx, row)),
            None => Err(self.deny(
                model,
                Operation::Create,
                "created record is not readable by the caller",
            )),
        }
    }

    async fn update_many(
        &self,
        model: &str,
        filter: &Record,
        data: Record,
    ) -> Result<Vec<Record>, WardenError> {
        let (policy, mut scope) = self.filtered_scope(model, Operation::Update, filter)?;

        let leaves_scope = scope
            .any_of
            .iter()
            .any(|group| !group.is_empty() && group.iter().all(|f| contradicts(&data, f)));
        if leaves_scope || scope.deny.iter().any(|f| record_matches(&data, f)) {
            return Err(self.deny(
                model,
                Operation::Update,
                "update would move rows outside the permitted scope",
            ));
        }

        self.check_writable(policy, model, Operation::Update, &data, Some(&mut scope))?;
        let rows = self.db.update_scoped(model, filter, &scope, &data).await?;
        debug!(model, updated = rows.len(), "policy-checked update");
        Ok(self.readable(policy, rows))
    }

    async fn delete_many(&self, model: &str, filter: &Record) -> Result<Vec<Record>, WardenError> {
        let (policy, scope) = self.filtered_scope(model, Operation::Delete, filter)?;
        let rows = self.db.delete_scoped(model, filter, &scope).await?;
        debug!(model, deleted = rows.len(), "policy-checked delete");
        Ok(self.readable(policy, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::client::{GetDbParams, get_db};
    use crate::policy::context::AuthUser;
    use crate::policy::rules::{OperationRules, Rule};
    use serde_json::{Value, json};

    const POLICY: &str = r#"
        [models.post.read]
        allow = [{ rule = "field_equals", field = "published", value = true }]

        [models.post.create]
        allow = [{ rule = "owner", field = "author_id" }]

        [models.post.update]
        allow = [{ rule = "owner", field = "author_id" }]
        deny = [{ rule = "field_equals", field = "locked", value = true }]

        [models.post.fields.published]
        write = [{ rule = "role", roles = ["editor"] }]

        [models.post.fields.title]
        write = [{ rule = "field_equals", field = "published", value = false }]

        [models.post.fields.pin]
        read = [{ rule = "authenticated" }]

        [models.post.fields.review_notes]
        read = [{ rule = "owner", field = "author_id" }]

        [models.audit.update]
        allow = [{ rule = "always" }]

        [models.audit.delete]
        allow = [{ rule = "always" }]

        [models.audit.fields.actor]
        read = [{ rule = "role", roles = ["auditor"] }]
    "#;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn lazy_db() -> Db {
        get_db(GetDbParams::new("postgres://app:pw@127.0.0.1:1/app")).expect("lazy pool")
    }

    fn enhanced(ctx: AuthContext) -> EnhancedDb {
        let policy = Arc::new(PolicySet::from_toml_str(POLICY).unwrap());
        enhance(&lazy_db(), policy, ctx)
    }

    #[tokio::test]
    async fn wrapper_is_distinct_but_shares_the_pool() {
        let db = lazy_db();
        let wrapped = enhance(&db, Arc::new(PolicySet::deny_all()), AuthContext::anonymous());
        assert!(wrapped.raw().ptr_eq(&db));
        assert!(wrapped.context().is_anonymous());

        let other = wrapped.with_context(AuthContext::user(AuthUser::new(1)));
        assert!(other.raw().ptr_eq(&db));
        assert!(!other.context().is_anonymous());
    }

    #[tokio::test]
    async fn deny_all_policy_refuses_every_operation_without_touching_the_database() {
        let db = enhance(&lazy_db(), Arc::new(PolicySet::deny_all()), AuthContext::anonymous());
        let filter = Record::new();

        let err = db.find_many("post", &filter).await.unwrap_err();
        assert!(err.is_denied());
        assert!(db.count("post", &filter).await.unwrap_err().is_denied());
        assert!(db.create("post", Record::new()).await.unwrap_err().is_denied());
        assert!(
            db.update_many("post", &filter, rec(json!({"title": "x"})))
                .await
                .unwrap_err()
                .is_denied()
        );
        assert!(db.delete_many("post", &filter).await.unwrap_err().is_denied());
    }

    #[tokio::test]
    async fn anonymous_cannot_create_owned_records() {
        let db = enhanced(AuthContext::anonymous());
        let err = db
            .create("post", rec(json!({"author_id": 1, "title": "hi"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::Denied {
                operation: Operation::Create,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn create_for_someone_else_is_denied() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let err = db
            .create("post", rec(json!({"author_id": 8, "title": "hi"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create rules"));
    }

    #[tokio::test]
    async fn create_checks_field_write_rules_against_the_record() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let err = db
            .create(
                "post",
                rec(json!({"author_id": 7, "title": "hi", "published": true})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("`published`"));
    }

    #[tokio::test]
    async fn update_may_not_hand_rows_to_another_owner() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let err = db
            .update_many("post", &Record::new(), rec(json!({"author_id": 8})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the permitted scope"));
    }

    #[tokio::test]
    async fn update_may_not_lock_rows_it_is_denied_on() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let err = db
            .update_many("post", &Record::new(), rec(json!({"locked": true})))
            .await
            .unwrap_err();
        assert!(err.is_denied());
    }

    #[tokio::test]
    async fn update_narrows_scope_for_row_dependent_field_rules() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let (policy, mut scope) = db.scope("post", Operation::Update).unwrap();
        db.check_writable(
            policy,
            "post",
            Operation::Update,
            &rec(json!({"title": "new"})),
            Some(&mut scope),
        )
        .unwrap();
        assert_eq!(
            scope.any_of,
            vec![
                vec![rec(json!({"author_id": 7}))],
                vec![rec(json!({"published": false}))],
            ]
        );
        assert_eq!(scope.deny, vec![rec(json!({"locked": true}))]);
    }

    #[tokio::test]
    async fn invalid_model_names_are_refused_before_reaching_sql() {
        let mut policy = PolicySet::deny_all();
        policy.models.insert(
            "post; --".to_string(),
            ModelPolicy {
                read: OperationRules {
                    allow: vec![Rule::Always],
                    deny: Vec::new(),
                },
                ..Default::default()
            },
        );
        let raw = lazy_db();
        let db = enhance(&raw, Arc::new(policy), AuthContext::anonymous());

        let err = db.find_many("post; --", &Record::new()).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidIdentifier(ref name) if name == "post; --"));
        assert!(matches!(
            raw.find_many("post; --", &Record::new()).await.unwrap_err(),
            WardenError::InvalidIdentifier(_)
        ));
    }

    #[tokio::test]
    async fn filtering_on_an_unreadable_field_is_denied() {
        let db = enhanced(AuthContext::anonymous());
        let filter = rec(json!({"pin": "1234"}));

        let err = db.count("post", &filter).await.unwrap_err();
        assert!(err.to_string().contains("`pin`"));
        assert!(db.find_many("post", &filter).await.unwrap_err().is_denied());
        assert!(db.find_first("post", &filter).await.unwrap_err().is_denied());
    }

    #[tokio::test]
    async fn filtering_on_a_row_dependent_field_narrows_the_scope() {
        let db = enhanced(AuthContext::user(AuthUser::new(7)));
        let filter = rec(json!({"review_notes": "ok", "pin": "1234"}));
        let (_, scope) = db
            .filtered_scope("post", Operation::Read, &filter)
            .unwrap();
        assert_eq!(
            scope.any_of,
            vec![
                vec![rec(json!({"published": true}))],
                vec![rec(json!({"author_id": 7}))],
            ]
        );
    }

    #[tokio::test]
    async fn rows_returned_by_writes_follow_read_rules() {
        let signed_in = enhanced(AuthContext::user(AuthUser::new(7)));
        let post = signed_in.policy().model("post").unwrap();
        let rows = vec![
            rec(json!({"id": 1, "published": true, "author_id": 8, "review_notes": "x"})),
            rec(json!({"id": 2, "published": false, "author_id": 7})),
        ];
        let shown = signed_in.readable(post, rows.clone());
        assert_eq!(shown, vec![rec(json!({"id": 1, "published": true, "author_id": 8}))]);

        // `audit` may be updated and deleted but never read.
        let audit = signed_in.policy().model("audit").unwrap();
        assert!(signed_in.readable(audit, rows).is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_refuse_filters_on_hidden_columns() {
        let db = enhanced(AuthContext::anonymous());
        let filter = rec(json!({"actor": 1}));

        let err = db.delete_many("audit", &filter).await.unwrap_err();
        assert!(matches!(
            err,
            WardenError::Denied {
                operation: Operation::Delete,
                ..
            }
        ));
        assert!(err.to_string().contains("`actor`"));
        assert!(
            db.update_many("audit", &filter, rec(json!({"note": "x"})))
                .await
                .unwrap_err()
                .is_denied()
        );
    }
}
