//! Pipeline tests against a live postgres and the mock provider.
//!
//! Ignored by default because they need a scratch database:
//!
//!   DATABASE_URL=postgres://shepherd@localhost/shepherd_test \
//!       cargo test -p shepherd_core -- --ignored --test-threads=1
//!
//! Each test builds its own users/namespaces/clusters with unique names,
//! but the queue is shared, so the claim gate below also serializes runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use shepherd_core::audit::RequestContext;
use shepherd_core::batch::{self, BatchRequest};
use shepherd_core::dispatch::{DispatchConfig, Dispatcher, ProviderRegistry};
use shepherd_core::governance::{self, ApproveOptions};
use shepherd_core::rbac::{load_actor, Actor};
use shepherd_core::{db, queue, seed, users, Db};
use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::batch::BatchStatus;
use shepherd_definitions::cluster::{Cluster, ClusterHealth};
use shepherd_definitions::event::EventStatus;
use shepherd_definitions::instance_size::InstanceSize;
use shepherd_definitions::rbac::{
    BindingSource, ResourceRole, ResourceRoleBinding, ResourceType, RoleBinding,
};
use shepherd_definitions::template::{Template, TemplateStatus};
use shepherd_definitions::ticket::TicketStatus;
use shepherd_definitions::vm::VmRequest;
use shepherd_definitions::{
    Environment, Error as DomainError, NamespaceRecord, Service, System, User,
};
use shepherd_provider::{ClusterCache, MockProvider, Provider};
use shepherd_provider::mock::MockFailure;

static GATE: OnceCell<Mutex<()>> = OnceCell::const_new();

async fn gate() -> tokio::sync::MutexGuard<'static, ()> {
    GATE.get_or_init(|| async { Mutex::new(()) })
        .await
        .lock()
        .await
}

fn unique(prefix: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &tag[..8])
}

async fn connect() -> Db {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch db");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect");
    let db = Db::from_pool(pool);
    db.migrate().await.expect("migrate");
    seed::run(&db).await.expect("seed");
    db
}

struct Fixture {
    db: Db,
    admin: Actor,
    operator: Actor,
    namespace: NamespaceRecord,
    service: Service,
    template: Template,
    size: InstanceSize,
    cluster: Cluster,
    mock: Arc<MockProvider>,
    dispatcher: Dispatcher,
    ctx: RequestContext,
}

async fn fixture(env: Environment) -> Fixture {
    let db = connect().await;
    let now = Utc::now();

    let admin_user = db::users::get_by_username(db.pool(), "admin")
        .await
        .unwrap()
        .expect("seeded admin");
    let admin = load_actor(db.pool(), admin_user.id).await.unwrap();

    // an operator with membership on a fresh service
    let username = unique("alice");
    let operator_user = User {
        id: Uuid::new_v4(),
        username: username.clone(),
        password_hash: users::hash_password("a-strong-password").unwrap(),
        force_password_change: false,
        disabled: false,
        created_at: now,
        updated_at: now,
    };
    let operator_role = db::rbac::get_role_by_name(db.pool(), "Operator")
        .await
        .unwrap()
        .expect("seeded role");

    let system = System {
        id: Uuid::new_v4(),
        name: unique("sys"),
        description: String::new(),
        created_at: now,
    };
    let service = Service {
        id: Uuid::new_v4(),
        system_id: system.id,
        name: unique("svc"),
        description: String::new(),
        created_at: now,
    };
    let namespace = NamespaceRecord {
        id: Uuid::new_v4(),
        name: unique("ns"),
        environment: env,
        description: String::new(),
        created_at: now,
    };
    let template = Template {
        id: Uuid::new_v4(),
        name: unique("tpl"),
        version: "1".into(),
        status: TemplateStatus::Active,
        content: json!({"spec": {"runStrategy": "Always"}}),
        os_image: None,
        cloud_init: None,
        created_at: now,
        updated_at: now,
    };
    let size = InstanceSize {
        id: Uuid::new_v4(),
        name: unique("size"),
        cpu: 4,
        memory_mi: 8192,
        disk_gi: 50,
        required_capabilities: Default::default(),
        spec_overrides: Default::default(),
        created_at: now,
        updated_at: now,
    };
    let cluster = Cluster {
        id: Uuid::new_v4(),
        name: unique("cluster"),
        api_url: "https://10.0.0.1:6443".into(),
        credentials: vec![1, 2, 3],
        environment: env,
        health: ClusterHealth::Healthy,
        kubevirt_version: Some("1.2.0".into()),
        enabled_features: Default::default(),
        storage_classes: vec!["standard".into()],
        default_storage_class: Some("standard".into()),
        last_probed_at: None,
        last_detected_at: None,
        created_at: now,
        updated_at: now,
    };

    {
        let operator_user = operator_user.clone();
        let system = system.clone();
        let service = service.clone();
        let namespace = namespace.clone();
        let template = template.clone();
        let size = size.clone();
        let cluster = cluster.clone();
        let role_id = operator_role.id;
        db.with_tx(move |conn| {
            let operator_user = operator_user.clone();
            let system = system.clone();
            let service = service.clone();
            let namespace = namespace.clone();
            let template = template.clone();
            let size = size.clone();
            let cluster = cluster.clone();
            Box::pin(async move {
                db::users::insert(conn, &operator_user).await?;
                db::rbac::insert_binding(
                    conn,
                    &RoleBinding {
                        id: Uuid::new_v4(),
                        user_id: operator_user.id,
                        role_id,
                        allowed_environments: [Environment::Test, Environment::Prod].into(),
                        source: BindingSource::Local,
                        created_at: Utc::now(),
                    },
                )
                .await?;
                db::hierarchy::insert_system(conn, &system).await?;
                db::hierarchy::insert_service(conn, &service).await?;
                db::rbac::insert_resource_binding(
                    conn,
                    &ResourceRoleBinding {
                        id: Uuid::new_v4(),
                        user_id: operator_user.id,
                        resource_type: ResourceType::Service,
                        resource_id: service.id,
                        role: ResourceRole::Member,
                        created_at: Utc::now(),
                    },
                )
                .await?;
                db::namespaces::insert(conn, &namespace).await?;
                db::templates::insert(conn, &template).await?;
                db::sizes::insert(conn, &size).await?;
                db::clusters::insert(conn, &cluster).await?;
                Ok(())
            })
        })
        .await
        .expect("fixture insert");
    }

    let operator = load_actor(db.pool(), operator_user.id).await.unwrap();

    let mock = Arc::new(MockProvider::new());
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(
        cluster.id,
        Arc::clone(&mock) as Arc<dyn Provider>,
        ClusterCache::new(),
    );
    let dispatcher = Dispatcher::new(db.clone(), registry, DispatchConfig::default());

    Fixture {
        db,
        admin,
        operator,
        namespace,
        service,
        template,
        size,
        cluster,
        mock,
        dispatcher,
        ctx: RequestContext::default(),
    }
}

impl Fixture {
    fn vm_request(&self, name: &str) -> VmRequest {
        VmRequest {
            name: name.into(),
            service_id: self.service.id,
            template_id: self.template.id,
            instance_size_id: self.size.id,
            namespace: self.namespace.name.clone(),
            reason: "deploy".into(),
            request_id: None,
            spec: None,
        }
    }

    /// Claim and dispatch one job; true when a job ran.
    async fn step(&self) -> bool {
        match queue::claim_one(self.db.pool()).await.unwrap() {
            Some(job) => {
                self.dispatcher.handle(job).await;
                true
            }
            None => false,
        }
    }

    async fn drain(&self) {
        while self.step().await {}
    }
}

#[tokio::test]
#[ignore]
async fn happy_path_create_runs_to_success() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let ticket = governance::submit_vm_create(
        &fx.db,
        &fx.operator,
        &fx.ctx,
        fx.vm_request("shop-api-01"),
    )
    .await
    .unwrap();
    assert_eq!(ticket.status, TicketStatus::PendingApproval);

    // co-commit: pending tickets have an event but no job
    let events = db::events::get_by_ticket(fx.db.pool(), ticket.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(queue::live_jobs_for_event(fx.db.pool(), events[0].id)
        .await
        .unwrap()
        .is_empty());

    let approved = governance::approve(
        &fx.db,
        &fx.admin,
        &fx.ctx,
        ticket.id,
        ApproveOptions {
            selected_cluster_id: Some(fx.cluster.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(approved.status, TicketStatus::Approved);
    assert_eq!(approved.selected_storage_class.as_deref(), Some("standard"));

    // co-commit: exactly one live job for the approved event
    assert_eq!(
        queue::live_jobs_for_event(fx.db.pool(), events[0].id)
            .await
            .unwrap()
            .len(),
        1
    );

    fx.drain().await;

    let done = db::tickets::get(fx.db.pool(), ticket.id).await.unwrap().unwrap();
    assert_eq!(done.status, TicketStatus::Success);
    let event = db::events::get(fx.db.pool(), events[0].id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(fx.mock.vm_count(), 1);

    let actions = db::audit::actions_for_resource(fx.db.pool(), ResourceType::Vm, ticket.id)
        .await
        .unwrap();
    assert!(actions.contains(&AuditAction::RequestSubmitted));
    assert!(actions.contains(&AuditAction::ApprovalApproved));
    assert!(actions.contains(&AuditAction::ExecutionCompleted));

    // the requester got an inbox row for the decision and the result
    let inbox = db::notifications::list_for(fx.db.pool(), fx.operator.id, false, 50, 0)
        .await
        .unwrap();
    assert!(inbox.len() >= 2);
}

#[tokio::test]
#[ignore]
async fn transient_failure_retries_then_succeeds() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let ticket = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, fx.vm_request("web-01"))
        .await
        .unwrap();
    governance::approve(
        &fx.db,
        &fx.admin,
        &fx.ctx,
        ticket.id,
        ApproveOptions {
            selected_cluster_id: Some(fx.cluster.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    fx.mock.script_failure(MockFailure::Retryable);
    assert!(fx.step().await);

    // ticket is still executing; the queue owns the retry
    let mid = db::tickets::get(fx.db.pool(), ticket.id).await.unwrap().unwrap();
    assert_eq!(mid.status, TicketStatus::Executing);

    // attempt 1 backs off exactly one second
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(fx.step().await);

    let done = db::tickets::get(fx.db.pool(), ticket.id).await.unwrap().unwrap();
    assert_eq!(done.status, TicketStatus::Success);
    let events = db::events::get_by_ticket(fx.db.pool(), ticket.id).await.unwrap();
    assert_eq!(events[0].attempts, 2);
    // idempotent apply: one external vm despite two attempts
    assert_eq!(fx.mock.vm_count(), 1);
}

#[tokio::test]
#[ignore]
async fn modified_spec_replaces_wholesale() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let mut request = fx.vm_request("db-01");
    request.spec = Some(json!({"cpu": 4, "memory": "8Gi", "disk": "50Gi"}));
    let ticket = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, request)
        .await
        .unwrap();

    // the admin hands back a full replacement with a smaller shape
    let mut modified = ticket.payload.clone();
    modified["cpu"] = json!(2);
    modified["memory"] = json!("4Gi");
    modified["disk"] = json!("50Gi");
    modified
        .as_object_mut()
        .unwrap()
        .remove("spec");
    governance::approve(
        &fx.db,
        &fx.admin,
        &fx.ctx,
        ticket.id,
        ApproveOptions {
            modified_spec: Some(modified),
            modification_reason: Some("right-size".into()),
            selected_cluster_id: Some(fx.cluster.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    fx.drain().await;

    let manifests = fx.mock.applied_manifests();
    assert_eq!(manifests.len(), 1);
    let domain = &manifests[0]["spec"]["template"]["spec"]["domain"];
    // the replacement won; the original cpu=4 never reached the cluster
    assert_eq!(domain["cpu"]["cores"], 2);
    assert_eq!(domain["memory"]["guest"], "4Gi");
}

#[tokio::test]
#[ignore]
async fn batch_partial_success_and_cooldown() {
    let _g = gate().await;
    let fx = fixture(Environment::Test).await;

    let items: Vec<VmRequest> = (0..4).map(|i| fx.vm_request(&format!("batch-vm-{}", i))).collect();
    let parent = batch::submit_batch(
        &fx.db,
        &fx.operator,
        &fx.ctx,
        BatchRequest {
            items,
            idempotency_key: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(parent.child_count, 4);
    assert_eq!(parent.status, BatchStatus::InProgress);

    // a second submit inside the cooldown window is a typed 429
    let err = batch::submit_batch(
        &fx.db,
        &fx.operator,
        &fx.ctx,
        BatchRequest {
            items: vec![fx.vm_request("batch-vm-later")],
            idempotency_key: None,
        },
    )
    .await
    .expect_err("cooldown must trip");
    match err.domain() {
        Some(DomainError::RateLimited {
            limit_type,
            retry_after_seconds,
            ..
        }) => {
            assert_eq!(limit_type, "user_batch_cooldown");
            assert!(*retry_after_seconds >= 1);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // approve all four children, then fail exactly the last one
    let children = db::tickets::children_of_batch(fx.db.pool(), parent.id).await.unwrap();
    assert_eq!(children.len(), 4);
    for child in &children {
        governance::approve(
            &fx.db,
            &fx.admin,
            &fx.ctx,
            child.id,
            ApproveOptions {
                selected_cluster_id: Some(fx.cluster.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }
    for _ in 0..3 {
        assert!(fx.step().await);
    }
    fx.mock.script_failure(MockFailure::Permanent);
    assert!(fx.step().await);

    let parent = batch::get_batch(&fx.db, parent.id).await.unwrap();
    assert_eq!(parent.status, BatchStatus::PartialSuccess);
    assert_eq!(parent.success_count, 3);
    assert_eq!(parent.failed_count, 1);
    assert_eq!(parent.pending_count, 0);

    // retry requeues only the failed child
    let retried = batch::retry_batch(&fx.db, &fx.operator, &fx.ctx, parent.id)
        .await
        .unwrap();
    assert_eq!(retried.pending_count, 1);
    assert_eq!(retried.failed_count, 0);
    fx.drain().await;

    let done = batch::get_batch(&fx.db, parent.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.success_count, 4);
}

#[tokio::test]
#[ignore]
async fn batch_size_bounds_are_validated() {
    let _g = gate().await;
    let fx = fixture(Environment::Test).await;

    let err = batch::submit_batch(
        &fx.db,
        &fx.operator,
        &fx.ctx,
        BatchRequest {
            items: vec![],
            idempotency_key: None,
        },
    )
    .await
    .expect_err("empty batch");
    assert!(matches!(err.domain(), Some(DomainError::Validation(_))));

    let items: Vec<VmRequest> = (0..51).map(|i| fx.vm_request(&format!("too-many-{}", i))).collect();
    let err = batch::submit_batch(
        &fx.db,
        &fx.operator,
        &fx.ctx,
        BatchRequest {
            items,
            idempotency_key: None,
        },
    )
    .await
    .expect_err("oversized batch");
    assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
}

#[tokio::test]
#[ignore]
async fn terminal_states_refuse_transitions() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let ticket = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, fx.vm_request("app-01"))
        .await
        .unwrap();
    governance::approve(
        &fx.db,
        &fx.admin,
        &fx.ctx,
        ticket.id,
        ApproveOptions {
            selected_cluster_id: Some(fx.cluster.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // approving an approved ticket is a conflict
    let err = governance::approve(&fx.db, &fx.admin, &fx.ctx, ticket.id, ApproveOptions::default())
        .await
        .expect_err("double approve");
    assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));

    fx.drain().await;
    let done = db::tickets::get(fx.db.pool(), ticket.id).await.unwrap().unwrap();
    assert_eq!(done.status, TicketStatus::Success);

    // cancelling a SUCCESS ticket is a conflict
    let err = governance::cancel(&fx.db, &fx.operator, &fx.ctx, ticket.id)
        .await
        .expect_err("cancel terminal");
    assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));
}

#[tokio::test]
#[ignore]
async fn same_request_id_returns_the_original_ticket() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let mut request = fx.vm_request("idem-01");
    request.request_id = Some(unique("req"));
    let first = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, request.clone())
        .await
        .unwrap();
    let second = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, request)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let events = db::events::get_by_ticket(fx.db.pool(), first.id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
#[ignore]
async fn rejection_leaves_no_live_job() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    let ticket = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, fx.vm_request("rej-01"))
        .await
        .unwrap();
    governance::reject(&fx.db, &fx.admin, &fx.ctx, ticket.id, "not today")
        .await
        .unwrap();

    let done = db::tickets::get(fx.db.pool(), ticket.id).await.unwrap().unwrap();
    assert_eq!(done.status, TicketStatus::Rejected);
    let events = db::events::get_by_ticket(fx.db.pool(), ticket.id).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Cancelled);
    assert!(queue::live_jobs_for_event(fx.db.pool(), events[0].id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore]
async fn namespace_environment_must_match_cluster() {
    let _g = gate().await;
    let fx = fixture(Environment::Prod).await;

    // a healthy cluster in the wrong environment
    let now = Utc::now();
    let test_cluster = Cluster {
        id: Uuid::new_v4(),
        name: unique("cluster-test"),
        api_url: "https://10.0.0.2:6443".into(),
        credentials: vec![],
        environment: Environment::Test,
        health: ClusterHealth::Healthy,
        kubevirt_version: None,
        enabled_features: Default::default(),
        storage_classes: vec!["standard".into()],
        default_storage_class: None,
        last_probed_at: None,
        last_detected_at: None,
        created_at: now,
        updated_at: now,
    };
    {
        let test_cluster = test_cluster.clone();
        fx.db
            .with_tx(move |conn| {
                let test_cluster = test_cluster.clone();
                Box::pin(async move { db::clusters::insert(conn, &test_cluster).await })
            })
            .await
            .unwrap();
    }

    let ticket = governance::submit_vm_create(&fx.db, &fx.operator, &fx.ctx, fx.vm_request("env-01"))
        .await
        .unwrap();
    let err = governance::approve(
        &fx.db,
        &fx.admin,
        &fx.ctx,
        ticket.id,
        ApproveOptions {
            selected_cluster_id: Some(test_cluster.id),
            ..Default::default()
        },
    )
    .await
    .expect_err("environment mismatch");
    assert!(matches!(err.domain(), Some(DomainError::PreconditionFailed(_))));
}
