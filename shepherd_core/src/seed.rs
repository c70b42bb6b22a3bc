//! Idempotent first-boot seeding: the bootstrap admin, the built-in
//! roles with their explicit permission sets, and the default tenant.
//!
//! Safe to run on every startup; existing rows short-circuit.

use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use shepherd_definitions::rbac::{builtin_roles, BindingSource, Role, RoleBinding};
use shepherd_definitions::{Environment, System, User};

use crate::users::hash_password;
use crate::{db, Db, Result};

const BOOTSTRAP_USERNAME: &str = "admin";
const BOOTSTRAP_PASSWORD: &str = "admin";
const DEFAULT_TENANT: &str = "default";

pub async fn run(db: &Db) -> Result<()> {
    let hash = hash_password(BOOTSTRAP_PASSWORD)?;
    db.with_tx(move |conn| {
        let hash = hash.clone();
        Box::pin(async move {
            let now = Utc::now();

            for (name, permissions) in builtin_roles() {
                if db::rbac::get_role_by_name(&mut *conn, name).await?.is_none() {
                    db::rbac::insert_role(
                        conn,
                        &Role {
                            id: Uuid::new_v4(),
                            name: name.to_string(),
                            permissions,
                            created_at: now,
                        },
                    )
                    .await?;
                    info!("seeded role {}", name);
                }
            }

            let admin = match db::users::get_by_username(&mut *conn, BOOTSTRAP_USERNAME).await? {
                Some(existing) => existing,
                None => {
                    let user = User {
                        id: Uuid::new_v4(),
                        username: BOOTSTRAP_USERNAME.into(),
                        password_hash: hash.clone(),
                        // the bootstrap credential is public knowledge, so
                        // the first login must rotate it
                        force_password_change: true,
                        disabled: false,
                        created_at: now,
                        updated_at: now,
                    };
                    db::users::insert(conn, &user).await?;
                    warn!("seeded bootstrap user '{}'; first login must change the password", BOOTSTRAP_USERNAME);
                    user
                }
            };

            let bindings = db::rbac::list_bindings_for_user(&mut *conn, admin.id).await?;
            if bindings.is_empty() {
                let bootstrap = db::rbac::get_role_by_name(&mut *conn, "Bootstrap")
                    .await?
                    .expect("bootstrap role seeded above");
                db::rbac::insert_binding(
                    conn,
                    &RoleBinding {
                        id: Uuid::new_v4(),
                        user_id: admin.id,
                        role_id: bootstrap.id,
                        allowed_environments: [Environment::Test, Environment::Prod].into(),
                        source: BindingSource::Local,
                        created_at: now,
                    },
                )
                .await?;
            }

            if db::hierarchy::get_system_by_name(&mut *conn, DEFAULT_TENANT)
                .await?
                .is_none()
            {
                db::hierarchy::insert_system(
                    conn,
                    &System {
                        id: Uuid::new_v4(),
                        name: DEFAULT_TENANT.into(),
                        description: "default tenant".into(),
                        created_at: now,
                    },
                )
                .await?;
                info!("seeded default tenant");
            }
            Ok(())
        })
    })
    .await
}
