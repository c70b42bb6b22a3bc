//! systems / services / vms queries: the logical resource hierarchy.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::vm::{Service, System, VmRecord};

use crate::Result;

fn map_system(row: &PgRow) -> Result<System> {
    Ok(System {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_service(row: &PgRow) -> Result<Service> {
    Ok(Service {
        id: row.try_get("id")?,
        system_id: row.try_get("system_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_vm(row: &PgRow) -> Result<VmRecord> {
    Ok(VmRecord {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        name: row.try_get("name")?,
        namespace: row.try_get("namespace")?,
        cluster_id: row.try_get("cluster_id")?,
        template_id: row.try_get("template_id")?,
        instance_size_id: row.try_get("instance_size_id")?,
        external_uid: row.try_get("external_uid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------- systems

pub async fn insert_system(conn: &mut PgConnection, s: &System) -> Result<()> {
    sqlx::query(
        "INSERT INTO systems (id, name, description, created_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(s.id)
    .bind(&s.name)
    .bind(&s.description)
    .bind(s.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_system<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<System>> {
    let row = sqlx::query("SELECT id, name, description, created_at FROM systems WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_system).transpose()
}

pub async fn get_system_by_name<'e, E: PgExecutor<'e>>(ex: E, name: &str) -> Result<Option<System>> {
    let row = sqlx::query("SELECT id, name, description, created_at FROM systems WHERE name = $1")
        .bind(name)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_system).transpose()
}

pub async fn list_systems<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<System>> {
    let rows = sqlx::query("SELECT id, name, description, created_at FROM systems ORDER BY name")
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_system).collect()
}

// --------------------------------------------------------------- services

pub async fn insert_service(conn: &mut PgConnection, s: &Service) -> Result<()> {
    sqlx::query(
        "INSERT INTO services (id, system_id, name, description, created_at) VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(s.id)
    .bind(s.system_id)
    .bind(&s.name)
    .bind(&s.description)
    .bind(s.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_service<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<Service>> {
    let row = sqlx::query(
        "SELECT id, system_id, name, description, created_at FROM services WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_service).transpose()
}

pub async fn get_service_by_name<'e, E: PgExecutor<'e>>(
    ex: E,
    name: &str,
) -> Result<Option<Service>> {
    let row = sqlx::query(
        "SELECT id, system_id, name, description, created_at FROM services WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_service).transpose()
}

pub async fn list_services<'e, E: PgExecutor<'e>>(ex: E, system_id: Uuid) -> Result<Vec<Service>> {
    let rows = sqlx::query(
        "SELECT id, system_id, name, description, created_at FROM services
         WHERE system_id = $1 ORDER BY name",
    )
    .bind(system_id)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_service).collect()
}

// -------------------------------------------------------------------- vms

const VM_COLUMNS: &str = "id, service_id, name, namespace, cluster_id, template_id, \
     instance_size_id, external_uid, created_at, updated_at";

/// Upsert keyed on (namespace, name); the dispatcher writes this after a
/// successful apply, and a re-delivered apply converges on the same row.
pub async fn upsert_vm(conn: &mut PgConnection, vm: &VmRecord) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO vms
           (id, service_id, name, namespace, cluster_id, template_id, instance_size_id,
            external_uid, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
           ON CONFLICT (namespace, name) DO UPDATE
           SET cluster_id = EXCLUDED.cluster_id,
               external_uid = EXCLUDED.external_uid,
               updated_at = now()"#,
    )
    .bind(vm.id)
    .bind(vm.service_id)
    .bind(&vm.name)
    .bind(&vm.namespace)
    .bind(vm.cluster_id)
    .bind(vm.template_id)
    .bind(vm.instance_size_id)
    .bind(&vm.external_uid)
    .bind(vm.created_at)
    .bind(vm.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_vm<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<VmRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM vms WHERE id = $1", VM_COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_vm).transpose()
}

pub async fn get_vm_by_name<'e, E: PgExecutor<'e>>(
    ex: E,
    namespace: &str,
    name: &str,
) -> Result<Option<VmRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM vms WHERE namespace = $1 AND name = $2",
        VM_COLUMNS
    ))
    .bind(namespace)
    .bind(name)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_vm).transpose()
}

pub async fn list_vms<'e, E: PgExecutor<'e>>(ex: E, service_id: Option<Uuid>) -> Result<Vec<VmRecord>> {
    let rows = match service_id {
        Some(sid) => {
            sqlx::query(&format!(
                "SELECT {} FROM vms WHERE service_id = $1 ORDER BY namespace, name",
                VM_COLUMNS
            ))
            .bind(sid)
            .fetch_all(ex)
            .await?
        }
        None => {
            sqlx::query(&format!("SELECT {} FROM vms ORDER BY namespace, name", VM_COLUMNS))
                .fetch_all(ex)
                .await?
        }
    };
    rows.iter().map(map_vm).collect()
}

pub async fn delete_vm(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM vms WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
