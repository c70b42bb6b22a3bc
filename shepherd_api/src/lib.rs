//! The HTTP boundary.
//!
//! Handlers are thin: extract the actor, call into the core, render the
//! result. Change endpoints answer 202 with a ticket envelope; all errors
//! flow through [`errors::ApiError`] so the taxonomy maps to statuses in
//! exactly one place.

/// Error rendering for the boundary
pub mod errors;
pub use errors::ApiError;

/// JWT issuance and validation, bearer extraction
pub mod auth;

/// Shared application state handed to every handler
pub mod state;
pub use state::AppState;

/// Route handlers
pub mod handlers;

use actix_web::web;

/// Route table; mounted by main and by the tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .route("/auth/login", web::post().to(handlers::auth::login))
            .route("/auth/password", web::post().to(handlers::auth::change_password))
            .route("/vms/request", web::post().to(handlers::vms::request_create))
            .route("/vms", web::get().to(handlers::vms::list))
            .route("/vms/preview-cluster", web::get().to(handlers::vms::preview_cluster))
            .route("/vms/batch", web::post().to(handlers::batches::submit))
            .route("/vms/batch/{id}", web::get().to(handlers::batches::get))
            .route("/vms/batch/{id}/retry", web::post().to(handlers::batches::retry))
            .route("/vms/batch/{id}/cancel", web::post().to(handlers::batches::cancel))
            .route("/vms/{id}", web::get().to(handlers::vms::get))
            .route("/vms/{id}", web::delete().to(handlers::vms::request_delete))
            .route("/vms/{id}/start", web::post().to(handlers::vms::start))
            .route("/vms/{id}/stop", web::post().to(handlers::vms::stop))
            .route("/vms/{id}/restart", web::post().to(handlers::vms::restart))
            .route(
                "/vms/{id}/console/request",
                web::post().to(handlers::vms::request_console),
            )
            .route(
                "/vms/console/{ticket_id}/token",
                web::get().to(handlers::vms::console_token),
            )
            .route("/approvals", web::get().to(handlers::approvals::list_pending))
            .route("/approvals/{id}", web::get().to(handlers::approvals::get))
            .route("/approvals/{id}/approve", web::post().to(handlers::approvals::approve))
            .route("/approvals/{id}/reject", web::post().to(handlers::approvals::reject))
            .route("/approvals/{id}/cancel", web::post().to(handlers::approvals::cancel))
            .route("/notifications", web::get().to(handlers::notifications::list))
            .route(
                "/notifications/unread-count",
                web::get().to(handlers::notifications::unread_count),
            )
            .route(
                "/notifications/{id}/read",
                web::patch().to(handlers::notifications::mark_read),
            )
            .route(
                "/notifications/mark-all-read",
                web::post().to(handlers::notifications::mark_all_read),
            )
            .route("/systems", web::post().to(handlers::admin::create_system))
            .route("/systems", web::get().to(handlers::admin::list_systems))
            .route("/services", web::post().to(handlers::admin::create_service))
            .service(
                web::scope("/admin")
                    .route("/audit-logs", web::get().to(handlers::admin::audit_logs))
                    .route("/clusters", web::post().to(handlers::admin::create_cluster))
                    .route("/clusters", web::get().to(handlers::admin::list_clusters))
                    .route("/clusters/{id}", web::delete().to(handlers::admin::delete_cluster))
                    .route("/namespaces", web::post().to(handlers::admin::create_namespace))
                    .route("/namespaces", web::get().to(handlers::admin::list_namespaces))
                    .route("/templates", web::post().to(handlers::admin::create_template))
                    .route("/templates", web::get().to(handlers::admin::list_templates))
                    .route(
                        "/templates/{id}/publish",
                        web::post().to(handlers::admin::publish_template),
                    )
                    .route(
                        "/templates/{id}/archive",
                        web::post().to(handlers::admin::archive_template),
                    )
                    .route("/sizes", web::post().to(handlers::admin::create_size))
                    .route("/sizes", web::get().to(handlers::admin::list_sizes))
                    .route("/users", web::post().to(handlers::admin::create_user))
                    .route("/users", web::get().to(handlers::admin::list_users))
                    .route("/users/{id}/disable", web::post().to(handlers::admin::disable_user))
                    .route("/roles", web::get().to(handlers::admin::list_roles))
                    .route("/role-bindings", web::post().to(handlers::admin::bind_role))
                    .route("/members", web::post().to(handlers::admin::add_member))
                    .route("/exemptions", web::post().to(handlers::admin::grant_exemption))
                    .route("/exemptions", web::get().to(handlers::admin::list_exemptions))
                    .route(
                        "/exemptions/{user_id}",
                        web::delete().to(handlers::admin::revoke_exemption),
                    )
                    .route("/jobs/{id}/requeue", web::post().to(handlers::admin::requeue_job))
                    .route("/adoptions", web::get().to(handlers::admin::list_adoptions))
                    .route(
                        "/adoptions/{id}/resolve",
                        web::post().to(handlers::admin::resolve_adoption),
                    ),
            ),
    )
    .route("/health", web::get().to(handlers::health));
}
