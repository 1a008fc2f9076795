//! Application registration: `PUT /` and `DELETE /`.
//!
//! An application is a platform key pair handed out by the gateway and
//! bound to one set of backend credentials.  Registration is open; every
//! other call, including removal, must be signed with the platform keys.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;
use garde::Validate;
use tracing::{info, warn};

use super::{empty_response, xml_response, Identity};
use crate::credentials::{generate_access_key, generate_secret_key, Application};
use crate::errors::S3Error;
use crate::gateway::{correlation_headers, Credentials};
use crate::xml::{parse_create_application, render_create_application_result};
use crate::AppState;

/// `PUT /` -- PutApplication.
#[utoipa::path(
    put,
    path = "/",
    tag = "Application",
    operation_id = "PutApplication",
    request_body(content = String, description = "CreateApplicationConfiguration document", content_type = "application/xml"),
    responses(
        (status = 200, description = "CreateApplicationResult with the new platform keys", content_type = "application/xml"),
        (status = 400, description = "Malformed or invalid configuration"),
        (status = 409, description = "Backend credentials already registered")
    )
)]
pub async fn put_application(state: Arc<AppState>, body: &[u8]) -> Result<Response, S3Error> {
    let cfg = parse_create_application(body).map_err(|e| {
        warn!("PutApplication: {}", e);
        S3Error::MalformedXML
    })?;

    if let Err(report) = cfg.validate() {
        let argument_name = report.iter().next().map(|(path, _)| path.to_string());
        return Err(S3Error::InvalidRequestParameter {
            argument_name,
            argument_value: None,
        });
    }
    if !state.registry.contains(&cfg.engine) {
        return Err(S3Error::InvalidRequestParameter {
            argument_name: Some("Engine".to_string()),
            argument_value: Some(cfg.engine),
        });
    }

    let backend = Credentials::new(cfg.access_key.as_str(), cfg.secret_key.as_str());
    if state.credentials.backend_registered(&cfg.engine, &backend).await? {
        return Err(S3Error::AccessKeyCreated);
    }

    let access_key = generate_access_key();
    let secret_key = generate_secret_key();
    state
        .credentials
        .insert(Application {
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
            engine: cfg.engine,
            engine_access_key: cfg.access_key,
            engine_secret_key: cfg.secret_key,
            engine_region: cfg.region,
            app_name: cfg.app_name,
            app_remark: cfg.app_remark,
            created_at: String::new(),
        })
        .await?;

    let xml = render_create_application_result(&access_key, &secret_key);
    Ok(xml_response(correlation_headers(None, None), xml))
}

/// `DELETE /` -- DeleteApplication.  Removes the caller's own keys.
#[utoipa::path(
    delete,
    path = "/",
    tag = "Application",
    operation_id = "DeleteApplication",
    responses(
        (status = 200, description = "Application removed"),
        (status = 403, description = "Access denied")
    )
)]
pub async fn delete_application(state: Arc<AppState>, identity: &Identity) -> Result<Response, S3Error> {
    let removed = state.credentials.delete(&identity.access_key).await?;
    if removed {
        info!("removed application {}", identity.access_key);
    }
    Ok(empty_response(StatusCode::OK, correlation_headers(None, None)))
}
