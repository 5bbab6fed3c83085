use std::convert::Infallible;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use super::{exam_socket, AppContext};
use crate::cache::LocalCache;
use crate::error::PortalError;
use crate::model::Action;
use crate::portal::{self, StaffLogin, StudentLogin};
use crate::remote::RemoteStore;

/// Staff-authenticated mutation request.
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub actor: StaffLogin,
    #[serde(flatten)]
    pub action: Action,
}

/// Every collaborator route under `/portal`.
pub fn portal_routes<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec!["content-type"]);

    health_check(ctx.clone())
        .or(dataset_endpoint(ctx.clone()))
        .or(student_login(ctx.clone()))
        .or(staff_login(ctx.clone()))
        .or(dispatch_endpoint(ctx.clone()))
        .or(stage_endpoint(ctx.clone()))
        .or(exam_websocket_route(ctx))
        .with(cors)
}

pub fn health_check<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "health")
        .and(warp::get())
        .and(with_context(ctx))
        .map(|ctx: AppContext<R, C>| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Examsy Portal",
                "version": env!("CARGO_PKG_VERSION"),
                "sync": ctx.engine.status(),
            }))
        })
}

pub fn dataset_endpoint<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "dataset")
        .and(warp::get())
        .and(with_context(ctx))
        .map(|ctx: AppContext<R, C>| {
            let dataset = ctx.engine.current_dataset();
            warp::reply::json(&serde_json::json!({
                "status": ctx.engine.status(),
                "isSyncing": ctx.engine.is_syncing(),
                "counts": dataset.counts(),
                "data": dataset.redacted(),
            }))
        })
}

pub fn student_login<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "login" / "student")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .and_then(handle_student_login::<R, C>)
}

pub fn staff_login<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "login" / "staff")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .map(|login: StaffLogin, ctx: AppContext<R, C>| {
            let dataset = ctx.engine.current_dataset();
            match portal::resolve_staff(&ctx.admin, &dataset, &login) {
                Ok(role) => {
                    tracing::info!(username = %login.username, role = %role, "Staff login");
                    warp::reply::json(&serde_json::json!({ "success": true, "role": role }))
                        .into_response()
                }
                Err(e) => error_reply(&e),
            }
        })
}

pub fn dispatch_endpoint<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "dispatch")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .and_then(handle_dispatch::<R, C>)
}

pub fn stage_endpoint<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "stage")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(ctx))
        .and_then(handle_stage::<R, C>)
}

pub fn exam_websocket_route<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("portal" / "exam")
        .and(warp::ws())
        .and(with_context(ctx))
        .map(|ws: warp::ws::Ws, ctx: AppContext<R, C>| {
            ws.on_upgrade(move |websocket| exam_socket::handle_exam_socket(websocket, ctx))
        })
}

async fn handle_student_login<R: RemoteStore, C: LocalCache>(
    login: StudentLogin,
    ctx: AppContext<R, C>,
) -> Result<Response, Infallible> {
    Ok(match portal::start_session(&ctx.engine, &login).await {
        Ok(ticket) => warp::reply::json(&serde_json::json!({ "success": true, "data": ticket }))
            .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn handle_dispatch<R: RemoteStore, C: LocalCache>(
    request: DispatchRequest,
    ctx: AppContext<R, C>,
) -> Result<Response, Infallible> {
    let dataset = ctx.engine.current_dataset();
    let role = match portal::resolve_staff(&ctx.admin, &dataset, &request.actor) {
        Ok(role) => role,
        Err(e) => return Ok(error_reply(&e)),
    };

    Ok(match ctx.engine.dispatch(&role, request.action).await {
        Ok(true) => warp::reply::json(&serde_json::json!({ "success": true })).into_response(),
        Ok(false) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "success": false,
                "message": "Remote write failed, dataset reconciled",
            })),
            StatusCode::BAD_GATEWAY,
        )
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn handle_stage<R: RemoteStore, C: LocalCache>(
    request: DispatchRequest,
    ctx: AppContext<R, C>,
) -> Result<Response, Infallible> {
    let dataset = ctx.engine.current_dataset();
    let role = match portal::resolve_staff(&ctx.admin, &dataset, &request.actor) {
        Ok(role) => role,
        Err(e) => return Ok(error_reply(&e)),
    };

    Ok(match ctx.engine.stage(&role, request.action).await {
        Ok(()) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "success": true, "staged": true })),
            StatusCode::ACCEPTED,
        )
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

/// Maps an error onto an HTTP status and `{ success: false, message }`.
pub fn error_reply(err: &PortalError) -> Response {
    let status = match err {
        PortalError::InvalidCredentials | PortalError::Login(_) => StatusCode::UNAUTHORIZED,
        PortalError::Forbidden { .. } => StatusCode::FORBIDDEN,
        PortalError::StudentNotFound(_)
        | PortalError::SessionNotFound(_)
        | PortalError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        PortalError::DuplicateStudent(_)
        | PortalError::DuplicateSession(_)
        | PortalError::DuplicateRoom(_)
        | PortalError::EmptyOverwrite => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "success": false,
            "message": err.to_string(),
        })),
        status,
    )
    .into_response()
}

fn with_context<R: RemoteStore, C: LocalCache>(
    ctx: AppContext<R, C>,
) -> impl Filter<Extract = (AppContext<R, C>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}
