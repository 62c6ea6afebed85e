//! HTTP endpoints of a node.
//!
//! Every failure, malformed bodies and queries included, is answered with the body
//! `ERROR: {msg}` and every payload-free success with `SUCCESS!`.

use crate::{
    consensus::Runtime,
    node::Node,
    router::Request,
    wire::{self, Genesis, HostNotice, IncludeSelf, JoinRequest, Neighbours, ValidatorNotice},
    CommitteeId, Error, Transaction,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request as HttpRequest, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    serve as axum_serve, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

type Shared<R> = State<Arc<Node<R>>>;

/// Committee id taken from the path, always in canonical form.
#[derive(Deserialize)]
#[serde(from = "String")]
struct Id(CommitteeId);

impl From<String> for Id {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

/// JSON body. A body that fails to parse is answered with the error marker.
struct Body<T>(T);

impl<T, S> FromRequest<S> for Body<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: HttpRequest, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(reject(rejection.status(), rejection.body_text())),
        }
    }
}

/// Query string. A query that fails to parse is answered with the error marker.
struct Params<T>(T);

impl<T, S> FromRequestParts<S> for Params<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(reject(rejection.status(), rejection.body_text())),
        }
    }
}

fn reject(status: StatusCode, msg: String) -> Response {
    debug!(%status, %msg, "malformed request");
    (status, wire::error(msg)).into_response()
}

fn text(result: Result<String, Error>) -> Response {
    match result {
        Ok(body) => body.into_response(),
        Err(err) => {
            debug!(?err, "request failed");
            wire::error(err).into_response()
        }
    }
}

fn success(result: Result<(), Error>) -> Response {
    text(result.map(|()| wire::SUCCESS.to_string()))
}

fn json<T: Serialize>(result: Result<T, Error>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => text(Err(err)),
    }
}

/// Accessors report a missing peer the same way as a missing committee.
fn member(id: &CommitteeId, err: Error) -> Error {
    match err {
        Error::NotStarted => Error::UnknownCommittee(id.clone()),
        err => err,
    }
}

async fn info<R: Runtime>(State(node): Shared<R>) -> Response {
    Json(node.info(None).await).into_response()
}

async fn info_committee<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    Json(node.info(Some(&id)).await).into_response()
}

async fn start<R: Runtime>(
    State(node): Shared<R>,
    Path((Id(a), Id(b))): Path<(Id, Id)>,
) -> Response {
    success(node.start(a, b).await)
}

async fn genesis<R: Runtime>(
    State(node): Shared<R>,
    Path(Id(id)): Path<Id>,
    Body(body): Body<Genesis>,
) -> Response {
    success(node.genesis(&id, body).await)
}

async fn join<R: Runtime>(
    State(node): Shared<R>,
    Path(Id(id)): Path<Id>,
    Body(body): Body<Neighbours>,
) -> Response {
    success(node.join_committee(&id, &body.neighbours).await)
}

async fn add<R: Runtime>(
    State(node): Shared<R>,
    Path(Id(id)): Path<Id>,
    Body(body): Body<Neighbours>,
) -> Response {
    node.add_neighbours(&id, &body.neighbours);
    success(Ok(()))
}

async fn quorum_info<R: Runtime>(State(node): Shared<R>, Params(query): Params<IncludeSelf>) -> Response {
    Json(node.quorum_info(None, query.include_self).await).into_response()
}

async fn quorum_info_committee<R: Runtime>(
    State(node): Shared<R>,
    Path(Id(id)): Path<Id>,
    Params(query): Params<IncludeSelf>,
) -> Response {
    Json(node.quorum_info(Some(&id), query.include_self).await).into_response()
}

async fn intersection_map<R: Runtime>(State(node): Shared<R>) -> Response {
    Json(node.survey().await.to_wire()).into_response()
}

async fn min_intersection<R: Runtime>(State(node): Shared<R>) -> Response {
    let map = node.survey().await;
    json(map.min().map(|(a, b)| wire::Selection {
        peers: [(a.clone(), map.members(&a)), (b.clone(), map.members(&b))].into(),
        min_intersection: Some((a, b)),
        max_intersection: None,
    }))
}

async fn max_intersection<R: Runtime>(State(node): Shared<R>) -> Response {
    let map = node.survey().await;
    json(map.max().map(|(a, b)| wire::Selection {
        peers: [(a.clone(), map.members(&a)), (b.clone(), map.members(&b))].into(),
        min_intersection: None,
        max_intersection: Some((a, b)),
    }))
}

async fn request_join<R: Runtime>(State(node): Shared<R>, Body(body): Body<JoinRequest>) -> Response {
    success(node.join(&body.known_host).await.map(|_| ()))
}

async fn request_leave<R: Runtime>(State(node): Shared<R>) -> Response {
    success(node.leave().await)
}

async fn add_host<R: Runtime>(State(node): Shared<R>, Body(notice): Body<HostNotice>) -> Response {
    node.add_host(&notice);
    success(Ok(()))
}

async fn remove_host<R: Runtime>(State(node): Shared<R>, Body(notice): Body<HostNotice>) -> Response {
    node.remove_host(&notice);
    success(Ok(()))
}

async fn change_validator<R: Runtime>(node: &Node<R>, notice: &ValidatorNotice, add: bool) -> Response {
    match node.change_validator(notice, add).await {
        Ok(_) => success(Ok(())),
        Err(Error::MembershipUpdateTimeout(_)) => wire::error("Committee update failed!").into_response(),
        Err(err) => text(Err(err)),
    }
}

async fn add_validator<R: Runtime>(State(node): Shared<R>, Body(notice): Body<ValidatorNotice>) -> Response {
    change_validator(&node, &notice, true).await
}

async fn remove_validator<R: Runtime>(
    State(node): Shared<R>,
    Body(notice): Body<ValidatorNotice>,
) -> Response {
    change_validator(&node, &notice, false).await
}

async fn submit<R: Runtime>(State(node): Shared<R>, Body(tx): Body<Transaction>) -> Response {
    text(node.handle(Request::Submit, &tx).await)
}

async fn get_value<R: Runtime>(State(node): Shared<R>, Body(tx): Body<Transaction>) -> Response {
    text(node.handle(Request::Get, &tx).await)
}

async fn blocks<R: Runtime>(State(node): Shared<R>, Body(tx): Body<Transaction>) -> Response {
    text(node.handle(Request::Blocks, &tx).await)
}

async fn user_key<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    text(node.identity(&id).await.map(|i| i.user_key).map_err(|e| member(&id, e)))
}

async fn val_key<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    text(node.identity(&id).await.map(|i| i.validator_key).map_err(|e| member(&id, e)))
}

async fn ip<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    text(node.identity(&id).await.map(|i| i.endpoint).map_err(|e| member(&id, e)))
}

async fn committee_val_keys<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    json(node.committee_val_keys(&id).await.map_err(|e| member(&id, e)))
}

async fn committee_ips<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    json(node.committee_ips(&id).await.map_err(|e| member(&id, e)))
}

async fn vacate<R: Runtime>(State(node): Shared<R>, Path(Id(id)): Path<Id>) -> Response {
    json(node.vacate(&id).await.map(|terminal| wire::Vacated { terminal }))
}

async fn refresh<R: Runtime>(State(node): Shared<R>) -> Response {
    success(node.refresh_all().await)
}

async fn status<R: Runtime>(State(node): Shared<R>) -> Response {
    node.status().to_string().into_response()
}

async fn metrics<R: Runtime>(State(node): Shared<R>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        node.metrics().encode(),
    )
        .into_response()
}

/// Every endpoint of `node`.
pub fn router<R: Runtime>(node: Arc<Node<R>>) -> Router {
    Router::new()
        .route("/info", get(info::<R>))
        .route("/info/{id}", get(info_committee::<R>))
        .route("/start/{a}/{b}", get(start::<R>))
        .route("/genesis/{id}", post(genesis::<R>))
        .route("/join/{id}", post(join::<R>))
        .route("/add/{id}", post(add::<R>))
        .route("/quorum+info", get(quorum_info::<R>))
        .route("/quorum+info/{id}", get(quorum_info_committee::<R>))
        .route("/intersection+map", get(intersection_map::<R>))
        .route("/min+intersection", get(min_intersection::<R>))
        .route("/max+intersection", get(max_intersection::<R>))
        .route("/request+join", post(request_join::<R>))
        .route("/request+leave", post(request_leave::<R>))
        .route("/add+host", post(add_host::<R>))
        .route("/remove+host", post(remove_host::<R>))
        .route("/add+validator", post(add_validator::<R>))
        .route("/remove+validator", post(remove_validator::<R>))
        .route("/submit", post(submit::<R>))
        .route("/get", post(get_value::<R>))
        .route("/blocks", post(blocks::<R>))
        .route("/user+key/{id}", get(user_key::<R>))
        .route("/val+key/{id}", get(val_key::<R>))
        .route("/ip/{id}", get(ip::<R>))
        .route("/committee+val+keys/{id}", get(committee_val_keys::<R>))
        .route("/committee+ips/{id}", get(committee_ips::<R>))
        .route("/vacate/{id}", post(vacate::<R>))
        .route("/refresh", post(refresh::<R>))
        .route("/status", get(status::<R>))
        .route("/metrics", get(metrics::<R>))
        .with_state(node)
}

/// Serve `node` on `listener` until the server stops.
pub async fn serve<R: Runtime>(node: Arc<Node<R>>, listener: TcpListener) -> Result<(), Error> {
    if let Some(interval) = node.config().refresh_interval {
        tokio::spawn(node.clone().run_refresh(interval));
    }
    info!(address = %node.address(), "serving");
    axum_serve(listener, router(node)).await?;
    Ok(())
}
