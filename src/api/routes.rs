use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::Filter;

use super::websocket;
use crate::error::QuizError;
use crate::live::protocol::{ClientEvaluation, LaunchedQuestion};
use crate::live::{LiveServer, ParticipantUpdate, SaveOutcome};
use crate::store::QuestionBlock;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateClassRequest {
    name: String,
    teacher_name: String,
    #[serde(default)]
    blocks: Vec<QuestionBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JumpRequest {
    block_index: usize,
    question_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevealRequest {
    question_id: String,
    correct_answer: Value,
    points: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerRequest {
    session_id: String,
    question_id: String,
    answer: Value,
    evaluation: Option<ClientEvaluation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveParticipantRequest {
    session_id: String,
    display_name: Option<String>,
    score: Option<i64>,
    score_delta: Option<i64>,
}

/// All routes of the live server: the WebSocket upgrade, the REST mirror
/// for clients without a persistent connection, and the health check.
pub fn live_routes(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    websocket_route(server.clone())
        .or(create_class(server.clone()))
        .or(get_class(server.clone()))
        .or(launch(server.clone()))
        .or(jump(server.clone()))
        .or(next_block(server.clone()))
        .or(finish(server.clone()))
        .or(reveal(server.clone()))
        .or(submit_answer(server.clone()))
        .or(save_participant(server.clone()))
        .or(reset_scores(server.clone()))
        .or(reset_class(server.clone()))
        .or(list_participants(server.clone()))
        .or(list_challenges(server))
        .or(health_check())
}

fn websocket_route(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server))
        .map(|ws: warp::ws::Ws, server: Arc<LiveServer>| {
            ws.on_upgrade(move |websocket| websocket::handle_live_websocket(websocket, server))
        })
}

fn create_class(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |body: CreateClassRequest, server: Arc<LiveServer>| async move {
                let result = server
                    .create_class(body.name, body.teacher_name, body.blocks)
                    .await;
                match result {
                    Ok(class) => Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&class),
                        StatusCode::CREATED,
                    )),
                    Err(e) => Ok(error_reply(e)),
                }
            },
        )
}

fn get_class(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String)
        .and(warp::get())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            let result = server.get_class(&class_id).await;
            match result {
                Ok(Some(class)) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&class),
                    StatusCode::OK,
                )),
                Ok(None) => Ok(error_reply(QuizError::ClassNotFound(class_id))),
                Err(e) => Ok(error_reply(e)),
            }
        })
}

fn launch(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "launch")
        .and(warp::post())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            let result = server.launch_next(&class_id).await;
            match result {
                Ok(active) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&LaunchedQuestion::from_active(&active, active.duration_secs)),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        })
}

fn jump(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "jump")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |class_id: String, body: JumpRequest, server: Arc<LiveServer>| async move {
                let result = server
                    .jump_to(&class_id, body.block_index, body.question_index)
                    .await;
                match result {
                    Ok(active) => Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&LaunchedQuestion::from_active(
                            &active,
                            active.duration_secs,
                        )),
                        StatusCode::OK,
                    )),
                    Err(e) => Ok(error_reply(e)),
                }
            },
        )
}

fn next_block(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "next-block")
        .and(warp::post())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            Ok::<_, Infallible>(status_reply(server.next_block(&class_id).await))
        })
}

fn finish(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "finish")
        .and(warp::post())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            Ok::<_, Infallible>(status_reply(server.finish_class(&class_id).await))
        })
}

fn reveal(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "reveal")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |class_id: String, body: RevealRequest, server: Arc<LiveServer>| async move {
                let result = server
                    .reveal_question(&class_id, &body.question_id, body.correct_answer, body.points)
                    .await;
                Ok::<_, Infallible>(status_reply(result))
            },
        )
}

fn submit_answer(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "answers")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |class_id: String, body: AnswerRequest, server: Arc<LiveServer>| async move {
                let result = server
                    .submit_answer(
                        &class_id,
                        &body.session_id,
                        &body.question_id,
                        body.answer,
                        body.evaluation,
                    )
                    .await;
                Ok::<_, Infallible>(status_reply(result))
            },
        )
}

fn save_participant(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "participants")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |class_id: String, body: SaveParticipantRequest, server: Arc<LiveServer>| async move {
                let update = ParticipantUpdate {
                    display_name: body.display_name,
                    score: body.score,
                    score_delta: body.score_delta,
                };
                let result = server
                    .save_participant(&class_id, &body.session_id, update)
                    .await;
                match result {
                    Ok(outcome) => Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&json!({
                            "saved": outcome == SaveOutcome::Saved
                        })),
                        StatusCode::OK,
                    )),
                    Err(e) => Ok(error_reply(e)),
                }
            },
        )
}

fn reset_scores(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "participants" / "reset")
        .and(warp::post())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            let result = server.reset_scores(&class_id).await;
            match result {
                Ok(touched) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&json!({ "reset": touched })),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        })
}

fn reset_class(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "reset")
        .and(warp::post())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            Ok::<_, Infallible>(status_reply(server.reset_class(&class_id).await))
        })
}

fn list_participants(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "participants")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            let result = server.list_participants(&class_id).await;
            match result {
                Ok(participants) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&participants),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        })
}

fn list_challenges(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "classes" / String / "challenges")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|class_id: String, server: Arc<LiveServer>| async move {
            let result = server.list_challenges(&class_id).await;
            match result {
                Ok(challenges) => Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&challenges),
                    StatusCode::OK,
                )),
                Err(e) => Ok(error_reply(e)),
            }
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "status": "healthy",
            "service": "Quiz Live Server",
            "version": env!("CARGO_PKG_VERSION")
        }))
    })
}

fn status_reply(result: crate::error::Result<()>) -> warp::reply::WithStatus<warp::reply::Json> {
    match result {
        Ok(()) => {
            warp::reply::with_status(warp::reply::json(&json!({ "status": "ok" })), StatusCode::OK)
        }
        Err(e) => error_reply(e),
    }
}

fn error_reply(error: QuizError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match &error {
        QuizError::Validation(_) | QuizError::InvalidPointer(_, _) => StatusCode::BAD_REQUEST,
        QuizError::Forbidden(_) => StatusCode::FORBIDDEN,
        QuizError::ClassNotFound(_) => StatusCode::NOT_FOUND,
        QuizError::NoBlocks(_)
        | QuizError::BlockExhausted(_)
        | QuizError::ClassFinished(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": error.to_string() })),
        status,
    )
}

fn with_server(
    server: Arc<LiveServer>,
) -> impl Filter<Extract = (Arc<LiveServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}
