// HTTP route handlers for submission intake

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use judge_common::{ContestId, ProblemId, Submission, SubmissionId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubmission {
    pub code: String,
    pub language: String,
    pub problem_id: ProblemId,
    pub contest_id: ContestId,
    pub username: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

/// POST /submissions - Store a PENDING submission and queue it for judging
pub async fn create_submission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSubmission>,
) -> Response {
    match state.problems.get(payload.problem_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Problem {} not found", payload.problem_id),
            );
        }
        Err(e) => {
            error!(problem_id = payload.problem_id, error = %e, "Failed to load problem");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load problem");
        }
    }

    match state.contests.get(payload.contest_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Contest {} not found", payload.contest_id),
            );
        }
        Err(e) => {
            error!(contest_id = payload.contest_id, error = %e, "Failed to load contest");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load contest");
        }
    }

    let submission = Submission::new(
        payload.code,
        payload.language,
        payload.problem_id,
        payload.contest_id,
        payload.username,
    );

    let submission = match state.submissions.save(&submission).await {
        Ok(saved) => saved,
        Err(e) => {
            error!(submission_id = %submission.id, error = %e, "Failed to store submission");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store submission");
        }
    };

    if let Err(e) = state.queue.enqueue(submission.id).await {
        error!(submission_id = %submission.id, error = %e, "Failed to queue submission");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue submission");
    }

    info!(
        submission_id = %submission.id,
        problem_id = submission.problem_id,
        language = %submission.language,
        source_size = submission.code.len(),
        "Submission queued"
    );
    (StatusCode::CREATED, Json(submission)).into_response()
}

/// GET /submissions/{id} - Current judging state of a submission
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = id.parse::<SubmissionId>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid submission ID format");
    };

    match state.submissions.get(id).await {
        Ok(submission) => (StatusCode::OK, Json(submission)).into_response(),
        Err(e) if e.is_not_found() => {
            error_response(StatusCode::NOT_FOUND, format!("Submission {} not found", id))
        }
        Err(e) => {
            error!(submission_id = %id, error = %e, "Failed to fetch submission");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch submission")
        }
    }
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
