use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub mod api;
pub mod msg;
pub mod range;
pub mod stream;
pub mod svc;

// adapted from the axum anyhow-error-response example

// make our own error that wraps `anyhow::Error`
pub struct AppError(anyhow::Error);

// tell axum how to convert `AppError` into a response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal server error: {}", self.0),
        )
            .into_response()
    }
}

// this enables using `?` on functions that return `Result<_, anyhow::Error>`
// to turn them into `Result<_, AppError>`
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
