use axum::http::StatusCode;

pub async fn banner() -> &'static str {
    "Asset bridge is running"
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}
