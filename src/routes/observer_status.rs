use axum::extract::State;

use crate::{
    observer::ObserverStatus,
    routes::{AppState, Json},
};

pub async fn handler(state: State<AppState>) -> Json<ObserverStatus> {
    Json(state.observer.status().await)
}
