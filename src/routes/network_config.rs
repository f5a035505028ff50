use axum::extract::State;

use crate::{
    network::NetworkConfigSnapshot,
    routes::{AppState, Json},
};

pub async fn handler(state: State<AppState>) -> Json<NetworkConfigSnapshot> {
    Json(state.network.config_snapshot().await)
}
