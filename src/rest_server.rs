use rocket::serde::{json::Json, Serialize};
use rocket::{get, post, routes, State};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info};

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

/// Accept a remotely-pushed configuration document: a flat map of string
/// keys to string values, handed to the orchestrator through the config
/// channel.
#[post("/config", data = "<document>")]
async fn push_config(
    document: Json<HashMap<String, String>>,
    config_tx: &State<mpsc::Sender<HashMap<String, String>>>,
) -> Json<ApiResponse> {
    let document = document.into_inner();
    info!("configuration document received: {} keys", document.len());
    match config_tx.send(document).await {
        Ok(()) => Json(ApiResponse {
            status: "accepted".to_string(),
            message: "Configuration update queued.".to_string(),
        }),
        Err(_) => Json(ApiResponse {
            status: "error".to_string(),
            message: "The bridge is shutting down.".to_string(),
        }),
    }
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "EdgeRelay is running.".to_string(),
    })
}

/// Run the Rocket server that receives configuration pushes
pub async fn run_rest_server(config_tx: mpsc::Sender<HashMap<String, String>>) {
    let result = rocket::build()
        .manage(config_tx)
        .mount("/", routes![root_handler, push_config])
        .launch()
        .await;

    if let Err(e) = result {
        error!("REST server terminated: {e}");
    }
}
