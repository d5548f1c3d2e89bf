use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use ridecast::{
    inference_config_from_env, init_logging, log_app_bind, log_app_start,
    logging_config_from_env, predictions_router, PredictionReader, SqlitePredictionReader,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("prediction_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("RIDECAST_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    let store_path = std::env::var("RIDECAST_PREDICTION_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/ridecast/predictions.sqlite"));
    let group = inference_config_from_env()?.prediction_group;

    let reader: Arc<dyn PredictionReader> =
        Arc::new(SqlitePredictionReader::new(store_path, group));
    let app = predictions_router(reader);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
