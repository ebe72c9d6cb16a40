mod api;
mod config;
mod error;
mod evaluator;
mod live;
mod store;

use std::sync::Arc;

use config::Config;
use evaluator::{DisabledEvaluator, Evaluator, EvaluatorConfig, HttpEvaluator};
use live::LiveServer;
use store::MemoryStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quiz_live_server=info,warp=info".into()),
        )
        .init();

    let config = Config::from_env();

    let evaluator: Arc<dyn Evaluator> = match EvaluatorConfig::from_env() {
        Some(evaluator_config) => match HttpEvaluator::new(evaluator_config) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!(error = %e, "Evaluator client setup failed, open answers degrade to zero");
                Arc::new(DisabledEvaluator)
            }
        },
        None => {
            tracing::info!("Evaluator disabled, open answers score zero unless client-evaluated");
            Arc::new(DisabledEvaluator)
        }
    };

    let server = Arc::new(LiveServer::new(
        Arc::new(MemoryStore::new()),
        evaluator,
        config.presence.clone(),
    ));

    let routes = api::routes::live_routes(server);

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Quiz live server listening"
    );
    warp::serve(routes).run(config.bind_address()).await;
}
