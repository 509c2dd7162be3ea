use crypto_chat_orchestrator::{
    agent::Orchestrator,
    aggregator::DataAggregator,
    config::Config,
    llm::GeminiClient,
    memory::ConversationStore,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing; RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    config.log_warnings();

    info!("🚀 Crypto Chat Orchestrator starting");

    // Create components
    let llm = Arc::new(GeminiClient::new(&config.llm)?);
    let aggregator = Arc::new(DataAggregator::from_config(&config.providers)?);
    info!(
        market_providers = ?aggregator.market_provider_names(),
        web_search = aggregator.has_web_search(),
        "Data aggregator ready"
    );

    let store = Arc::new(ConversationStore::new(config.session.clone()));
    let sweeper = store.spawn_sweeper();

    let orchestrator = Orchestrator::new(config, llm, aggregator, store);
    let session_id = orchestrator.create_session().await;
    info!(session_id = %session_id, "✅ Session started");

    println!("Ask about crypto prices, news or concepts. Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match orchestrator.process_query(&line, &session_id).await {
            Ok(result) => {
                println!("\n{}", result.response);
                if !result.suggestions.is_empty() {
                    println!("\nYou could also ask:");
                    for suggestion in &result.suggestions {
                        println!("  - {}", suggestion);
                    }
                }
            }
            Err(e) => eprintln!("\n⚠️  {}", e),
        }
    }

    sweeper.abort();
    info!("Goodbye");
    Ok(())
}
