//! Laundry Node binary
//!
//! Runs the whole Cistern supply network and its washing units in one process.

use cistern_laundry::{LaundryConfig, LaundryNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laundry_node=info,cistern_laundry=info,cistern_supply=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Laundry Node");

    let config = LaundryConfig::from_env();

    let node = LaundryNode::new(config).await?;
    node.run().await?;

    Ok(())
}
