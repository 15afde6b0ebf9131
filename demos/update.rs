//! Minimal update driver: installs or updates the stable channel under a
//! root given on the command line, printing progress to stdout.
//!
//! ```sh
//! cargo run --example update -- /opt/hytale
//! ```

use hytale_content::{Channel, ContentEngine, EngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let root = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./hytale-root".to_string());

    let engine = ContentEngine::new(EngineConfig::new(&root)).await?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.speed_bps {
                Some(speed) => println!(
                    "[{:?}] {:5.1}% {} ({})",
                    event.stage,
                    event.percent,
                    event.message,
                    hytale_content::types::format_speed(speed)
                ),
                None => println!("[{:?}] {}", event.stage, event.message),
            }
        }
    });

    engine.install_or_update(Channel::Latest).await?;

    let record = engine.build_record(Channel::Latest).await;
    println!("installed build {} under {root}", record.build);

    drop(engine);
    printer.abort();
    Ok(())
}
