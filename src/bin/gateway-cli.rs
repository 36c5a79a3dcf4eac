use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Inspection CLI for the resilience gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Breaker health summary
    Health,
    /// Per-breaker metrics as JSON
    Metrics,
    /// Per-breaker metrics in Prometheus text format
    Prometheus,
    /// Active cache backend and its counters
    CacheStats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Health => {
            let res = client.get(format!("{}/health", base)).send().await?;
            // 503 still carries the report.
            print_json(res, true).await?;
        }
        Commands::Metrics => {
            let res = client.get(format!("{}/metrics", base)).send().await?;
            print_json(res, false).await?;
        }
        Commands::Prometheus => {
            let res = client.get(format!("{}/metrics/prometheus", base)).send().await?;
            let status = res.status();
            let text = res.text().await?;
            if !status.is_success() {
                eprintln!("Error: gateway returned status {}", status);
                eprintln!("Response: {}", text);
                return Ok(());
            }
            print!("{}", text);
        }
        Commands::CacheStats => {
            let res = client.get(format!("{}/cache/stats", base)).send().await?;
            print_json(res, false).await?;
        }
    }

    Ok(())
}

async fn print_json(res: reqwest::Response, accept_unavailable: bool) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let unavailable = accept_unavailable && status == reqwest::StatusCode::SERVICE_UNAVAILABLE;
    if !status.is_success() && !unavailable {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
