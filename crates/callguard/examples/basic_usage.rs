//! Basic callguard usage
//!
//! Issues a few requests through a rate-limited client, then wraps an
//! arbitrary flaky operation with the executor directly.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example basic_usage --features trace
//!
//! # Against another API, with retry settings from the environment
//! CALLGUARD_MAX_ATTEMPTS=5 CALLGUARD_RATE_LIMIT=2 \
//!     cargo run --example basic_usage --features trace -- https://api.github.com
//! ```

use anyhow::Context;
use callguard::{
    ApiClient, Attempt, Failure, JsonSink, RequestExecutor, RequestOptions, ResilienceConfig,
    init_tracing,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://httpbin.org".to_string());
    let config = ResilienceConfig::from_env().context("invalid CALLGUARD_* settings")?;

    let client = ApiClient::builder()
        .config(config.clone())
        .base_url(&base_url)
        .default_header("Accept", "application/json")
        .non_retryable_status(404)
        .build()?;

    println!("GET {}", client.build_url("/get"));
    let body = client
        .request(
            "GET",
            "/get",
            RequestOptions::new()
                .query("source", "callguard")
                .timeout(Duration::from_secs(5)),
        )
        .await
        .context("GET /get")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    match client.get("/status/404").await {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("404 not retried: {e} ({} attempt)", e.attempts()),
    }
    client.close();

    // Any async operation, with events as JSON lines on stdout.
    let executor = RequestExecutor::from_config(&config, Arc::new(JsonSink::stdout()))?;
    let calls = AtomicU32::new(0);
    let answer = executor
        .run(|attempt: Attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt.is_last() {
                    Ok(42)
                } else {
                    Err(Failure::retryable(std::io::Error::other("warming up")))
                }
            }
        })
        .await?;
    println!(
        "answer {answer} after {} attempt(s)",
        calls.load(Ordering::SeqCst)
    );

    Ok(())
}
