//! Issues a few requests against a small bucket with a shared deadline.
//!
//! > You can run this example with:
//! >
//! > ```sh
//! > RUST_LOG=token_gate=trace cargo run --example burst
//! > ```

use token_gate::{Context, Limiter};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> token_gate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let limiter = Limiter::new(1, 2)?;
    let ctx = Context::with_timeout(Duration::from_secs(2));

    for n in [3, 2, 2] {
        match limiter.wait_n(&ctx, n).await {
            Ok(()) => println!("{n} tokens: admitted"),
            Err(error) => println!("{n} tokens: {error}"),
        }
    }

    Ok(())
}
