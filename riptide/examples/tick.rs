//! Minimal riptide demo: one event-loop worker running a periodic tick
//! alongside cross-thread tasks, then shutting down cleanly.
//!
//! Run with: cargo run --example tick

use std::time::Duration;

use riptide::{Config, LoopCtx, RiptideBuilder};

fn tick(ctx: &mut LoopCtx<'_>, remaining: u32) {
    tracing::info!(remaining, "tick");
    if remaining > 0 {
        ctx.schedule(Duration::from_millis(200), move |ctx| {
            tick(ctx, remaining - 1);
        });
    } else {
        ctx.request_shutdown();
    }
}

fn main() -> Result<(), riptide::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (_shutdown, workers) = RiptideBuilder::new(Config::default()).launch()?;

    workers[0].handle().execute(|ctx| {
        tracing::info!("loop is up");
        tick(ctx, 5);
    });

    for worker in workers {
        worker.join().expect("loop thread panicked")?;
    }
    tracing::info!("all loops stopped");
    Ok(())
}
