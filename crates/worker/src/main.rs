fn main() -> anyhow::Result<()> {
    drawq_observability::init();

    let config = drawq_infra::WorkerConfig::from_env()?;
    let summary = drawq_worker::run_dead_letter_drain(&config)?;

    tracing::info!(
        drained = summary.acked,
        left_unacked = summary.left_unacked,
        "drawq-dlq exiting"
    );
    Ok(())
}
