use core_config::tracing::install_color_eyre;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Before any fallible operation so startup errors are rendered by color-eyre
    install_color_eyre();

    queue_gateway::run().await
}
