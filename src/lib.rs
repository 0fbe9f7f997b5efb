pub mod config;
pub mod muddle;
pub mod net;

use std::sync::Arc;

use self::{config::Config, muddle::Muddle};

use overlay::peers::NEVER_EXPIRE;

/// In order to let the integration tests start nodes the same way the
/// binary does, the composition lives here instead of in the main
/// function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let network = config.network_id()?;
    let identity = config.identity()?;

    log::info!(
        "muddle node: address={}, network={}",
        identity.address(),
        network
    );

    let muddle = Muddle::new(
        network,
        identity,
        config.external_address(),
        config.port_mapping()?,
    );

    if let Some(path) = &config.node.peer_table_file {
        muddle.set_peer_table_file(path.into());
    }
    muddle.set_tracker_configuration(config.tracker.to_configuration());

    muddle.start(&config.node.listen_ports).await?;

    for peer in &config.node.peers {
        muddle.connect_to_uri(peer.clone(), NEVER_EXPIRE);
    }

    // The node is non-blocking once running; keep the process alive.
    std::future::pending::<()>().await;

    Ok(())
}
