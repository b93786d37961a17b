use std::sync::Arc;

use {
    anyhow::{Result, bail},
    hearth_actions::{
        ActionApi, ActionDispatcher, ActionRunState, ActionRunner, DispatcherOptions,
        HttpActionApi, LinkReachability, MemoryCatalog, PeerLink, ServerDirectory,
    },
    hearth_config::HearthConfig,
    tokio::sync::mpsc,
};

pub fn list() -> Result<()> {
    let config = hearth_config::discover_and_load();
    let actions = MemoryCatalog::from_config(&config).snapshot();
    if actions.is_empty() {
        println!("No actions visible on the companion.");
        return Ok(());
    }
    for action in actions {
        println!("{:>4}  {:<24} {:<32} {}", action.position, action.id, action.name, action.server);
    }
    Ok(())
}

/// Fire an action and print each state change until it clears.
pub async fn run(action_id: &str) -> Result<()> {
    let config = hearth_config::discover_and_load();
    fire(&config, action_id, Arc::new(HttpActionApi::default())).await
}

async fn fire(config: &HearthConfig, action_id: &str, api: Arc<dyn ActionApi>) -> Result<()> {
    let catalog = MemoryCatalog::from_config(config);

    // No paired device from a terminal: the link stays unreachable.
    let (outbound, _peer) = mpsc::channel(1);
    let link = Arc::new(PeerLink::new(outbound));
    let reachability: Arc<LinkReachability> = link.reachability();

    let dispatcher = ActionDispatcher::new(
        &catalog,
        reachability,
        link,
        api,
        ServerDirectory::from_config(config),
        DispatcherOptions::from_config(&config.dispatch),
    );

    let mut states = dispatcher.subscribe();
    if !dispatcher.trigger(action_id) {
        bail!("no visible action with id {action_id}");
    }

    // The direct call is bounded by the API client's timeout, so every run
    // reaches a result and then clears.
    let mut succeeded = None;
    loop {
        let state = states.borrow_and_update().state;
        println!("{state:?}");
        match state {
            ActionRunState::Loading => {},
            ActionRunState::Success => succeeded = Some(true),
            ActionRunState::Failure => succeeded = Some(false),
            ActionRunState::Idle => break,
        }
        if states.changed().await.is_err() {
            bail!("dispatcher stopped before action {action_id} finished");
        }
    }

    // The result can be coalesced away when the reset lands first.
    let failed = match succeeded {
        Some(succeeded) => !succeeded,
        None => dispatcher.last_failure().is_some(),
    };
    if failed {
        if let Some(reason) = dispatcher.last_failure() {
            eprintln!("{reason}");
        }
        bail!("action {action_id} failed");
    }
    Ok(())
}
