//! Pod Bot
//!
//! Opens `podbot-<i>` subscriptions against a relay server and logs every
//! record until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use pod_status::bot::{BotCli, PodBot};
use pod_status::proto::pod_stat_intf_client::PodStatIntfClient;
use pod_status::shutdown::Shutdown;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pod_status::logging::init();

    let cli = BotCli::parse();
    info!(count = cli.count, server = %cli.server, "starting pod bots");

    let client = PodStatIntfClient::connect(cli.server.clone())
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    let shutdown = Shutdown::new();
    let mut bots = JoinSet::new();
    for index in 0..cli.count {
        let bot = PodBot::numbered(index);
        let client = client.clone();
        let stop = shutdown.token();
        bots.spawn(async move {
            let result = bot.run(client, stop).await;
            (bot, result)
        });
    }

    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    while let Some(joined) = bots.join_next().await {
        let (bot, result) = joined.context("bot task failed")?;
        match result {
            Ok(received) => println!("{}: {received} records", bot.name()),
            Err(status) => warn!(bot = %bot.name(), error = %status, "bot stream failed"),
        }
    }
    signals.abort();
    Ok(())
}
