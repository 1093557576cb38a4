//! Synthetic subscriber used to load-test the relay.

use crate::proto::PodStatRequest;
use crate::proto::pod_stat_intf_client::PodStatIntfClient;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(
    name = "pod-bot",
    version,
    about = "Opens concurrent pod status streams against a relay server"
)]
pub struct BotCli {
    /// Number of concurrent bots
    #[arg(default_value_t = 1)]
    pub count: usize,

    /// Relay server address
    #[arg(long, env = "POD_STATUS_ADDR", default_value = "http://127.0.0.1:50051")]
    pub server: String,
}

/// One subscriber identity.
#[derive(Debug, Clone)]
pub struct PodBot {
    name: String,
}

impl PodBot {
    /// Bot named `podbot-<index>`.
    #[must_use]
    pub fn numbered(index: usize) -> Self {
        Self {
            name: format!("podbot-{index}"),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listens until `stop` fires or the server ends the stream. Returns the
    /// number of records received.
    pub async fn run(
        &self,
        mut client: PodStatIntfClient<Channel>,
        stop: CancellationToken,
    ) -> Result<u64, tonic::Status> {
        let request = PodStatRequest {
            clientid: self.name.clone(),
            name: String::new(),
        };
        let mut stream = client.listen_pod_status(request).await?.into_inner();
        info!(bot = %self.name, "listening for pod status");

        let mut received = 0;
        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    debug!(bot = %self.name, "stop signal received");
                    break;
                }
                reply = stream.message() => match reply? {
                    Some(reply) => {
                        received += 1;
                        let stat = reply.podstat.unwrap_or_default();
                        info!(
                            bot = %self.name,
                            message = %reply.message,
                            pod = %stat.podname,
                            state = %stat.podstate,
                            node = %stat.nodename,
                            "received pod status"
                        );
                    }
                    None => {
                        info!(bot = %self.name, "server closed the stream");
                        break;
                    }
                },
            }
        }
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_names() {
        assert_eq!(PodBot::numbered(0).name(), "podbot-0");
        assert_eq!(PodBot::numbered(12).name(), "podbot-12");
    }

    #[test]
    fn test_cli_count() {
        let cli = BotCli::parse_from(["pod-bot", "4", "--server", "http://relay:50051"]);
        assert_eq!(cli.count, 4);
        assert_eq!(cli.server, "http://relay:50051");
    }
}
