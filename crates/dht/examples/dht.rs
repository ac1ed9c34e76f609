use std::time::Duration;

use anyhow::Context;
use masala_dht::{DEFAULT_REALM, DhtBuilder, DhtConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let name = std::env::args()
        .nth(1)
        .context("first argument should be a name to look up")?;

    tracing_subscriber::fmt::init();

    let dht = DhtBuilder::with_config(DhtConfig {
        realm: Some(DEFAULT_REALM.to_owned()),
        ..Default::default()
    })
    .await
    .context("error initializing DHT")?;

    let stats_printer = async {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            info!("DHT stats: {:?}", dht.stats());
        }
        #[allow(unreachable_code)]
        Ok::<_, anyhow::Error>(())
    };

    let routing_table_dumper = async {
        loop {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let filename = "/tmp/masala-routing-table.json";
            let f = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(filename)
                .with_context(|| format!("error opening {filename}"))?;
            dht.with_routing_table(|r| serde_json::to_writer_pretty(f, r))
                .context("error dumping routing table")?;
            info!("Dumped DHT routing table to {}", filename);
        }
        #[allow(unreachable_code)]
        Ok::<_, anyhow::Error>(())
    };

    let lookup = async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let addr = dht.lookup_name(&name)?.wait().await;
        info!(name, ?addr, "lookup finished");
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        r = stats_printer => r,
        r = routing_table_dumper => r,
        r = lookup => r,
    }
}
