use replicated_map::config::NodeConfig;
use replicated_map::node::ReplicatedMap;
use replicated_map::shell;
use replicated_map::transport::cluster::ClusterTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("replicated-map", String::as_str);

    let config = match NodeConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("{}", NodeConfig::usage(program));
            std::process::exit(1);
        }
    };

    let level = if config.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let span = tracing::info_span!("node", bind = %config.bind, group = %config.group);

    tracing::info!(parent: &span, "Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!(parent: &span, "Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!(parent: &span, "Starting as seed node (founder)");
    }

    // 1. Transport (UDP gossip + HTTP):
    let transport = ClusterTransport::new(config.cluster(), span.clone());

    // 2. Join the group; the first view triggers state recovery:
    let map = ReplicatedMap::join(transport, &config.group, config.reconciler(), span.clone()).await?;
    tracing::info!(parent: &span, "Node ID: {}", map.local_id());

    // 3. Interactive shell until quit or end of input:
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = shell::run(&map, stdin, tokio::io::stdout(), span.clone()).await;

    // 4. Leave cleanly even if the shell failed:
    map.leave().await;
    result?;

    Ok(())
}
