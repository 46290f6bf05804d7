//! tracemesh - cluster-wide eBPF tracing
//!
//! Usage:
//!     tracemesh node tcpconnect --latency           # run a gadget on this node
//!     tracemesh trace tcpconnect -n default         # stream a gadget from every node
//!     tracemesh list --gadget tcpconnect
//!     tracemesh operation <trace-id> stop
//!     tracemesh delete <trace-id>

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use tracemesh::config::{NodeConfig, OrchestratorConfig};
use tracemesh::ebpf::{
    AyaBackend, ContainerCollection, Enricher, GadgetContext, GadgetParams, GadgetRegistry,
};
use tracemesh::metrics;
use tracemesh::telemetry;
use tracemesh::trace::orchestrator::render_trace_table;
use tracemesh::trace::{
    spawn_signal_listener, CommonFlags, Console, InterruptState, KubeProxyClient, KubectlExec,
    LineTransform, OutputFormat, TraceConfig, TraceOrchestrator,
};

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "tracemesh")]
#[command(about = "Cluster-wide eBPF tracing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a gadget on this node and print its events as JSON lines
    Node(NodeArgs),
    /// Stream a gadget's events from every node of the cluster
    Trace(TraceArgs),
    /// List existing traces
    List(ListArgs),
    /// Delete a trace by id, or every trace of a gadget
    Delete {
        trace_id: Option<String>,
        #[arg(long, conflicts_with = "trace_id")]
        gadget: Option<String>,
    },
    /// Set the operation of every copy of a trace
    Operation { trace_id: String, operation: String },
    /// List the gadgets this build knows about
    Gadgets,
}

#[derive(Args, Debug)]
struct NodeArgs {
    gadget: String,

    /// Compute connect latency (tcpconnect)
    #[arg(long)]
    latency: bool,

    /// Ignore connections faster than this (tcpconnect, with --latency)
    #[arg(long, default_value_t = 0)]
    min_latency_ms: u64,

    /// Only report audited checks (capabilities)
    #[arg(long)]
    audit_only: bool,

    /// Restrict to these mount namespace ids
    #[arg(long = "mntns")]
    mntns: Vec<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Node name stamped on every event (default: $TRACEMESH_NODE_NAME).
    /// Pod and container fields need an external container source and stay
    /// empty in this mode.
    #[arg(long)]
    node_name: Option<String>,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Only run on this node
    #[arg(long, default_value = "")]
    node: String,

    #[arg(short = 'n', long, default_value = "")]
    namespace: String,

    #[arg(short = 'p', long, default_value = "")]
    podname: String,

    #[arg(short = 'c', long, default_value = "")]
    containername: String,

    /// Pod labels, key=value
    #[arg(short = 'l', long = "label", value_parser = parse_key_val)]
    labels: Vec<(String, String)>,
}

impl FilterArgs {
    fn flags(&self, output_format: OutputFormat) -> CommonFlags {
        CommonFlags {
            node: self.node.clone(),
            namespace: self.namespace.clone(),
            podname: self.podname.clone(),
            containername: self.containername.clone(),
            labels: self.labels.iter().cloned().collect(),
            output_format,
            verbose: false,
        }
    }
}

#[derive(Args, Debug)]
struct TraceArgs {
    gadget: String,

    #[command(flatten)]
    filter: FilterArgs,

    /// Gadget parameters, key=value
    #[arg(long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Output format: columns or json
    #[arg(short = 'o', long, default_value = "columns")]
    output: String,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long, default_value = "")]
    gadget: String,

    #[command(flatten)]
    filter: FilterArgs,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let otlp_endpoint = NodeConfig::from_env().otlp_endpoint;

    if let Err(e) = telemetry::init_tracing("tracemesh", otlp_endpoint.as_deref()) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let result = match cli.command {
        Commands::Node(args) => run_node(args).await,
        Commands::Gadgets => {
            for (name, description) in GadgetRegistry::with_builtin().list() {
                println!("{:<16}{}", name, description);
            }
            Ok(())
        }
        command => run_client(command).await,
    };

    if otlp_endpoint.is_some() {
        telemetry::shutdown_tracing();
    }
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_node(args: NodeArgs) -> CliResult {
    let mut config = NodeConfig::from_env();
    if let Some(node) = args.node_name {
        config.node_name = node;
    }

    let params = GadgetParams {
        calculate_latency: args.latency,
        min_latency: Duration::from_millis(args.min_latency_ms),
        audit_only: args.audit_only,
        mount_ns_filter: (!args.mntns.is_empty()).then_some(args.mntns),
    };
    let console = Console::stdio();
    let ctx = GadgetContext {
        params,
        backend: Box::new(AyaBackend::new(&config)?),
        enricher: node_enricher(&config.node_name),
        output: Box::new(move |line: String| console.out_line(&line)),
    };

    let mut gadget = GadgetRegistry::with_builtin().instantiate(&args.gadget, ctx)?;
    gadget.start()?;
    info!(gadget = gadget.name(), "tracing, press Ctrl-C to stop");

    let mut consumer = gadget.take_consumer();
    let deadline = async {
        match args.timeout_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    let finished = async {
        match consumer.as_mut() {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = deadline => info!("timeout reached"),
        _ = finished => info!("event reader stopped"),
    }

    gadget.close();
    if let Some(handle) = consumer {
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }
    if args.metrics {
        eprint!("{}", metrics::gather());
    }
    Ok(())
}

/// Enricher for node mode; `None` when there is no node name to stamp.
///
/// Nothing registers containers here, so only the node field is ever set.
fn node_enricher(node_name: &str) -> Option<Arc<dyn Enricher>> {
    if node_name.is_empty() {
        return None;
    }
    Some(Arc::new(ContainerCollection::new(node_name)))
}

async fn run_client(command: Commands) -> CliResult {
    let config = OrchestratorConfig::from_env();
    let interrupts = InterruptState::new();
    spawn_signal_listener(Arc::clone(&interrupts))?;

    let orchestrator = TraceOrchestrator::new(
        Arc::new(KubeProxyClient::new(config.api_server.clone())),
        Arc::new(KubectlExec::new(
            config.namespace.clone(),
            config.agent_selector.clone(),
        )),
        config,
        Console::stdio(),
        interrupts,
    );

    match command {
        Commands::Trace(args) => {
            let format = match args.output.as_str() {
                "json" => OutputFormat::Json,
                "columns" => OutputFormat::Columns,
                other => return Err(format!("unknown output format {:?}", other).into()),
            };
            let mut trace = TraceConfig::stream(&args.gadget);
            trace.flags = args.filter.flags(format);
            trace.parameters = args.params.into_iter().collect::<BTreeMap<_, _>>();

            let transform: LineTransform = Arc::new(render_columns);
            orchestrator.run_and_stream(&trace, transform).await?;
        }
        Commands::List(args) => {
            let trace = TraceConfig {
                gadget: args.gadget,
                flags: args.filter.flags(OutputFormat::Columns),
                ..Default::default()
            };
            let summaries = orchestrator.list_traces(&trace).await?;
            print!("{}", render_trace_table(&summaries));
        }
        Commands::Delete { trace_id, gadget } => match (trace_id, gadget) {
            (Some(id), _) => orchestrator.delete_trace(&id).await,
            (None, Some(gadget)) => orchestrator.delete_traces_by_gadget(&gadget).await?,
            (None, None) => return Err("either a trace id or --gadget is required".into()),
        },
        Commands::Operation {
            trace_id,
            operation,
        } => orchestrator.set_operation(&trace_id, &operation).await?,
        Commands::Node(_) | Commands::Gadgets => {}
    }
    Ok(())
}

/// Render one JSON event line as space-separated columns.
///
/// Lines that are not JSON objects are printed as they are.
fn render_columns(line: &str) -> String {
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_str::<serde_json::Value>(line)
    else {
        return line.to_string();
    };
    let text = |key: &str| match fields.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    };

    let kind = text("type");
    if kind == "err" || kind == "warn" {
        return format!("{:<16}{}: {}", text("node"), kind.to_uppercase(), text("message"));
    }

    const ENVELOPE: [&str; 7] = [
        "type",
        "timestamp",
        "mountnsid",
        "node",
        "namespace",
        "pod",
        "container",
    ];
    let payload: Vec<String> = fields
        .iter()
        .filter(|(k, _)| !ENVELOPE.contains(&k.as_str()))
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect();
    format!(
        "{:<16}{:<16}{:<24}{}",
        text("node"),
        text("namespace"),
        text("pod"),
        payload.join(" ")
    )
}
